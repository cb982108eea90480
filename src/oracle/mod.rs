//! C4 — LLM decision oracle: classifies an input+candidates tuple into
//! match/ambiguous/decompose, and performs the secondary unit-conversion
//! call.

pub mod client;

use crate::error::{LcaError, Result};
use crate::models::{Candidate, CandidateSet, ComponentCategory, ComponentSpec, InputRow, Scope};
use client::{ChatMessage, LlmClient};
use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

const MAX_TRANSPORT_RETRIES: u32 = 5;
const MAX_MALFORMED_RETRIES: u32 = 3;
const DECOMPOSITION_TOLERANCE: f64 = 0.02;
const MIN_COMPONENTS: usize = 3;
const MAX_COMPONENTS: usize = 10;
const MAX_CONVERSION_FACTOR: f64 = 1_000_000.0;

#[derive(Debug, Clone)]
pub struct PlausibleCandidate {
    pub uuid: String,
    pub why_short: String,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Match { selected_uuid: String, rationale: String },
    Ambiguous { plausible: Vec<PlausibleCandidate>, rationale: String },
    Decompose { components: Vec<ComponentSpec> },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
enum RawDecision {
    Match { selected_uuid: String, rationale: String },
    Ambiguous { plausible: Vec<RawPlausible>, rationale: String },
    Decompose { components: Vec<RawComponent> },
}

#[derive(Debug, Deserialize)]
struct RawPlausible {
    uuid: String,
    why_short: String,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    name: String,
    quantity: f64,
    category: ComponentCategory,
    note: Option<String>,
}

fn scope_label(scope: Option<Scope>) -> &'static str {
    match scope {
        Some(Scope::Scope1) => "Scope 1",
        Some(Scope::Scope2) => "Scope 2",
        Some(Scope::Scope3) => "Scope 3",
        None => "unspecified",
    }
}

fn build_decide_prompt(input: &InputRow, candidates: &CandidateSet, allow_decompose: bool) -> String {
    let mut listing = String::new();
    for (i, c) in candidates.iter().enumerate() {
        listing.push_str(&format!(
            "{}. uuid={} activity=\"{}\" product=\"{}\" geography={} unit={}\n",
            i + 1,
            c.uuid,
            c.activity_name,
            c.product_name,
            c.geography,
            c.unit
        ));
    }

    let decompose_clause = if allow_decompose {
        "If no candidate reasonably fits AND the product is compound (made of several distinct \
         materials/processes), return decision=\"decompose\" with 3 to 10 components whose \
         quantity fields sum to 1.0. Simple activities (diesel, petrol, electricity, transport, \
         heating, basic materials) are never decomposable."
    } else {
        "Decomposition is disabled for this call; you must return \"match\" or \"ambiguous\"."
    };

    format!(
        "Input descriptor: \"{}\"\nRequested unit: {}\nScope: {}\nCategory: {}\nSub-category: {}\n\n\
         Candidates:\n{}\n\
         Classify this input against the candidates above.\n\
         Return \"match\" when exactly one candidate plausibly represents the input, quoting that \
         candidate's \"uuid\" field verbatim as \"selected_uuid\".\n\
         Return \"ambiguous\" with at least two plausible candidates when more than one fits, each \
         \"uuid\" quoted verbatim from the listing.\n\
         {}\n\
         Respond with JSON only: {{\"decision\": \"match\"|\"ambiguous\"|\"decompose\", ...}}.",
        input.bezeichnung_norm.as_deref().unwrap_or(&input.bezeichnung),
        input.unit_norm.as_deref().unwrap_or(&input.referenzeinheit),
        scope_label(input.scope),
        input.kategorie.as_deref().unwrap_or("-"),
        input.unterkategorie.as_deref().unwrap_or("-"),
        listing,
        decompose_clause,
    )
}

async fn call_with_retry(client: &dyn LlmClient, messages: Vec<ChatMessage>) -> Result<String> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match client.chat_completion(messages.clone()).await {
            Ok(text) => return Ok(text),
            Err(LcaError::LlmTransport { source, .. }) => {
                if attempt >= MAX_TRANSPORT_RETRIES {
                    return Err(LcaError::LlmTransport { attempts: attempt, source });
                }
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(10)));
                warn!("LLM transport error on attempt {attempt}, retrying after {backoff:?}: {source}");
                tokio::time::sleep(backoff).await;
            }
            Err(other) => return Err(other),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim()
}

fn parse_decision(text: &str, candidates: &CandidateSet, allow_decompose: bool) -> Result<Decision> {
    let cleaned = strip_code_fence(text);
    let raw: RawDecision =
        serde_json::from_str(cleaned).map_err(|e| LcaError::LlmMalformed(format!("invalid JSON: {e}")))?;

    let valid_uuids: std::collections::HashSet<&str> =
        candidates.iter().map(|c| c.uuid.as_str()).collect();

    match raw {
        RawDecision::Match { selected_uuid, rationale } => {
            if !valid_uuids.contains(selected_uuid.as_str()) {
                return Err(LcaError::LlmMalformed(format!(
                    "selected_uuid {selected_uuid} is not among the candidates"
                )));
            }
            Ok(Decision::Match { selected_uuid, rationale })
        }
        RawDecision::Ambiguous { plausible, rationale } => {
            if plausible.len() < 2 {
                return Err(LcaError::LlmMalformed("ambiguous decision needs at least 2 plausible candidates".to_string()));
            }
            for p in &plausible {
                if !valid_uuids.contains(p.uuid.as_str()) {
                    return Err(LcaError::LlmMalformed(format!("plausible uuid {} is not among the candidates", p.uuid)));
                }
            }
            Ok(Decision::Ambiguous {
                plausible: plausible
                    .into_iter()
                    .map(|p| PlausibleCandidate { uuid: p.uuid, why_short: p.why_short })
                    .collect(),
                rationale,
            })
        }
        RawDecision::Decompose { components } => {
            if !allow_decompose {
                return Err(LcaError::LlmMalformed("decompose is disabled for this call".to_string()));
            }
            let specs: Vec<ComponentSpec> = components
                .into_iter()
                .map(|c| ComponentSpec { name: c.name, quantity: c.quantity, category: c.category, note: c.note })
                .collect();
            validate_components(&specs)?;
            Ok(Decision::Decompose { components: specs })
        }
    }
}

fn validate_components(components: &[ComponentSpec]) -> Result<()> {
    if components.len() < MIN_COMPONENTS || components.len() > MAX_COMPONENTS {
        return Err(LcaError::LlmMalformed(format!(
            "expected 3-10 components, got {}",
            components.len()
        )));
    }
    let sum: f64 = components.iter().map(|c| c.quantity).sum();
    if (sum - 1.0).abs() > DECOMPOSITION_TOLERANCE {
        return Err(LcaError::LlmMalformed(format!(
            "component quantities sum to {sum}, expected ~1.0 (tolerance {DECOMPOSITION_TOLERANCE})"
        )));
    }
    Ok(())
}

/// C4.1: classify an input+candidates tuple. Retries transport errors
/// with exponential backoff (up to 5x) and malformed responses with a
/// correction prompt (up to 3x) before surfacing `LLMMalformed` /
/// `DecompositionInvalid`.
pub async fn decide(
    client: &dyn LlmClient,
    input: &InputRow,
    candidates: &CandidateSet,
    allow_decompose: bool,
) -> Result<Decision> {
    let system = ChatMessage::system(
        "You are an LCA matching assistant. Classify the input descriptor against the \
         candidate ecoinvent activities. Respond with JSON only, no prose.",
    );
    let mut messages = vec![system, ChatMessage::user(build_decide_prompt(input, candidates, allow_decompose))];

    let mut last_err: Option<LcaError> = None;
    for attempt in 1..=MAX_MALFORMED_RETRIES {
        let raw = call_with_retry(client, messages.clone()).await?;
        match parse_decision(&raw, candidates, allow_decompose) {
            Ok(decision) => return Ok(decision),
            Err(LcaError::LlmMalformed(reason)) => {
                debug!("decide() malformed response on attempt {attempt}: {reason}");
                messages.push(ChatMessage::user(format!(
                    "Your previous response was invalid: {reason}. Re-read the candidates and \
                     respond again with valid JSON only."
                )));
                last_err = Some(LcaError::LlmMalformed(reason));
            }
            Err(other) => return Err(other),
        }
    }

    match last_err {
        Some(LcaError::LlmMalformed(reason)) if reason.contains("3-10 components") || reason.contains("sum to") => {
            Err(LcaError::DecompositionInvalid { attempts: MAX_MALFORMED_RETRIES, reason })
        }
        Some(err) => Err(err),
        None => Err(LcaError::LlmMalformed("exhausted retries".to_string())),
    }
}

/// C4.2: derive the multiplier `q` such that "1 `from_unit` of
/// `description` equals `q` `to_unit`".
pub async fn convert_unit(client: &dyn LlmClient, description: &str, from_unit: &str, to_unit: &str) -> Result<f64> {
    let system = ChatMessage::system(
        "You convert physical units for life-cycle-inventory matching. Respond with JSON only: \
         {\"factor\": <positive number>}.",
    );
    let prompt = format!(
        "For \"{description}\", how many {to_unit} equal 1 {from_unit}? Respond with JSON only: \
         {{\"factor\": <positive finite number>}}."
    );

    let mut messages = vec![system, ChatMessage::user(prompt)];

    for attempt in 1..=2u32 {
        let raw = call_with_retry(client, messages.clone()).await?;
        match parse_conversion_factor(&raw) {
            Ok(factor) => return Ok(factor),
            Err(reason) => {
                if attempt == 2 {
                    return Err(LcaError::UnitConversionFailed(reason));
                }
                debug!("convert_unit() rejected on attempt {attempt}: {reason}");
                messages.push(ChatMessage::user(format!(
                    "Your previous answer was invalid ({reason}). Respond again with JSON only: \
                     {{\"factor\": <positive finite number>}}."
                )));
            }
        }
    }
    unreachable!("loop always returns")
}

#[derive(Debug, Deserialize)]
struct ConversionResponse {
    factor: f64,
}

fn parse_conversion_factor(text: &str) -> std::result::Result<f64, String> {
    let cleaned = strip_code_fence(text);
    let parsed: ConversionResponse =
        serde_json::from_str(cleaned).map_err(|e| format!("invalid JSON: {e}"))?;
    let factor = parsed.factor;
    if !factor.is_finite() || factor <= 0.0 || factor > MAX_CONVERSION_FACTOR {
        return Err(format!("factor {factor} out of range (0, {MAX_CONVERSION_FACTOR}]"));
    }
    Ok(factor)
}
