//! C5 — Emission calculator: unit reconciliation, factor multiplication,
//! and provenance formatting.

use crate::catalogue::CatalogueEntry;
use crate::models::{DecisionType, ResolvedComponent, RowResult};
use std::fmt::Write as _;

const MAX_QUELLE_LEN: usize = 1000;
const MAX_QUELLE_UUIDS: usize = 10;
const MAX_BESCHREIBUNG_LEN: usize = 1000;

/// Per-kg-of-reference-unit CO2-eq, in tonnes, for a direct match.
pub fn direct_totals(entry: &CatalogueEntry, q: f64) -> (f64, f64) {
    let biogenic_t = entry.biogenic_factor * q / 1000.0;
    let common_t = entry.common_factor * q / 1000.0;
    (biogenic_t, common_t)
}

/// Sum over resolved components.
pub fn decomposition_totals(components: &[ResolvedComponent]) -> (f64, f64) {
    let biogenic_t = components.iter().map(|c| c.biogenic_t).sum();
    let common_t = components.iter().map(|c| c.common_t).sum();
    (biogenic_t, common_t)
}

fn truncate_to(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}

/// One-sentence summary: activity name, chosen geography, unit,
/// multiplier if != 1.
pub fn format_beschreibung(entry: &CatalogueEntry, q: f64) -> String {
    let sentence = if (q - 1.0).abs() < 1e-9 {
        format!(
            "Matched to \"{}\" ({}) in {}, unit {}.",
            entry.activity_name, entry.product_name, entry.geography, entry.unit
        )
    } else {
        format!(
            "Matched to \"{}\" ({}) in {}, unit {}, applying a conversion factor of {:.4}.",
            entry.activity_name, entry.product_name, entry.geography, entry.unit, q
        )
    };
    truncate_to(&sentence, MAX_BESCHREIBUNG_LEN)
}

/// One-sentence summary for a decomposition result, naming the number
/// of components resolved.
pub fn format_beschreibung_decompose(component_count: usize) -> String {
    truncate_to(
        &format!("Decomposed into {component_count} components, each matched to its own ecoinvent activity."),
        MAX_BESCHREIBUNG_LEN,
    )
}

/// Comma-separated, deduplicated, capped UUID list.
pub fn format_quelle(uuids: &[String]) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<&str> = Vec::new();
    for uuid in uuids {
        if seen.insert(uuid.as_str()) {
            deduped.push(uuid.as_str());
        }
    }
    let truncated = deduped.len() > MAX_QUELLE_UUIDS;
    deduped.truncate(MAX_QUELLE_UUIDS);

    let mut joined = deduped.join(", ");
    if truncated {
        joined.push('…');
    }
    truncate_to(&joined, MAX_QUELLE_LEN)
}

/// Line-by-line reproduction of inputs, catalogue factors, conversion
/// rationale, and arithmetic for a direct match.
pub fn format_detailed_calc_direct(entry: &CatalogueEntry, q: f64, conversion_rationale: Option<&str>) -> String {
    let (biogenic_t, common_t) = direct_totals(entry, q);
    let mut out = String::new();
    let _ = writeln!(out, "catalogue entry: {} ({})", entry.activity_name, entry.uuid);
    let _ = writeln!(out, "geography: {}", entry.geography);
    let _ = writeln!(out, "catalogue unit: {}", entry.unit);
    let _ = writeln!(out, "biogenic factor: {} per {}", entry.biogenic_factor, entry.unit);
    let _ = writeln!(out, "common factor: {} per {}", entry.common_factor, entry.unit);
    let _ = writeln!(out, "conversion factor q = {q}");
    if let Some(rationale) = conversion_rationale {
        let _ = writeln!(out, "conversion rationale: {rationale}");
    }
    let _ = writeln!(out, "biogenic_kg = {} * {} = {}", entry.biogenic_factor, q, entry.biogenic_factor * q);
    let _ = writeln!(out, "common_kg   = {} * {} = {}", entry.common_factor, q, entry.common_factor * q);
    let _ = writeln!(out, "biogenic_t  = biogenic_kg / 1000 = {biogenic_t}");
    let _ = writeln!(out, "common_t    = common_kg / 1000 = {common_t}");
    out
}

/// Line-by-line reproduction for a decomposition: each component's own
/// calculation, followed by the summation.
pub fn format_detailed_calc_decompose(components: &[ResolvedComponent]) -> String {
    let mut out = String::new();
    for c in components {
        let _ = writeln!(
            out,
            "component \"{}\" (quantity={}, category={:?}) -> uuid {} biogenic_t={} common_t={}",
            c.spec.name, c.spec.quantity, c.spec.category, c.selected_uuid, c.biogenic_t, c.common_t
        );
    }
    let (biogenic_t, common_t) = decomposition_totals(components);
    let _ = writeln!(out, "biogenic_t = sum(component.biogenic_t) = {biogenic_t}");
    let _ = writeln!(out, "common_t   = sum(component.common_t) = {common_t}");
    out
}

/// Assemble the final `RowResult` for a direct match.
pub fn build_match_result(
    entry: &CatalogueEntry,
    q: f64,
    conversion_rationale: Option<&str>,
    candidates_json: Option<String>,
) -> RowResult {
    let (biogenic_t, common_t) = direct_totals(entry, q);
    RowResult {
        decision_type: DecisionType::Match,
        selected_uuid: Some(entry.uuid.clone()),
        candidates_json,
        components_json: None,
        biogenic_t: format!("{biogenic_t}"),
        common_t: format!("{common_t}"),
        beschreibung: format_beschreibung(entry, q),
        quelle: format_quelle(&[entry.uuid.clone()]),
        detailed_calc: format_detailed_calc_direct(entry, q, conversion_rationale),
        provenance_json: serde_json::json!({
            "decision": "match",
            "selected_uuid": entry.uuid,
            "q": q,
        })
        .to_string(),
    }
}

/// Assemble the final `RowResult` for a decomposition.
pub fn build_decompose_result(components: &[ResolvedComponent]) -> RowResult {
    let (biogenic_t, common_t) = decomposition_totals(components);
    let uuids: Vec<String> = components.iter().map(|c| c.selected_uuid.clone()).collect();
    let components_json = serde_json::to_string(components).ok();
    RowResult {
        decision_type: DecisionType::Decompose,
        selected_uuid: None,
        candidates_json: None,
        components_json,
        biogenic_t: format!("{biogenic_t}"),
        common_t: format!("{common_t}"),
        beschreibung: format_beschreibung_decompose(components.len()),
        quelle: format_quelle(&uuids),
        detailed_calc: format_detailed_calc_decompose(components),
        provenance_json: serde_json::json!({
            "decision": "decompose",
            "component_count": components.len(),
        })
        .to_string(),
    }
}
