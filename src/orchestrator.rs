//! C6 — Row orchestrator: the per-row state machine driving
//! C1 -> C3 -> C4 -> (C3 -> C4 for components) -> C5.

use crate::calculator;
use crate::catalogue::{validate_no_market_in_candidates, CatalogueStore};
use crate::embedding::EmbeddingEncoder;
use crate::error::{LcaError, Result};
use crate::models::{
    CandidateSet, ComponentSpec, InputRow, JobMode, ResolvedComponent, RowResult, RowStatus,
};
use crate::normalizer::normalize_row;
use crate::oracle::client::LlmClient;
use crate::oracle::{self, Decision};
use crate::retriever::{self, RetrievalParams};
use crate::scheduler::CancelToken;
use crate::store::JobStore;
use log::{info, warn};
use std::sync::Arc;

pub struct Orchestrator {
    pub store: Arc<dyn JobStore>,
    pub catalogue: Arc<CatalogueStore>,
    pub encoder: Arc<dyn EmbeddingEncoder>,
    pub llm: Arc<dyn LlmClient>,
    pub params: RetrievalParams,
    pub mode: JobMode,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        catalogue: Arc<CatalogueStore>,
        encoder: Arc<dyn EmbeddingEncoder>,
        llm: Arc<dyn LlmClient>,
        params: RetrievalParams,
        mode: JobMode,
    ) -> Self {
        Self { store, catalogue, encoder, llm, params, mode }
    }

    /// Drive one row through `pending` to a terminal state
    /// (`calculated`, `ambiguous` [suspended], or `error`).
    ///
    /// `cancel` is checked at each scheduling point: an in-flight LLM
    /// call always finishes, but the row aborts into
    /// `error("cancelled")` before the next one starts rather than
    /// proceeding to the next state-machine step.
    pub async fn process_row(&self, mut row: InputRow, cancel: CancelToken) -> Result<()> {
        if let Err(e) = normalize_row(&mut row) {
            warn!("row {} failed normalisation: {e}", row.id);
            self.store.set_row_error(row.id, e.kind_tag(), &e.to_string()).await?;
            return Ok(());
        }
        self.store.save_normalized_row(row.clone()).await?;

        self.store.update_row_status(row.id, RowStatus::Searching).await?;
        let candidates = match retriever::retrieve(&self.catalogue, self.encoder.as_ref(), &row, self.params).await {
            Ok(c) => c,
            Err(e) => {
                self.store.set_row_error(row.id, e.kind_tag(), &e.to_string()).await?;
                return Ok(());
            }
        };

        if self.abort_if_cancelled(row.id, &cancel).await? {
            return Ok(());
        }

        self.store.update_row_status(row.id, RowStatus::LlmDeciding).await?;
        let decision = match oracle::decide(self.llm.as_ref(), &row, &candidates, true).await {
            Ok(d) => d,
            Err(e) => {
                self.store.set_row_error(row.id, e.kind_tag(), &e.to_string()).await?;
                return Ok(());
            }
        };

        if self.abort_if_cancelled(row.id, &cancel).await? {
            return Ok(());
        }

        if let Err(e) = self.handle_decision(&row, &candidates, decision, &cancel).await {
            self.store.set_row_error(row.id, e.kind_tag(), &e.to_string()).await?;
        }
        Ok(())
    }

    /// If `cancel` has fired, roll the row to `error("cancelled")` and
    /// report `true` so the caller stops without starting another
    /// suspension point. No partial result is persisted.
    async fn abort_if_cancelled(&self, row_id: uuid::Uuid, cancel: &CancelToken) -> Result<bool> {
        if cancel.is_cancelled() {
            self.store.set_row_error(row_id, LcaError::Cancelled.kind_tag(), "cancelled").await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn handle_decision(
        &self,
        row: &InputRow,
        candidates: &CandidateSet,
        decision: Decision,
        cancel: &CancelToken,
    ) -> Result<()> {
        match decision {
            Decision::Match { selected_uuid, rationale } => {
                self.handle_match_decision(row, candidates, selected_uuid, rationale).await
            }
            Decision::Ambiguous { plausible, rationale } => {
                info!("row {} ambiguous: {rationale}", row.id);
                match self.mode {
                    JobMode::Review => {
                        self.store.save_candidates(row.id, candidates.clone()).await?;
                        self.store.update_row_status(row.id, RowStatus::Ambiguous).await?;
                        Ok(())
                    }
                    JobMode::Auto => {
                        let _ = plausible;
                        let top = candidates.iter().min_by_key(|c| c.rank).ok_or(LcaError::NoCandidates)?;
                        self.finish_match(row, candidates, &top.uuid, None).await
                    }
                }
            }
            Decision::Decompose { components } => self.handle_decompose(row, components, cancel).await,
        }
    }

    /// Validate a `Match` isn't a market entry; on violation, retry
    /// `decide` once, then degrade to `Ambiguous` using the top
    /// candidates.
    async fn handle_match_decision(
        &self,
        row: &InputRow,
        candidates: &CandidateSet,
        selected_uuid: String,
        _rationale: String,
    ) -> Result<()> {
        if validate_no_market_in_candidates(&self.catalogue, &selected_uuid).is_ok() {
            return self.finish_match(row, candidates, &selected_uuid, None).await;
        }

        warn!("row {} match {selected_uuid} is a market entry, retrying decide()", row.id);
        match oracle::decide(self.llm.as_ref(), row, candidates, true).await {
            Ok(Decision::Match { selected_uuid, .. })
                if validate_no_market_in_candidates(&self.catalogue, &selected_uuid).is_ok() =>
            {
                self.finish_match(row, candidates, &selected_uuid, None).await
            }
            _ => {
                warn!("row {} still resolves to a market entry, degrading to ambiguous", row.id);
                self.store.save_candidates(row.id, candidates.clone()).await?;
                self.store.update_row_status(row.id, RowStatus::Ambiguous).await?;
                Ok(())
            }
        }
    }

    /// Shared tail for both `match` and auto-picked `ambiguous`
    /// decisions: reconcile units (possibly via `convert_unit`) and
    /// compute the result.
    async fn finish_match(
        &self,
        row: &InputRow,
        candidates: &CandidateSet,
        selected_uuid: &str,
        precomputed_q: Option<f64>,
    ) -> Result<()> {
        self.store.update_row_status(row.id, RowStatus::Matched).await?;
        let entry = self
            .catalogue
            .by_uuid(selected_uuid)
            .ok_or_else(|| LcaError::Catalogue(format!("unknown catalogue uuid {selected_uuid}")))?;

        let unit_norm = row.unit_norm.as_deref().unwrap_or(&row.referenzeinheit);
        let q = match precomputed_q {
            Some(q) => q,
            None if entry.unit == unit_norm => 1.0,
            None => {
                oracle::convert_unit(
                    self.llm.as_ref(),
                    row.bezeichnung_norm.as_deref().unwrap_or(&row.bezeichnung),
                    unit_norm,
                    &entry.unit,
                )
                .await?
            }
        };

        let candidates_json = serde_json::to_string(candidates).ok();
        let result = calculator::build_match_result(entry, q, None, candidates_json);
        self.store.save_result(row.id, result).await?;
        Ok(())
    }

    /// Resume an `ambiguous` row after an external `resolve(row_id,
    /// uuid)` call: unit conversion + compute, without re-invoking
    /// `decide`.
    pub async fn resume_after_resolution(&self, row_id: uuid::Uuid, selected_uuid: &str) -> Result<()> {
        let row = self.store.resolve_row(row_id, selected_uuid).await?;
        let candidates = self.store.load_candidates(row_id).await?;
        if let Err(e) = self.finish_match(&row, &candidates, selected_uuid, None).await {
            self.store.set_row_error(row_id, e.kind_tag(), &e.to_string()).await?;
        }
        Ok(())
    }

    /// Each component spawns a minimal synthetic row run through
    /// C1/C3/C4 with `allow_decompose = false`. Component ambiguities
    /// are never suspended; the LLM's first plausible candidate is
    /// auto-picked regardless of job mode.
    async fn handle_decompose(&self, row: &InputRow, components: Vec<ComponentSpec>, cancel: &CancelToken) -> Result<()> {
        self.store.update_row_status(row.id, RowStatus::Decomposing).await?;

        let mut resolved = Vec::with_capacity(components.len());
        for spec in components {
            if cancel.is_cancelled() {
                return Err(LcaError::Cancelled);
            }
            let resolved_component = self.resolve_component(row, &spec).await.map_err(|e| LcaError::ComponentFailed {
                name: spec.name.clone(),
                source: Box::new(e),
            })?;
            resolved.push(resolved_component);
        }

        let result: RowResult = calculator::build_decompose_result(&resolved);
        self.store.save_result(row.id, result).await?;
        Ok(())
    }

    async fn resolve_component(&self, parent: &InputRow, spec: &ComponentSpec) -> Result<ResolvedComponent> {
        let mut sub_row = InputRow::for_component(parent, &spec.name, spec.category);
        normalize_row(&mut sub_row)?;

        let candidates = retriever::retrieve(&self.catalogue, self.encoder.as_ref(), &sub_row, self.params).await?;
        let decision = oracle::decide(self.llm.as_ref(), &sub_row, &candidates, false).await?;

        let selected_uuid = match decision {
            Decision::Match { selected_uuid, .. } => selected_uuid,
            Decision::Ambiguous { plausible, .. } => {
                plausible.first().map(|p| p.uuid.clone()).ok_or(LcaError::NoCandidates)?
            }
            Decision::Decompose { .. } => {
                return Err(LcaError::LlmMalformed("nested decomposition is not permitted".to_string()))
            }
        };
        validate_no_market_in_candidates(&self.catalogue, &selected_uuid)?;

        let entry = self
            .catalogue
            .by_uuid(&selected_uuid)
            .ok_or_else(|| LcaError::Catalogue(format!("unknown catalogue uuid {selected_uuid}")))?;

        let unit_norm = sub_row.unit_norm.as_deref().unwrap_or(&sub_row.referenzeinheit);
        let q = if entry.unit == unit_norm {
            1.0
        } else {
            oracle::convert_unit(self.llm.as_ref(), &spec.name, unit_norm, &entry.unit).await?
        };

        let (biogenic_t, common_t) = calculator::direct_totals(entry, q * spec.quantity);
        Ok(ResolvedComponent { spec: spec.clone(), selected_uuid, biogenic_t, common_t })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueEntry;
    use crate::embedding::FallbackEmbeddingEncoder;
    use crate::oracle::client::FakeLlmClient;
    use crate::store::InMemoryJobStore;

    fn catalogue() -> Arc<CatalogueStore> {
        let entries = vec![
            CatalogueEntry {
                uuid: "u-steel".to_string(),
                activity_name: "steel production".to_string(),
                product_name: "steel".to_string(),
                geography: "RER".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.02,
                common_factor: 1.8,
                is_market: false,
            },
            CatalogueEntry {
                uuid: "u-diesel".to_string(),
                activity_name: "diesel burned in building machine".to_string(),
                product_name: "diesel".to_string(),
                geography: "RER".to_string(),
                unit: "MJ".to_string(),
                biogenic_factor: 0.0,
                common_factor: 0.07,
                is_market: false,
            },
        ];
        Arc::new(CatalogueStore::from_entries(entries, None, None).unwrap())
    }

    #[tokio::test]
    async fn simple_match_same_unit_reaches_calculated() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Auto).await.unwrap();
        let mut row = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        row.region = Some("RER".to_string());
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row.clone()]).await.unwrap();

        let llm = Arc::new(FakeLlmClient::new().on(
            "stahl",
            r#"{"decision":"match","selected_uuid":"u-steel","rationale":"exact"}"#,
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            llm,
            RetrievalParams::default(),
            JobMode::Auto,
        );

        orchestrator.process_row(row, crate::scheduler::CancelToken::new()).await.unwrap();
        let final_row = store.load_row(row_id).await.unwrap();
        assert_eq!(final_row.status, RowStatus::Calculated);
    }

    #[tokio::test]
    async fn unknown_unit_terminates_in_error() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Auto).await.unwrap();
        let row = InputRow::new(job.id, 0, "Stahl".to_string(), "Faß".to_string());
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row.clone()]).await.unwrap();

        let orchestrator = Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            Arc::new(FakeLlmClient::new()),
            RetrievalParams::default(),
            JobMode::Auto,
        );

        orchestrator.process_row(row, crate::scheduler::CancelToken::new()).await.unwrap();
        let final_row = store.load_row(row_id).await.unwrap();
        assert_eq!(final_row.status, RowStatus::Error);
        assert_eq!(final_row.error_kind.as_deref(), Some("UnknownUnit"));
    }

    #[tokio::test]
    async fn ambiguous_in_review_mode_suspends_then_resolves() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Review).await.unwrap();
        let mut row = InputRow::new(job.id, 0, "Diesel Verbrennung".to_string(), "l".to_string());
        row.referenzeinheit = "MJ".to_string();
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row.clone()]).await.unwrap();

        let llm = Arc::new(FakeLlmClient::new().on(
            "diesel",
            r#"{"decision":"ambiguous","plausible":[{"uuid":"u-diesel","why_short":"building"},{"uuid":"u-steel","why_short":"other"}],"rationale":"unsure"}"#,
        ).on("burned in building", r#"{"factor": 1.0}"#));

        let orchestrator = Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            llm,
            RetrievalParams::default(),
            JobMode::Review,
        );

        orchestrator.process_row(row, crate::scheduler::CancelToken::new()).await.unwrap();
        let suspended = store.load_row(row_id).await.unwrap();
        assert_eq!(suspended.status, RowStatus::Ambiguous);

        orchestrator.resume_after_resolution(row_id, "u-diesel").await.unwrap();
        let resolved = store.load_row(row_id).await.unwrap();
        assert_eq!(resolved.status, RowStatus::Calculated);
    }
}
