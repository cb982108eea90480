//! C3 — Candidate retriever: hybrid BM25 + embedding search, reciprocal
//! rank fusion, region/unit re-ranking.
//!
//! Query construction and the scope-hint augmentation live here, not in
//! [`crate::catalogue`], so the catalogue store stays a pure index.

use crate::catalogue::bm25::tokenize;
use crate::catalogue::CatalogueStore;
use crate::embedding::EmbeddingEncoder;
use crate::error::{LcaError, Result};
use crate::models::{Candidate, CandidateSet, InputRow, Scope};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub pool: usize,
    pub rrf_k: u32,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self { top_k: 20, pool: 100, rrf_k: 60 }
    }
}

impl From<&crate::config::Config> for RetrievalParams {
    fn from(cfg: &crate::config::Config) -> Self {
        Self { top_k: cfg.top_k, pool: cfg.pool_size, rrf_k: cfg.rrf_k }
    }
}

fn scope_hint(scope: Option<Scope>) -> Option<&'static str> {
    match scope {
        Some(Scope::Scope1) => Some("combustion burned fuel"),
        Some(Scope::Scope2) => Some("electricity heat steam supply"),
        Some(Scope::Scope3) => Some("production manufacturing at plant"),
        None => None,
    }
}

/// Build the retrieval query text for a normalised row: `bezeichnung_norm`
/// plus optional `produktinfo_norm`, plus a scope hint that is never
/// surfaced in output, only used to steer retrieval.
pub fn build_query(row: &InputRow) -> String {
    let mut parts = vec![row
        .bezeichnung_norm
        .clone()
        .unwrap_or_else(|| row.bezeichnung.clone())];
    if let Some(info) = &row.produktinfo_norm {
        parts.push(info.clone());
    }
    if let Some(hint) = scope_hint(row.scope) {
        parts.push(hint.to_string());
    }
    parts.join(" ")
}

/// C3: retrieve, fuse, and re-rank candidates for a normalised row.
/// `row` must already have passed through [`crate::normalizer::normalize_row`].
pub async fn retrieve(
    store: &CatalogueStore,
    encoder: &dyn EmbeddingEncoder,
    row: &InputRow,
    params: RetrievalParams,
) -> Result<CandidateSet> {
    let query = build_query(row);
    let region_norm = row.region_norm.clone().unwrap_or_else(|| "GLO".to_string());
    let unit_norm = row
        .unit_norm
        .clone()
        .ok_or_else(|| LcaError::UnknownUnit(row.referenzeinheit.clone()))?;

    let terms = tokenize(&query);
    let lexical = store.lexical_search(&terms, params.pool);

    let embedding = encoder.embed(&query).await?;
    let semantic = store.vector_search(&embedding, params.pool);

    let fused = reciprocal_rank_fusion(&lexical, &semantic, params.rrf_k);
    let region_ranked = region_rerank(fused, store, &region_norm);
    let unit_ranked = unit_partition(region_ranked, store, &unit_norm);

    let mut candidates = Vec::with_capacity(params.top_k.min(unit_ranked.len()));
    let mut rank = 0usize;
    for uuid in unit_ranked {
        if rank >= params.top_k {
            break;
        }
        let Some(entry) = store.by_uuid(&uuid) else { continue };
        // Market entries are synthetic aggregates excluded from search;
        // never let one reach the candidate set even if an upstream
        // BM25/vector artifact surfaced it.
        if entry.is_market {
            continue;
        }
        rank += 1;
        candidates.push(Candidate {
            uuid: entry.uuid.clone(),
            activity_name: entry.activity_name.clone(),
            product_name: entry.product_name.clone(),
            geography: entry.geography.clone(),
            unit: entry.unit.clone(),
            rank,
            rationale: format!(
                "{} ({}) in {}, unit {}",
                entry.activity_name, entry.product_name, entry.geography, entry.unit
            ),
        });
    }

    if candidates.is_empty() {
        return Err(LcaError::NoCandidates);
    }
    Ok(candidates)
}

/// Reciprocal rank fusion over two 1-indexed ranked lists.
/// Tie-break by lower best-rank, then by uuid, for deterministic ordering.
fn reciprocal_rank_fusion(
    lexical: &[(String, f64)],
    semantic: &[(String, f64)],
    rrf_k: u32,
) -> Vec<String> {
    let mut rank_of: HashMap<&str, (Option<usize>, Option<usize>)> = HashMap::new();
    for (i, (uuid, _)) in lexical.iter().enumerate() {
        rank_of.entry(uuid.as_str()).or_insert((None, None)).0 = Some(i + 1);
    }
    for (i, (uuid, _)) in semantic.iter().enumerate() {
        rank_of.entry(uuid.as_str()).or_insert((None, None)).1 = Some(i + 1);
    }

    let k = rrf_k as f64;
    let mut scored: Vec<(String, f64, usize)> = rank_of
        .into_iter()
        .map(|(uuid, (r1, r2))| {
            let score = r1.map(|r| 1.0 / (k + r as f64)).unwrap_or(0.0)
                + r2.map(|r| 1.0 / (k + r as f64)).unwrap_or(0.0);
            let best_rank = match (r1, r2) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => usize::MAX,
            };
            (uuid.to_string(), score, best_rank)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
            .then_with(|| a.0.cmp(&b.0))
    });

    scored.into_iter().map(|(uuid, _, _)| uuid).collect()
}

fn region_priority(geography: &str, region_norm: &str) -> u8 {
    if geography == region_norm {
        0
    } else if geography == "GLO" {
        1
    } else if geography == "RoW" {
        2
    } else {
        3
    }
}

/// Stable re-sort by `(region_priority asc)`, preserving RRF order within
/// a priority band.
fn region_rerank(fused: Vec<String>, store: &CatalogueStore, region_norm: &str) -> Vec<String> {
    let mut indexed: Vec<(usize, String, u8)> = fused
        .into_iter()
        .enumerate()
        .map(|(i, uuid)| {
            let priority = store
                .by_uuid(&uuid)
                .map(|e| region_priority(&e.geography, region_norm))
                .unwrap_or(3);
            (i, uuid, priority)
        })
        .collect();
    indexed.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
    indexed.into_iter().map(|(_, uuid, _)| uuid).collect()
}

/// Stable partition: matching-unit candidates first, `other` after;
/// relative order preserved within each partition.
fn unit_partition(ranked: Vec<String>, store: &CatalogueStore, unit_norm: &str) -> Vec<String> {
    let mut matching = Vec::new();
    let mut other = Vec::new();
    for uuid in ranked {
        let is_match = store.by_uuid(&uuid).map(|e| e.unit == unit_norm).unwrap_or(false);
        if is_match {
            matching.push(uuid);
        } else {
            other.push(uuid);
        }
    }
    matching.extend(other);
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::CatalogueEntry;
    use crate::embedding::FallbackEmbeddingEncoder;
    use crate::models::RowStatus;
    use uuid::Uuid;

    fn entries() -> Vec<CatalogueEntry> {
        vec![
            CatalogueEntry {
                uuid: "de-steel".to_string(),
                activity_name: "steel production".to_string(),
                product_name: "steel".to_string(),
                geography: "DE".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.01,
                common_factor: 1.5,
                is_market: false,
            },
            CatalogueEntry {
                uuid: "rer-steel".to_string(),
                activity_name: "steel production".to_string(),
                product_name: "steel".to_string(),
                geography: "RER".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.02,
                common_factor: 1.8,
                is_market: false,
            },
            CatalogueEntry {
                uuid: "glo-steel-market".to_string(),
                activity_name: "market for steel".to_string(),
                product_name: "steel".to_string(),
                geography: "GLO".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.02,
                common_factor: 1.9,
                is_market: true,
            },
        ]
    }

    fn row(bezeichnung: &str, referenzeinheit: &str, region: &str) -> InputRow {
        let mut row = InputRow::new(Uuid::new_v4(), 0, bezeichnung.to_string(), referenzeinheit.to_string());
        row.region = Some(region.to_string());
        row.status = RowStatus::Searching;
        crate::normalizer::normalize_row(&mut row).unwrap();
        row
    }

    #[tokio::test]
    async fn region_preference_puts_matching_geography_first() {
        let store = CatalogueStore::from_entries(entries(), None, None).unwrap();
        let encoder = FallbackEmbeddingEncoder;
        let input = row("Stahl", "kg", "RER");
        let candidates = retrieve(&store, &encoder, &input, RetrievalParams::default()).await.unwrap();
        assert_eq!(candidates[0].uuid, "rer-steel");
        assert!(candidates.iter().all(|c| c.uuid != "glo-steel-market"));
    }

    #[tokio::test]
    async fn market_entry_never_reaches_candidate_set_even_on_lexical_hit() {
        // "market for steel" shares every lexical term with the query,
        // so BM25 alone would rank it first if market entries weren't
        // excluded from the fallback index and from the candidate list.
        let store = CatalogueStore::from_entries(entries(), None, None).unwrap();
        let encoder = FallbackEmbeddingEncoder;
        let input = row("market for steel", "kg", "GLO");
        let candidates = retrieve(&store, &encoder, &input, RetrievalParams::default()).await.unwrap();
        assert!(candidates.iter().all(|c| c.uuid != "glo-steel-market"));
    }

    #[tokio::test]
    async fn empty_catalogue_yields_no_candidates_error() {
        let store = CatalogueStore::from_entries(vec![], None, None).unwrap();
        let encoder = FallbackEmbeddingEncoder;
        let input = row("Stahl", "kg", "RER");
        let err = retrieve(&store, &encoder, &input, RetrievalParams::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind_tag(), "NoCandidates");
    }

    #[test]
    fn rrf_first_in_both_scores_two_over_sixty_one() {
        let lexical = vec![("a".to_string(), 10.0)];
        let semantic = vec![("a".to_string(), 0.9)];
        let fused = reciprocal_rank_fusion(&lexical, &semantic, 60);
        assert_eq!(fused[0], "a");

        let expected = 2.0 / 61.0;
        let score = 1.0 / (60.0 + 1.0) + 1.0 / (60.0 + 1.0);
        assert!((score - expected).abs() < 1e-12);
    }

    #[test]
    fn unit_partition_is_stable() {
        let store = CatalogueStore::from_entries(entries(), None, None).unwrap();
        let ranked = vec!["de-steel".to_string(), "rer-steel".to_string()];
        let partitioned = unit_partition(ranked.clone(), &store, "kg");
        assert_eq!(partitioned, ranked);
    }
}
