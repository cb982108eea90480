//! C2 — Catalogue store: read-only access to the ecoinvent dataset
//! rows plus the precomputed BM25 and vector artifacts built over them.
//!
//! A struct that owns the loaded data and is populated once at
//! startup, then shared read-only across every worker (`CatalogueStore`
//! is wrapped in an `Arc` by callers).

pub mod bm25;
pub mod vector;

use crate::error::{LcaError, Result};
use bm25::{tokenize, Bm25Artifact, Bm25Index};
use csv::Reader;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use vector::{VectorArtifact, VectorIndex, EMBEDDING_DIM};

/// One immutable ecoinvent-style LCI dataset row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub uuid: String,
    pub activity_name: String,
    pub product_name: String,
    pub geography: String,
    pub unit: String,
    pub biogenic_factor: f64,
    pub common_factor: f64,
    pub is_market: bool,
}

impl CatalogueEntry {
    /// Concatenation used for lexical indexing (`searchable_text`).
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.activity_name, self.product_name, self.geography)
    }
}

pub struct CatalogueStore {
    entries: HashMap<String, CatalogueEntry>,
    bm25: Bm25Index,
    vectors: VectorIndex,
}

impl CatalogueStore {
    /// Load the catalogue CSV plus its BM25/vector sidecar artifacts.
    /// `bm25_path`/`vector_path` of `None` falls back to building the
    /// artifacts in-process from the loaded entries — a development
    /// convenience, not the production index-construction pipeline
    /// (which runs offline and is out of this crate's scope).
    pub fn load(csv_path: &str, bm25_path: Option<&str>, vector_path: Option<&str>) -> Result<Self> {
        let entries = Self::load_entries_csv(csv_path)?;
        Self::from_entries(entries, bm25_path, vector_path)
    }

    pub fn from_entries(
        entries: Vec<CatalogueEntry>,
        bm25_path: Option<&str>,
        vector_path: Option<&str>,
    ) -> Result<Self> {
        let bm25 = match bm25_path {
            Some(path) => Bm25Index::load(path)?,
            None => {
                let docs: Vec<(&str, String)> = entries
                    .iter()
                    .filter(|e| !e.is_market)
                    .map(|e| (e.uuid.as_str(), e.searchable_text()))
                    .collect();
                let artifact = Bm25Artifact::build(docs.iter().map(|(id, text)| (*id, text.as_str())));
                Bm25Index::from_artifact(artifact)
            }
        };

        let vectors = match vector_path {
            Some(path) => VectorIndex::load(path)?,
            None => {
                let mut vectors = HashMap::new();
                for entry in entries.iter().filter(|e| !e.is_market) {
                    vectors.insert(entry.uuid.clone(), fallback_embedding(&entry.searchable_text()));
                }
                VectorIndex::from_artifact(VectorArtifact { vectors })
            }
        };

        let by_uuid = entries.into_iter().map(|e| (e.uuid.clone(), e)).collect();

        Ok(Self { entries: by_uuid, bm25, vectors })
    }

    fn load_entries_csv(path: &str) -> Result<Vec<CatalogueEntry>> {
        let mut reader = Reader::from_path(path)?;
        let mut entries = Vec::new();
        for record in reader.deserialize() {
            let entry: CatalogueEntry = record?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn by_uuid(&self, uuid: &str) -> Option<&CatalogueEntry> {
        self.entries.get(uuid)
    }

    pub fn lexical_search(&self, query_terms: &[String], k: usize) -> Vec<(String, f64)> {
        self.bm25.search(query_terms, k)
    }

    pub fn vector_search(&self, query_embedding: &[f32], k: usize) -> Vec<(String, f64)> {
        self.vectors.search(query_embedding, k)
    }

    pub fn all_searchable(&self) -> impl Iterator<Item = &CatalogueEntry> {
        self.entries.values().filter(|e| !e.is_market)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deterministic bag-of-words hash embedding, used only when no real
/// vector artifact is supplied (tests, local dev without the embedding
/// service). Not a substitute for the multilingual sentence encoder
/// the production pipeline calls through [`crate::embedding`].
pub fn fallback_embedding(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; EMBEDDING_DIM];
    for tok in tokenize(text) {
        let mut hash: u64 = 1469598103934665603;
        for byte in tok.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        let idx = (hash as usize) % EMBEDDING_DIM;
        v[idx] += 1.0;
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

pub fn validate_no_market_in_candidates(store: &CatalogueStore, uuid: &str) -> Result<()> {
    match store.by_uuid(uuid) {
        Some(entry) if entry.is_market => {
            Err(LcaError::Catalogue(format!("{uuid} is a market entry, excluded from search")))
        }
        Some(_) => Ok(()),
        None => Err(LcaError::Catalogue(format!("unknown catalogue uuid {uuid}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<CatalogueEntry> {
        vec![
            CatalogueEntry {
                uuid: "u-steel".to_string(),
                activity_name: "steel production".to_string(),
                product_name: "steel, low-alloyed".to_string(),
                geography: "RER".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.02,
                common_factor: 1.8,
                is_market: false,
            },
            CatalogueEntry {
                uuid: "u-steel-market".to_string(),
                activity_name: "market for steel".to_string(),
                product_name: "steel, low-alloyed".to_string(),
                geography: "GLO".to_string(),
                unit: "kg".to_string(),
                biogenic_factor: 0.02,
                common_factor: 1.9,
                is_market: true,
            },
        ]
    }

    #[test]
    fn all_searchable_excludes_market_entries() {
        let store = CatalogueStore::from_entries(sample_entries(), None, None).unwrap();
        let searchable: Vec<_> = store.all_searchable().collect();
        assert_eq!(searchable.len(), 1);
        assert_eq!(searchable[0].uuid, "u-steel");
    }

    #[test]
    fn by_uuid_finds_entry() {
        let store = CatalogueStore::from_entries(sample_entries(), None, None).unwrap();
        assert!(store.by_uuid("u-steel").is_some());
        assert!(store.by_uuid("nonexistent").is_none());
    }

    #[test]
    fn market_entry_rejected_as_candidate() {
        let store = CatalogueStore::from_entries(sample_entries(), None, None).unwrap();
        assert!(validate_no_market_in_candidates(&store, "u-steel").is_ok());
        assert!(validate_no_market_in_candidates(&store, "u-steel-market").is_err());
    }

    #[test]
    fn lexical_search_finds_steel() {
        let store = CatalogueStore::from_entries(sample_entries(), None, None).unwrap();
        let results = store.lexical_search(&["steel".to_string()], 5);
        assert!(results.iter().any(|(id, _)| id == "u-steel"));
    }
}
