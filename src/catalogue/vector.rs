//! Semantic half of C2/C3: cosine search over a precomputed vector
//! index. Computing the embeddings that populate this index is the
//! excluded "index construction" step; this module only scores a
//! query embedding against the stored vectors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const EMBEDDING_DIM: usize = 384;

/// Precomputed vector artifact: uuid -> 384-dim embedding, over
/// searchable (`is_market = false`) entries only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorArtifact {
    pub vectors: HashMap<String, Vec<f32>>,
}

pub struct VectorIndex {
    artifact: VectorArtifact,
}

impl VectorIndex {
    pub fn from_artifact(artifact: VectorArtifact) -> Self {
        Self { artifact }
    }

    pub fn load(path: &str) -> crate::error::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let artifact: VectorArtifact = serde_json::from_str(&data)?;
        Ok(Self::from_artifact(artifact))
    }

    /// Top `k` documents by cosine similarity to `query_embedding`
    /// (C2::vector_search).
    pub fn search(&self, query_embedding: &[f32], k: usize) -> Vec<(String, f64)> {
        let mut scored: Vec<(String, f64)> = self
            .artifact
            .vectors
            .iter()
            .map(|(uuid, vec)| (uuid.clone(), cosine_similarity(query_embedding, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let len = a.len().min(b.len());
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..len {
        dot += a[i] as f64 * b[i] as f64;
        norm_a += (a[i] as f64).powi(2);
        norm_b += (b[i] as f64).powi(2);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-9);
    }

    #[test]
    fn search_ranks_closest_first() {
        let mut vectors = HashMap::new();
        vectors.insert("near".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("far".to_string(), vec![0.0, 1.0, 0.0]);
        let index = VectorIndex::from_artifact(VectorArtifact { vectors });
        let results = index.search(&[0.9, 0.1, 0.0], 2);
        assert_eq!(results[0].0, "near");
    }
}
