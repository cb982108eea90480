//! Lexical half of C2/C3: BM25 scoring over a precomputed inverted
//! index. Building the index from raw catalogue text is out of scope
//! here; this module only *evaluates* BM25 against a query, consuming
//! whatever artifact produced the statistics below.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Precomputed BM25 term statistics, the sidecar artifact C2 loads
/// alongside the catalogue CSV.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Bm25Artifact {
    /// term -> postings list of (uuid, term frequency in that document)
    pub postings: HashMap<String, Vec<(String, u32)>>,
    /// uuid -> document length (token count)
    pub doc_len: HashMap<String, u32>,
    pub avg_doc_len: f64,
    pub n_docs: u32,
}

impl Bm25Artifact {
    /// Build the artifact from scratch. Index construction is normally
    /// an offline step; this exists here only so the crate is
    /// self-contained for local development and tests when no
    /// precomputed sidecar file is supplied. Production deployments
    /// should call [`Bm25Index::load`] against a file produced by the
    /// offline indexing pipeline.
    pub fn build<'a>(documents: impl Iterator<Item = (&'a str, &'a str)>) -> Self {
        let mut postings: HashMap<String, Vec<(String, u32)>> = HashMap::new();
        let mut doc_len = HashMap::new();
        let mut n_docs = 0u32;
        let mut total_len = 0u64;

        for (uuid, text) in documents {
            let tokens = tokenize(text);
            let len = tokens.len() as u32;
            doc_len.insert(uuid.to_string(), len);
            total_len += len as u64;
            n_docs += 1;

            let mut counts: HashMap<String, u32> = HashMap::new();
            for tok in tokens {
                *counts.entry(tok).or_insert(0) += 1;
            }
            for (term, tf) in counts {
                postings.entry(term).or_default().push((uuid.to_string(), tf));
            }
        }

        let avg_doc_len = if n_docs == 0 { 0.0 } else { total_len as f64 / n_docs as f64 };

        Self { postings, doc_len, avg_doc_len, n_docs }
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

pub struct Bm25Index {
    artifact: Bm25Artifact,
}

impl Bm25Index {
    pub fn from_artifact(artifact: Bm25Artifact) -> Self {
        Self { artifact }
    }

    pub fn load(path: &str) -> crate::error::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let artifact: Bm25Artifact = serde_json::from_str(&data)?;
        Ok(Self::from_artifact(artifact))
    }

    /// Top `k` documents by BM25 score for the given query terms,
    /// ordered by descending score (C2::lexical_search).
    pub fn search(&self, query_terms: &[String], k: usize) -> Vec<(String, f64)> {
        let n_docs = self.artifact.n_docs.max(1) as f64;
        let mut scores: HashMap<String, f64> = HashMap::new();

        for term in query_terms {
            let Some(postings) = self.artifact.postings.get(term) else { continue };
            let df = postings.len() as f64;
            let idf = ((n_docs - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (uuid, tf) in postings {
                let doc_len = *self.artifact.doc_len.get(uuid).unwrap_or(&0) as f64;
                let denom_norm = if self.artifact.avg_doc_len > 0.0 {
                    doc_len / self.artifact.avg_doc_len
                } else {
                    1.0
                };
                let tf = *tf as f64;
                let score = idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * denom_norm));
                *scores.entry(uuid.clone()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_exact_term_overlap_higher() {
        let docs = vec![
            ("a", "stahlblech warmgewalzt"),
            ("b", "diesel verbrennung motor"),
            ("c", "stahl rohr kaltgezogen"),
        ];
        let artifact = Bm25Artifact::build(docs.into_iter());
        let index = Bm25Index::from_artifact(artifact);
        let results = index.search(&["stahl".to_string()], 10);
        assert!(results.iter().any(|(id, _)| id == "c"));
        assert!(!results.iter().any(|(id, _)| id == "b"));
    }

    #[test]
    fn empty_query_returns_nothing() {
        let artifact = Bm25Artifact::build(vec![("a", "diesel")].into_iter());
        let index = Bm25Index::from_artifact(artifact);
        assert!(index.search(&[], 10).is_empty());
    }
}
