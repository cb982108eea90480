//! C8 — Job store: persists jobs, rows, results, and candidates.
//!
//! No external database is part of this crate's dependency stack, so
//! the store is realised in-process: a `JobStore` trait gives a struct
//! owning the data plus load/query methods, with a single
//! `InMemoryJobStore` guarded by `tokio::sync::RwLock` per table and a
//! per-row `tokio::sync::Mutex` for the atomic single-row write path.
//! Each worker clones an `Arc` handle once at pool startup, rather than
//! sharing a raw reference.

use crate::error::{LcaError, Result};
use crate::models::{Candidate, Job, JobMode, JobStatus, InputRow, RowResult, RowStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use uuid::Uuid;

const WRITER_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, mode: JobMode) -> Result<Job>;
    async fn add_input_rows(&self, job_id: Uuid, rows: Vec<InputRow>) -> Result<()>;
    async fn update_row_status(&self, row_id: Uuid, status: RowStatus) -> Result<()>;
    /// Persist the normaliser's (C1) shadow fields onto the stored row,
    /// so a later resumption (e.g. after `ambiguous` resolves) reads
    /// the same `*_norm` values the orchestrator computed, rather than
    /// re-deriving them from the raw fields.
    async fn save_normalized_row(&self, row: InputRow) -> Result<()>;
    async fn save_candidates(&self, row_id: Uuid, candidates: Vec<Candidate>) -> Result<()>;
    async fn save_result(&self, row_id: Uuid, result: RowResult) -> Result<()>;
    async fn load_row(&self, row_id: Uuid) -> Result<InputRow>;
    async fn load_candidates(&self, row_id: Uuid) -> Result<Vec<Candidate>>;
    async fn load_result(&self, row_id: Uuid) -> Result<Option<RowResult>>;
    async fn list_ambiguous(&self, job_id: Uuid) -> Result<Vec<InputRow>>;
    async fn resolve_row(&self, row_id: Uuid, selected_uuid: &str) -> Result<InputRow>;
    async fn set_row_error(&self, row_id: Uuid, kind: &str, message: &str) -> Result<()>;
    async fn list_job_rows(&self, job_id: Uuid) -> Result<Vec<InputRow>>;
    async fn get_job(&self, job_id: Uuid) -> Result<Job>;
    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()>;
    async fn recompute_counters(&self, job_id: Uuid) -> Result<Job>;
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    rows: HashMap<Uuid, InputRow>,
    results: HashMap<Uuid, RowResult>,
    candidates: HashMap<Uuid, Vec<Candidate>>,
}

pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self { tables: RwLock::new(Tables::default()), row_locks: Mutex::new(HashMap::new()) }
    }

    /// Acquire the per-row write lock, honouring the 30s busy timeout:
    /// writes affecting a single row are atomic, guarded by a 30s
    /// busy-wait timeout.
    async fn lock_row(&self, row_id: Uuid) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.row_locks.lock().await;
            locks.entry(row_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        timeout(WRITER_BUSY_TIMEOUT, lock.lock_owned())
            .await
            .map_err(|_| LcaError::StoreBusy(WRITER_BUSY_TIMEOUT))
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, mode: JobMode) -> Result<Job> {
        let job = Job::new(mode);
        let mut tables = self.tables.write().await;
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn add_input_rows(&self, job_id: Uuid, rows: Vec<InputRow>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let count = rows.len();
        for row in rows {
            tables.rows.insert(row.id, row);
        }
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.total += count;
            job.pending += count;
            job.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn update_row_status(&self, row_id: Uuid, status: RowStatus) -> Result<()> {
        let _guard = self.lock_row(row_id).await?;
        let mut tables = self.tables.write().await;
        let row = tables.rows.get_mut(&row_id).ok_or_else(|| LcaError::RowNotFound(row_id.to_string()))?;
        row.status = status;
        Ok(())
    }

    async fn save_normalized_row(&self, row: InputRow) -> Result<()> {
        let _guard = self.lock_row(row.id).await?;
        let mut tables = self.tables.write().await;
        let stored = tables.rows.get_mut(&row.id).ok_or_else(|| LcaError::RowNotFound(row.id.to_string()))?;
        *stored = row;
        Ok(())
    }

    async fn save_candidates(&self, row_id: Uuid, candidates: Vec<Candidate>) -> Result<()> {
        let _guard = self.lock_row(row_id).await?;
        let mut tables = self.tables.write().await;
        tables.candidates.insert(row_id, candidates);
        Ok(())
    }

    async fn save_result(&self, row_id: Uuid, result: RowResult) -> Result<()> {
        let _guard = self.lock_row(row_id).await?;
        let mut tables = self.tables.write().await;
        tables.results.insert(row_id, result);
        if let Some(row) = tables.rows.get_mut(&row_id) {
            row.status = RowStatus::Calculated;
        }
        Ok(())
    }

    async fn load_row(&self, row_id: Uuid) -> Result<InputRow> {
        let tables = self.tables.read().await;
        tables.rows.get(&row_id).cloned().ok_or_else(|| LcaError::RowNotFound(row_id.to_string()))
    }

    async fn load_candidates(&self, row_id: Uuid) -> Result<Vec<Candidate>> {
        let tables = self.tables.read().await;
        Ok(tables.candidates.get(&row_id).cloned().unwrap_or_default())
    }

    async fn load_result(&self, row_id: Uuid) -> Result<Option<RowResult>> {
        let tables = self.tables.read().await;
        Ok(tables.results.get(&row_id).cloned())
    }

    async fn list_ambiguous(&self, job_id: Uuid) -> Result<Vec<InputRow>> {
        let tables = self.tables.read().await;
        Ok(tables
            .rows
            .values()
            .filter(|r| r.job_id == job_id && r.status == RowStatus::Ambiguous)
            .cloned()
            .collect())
    }

    async fn resolve_row(&self, row_id: Uuid, selected_uuid: &str) -> Result<InputRow> {
        let _guard = self.lock_row(row_id).await?;
        let mut tables = self.tables.write().await;

        if let Some(result) = tables.results.get(&row_id) {
            if result.selected_uuid.as_deref() == Some(selected_uuid) {
                return tables.rows.get(&row_id).cloned().ok_or_else(|| LcaError::RowNotFound(row_id.to_string()));
            }
        }

        let row = tables.rows.get(&row_id).ok_or_else(|| LcaError::RowNotFound(row_id.to_string()))?;
        if row.status != RowStatus::Ambiguous {
            return Err(LcaError::NotAmbiguous(row_id.to_string()));
        }

        let candidates = tables.candidates.get(&row_id).cloned().unwrap_or_default();
        if !candidates.iter().any(|c| c.uuid == selected_uuid) {
            return Err(LcaError::UuidNotCandidate(selected_uuid.to_string()));
        }

        let row = tables.rows.get_mut(&row_id).unwrap();
        row.status = RowStatus::Matched;
        Ok(row.clone())
    }

    async fn set_row_error(&self, row_id: Uuid, kind: &str, message: &str) -> Result<()> {
        let _guard = self.lock_row(row_id).await?;
        let mut tables = self.tables.write().await;
        let row = tables.rows.get_mut(&row_id).ok_or_else(|| LcaError::RowNotFound(row_id.to_string()))?;
        row.status = RowStatus::Error;
        row.error_kind = Some(kind.to_string());
        row.error_message = Some(message.to_string());
        Ok(())
    }

    async fn list_job_rows(&self, job_id: Uuid) -> Result<Vec<InputRow>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<InputRow> = tables.rows.values().filter(|r| r.job_id == job_id).cloned().collect();
        rows.sort_by_key(|r| r.row_index);
        Ok(rows)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let tables = self.tables.read().await;
        tables.jobs.get(&job_id).cloned().ok_or_else(|| LcaError::RowNotFound(job_id.to_string()))
    }

    async fn set_job_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            job.status = status;
            job.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn recompute_counters(&self, job_id: Uuid) -> Result<Job> {
        let mut tables = self.tables.write().await;
        let (mut pending, mut processing, mut calculated, mut ambiguous, mut errors) = (0, 0, 0, 0, 0);
        for row in tables.rows.values().filter(|r| r.job_id == job_id) {
            match row.status {
                RowStatus::Pending => pending += 1,
                RowStatus::Searching | RowStatus::LlmDeciding | RowStatus::Decomposing | RowStatus::Matched => {
                    processing += 1
                }
                RowStatus::Calculated => calculated += 1,
                RowStatus::Ambiguous => ambiguous += 1,
                RowStatus::Error => errors += 1,
            }
        }
        let job = tables.jobs.get_mut(&job_id).ok_or_else(|| LcaError::RowNotFound(job_id.to_string()))?;
        job.pending = pending;
        job.processing = processing;
        job.calculated = calculated;
        job.ambiguous = ambiguous;
        job.errors = errors;
        job.updated_at = chrono::Utc::now();
        Ok(job.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_rejects_row_not_ambiguous() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(JobMode::Review).await.unwrap();
        let row = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row]).await.unwrap();

        let err = store.resolve_row(row_id, "whatever").await.unwrap_err();
        assert_eq!(err.kind_tag(), "NotAmbiguous");
    }

    #[tokio::test]
    async fn resolve_rejects_uuid_not_candidate() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(JobMode::Review).await.unwrap();
        let mut row = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        row.status = RowStatus::Ambiguous;
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row]).await.unwrap();
        store
            .save_candidates(
                row_id,
                vec![Candidate {
                    uuid: "u-1".to_string(),
                    activity_name: "a".to_string(),
                    product_name: "b".to_string(),
                    geography: "GLO".to_string(),
                    unit: "kg".to_string(),
                    rank: 1,
                    rationale: "x".to_string(),
                }],
            )
            .await
            .unwrap();

        let err = store.resolve_row(row_id, "not-a-candidate").await.unwrap_err();
        assert_eq!(err.kind_tag(), "UuidNotCandidate");
    }

    #[tokio::test]
    async fn resolve_succeeds_for_saved_candidate() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(JobMode::Review).await.unwrap();
        let mut row = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        row.status = RowStatus::Ambiguous;
        let row_id = row.id;
        store.add_input_rows(job.id, vec![row]).await.unwrap();
        store
            .save_candidates(
                row_id,
                vec![Candidate {
                    uuid: "u-1".to_string(),
                    activity_name: "a".to_string(),
                    product_name: "b".to_string(),
                    geography: "GLO".to_string(),
                    unit: "kg".to_string(),
                    rank: 1,
                    rationale: "x".to_string(),
                }],
            )
            .await
            .unwrap();

        let resolved = store.resolve_row(row_id, "u-1").await.unwrap();
        assert_eq!(resolved.status, RowStatus::Matched);
    }

    #[tokio::test]
    async fn counters_reflect_row_statuses() {
        let store = InMemoryJobStore::new();
        let job = store.create_job(JobMode::Auto).await.unwrap();
        let mut rows = vec![
            InputRow::new(job.id, 0, "A".to_string(), "kg".to_string()),
            InputRow::new(job.id, 1, "B".to_string(), "kg".to_string()),
        ];
        rows[1].status = RowStatus::Calculated;
        store.add_input_rows(job.id, rows).await.unwrap();

        let job = store.recompute_counters(job.id).await.unwrap();
        assert_eq!(job.pending, 1);
        assert_eq!(job.calculated, 1);
    }
}
