//! C7 — Batch scheduler: bounded concurrent execution of row
//! orchestrations, process-wide LLM pacing, and the resolution
//! barrier between `running` and `awaiting_resolution`.

use crate::error::Result;
use crate::models::{JobMode, JobStatus, RowStatus};
use crate::orchestrator::Orchestrator;
use crate::store::JobStore;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Process-wide token bucket gating outgoing LLM calls: one token,
/// refilled at 1 per `interval`, so no call starts within `interval`
/// of the previous one regardless of how many workers are racing for
/// it. A per-worker sleep would under-use
/// the budget when only one worker has work left; a shared bucket
/// keeps every worker honest against the same clock.
pub struct RateLimiter {
    interval: Duration,
    next_allowed: AsyncMutex<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, next_allowed: AsyncMutex::new(Instant::now()) }
    }

    /// Block until a token is available, then consume it.
    pub async fn acquire(&self) {
        let wait = {
            let mut next = self.next_allowed.lock().await;
            let now = Instant::now();
            let wait = next.saturating_duration_since(now);
            *next = now.max(*next) + self.interval;
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Cooperative cancellation flag shared between a scheduler run and
/// its workers. Checked at scheduling points only — an in-flight LLM
/// call is never interrupted mid-flight.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded multi-worker pool driving [`Orchestrator::process_row`]
/// over a job's pending rows.
pub struct BatchScheduler {
    store: Arc<dyn JobStore>,
    orchestrator: Arc<Orchestrator>,
    worker_count: usize,
}

impl BatchScheduler {
    pub fn new(store: Arc<dyn JobStore>, orchestrator: Arc<Orchestrator>, worker_count: usize) -> Self {
        Self { store, orchestrator, worker_count }
    }

    /// Run a job's pending rows to completion or to the suspension
    /// barrier. Rows are queued in input order (`row_index` ascending,
    /// as returned by [`JobStore::list_job_rows`]) but may complete out
    /// of order — completion is associated by `row_index`, not by
    /// queue position.
    pub async fn run_job(&self, job_id: Uuid, cancel: CancelToken) -> Result<JobStatus> {
        self.store.set_job_status(job_id, JobStatus::Running).await?;

        let rows = self.store.list_job_rows(job_id).await?;
        let pending: Vec<_> = rows.into_iter().filter(|r| r.status == RowStatus::Pending).collect();
        info!("job {job_id}: draining {} pending rows across {} workers", pending.len(), self.worker_count);

        let queue = Arc::new(AsyncMutex::new(pending.into_iter()));
        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count {
            let queue = queue.clone();
            let orchestrator = self.orchestrator.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next_row = {
                        let mut q = queue.lock().await;
                        q.next()
                    };
                    let Some(row) = next_row else { break };
                    let row_id = row.id;
                    if let Err(e) = orchestrator.process_row(row, cancel.clone()).await {
                        warn!("worker {worker_id}: row {row_id} exited with an unhandled error: {e}");
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}

        self.store.recompute_counters(job_id).await?;
        let status = self.settle_job_status(job_id).await?;
        Ok(status)
    }

    /// Once every worker has drained, a job
    /// in `review` mode with at least one `ambiguous` row moves to
    /// `awaiting_resolution`; otherwise (or in `auto` mode, which never
    /// leaves a row ambiguous) it is `completed`.
    async fn settle_job_status(&self, job_id: Uuid) -> Result<JobStatus> {
        let ambiguous = self.store.list_ambiguous(job_id).await?;
        let status = if !ambiguous.is_empty() { JobStatus::AwaitingResolution } else { JobStatus::Completed };
        self.store.set_job_status(job_id, status).await?;
        Ok(status)
    }

    /// External `resolve(job_id, row_id, uuid)` call: runs the
    /// post-ambiguity tail without re-invoking `decide`, then
    /// re-evaluates whether the job can leave `awaiting_resolution`.
    /// Idempotent once the row is `calculated` — delegated to
    /// [`JobStore::resolve_row`], which already treats a matching
    /// re-resolution as a no-op.
    pub async fn resolve(&self, job_id: Uuid, row_id: Uuid, selected_uuid: &str) -> Result<()> {
        self.orchestrator.resume_after_resolution(row_id, selected_uuid).await?;
        self.store.recompute_counters(job_id).await?;
        self.settle_job_status(job_id).await?;
        Ok(())
    }

    pub async fn resolve_batch(&self, job_id: Uuid, resolutions: Vec<(Uuid, String)>) -> Result<()> {
        for (row_id, uuid) in resolutions {
            self.resolve(job_id, row_id, &uuid).await?;
        }
        Ok(())
    }

    pub fn mode(&self) -> JobMode {
        self.orchestrator.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::{CatalogueEntry, CatalogueStore};
    use crate::embedding::FallbackEmbeddingEncoder;
    use crate::models::InputRow;
    use crate::oracle::client::FakeLlmClient;
    use crate::retriever::RetrievalParams;
    use crate::store::InMemoryJobStore;

    fn catalogue() -> Arc<CatalogueStore> {
        let entries = vec![CatalogueEntry {
            uuid: "u-steel".to_string(),
            activity_name: "steel production".to_string(),
            product_name: "steel".to_string(),
            geography: "RER".to_string(),
            unit: "kg".to_string(),
            biogenic_factor: 0.02,
            common_factor: 1.8,
            is_market: false,
        }];
        Arc::new(CatalogueStore::from_entries(entries, None, None).unwrap())
    }

    #[tokio::test]
    async fn run_job_completes_all_matching_rows() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Auto).await.unwrap();
        let mut row_a = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        row_a.region = Some("RER".to_string());
        let mut row_b = InputRow::new(job.id, 1, "Stahl".to_string(), "kg".to_string());
        row_b.region = Some("RER".to_string());
        store.add_input_rows(job.id, vec![row_a, row_b]).await.unwrap();

        let llm = Arc::new(FakeLlmClient::new().on(
            "stahl",
            r#"{"decision":"match","selected_uuid":"u-steel","rationale":"exact"}"#,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            llm,
            RetrievalParams::default(),
            JobMode::Auto,
        ));
        let scheduler = BatchScheduler::new(store.clone(), orchestrator, 2);

        let status = scheduler.run_job(job.id, CancelToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.calculated, 2);
    }

    #[tokio::test]
    async fn run_job_suspends_on_ambiguous_review_row() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Review).await.unwrap();
        let row = InputRow::new(job.id, 0, "Diesel Verbrennung".to_string(), "kg".to_string());
        store.add_input_rows(job.id, vec![row]).await.unwrap();

        let llm = Arc::new(FakeLlmClient::new().on(
            "diesel",
            r#"{"decision":"ambiguous","plausible":[{"uuid":"u-steel","why_short":"a"},{"uuid":"u-steel","why_short":"b"}],"rationale":"unsure"}"#,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            llm,
            RetrievalParams::default(),
            JobMode::Review,
        ));
        let scheduler = BatchScheduler::new(store.clone(), orchestrator, 1);

        let status = scheduler.run_job(job.id, CancelToken::new()).await.unwrap();
        assert_eq!(status, JobStatus::AwaitingResolution);
    }

    #[tokio::test]
    async fn rate_limiter_enforces_minimum_spacing() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn cancelled_token_stops_queue_before_unstarted_rows() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let job = store.create_job(JobMode::Auto).await.unwrap();
        let row = InputRow::new(job.id, 0, "Stahl".to_string(), "kg".to_string());
        store.add_input_rows(job.id, vec![row]).await.unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            catalogue(),
            Arc::new(FallbackEmbeddingEncoder),
            Arc::new(FakeLlmClient::new()),
            RetrievalParams::default(),
            JobMode::Auto,
        ));
        let scheduler = BatchScheduler::new(store.clone(), orchestrator, 1);

        let cancel = CancelToken::new();
        cancel.cancel();
        scheduler.run_job(job.id, cancel).await.unwrap();
        let job = store.get_job(job.id).await.unwrap();
        assert_eq!(job.pending, 1);
    }
}
