use anyhow::{bail, Context, Result};
use lci_matcher::catalogue::CatalogueStore;
use lci_matcher::config::Config;
use lci_matcher::embedding::{EmbeddingEncoder, FallbackEmbeddingEncoder, HttpEmbeddingEncoder};
use lci_matcher::models::{InputRow, JobMode, RowStatus, Scope};
use lci_matcher::oracle::client::{HttpLlmClient, LlmClient, RateLimitedLlmClient};
use lci_matcher::orchestrator::Orchestrator;
use lci_matcher::retriever::RetrievalParams;
use lci_matcher::scheduler::{BatchScheduler, CancelToken, RateLimiter};
use lci_matcher::store::{InMemoryJobStore, JobStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::process;
use std::sync::Arc;
use uuid::Uuid;

/// Single-binary JSON-in/JSON-out driver: `lci-matcher <job.json>`.
/// Not the HTTP surface (out of scope) — the same thin, file-driven
/// harness a batch run of the matching pipeline needs, standing in for
/// the spreadsheet-upload/export collaborators.
fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        bail!("usage: {} <job.json>", args.first().map(String::as_str).unwrap_or("lci-matcher"));
    }

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(run_job(&args[1]))
}

#[derive(Debug, Deserialize)]
struct JobSpec {
    #[serde(default)]
    mode: JobModeSpec,
    catalogue_csv: String,
    #[serde(default)]
    bm25_path: Option<String>,
    #[serde(default)]
    vector_path: Option<String>,
    rows: Vec<RowSpec>,
    /// Resolutions to apply after the worker pool drains, keyed by
    /// `row_index` — a scripted stand-in for the external `resolve()`
    /// calls the HTTP surface would otherwise make one at a time.
    #[serde(default)]
    resolutions: Vec<ResolutionSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JobModeSpec {
    Auto,
    #[default]
    Review,
}

#[derive(Debug, Deserialize)]
struct RowSpec {
    bezeichnung: String,
    referenzeinheit: String,
    #[serde(default)]
    produktinformationen: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    kategorie: Option<String>,
    #[serde(default)]
    unterkategorie: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    referenzjahr: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct ResolutionSpec {
    row_index: usize,
    uuid: String,
}

#[derive(Debug, Serialize)]
struct JobReport {
    job_id: Uuid,
    status: lci_matcher::models::JobStatus,
    counters: lci_matcher::models::JobCounters,
    rows: Vec<RowReport>,
}

#[derive(Debug, Serialize)]
struct RowReport {
    row_index: usize,
    status: RowStatus,
    error_kind: Option<String>,
    error_message: Option<String>,
    result: Option<lci_matcher::models::RowResult>,
}

async fn run_job(path: &str) -> Result<()> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let spec: JobSpec = serde_json::from_str(&data).context("parsing job spec")?;

    let config = Config::from_env();
    let mode = match spec.mode {
        JobModeSpec::Auto => JobMode::Auto,
        JobModeSpec::Review => JobMode::Review,
    };

    let catalogue = Arc::new(
        CatalogueStore::load(&spec.catalogue_csv, spec.bm25_path.as_deref(), spec.vector_path.as_deref())
            .with_context(|| format!("loading catalogue from {}", spec.catalogue_csv))?,
    );
    log::info!("loaded catalogue with {} entries", catalogue.len());

    let encoder: Arc<dyn EmbeddingEncoder> = if config.embedding_endpoint.is_empty() {
        Arc::new(FallbackEmbeddingEncoder)
    } else {
        Arc::new(HttpEmbeddingEncoder::new(config.embedding_endpoint.clone(), config.llm_timeout))
    };

    let base_llm: Arc<dyn LlmClient> =
        Arc::new(HttpLlmClient::new(config.llm_endpoint.clone(), config.llm_model.clone(), config.llm_timeout));
    let limiter = Arc::new(RateLimiter::new(config.rate_interval));
    let llm: Arc<dyn LlmClient> = Arc::new(RateLimitedLlmClient::new(base_llm, limiter));

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let job = store.create_job(mode).await?;

    let rows: Vec<InputRow> =
        spec.rows.into_iter().enumerate().map(|(i, r)| build_input_row(job.id, i, r)).collect();
    store.add_input_rows(job.id, rows).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        catalogue,
        encoder,
        llm,
        RetrievalParams::from(&config),
        mode,
    ));
    let scheduler = BatchScheduler::new(store.clone(), orchestrator, config.worker_count);

    let status = scheduler.run_job(job.id, CancelToken::new()).await?;
    log::info!("job {} drained with status {status:?}", job.id);

    if !spec.resolutions.is_empty() {
        let rows = store.list_job_rows(job.id).await?;
        let resolutions: Vec<(Uuid, String)> = spec
            .resolutions
            .into_iter()
            .filter_map(|r| rows.iter().find(|row| row.row_index == r.row_index).map(|row| (row.id, r.uuid)))
            .collect();
        scheduler.resolve_batch(job.id, resolutions).await?;
    }

    let report = build_report(store.as_ref(), job.id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn build_input_row(job_id: Uuid, index: usize, spec: RowSpec) -> InputRow {
    let mut row = InputRow::new(job_id, index, spec.bezeichnung, spec.referenzeinheit);
    row.produktinformationen = spec.produktinformationen;
    row.kategorie = spec.kategorie;
    row.unterkategorie = spec.unterkategorie;
    row.region = spec.region;
    row.referenzjahr = spec.referenzjahr;
    row.scope = match spec.scope.as_deref() {
        Some("Scope 1") => Some(Scope::Scope1),
        Some("Scope 2") => Some(Scope::Scope2),
        Some("Scope 3") => Some(Scope::Scope3),
        _ => None,
    };
    row
}

async fn build_report(store: &dyn JobStore, job_id: Uuid) -> Result<JobReport> {
    let job = store.get_job(job_id).await?;
    let rows = store.list_job_rows(job_id).await?;

    let mut rows_out = Vec::with_capacity(rows.len());
    for row in &rows {
        let result = if row.status == RowStatus::Calculated { store.load_result(row.id).await? } else { None };
        rows_out.push(RowReport {
            row_index: row.row_index,
            status: row.status,
            error_kind: row.error_kind.clone(),
            error_message: row.error_message.clone(),
            result,
        });
    }

    Ok(JobReport { job_id, status: job.status, counters: job.counters(), rows: rows_out })
}
