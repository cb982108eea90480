use std::time::Duration;

/// Process configuration, read from the environment the way `main.rs`
/// already reads `RUST_LOG` for `env_logger::init()` — no config crate,
/// just defaulted `std::env::var` lookups.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_count: usize,
    pub llm_endpoint: String,
    pub llm_model: String,
    pub embedding_endpoint: String,
    pub rate_interval: Duration,
    pub top_k: usize,
    pub pool_size: usize,
    pub rrf_k: u32,
    pub llm_timeout: Duration,
    pub mode: crate::models::JobMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 4,
            llm_endpoint: "http://localhost:8081/v1/chat/completions".to_string(),
            llm_model: "lci-oracle".to_string(),
            embedding_endpoint: "http://localhost:8082/embed".to_string(),
            rate_interval: Duration::from_secs(15),
            top_k: 20,
            pool_size: 100,
            rrf_k: 60,
            llm_timeout: Duration::from_secs(60),
            mode: crate::models::JobMode::Review,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_count: env_usize("LCA_WORKER_COUNT", defaults.worker_count),
            llm_endpoint: env_string("LCA_LLM_ENDPOINT", &defaults.llm_endpoint),
            llm_model: env_string("LCA_LLM_MODEL", &defaults.llm_model),
            embedding_endpoint: env_string("LCA_EMBEDDING_ENDPOINT", &defaults.embedding_endpoint),
            rate_interval: Duration::from_secs(env_u64(
                "LCA_RATE_INTERVAL_SECS",
                defaults.rate_interval.as_secs(),
            )),
            top_k: env_usize("LCA_TOP_K", defaults.top_k),
            pool_size: env_usize("LCA_POOL_SIZE", defaults.pool_size),
            rrf_k: env_usize("LCA_RRF_K", defaults.rrf_k as usize) as u32,
            llm_timeout: Duration::from_secs(env_u64(
                "LCA_LLM_TIMEOUT_SECS",
                defaults.llm_timeout.as_secs(),
            )),
            mode: match std::env::var("LCA_MODE").as_deref() {
                Ok("auto") => crate::models::JobMode::Auto,
                _ => defaults.mode,
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
