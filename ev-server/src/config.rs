//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::Result;
use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// `PostgreSQL` connection URL. Absence selects the in-memory storage path.
    pub database_url: Option<String>,

    /// Global API key gate secret. Absent disables the gate.
    pub external_api_key: Option<String>,
    /// Per-route secret for `/pronounce`, falling back to `external_api_key`.
    pub pronounce_api_key: Option<String>,
    /// Per-route secret for `/session-score`, falling back to `external_api_key`.
    pub session_scoring_api_key: Option<String>,

    /// Worker pool size: `min(4, max(1, EASEPOCKET_WORKER_COUNT or min(2, cpuCount)))`.
    pub worker_count: usize,
    /// Queue limit: `max(4, EASEPOCKET_WORKER_QUEUE_LIMIT or 32)`.
    pub worker_queue_limit: usize,
    /// Per-task timeout in ms: `max(2000, EASEPOCKET_WORKER_TASK_TIMEOUT_MS or 15000)`.
    pub worker_task_timeout_ms: u64,
    /// When set, the scoring pipeline runs inline in the caller instead of the pool.
    pub worker_disabled: bool,

    /// CORS allow-all mode.
    pub cors_allow_all: bool,
    /// Explicit CORS origin allow-list, used when `cors_allow_all` is false.
    pub cors_allow_origins: Vec<String>,

    /// Transcriber (STT) provider base URL.
    pub transcriber_base_url: Option<String>,
    /// Speaker (TTS) provider base URL.
    pub speaker_base_url: Option<String>,
    /// Shared credential forwarded to the STT/TTS provider.
    pub provider_api_key: Option<String>,
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_worker_count() -> usize {
    env_usize("EASEPOCKET_WORKER_COUNT").unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(1)
            .min(2)
    })
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let external_api_key = env::var("EXTERNAL_API_KEY").ok().filter(|s| !s.is_empty());

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            pronounce_api_key: env::var("PRONOUNCE_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| external_api_key.clone()),
            session_scoring_api_key: env::var("SESSION_SCORING_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .or_else(|| external_api_key.clone()),
            external_api_key,
            worker_count: default_worker_count().clamp(1, 4),
            worker_queue_limit: env_usize("EASEPOCKET_WORKER_QUEUE_LIMIT").unwrap_or(32).max(4),
            worker_task_timeout_ms: env_u64("EASEPOCKET_WORKER_TASK_TIMEOUT_MS")
                .unwrap_or(15_000)
                .max(2_000),
            worker_disabled: env::var("EASEPOCKET_DISABLE_WORKER")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allow_all: env::var("CORS_ALLOW_ALL")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allow_origins: env::var("CORS_ALLOW_ORIGINS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            transcriber_base_url: env::var("TRANSCRIBER_BASE_URL").ok().filter(|s| !s.is_empty()),
            speaker_base_url: env::var("SPEAKER_BASE_URL").ok().filter(|s| !s.is_empty()),
            provider_api_key: env::var("PROVIDER_API_KEY").ok().filter(|s| !s.is_empty()),
        })
    }

    /// Configuration with network-free defaults for tests.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            database_url: None,
            external_api_key: None,
            pronounce_api_key: None,
            session_scoring_api_key: None,
            worker_count: 2,
            worker_queue_limit: 32,
            worker_task_timeout_ms: 15_000,
            worker_disabled: true,
            cors_allow_all: true,
            cors_allow_origins: Vec::new(),
            transcriber_base_url: None,
            speaker_base_url: None,
            provider_api_key: None,
        }
    }
}
