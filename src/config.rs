//! Configuration parsing and validation.
//!
//! Kenny is configured via a TOML file (default: `config/kenny.toml`)
//! with environment-variable overrides applied after parsing:
//!
//! - `KENNY_DB_PATH` — absolute path to the store
//! - `KENNY_PROJECT_ROOT` — root directory used for path discovery
//! - `KENNY_ENV` — development | testing | staging | production
//! - `OLLAMA_ENDPOINT` — embedder / planner endpoint
//! - `LLM_MODEL` — planner model id
//! - `METRICS_ENDPOINT` — optional metrics sink (recorded, not served)
//!
//! A missing config file is not an error; defaults are resolved from the
//! project root so `kenny init` works in a fresh checkout.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime environment, selecting cache and log-level defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Testing,
    Staging,
    Production,
}

impl Environment {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Environment::Development),
            "testing" => Some(Environment::Testing),
            "staging" => Some(Environment::Staging),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }

    /// Default `tracing` filter directive for this environment.
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Environment::Development => "debug",
            Environment::Testing => "warn",
            Environment::Staging => "info",
            Environment::Production => "info",
        }
    }

    /// Whether read-path caching layers are enabled.
    pub fn caching_enabled(&self) -> bool {
        !matches!(self, Environment::Testing)
    }
}

fn default_environment() -> Environment {
    if cfg!(debug_assertions) {
        Environment::Development
    } else {
        Environment::Production
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    pub store: StoreConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub planner: PlannerConfig,
    pub sources: SourcesConfig,
    pub jobs: JobsConfig,
    pub audit: AuditConfig,
    /// Optional metrics sink endpoint; recorded for external shippers.
    pub metrics_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let root = resolve_project_root();
        Self {
            environment: default_environment(),
            store: StoreConfig::for_root(&root),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingConfig::default(),
            planner: PlannerConfig::default(),
            sources: SourcesConfig::for_root(&root),
            jobs: JobsConfig::default(),
            audit: AuditConfig::for_root(&root),
            metrics_endpoint: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl StoreConfig {
    fn for_root(root: &Path) -> Self {
        Self {
            path: root.join("data").join("kenny.sqlite3"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_root(&resolve_project_root())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum chunk window in bytes for email bodies and sliding windows.
    pub max_window_bytes: usize,
    /// Soft overlap allowance used to respect sentence boundaries.
    pub soft_overlap_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_window_bytes: 800,
            soft_overlap_bytes: 40,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Weight applied to the normalized keyword score.
    pub bm25_weight: f64,
    /// Weight applied to the normalized vector score.
    pub embedding_weight: f64,
    /// Default result limit.
    pub default_limit: usize,
    /// Wall-clock budget; on exhaustion partial results are returned.
    pub budget_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            bm25_weight: 0.5,
            embedding_weight: 0.5,
            default_limit: 10,
            budget_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `disabled`, `ollama`, or `hash` (deterministic local projection).
    pub provider: String,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub endpoint: String,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            endpoint: "http://127.0.0.1:11434".to_string(),
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlannerConfig {
    /// `rule` (deterministic fallback, always available) or `http`.
    pub provider: String,
    pub model: Option<String>,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            provider: "rule".to_string(),
            model: None,
            endpoint: "http://127.0.0.1:11434".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    /// Directory of NDJSON record files, one `<source_app>.ndjson` each.
    pub records_dir: PathBuf,
    /// Sources enabled for ingest; empty means every file found.
    pub enabled: Vec<String>,
    /// Records pulled per batch from an extractor.
    pub batch_size: usize,
    /// Keep going after a failed batch instead of failing the source.
    pub continue_on_batch_failure: bool,
}

impl SourcesConfig {
    fn for_root(root: &Path) -> Self {
        Self {
            records_dir: root.join("data").join("sources"),
            enabled: Vec::new(),
            batch_size: 200,
            continue_on_batch_failure: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self::for_root(&resolve_project_root())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub workers: usize,
    pub history_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for `*.ndjson` audit files.
    pub dir: PathBuf,
    pub max_file_bytes: u64,
    pub retention_days: i64,
}

impl AuditConfig {
    fn for_root(root: &Path) -> Self {
        Self {
            dir: root.join("data").join("logs"),
            max_file_bytes: 50 * 1024 * 1024,
            retention_days: 30,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self::for_root(&resolve_project_root())
    }
}

/// Resolve the project root: `KENNY_PROJECT_ROOT` if set, else the current
/// working directory.
pub fn resolve_project_root() -> PathBuf {
    if let Ok(root) = std::env::var("KENNY_PROJECT_ROOT") {
        return PathBuf::from(root);
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Load the config file (if present), apply environment overrides, and
/// validate. Startup configuration errors are fatal.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(path) = std::env::var("KENNY_DB_PATH") {
        config.store.path = PathBuf::from(path);
    }
    if let Ok(env) = std::env::var("KENNY_ENV") {
        if let Some(parsed) = Environment::parse(&env) {
            config.environment = parsed;
        }
    }
    if let Ok(endpoint) = std::env::var("OLLAMA_ENDPOINT") {
        config.embedding.endpoint = endpoint.clone();
        config.planner.endpoint = endpoint;
    }
    if let Ok(model) = std::env::var("LLM_MODEL") {
        config.planner.model = Some(model);
    }
    if let Ok(endpoint) = std::env::var("METRICS_ENDPOINT") {
        config.metrics_endpoint = Some(endpoint);
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_window_bytes == 0 {
        anyhow::bail!("chunking.max_window_bytes must be > 0");
    }
    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }
    if config.retrieval.bm25_weight < 0.0 || config.retrieval.embedding_weight < 0.0 {
        anyhow::bail!("retrieval weights must be non-negative");
    }
    if config.retrieval.bm25_weight + config.retrieval.embedding_weight == 0.0 {
        anyhow::bail!("at least one retrieval weight must be positive");
    }

    if config.embedding.is_enabled() {
        match config.embedding.provider.as_str() {
            "ollama" | "hash" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, ollama, or hash.",
                other
            ),
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.planner.provider.as_str() {
        "rule" | "http" => {}
        other => anyhow::bail!("Unknown planner provider: '{}'. Must be rule or http.", other),
    }

    if config.jobs.workers == 0 {
        anyhow::bail!("jobs.workers must be >= 1");
    }

    Ok(())
}
