//! Environment-driven configuration for the AgroMine services.
//!
//! This module loads and validates settings once at startup (via `init_config`) and exposes
//! a global, read-only view through `get_config`. The configuration powers the HTTP surface
//! and every pipeline collaborator and includes:
//!
//! - Vector store connectivity (`QDRANT_URL`, `QDRANT_API_KEY?`) and corpus names
//!   (`REFERENCE_COLLECTION?`, `EPHEMERAL_COLLECTION?`, `CHAT_COLLECTION?`).
//! - Embedding endpoint (`EMBEDDING_URL`, `EMBEDDING_MODEL`, `EMBEDDING_DIMENSION`).
//! - LLM endpoint (`LLM_URL`, `LLM_MODEL`, `LLM_MAX_RETRIES?`).
//! - Blob gateway (`BLOBSTORE_URL`, `BLOBSTORE_API_KEY?`) plus the per-project reference
//!   workbook prefixes (`REFERENCE_BUCKET`, `STAR_REFERENCE_PREFIX?`, `PRMS_REFERENCE_PREFIX?`).
//! - Lexical search indexes for mapping (`STAFF_SEARCH_*`, `INSTITUTION_SEARCH_*`,
//!   `MAPPING_MAX_RETRIES?`, `MAPPING_RETRY_DELAY_SECS?`).
//! - Record source for ingestion (`RECORD_SOURCE_URL`).
//! - Token validation endpoints (`STAR_AUTH_ENDPOINT?`, `PRMS_AUTH_ENDPOINT?`).
//! - Interaction tracking (`TRACKER_DB_PATH?`, `IS_PROD?`) and the notifier webhook
//!   (`NOTIFIER_WEBHOOK_URL?`).
//! - Chunking overrides (`CHUNK_SIZE?`, `CHUNK_OVERLAP?`), bulk worker pool
//!   (`BULK_BATCH_SIZE?`, `BULK_MAX_WORKERS?`), per-step and overall deadlines
//!   (`STEP_TIMEOUT_SECS?`, `REQUEST_DEADLINE_SECS?`) and the HTTP port (`SERVER_PORT?`).
//!
//! Most fields are optional with sensible defaults; invalid combinations are flagged early with
//! descriptive errors so misconfiguration is easy to diagnose.

use serde::Deserialize;
use std::env;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Runtime configuration for the AgroMine server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Base URL of the Qdrant instance backing the vector corpora.
    pub qdrant_url: String,
    /// Optional API key required to access Qdrant.
    pub qdrant_api_key: Option<String>,
    /// Alias of the persistent reference corpus.
    pub reference_collection: String,
    /// Collection holding per-request ephemeral document vectors.
    pub ephemeral_collection: String,
    /// Alias of the chatbot retrieval corpus.
    pub chat_collection: String,
    /// Base URL of the embedding endpoint.
    pub embedding_url: String,
    /// Optional API key for the embedding endpoint.
    pub embedding_api_key: Option<String>,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of the LLM endpoint.
    pub llm_url: String,
    /// Optional API key for the LLM endpoint.
    pub llm_api_key: Option<String>,
    /// Model identifier used for generation calls.
    pub llm_model: String,
    /// Retry budget for transient LLM failures.
    pub llm_max_retries: usize,
    /// Base URL of the blob storage gateway.
    pub blobstore_url: String,
    /// Optional API key for the blob gateway.
    pub blobstore_api_key: Option<String>,
    /// Bucket holding the reference workbooks.
    pub reference_bucket: String,
    /// Key prefix for the STAR reference workbooks.
    pub star_reference_prefix: String,
    /// Key prefix for the PRMS reference workbooks.
    pub prms_reference_prefix: String,
    /// Lexical search settings for the staff index.
    pub staff_search: SearchIndexConfig,
    /// Lexical search settings for the institution index.
    pub institution_search: SearchIndexConfig,
    /// Retry budget for mapping calls hitting an unavailable backend.
    pub mapping_max_retries: usize,
    /// Base delay in seconds for the mapping exponential backoff.
    pub mapping_retry_delay_secs: u64,
    /// Base URL of the relational record source.
    pub record_source_url: String,
    /// Optional API key for the record source.
    pub record_source_api_key: Option<String>,
    /// Token validation endpoint for the STAR project.
    pub star_auth_endpoint: Option<String>,
    /// Token validation endpoint for the PRMS project.
    pub prms_auth_endpoint: Option<String>,
    /// Path of the SQLite database backing the interaction tracker.
    pub tracker_db_path: String,
    /// Deployment environment used to shard interaction records.
    pub environment: Environment,
    /// Optional webhook receiving negative-feedback and operational alerts.
    pub notifier_webhook_url: Option<String>,
    /// Character budget per chunk produced by the splitter.
    pub chunk_size: usize,
    /// Character overlap between adjacent chunks.
    pub chunk_overlap: usize,
    /// Rows per batch in the bulk-upload path.
    pub bulk_batch_size: usize,
    /// Upper bound on concurrent bulk workers.
    pub bulk_max_workers: usize,
    /// Timeout applied to each outbound call, in seconds.
    pub step_timeout_secs: u64,
    /// Overall deadline for one extraction request, in seconds.
    pub request_deadline_secs: u64,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Service name announced in notifications and the registry.
    pub service_name: String,
}

/// Connection settings for one lexical search index.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchIndexConfig {
    /// Base URL of the search cluster.
    pub url: String,
    /// Index name queried for candidates.
    pub index: String,
    /// Basic-auth username.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
}

/// Deployment environment, used to shard persisted interaction records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Non-production deployments.
    Test,
    /// Production deployments.
    Prod,
}

impl Environment {
    /// Suffix appended to sharded table names.
    pub fn table_suffix(self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Prod => "prod",
        }
    }
}

/// Projects served by the extraction pipeline, each with its own
/// token-validation endpoint and reference workbooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Project {
    /// STAR reporting platform.
    Star,
    /// PRMS reporting platform.
    Prms,
}

impl std::str::FromStr for Project {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "star" => Ok(Self::Star),
            "prms" => Ok(Self::Prms),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Project::Star => f.write_str("STAR"),
            Project::Prms => f.write_str("PRMS"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let chunk_size = load_usize_with_default("CHUNK_SIZE", 8_000)?;
        let chunk_overlap = load_usize_with_default("CHUNK_OVERLAP", 1_500)?;
        let bulk_batch_size = load_usize_with_default("BULK_BATCH_SIZE", 5)?;
        let bulk_max_workers = load_usize_with_default("BULK_MAX_WORKERS", 20)?;

        if chunk_size == 0 {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE must be at least 1".into(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidValue(
                "CHUNK_OVERLAP must be smaller than CHUNK_SIZE".into(),
            ));
        }
        if bulk_batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BULK_BATCH_SIZE must be at least 1".into(),
            ));
        }
        if bulk_max_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "BULK_MAX_WORKERS must be at least 1".into(),
            ));
        }

        let embedding_dimension: usize = load_env("EMBEDDING_DIMENSION")?
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()))?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue(
                "EMBEDDING_DIMENSION must be greater than zero".into(),
            ));
        }

        let environment = if load_bool_with_default("IS_PROD", false)? {
            Environment::Prod
        } else {
            Environment::Test
        };

        Ok(Self {
            qdrant_url: load_env("QDRANT_URL")?,
            qdrant_api_key: load_env_optional("QDRANT_API_KEY"),
            reference_collection: load_env_optional("REFERENCE_COLLECTION")
                .unwrap_or_else(|| "reference_corpus".into()),
            ephemeral_collection: load_env_optional("EPHEMERAL_COLLECTION")
                .unwrap_or_else(|| "ephemeral_documents".into()),
            chat_collection: load_env_optional("CHAT_COLLECTION")
                .unwrap_or_else(|| "chat_corpus".into()),
            embedding_url: load_env("EMBEDDING_URL")?,
            embedding_api_key: load_env_optional("EMBEDDING_API_KEY"),
            embedding_model: load_env("EMBEDDING_MODEL")?,
            embedding_dimension,
            llm_url: load_env("LLM_URL")?,
            llm_api_key: load_env_optional("LLM_API_KEY"),
            llm_model: load_env("LLM_MODEL")?,
            llm_max_retries: load_usize_with_default("LLM_MAX_RETRIES", 3)?,
            blobstore_url: load_env("BLOBSTORE_URL")?,
            blobstore_api_key: load_env_optional("BLOBSTORE_API_KEY"),
            reference_bucket: load_env("REFERENCE_BUCKET")?,
            star_reference_prefix: load_env_optional("STAR_REFERENCE_PREFIX")
                .unwrap_or_else(|| "star/text-mining/files".into()),
            prms_reference_prefix: load_env_optional("PRMS_REFERENCE_PREFIX")
                .unwrap_or_else(|| "prms/text-mining/files".into()),
            staff_search: SearchIndexConfig {
                url: load_env("STAFF_SEARCH_URL")?,
                index: load_env("STAFF_SEARCH_INDEX")?,
                username: load_env_optional("STAFF_SEARCH_USERNAME"),
                password: load_env_optional("STAFF_SEARCH_PASSWORD"),
            },
            institution_search: SearchIndexConfig {
                url: load_env("INSTITUTION_SEARCH_URL")?,
                index: load_env("INSTITUTION_SEARCH_INDEX")?,
                username: load_env_optional("INSTITUTION_SEARCH_USERNAME"),
                password: load_env_optional("INSTITUTION_SEARCH_PASSWORD"),
            },
            mapping_max_retries: load_usize_with_default("MAPPING_MAX_RETRIES", 10)?,
            mapping_retry_delay_secs: load_u64_with_default("MAPPING_RETRY_DELAY_SECS", 4)?,
            record_source_url: load_env("RECORD_SOURCE_URL")?,
            record_source_api_key: load_env_optional("RECORD_SOURCE_API_KEY"),
            star_auth_endpoint: load_env_optional("STAR_AUTH_ENDPOINT"),
            prms_auth_endpoint: load_env_optional("PRMS_AUTH_ENDPOINT"),
            tracker_db_path: load_env_optional("TRACKER_DB_PATH")
                .unwrap_or_else(|| "data/interactions.db".into()),
            environment,
            notifier_webhook_url: load_env_optional("NOTIFIER_WEBHOOK_URL"),
            chunk_size,
            chunk_overlap,
            bulk_batch_size,
            bulk_max_workers,
            step_timeout_secs: load_u64_with_default("STEP_TIMEOUT_SECS", 120)?,
            request_deadline_secs: load_u64_with_default("REQUEST_DEADLINE_SECS", 600)?,
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
            service_name: load_env_optional("MS_NAME")
                .unwrap_or_else(|| "AgroMine Text Mining".into()),
        })
    }

    /// Token validation endpoint for a project, if configured.
    pub fn auth_endpoint(&self, project: Project) -> Option<&str> {
        match project {
            Project::Star => self.star_auth_endpoint.as_deref(),
            Project::Prms => self.prms_auth_endpoint.as_deref(),
        }
    }

    /// Reference workbook key prefix for a project.
    pub fn reference_prefix(&self, project: Project) -> &str {
        match project {
            Project::Star => &self.star_reference_prefix,
            Project::Prms => &self.prms_reference_prefix,
        }
    }
}

fn load_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn load_bool_with_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match load_env_optional(key) {
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(key.to_string())),
        },
        None => Ok(default),
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        qdrant_url = %config.qdrant_url,
        reference_collection = %config.reference_collection,
        ephemeral_collection = %config.ephemeral_collection,
        chat_collection = %config.chat_collection,
        embedding_model = %config.embedding_model,
        embedding_dimension = config.embedding_dimension,
        llm_model = %config.llm_model,
        environment = ?config.environment,
        bulk_batch_size = config.bulk_batch_size,
        bulk_max_workers = config.bulk_max_workers,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
