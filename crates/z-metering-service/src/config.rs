//! Service configuration.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use z_metering_core::{ActionCosts, MeteringError, PlanCatalog};
use z_metering_engine::EngineConfig;

/// Where the service keeps its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-process maps; state is lost on restart.
    Memory,
    /// `RocksDB` under `data_dir` (requires the `rocksdb-backend` feature).
    RocksDb,
}

impl FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" => Ok(Self::RocksDb),
            other => Err(ConfigError::Invalid(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

/// Errors raised while loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configured file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A value or file was rejected.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<MeteringError> for ConfigError {
    fn from(err: MeteringError) -> Self {
        Self::Invalid(err.to_string())
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/z-metering").
    pub data_dir: String,

    /// Storage backend (default: memory).
    pub storage_backend: StorageBackend,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// HS256 secret for user JWTs. Without it only test tokens authenticate.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "z-metering").
    pub auth_audience: String,

    /// JSON plan catalog; built-in plans when unset.
    pub plan_catalog_path: Option<String>,

    /// JSON action cost table; built-in costs when unset.
    pub action_costs_path: Option<String>,

    /// Observability endpoint receiving usage records (optional).
    pub observability_url: Option<String>,

    /// Bearer key for the observability endpoint (optional).
    pub observability_api_key: Option<String>,

    /// Age in seconds after which pending reservations are swept.
    pub reservation_grace_seconds: u64,

    /// Seconds between stale reservation sweeps.
    pub sweep_interval_seconds: u64,

    /// Whether `past_due` subscriptions may keep reserving.
    pub allow_past_due: bool,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Observability secrets file structure.
#[derive(Debug, Deserialize)]
struct ObservabilitySecrets {
    url: String,
    #[serde(default)]
    api_key: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    ///
    /// Unparseable values fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (observability_url, observability_api_key) = load_observability_secrets();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            storage_backend: std::env::var("STORAGE_BACKEND")
                .ok()
                .and_then(|s| {
                    s.parse()
                        .map_err(|e: ConfigError| {
                            tracing::warn!(error = %e, "Ignoring STORAGE_BACKEND");
                        })
                        .ok()
                })
                .unwrap_or(defaults.storage_backend),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or(defaults.auth_audience),
            plan_catalog_path: std::env::var("PLAN_CATALOG_PATH").ok(),
            action_costs_path: std::env::var("ACTION_COSTS_PATH").ok(),
            observability_url,
            observability_api_key,
            reservation_grace_seconds: env_parse("RESERVATION_GRACE_SECONDS")
                .unwrap_or(defaults.reservation_grace_seconds),
            sweep_interval_seconds: env_parse("SWEEP_INTERVAL_SECONDS")
                .unwrap_or(defaults.sweep_interval_seconds),
            allow_past_due: env_parse("ALLOW_PAST_DUE").unwrap_or(defaults.allow_past_due),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
        }
    }

    /// Engine tunables derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let grace = i64::try_from(self.reservation_grace_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds);

        let defaults = EngineConfig::default();
        EngineConfig {
            reservation_grace: grace.unwrap_or(defaults.reservation_grace),
            allow_past_due: self.allow_past_due,
        }
    }

    /// The plan catalog from `plan_catalog_path`, or the built-in plans.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured file is unreadable or invalid.
    pub fn load_catalog(&self) -> Result<PlanCatalog, ConfigError> {
        match &self.plan_catalog_path {
            Some(path) => {
                let catalog = PlanCatalog::from_json(&read_file(path)?)?;
                tracing::info!(path = %path, plans = catalog.len(), "Loaded plan catalog");
                Ok(catalog)
            }
            None => Ok(PlanCatalog::default()),
        }
    }

    /// The action cost table from `action_costs_path`, or the built-in costs.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured file is unreadable or invalid.
    pub fn load_costs(&self) -> Result<ActionCosts, ConfigError> {
        match &self.action_costs_path {
            Some(path) => {
                let costs = ActionCosts::from_json(&read_file(path)?)?;
                tracing::info!(path = %path, "Loaded action costs");
                Ok(costs)
            }
            None => Ok(ActionCosts::default()),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })
}

/// Load observability endpoint settings from file or environment.
fn load_observability_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/observability.json",
        "z-metering/.secrets/observability.json",
        "../.secrets/observability.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<ObservabilitySecrets>(path) {
            tracing::info!(path = %path, "Loaded observability secrets from file");
            return (Some(secrets.url), secrets.api_key);
        }
    }

    tracing::debug!("Observability secrets file not found, using environment variables");
    (
        std::env::var("OBSERVABILITY_URL").ok(),
        std::env::var("OBSERVABILITY_API_KEY").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/z-metering".into(),
            storage_backend: StorageBackend::Memory,
            service_api_key: None,
            auth_jwt_secret: None,
            auth_audience: "z-metering".into(),
            plan_catalog_path: None,
            action_costs_path: None,
            observability_url: None,
            observability_api_key: None,
            reservation_grace_seconds: 15 * 60,
            sweep_interval_seconds: 60,
            allow_past_due: true,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
