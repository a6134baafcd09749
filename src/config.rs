use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "INR";
const DEFAULT_MAX_QUANTITY_PER_LINE: i32 = 10;
const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 5;

/// Credentials for a single payment provider. A provider with an empty
/// key/secret pair is treated as not configured and is skipped at startup.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GatewayCredentials {
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_secret: String,
    /// Secret used for webhook signature verification; falls back to
    /// `key_secret` when unset.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Provider API base URL (overridable for tests).
    #[serde(default)]
    pub base_url: Option<String>,
    /// URL the hosted payment page redirects back to.
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl GatewayCredentials {
    pub fn is_configured(&self) -> bool {
        !self.key_id.is_empty() && !self.key_secret.is_empty()
    }

    pub fn webhook_secret(&self) -> &str {
        self.webhook_secret.as_deref().unwrap_or(&self.key_secret)
    }
}

/// Payment gateway configuration block.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub razorpay: GatewayCredentials,
    #[serde(default)]
    pub phonepe: GatewayCredentials,
}

/// Application configuration with validation.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[serde(default = "default_env")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Store currency (ISO 4217); all amounts are minor units of this
    #[serde(default = "default_currency")]
    #[validate(length(min = 3, max = 3))]
    pub currency: String,

    /// Maximum quantity a single order line may carry
    #[serde(default = "default_max_quantity_per_line")]
    #[validate(range(min = 1))]
    pub max_quantity_per_line: i32,

    /// Stock level at which a low-stock alert event is emitted
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i32,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Payment provider credentials
    #[serde(default)]
    pub payments: PaymentsConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_env() -> String {
    DEFAULT_ENV.to_string()
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_max_quantity_per_line() -> i32 {
    DEFAULT_MAX_QUANTITY_PER_LINE
}
fn default_low_stock_threshold() -> i32 {
    DEFAULT_LOW_STOCK_THRESHOLD
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

impl AppConfig {
    /// Minimal constructor used by tests and tooling.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            currency: default_currency(),
            max_quantity_per_line: default_max_quantity_per_line(),
            low_stock_threshold: default_low_stock_threshold(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            payments: PaymentsConfig::default(),
        }
    }
}

/// Loads configuration from layered sources: `config/default.toml`, an
/// environment-specific file, and `APP_*` environment variables (highest
/// precedence, `__` as the nesting separator, e.g.
/// `APP_PAYMENTS__RAZORPAY__KEY_ID`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let run_env = std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder()
        .set_default("environment", run_env.clone())?
        .set_default("host", "127.0.0.1")?;

    let default_file = Path::new(CONFIG_DIR).join("default.toml");
    if default_file.exists() {
        builder = builder.add_source(File::from(default_file));
    }
    let env_file = Path::new(CONFIG_DIR).join(format!("{run_env}.toml"));
    if env_file.exists() {
        builder = builder.add_source(File::from(env_file));
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let cfg: AppConfig = settings.try_deserialize()?;
    cfg.validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

    info!(environment = %cfg.environment, "Configuration loaded");
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fills_defaults() {
        let cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "127.0.0.1".into(),
            18080,
            "test".into(),
        );
        assert_eq!(cfg.currency, "INR");
        assert_eq!(cfg.max_quantity_per_line, 10);
        assert!(!cfg.payments.razorpay.is_configured());
    }

    #[test]
    fn webhook_secret_falls_back_to_key_secret() {
        let creds = GatewayCredentials {
            key_id: "key".into(),
            key_secret: "secret".into(),
            webhook_secret: None,
            base_url: None,
            callback_url: None,
        };
        assert_eq!(creds.webhook_secret(), "secret");
        assert!(creds.is_configured());
    }
}
