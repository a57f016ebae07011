use domain::models::Package;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use shared::validation::{validate_duration_days, MAX_DURATION_DAYS};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub allocation: AllocationConfig,
    pub payment: PaymentConfig,
    pub invitation: InvitationConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    pub jobs: JobsConfig,
    /// Package catalogue keyed by package id.
    #[serde(default)]
    pub packages: HashMap<String, PackageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl From<&DatabaseConfig> for persistence::db::DatabaseConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            url: config.url.clone(),
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            connect_timeout_secs: config.connect_timeout_secs,
            idle_timeout_secs: config.idle_timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Key expected in the `X-Admin-Key` header. Admin routes reject every
    /// request while this is empty.
    #[serde(default)]
    pub admin_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllocationConfig {
    /// Lease length for orders whose package carries no duration.
    #[serde(default = "default_lease_days")]
    pub default_lease_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    /// HMAC key for callback signatures.
    #[serde(default)]
    pub callback_private_key: String,

    /// Actor name recorded on callback-driven audit entries.
    #[serde(default = "default_provider_name")]
    pub provider_name: String,

    #[serde(default = "default_pending_order_ttl_hours")]
    pub pending_order_ttl_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvitationConfig {
    /// When disabled, assigned orders stay at `account_assigned`.
    #[serde(default)]
    pub enabled: bool,

    /// Automation service endpoint (required if enabled)
    #[serde(default)]
    pub executor_url: String,

    #[serde(default = "default_invite_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_invite_base_backoff")]
    pub base_backoff_secs: u64,

    #[serde(default = "default_invite_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationConfig {
    /// Operator webhook. Notifications are only logged when empty.
    #[serde(default)]
    pub webhook_url: String,

    /// Optional HMAC secret for the `X-Webhook-Signature` header.
    #[serde(default)]
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_lease_expiry_interval")]
    pub lease_expiry_interval_minutes: u64,

    #[serde(default = "default_stock_retry_interval")]
    pub stock_retry_interval_minutes: u64,

    #[serde(default = "default_invitation_resume_interval")]
    pub invitation_resume_interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    /// Minor currency units.
    pub price: i64,
    pub duration_days: i64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    20
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_lease_days() -> i64 {
    30
}
fn default_provider_name() -> String {
    "payment_gateway".to_string()
}
fn default_pending_order_ttl_hours() -> i64 {
    24
}
fn default_invite_max_retries() -> u32 {
    3
}
fn default_invite_base_backoff() -> u64 {
    300
}
fn default_invite_attempt_timeout() -> u64 {
    60
}
fn default_lease_expiry_interval() -> u64 {
    60
}
fn default_stock_retry_interval() -> u64 {
    30
}
fn default_invitation_resume_interval() -> u64 {
    15
}

/// Configuration validation error
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Loading order (later sources override earlier):
    /// 1. config/default.toml - base configuration with defaults
    /// 2. config/local.toml - local overrides (optional, not in git)
    /// 3. Environment variables with SL__ prefix
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("SL").separator("__"))
            .build()?;

        let cfg: Self = config.try_deserialize()?;
        cfg.validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Ok(cfg)
    }

    /// Load configuration for testing with custom overrides.
    ///
    /// Builds the config from embedded defaults so tests do not depend on
    /// the working directory.
    #[cfg(test)]
    pub fn load_for_test(overrides: &[(&str, &str)]) -> Result<Self, config::ConfigError> {
        let defaults = r#"
            [server]
            host = "0.0.0.0"
            port = 8080
            request_timeout_secs = 30

            [database]
            url = ""
            max_connections = 20
            min_connections = 5
            connect_timeout_secs = 10
            idle_timeout_secs = 600

            [logging]
            level = "info"
            format = "json"

            [security]
            cors_origins = []
            admin_api_key = "test-admin-key"

            [allocation]
            default_lease_days = 30

            [payment]
            callback_private_key = "test-callback-key"
            provider_name = "payment_gateway"
            pending_order_ttl_hours = 24

            [invitation]
            enabled = false
            executor_url = ""
            max_retries = 3
            base_backoff_secs = 300
            attempt_timeout_secs = 60

            [notification]
            webhook_url = ""

            [jobs]
            lease_expiry_interval_minutes = 60
            stock_retry_interval_minutes = 30
            invitation_resume_interval_minutes = 15

            [packages.1_month]
            name = "1 Month"
            price = 50000
            duration_days = 30
        "#;

        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(defaults, config::FileFormat::Toml));

        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }

        let cfg: Self = builder.build()?.try_deserialize()?;
        // Skip validation in tests to allow partial configs
        Ok(cfg)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.database.url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "SL__DATABASE__URL environment variable must be set".to_string(),
            ));
        }

        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue(
                "Server port cannot be 0".to_string(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigValidationError::InvalidValue(
                "min_connections cannot exceed max_connections".to_string(),
            ));
        }

        if self.payment.callback_private_key.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "SL__PAYMENT__CALLBACK_PRIVATE_KEY environment variable must be set".to_string(),
            ));
        }

        if validate_duration_days(self.allocation.default_lease_days).is_err() {
            return Err(ConfigValidationError::InvalidValue(format!(
                "default_lease_days must be between 1 and {}",
                MAX_DURATION_DAYS
            )));
        }

        if self.payment.pending_order_ttl_hours <= 0
            || self.payment.pending_order_ttl_hours > MAX_DURATION_DAYS * 24
        {
            return Err(ConfigValidationError::InvalidValue(
                "pending_order_ttl_hours is out of range".to_string(),
            ));
        }

        if self.invitation.enabled && self.invitation.executor_url.is_empty() {
            return Err(ConfigValidationError::MissingRequired(
                "invitation.executor_url is required when the invitation pipeline is enabled"
                    .to_string(),
            ));
        }

        for (id, package) in &self.packages {
            if validate_duration_days(package.duration_days).is_err() || package.price < 0 {
                return Err(ConfigValidationError::InvalidValue(format!(
                    "Package {} needs a duration of 1 to {} days and a non-negative price",
                    id, MAX_DURATION_DAYS
                )));
            }
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    /// Catalogue entries built from the `packages` table.
    pub fn package_list(&self) -> Vec<Package> {
        self.packages
            .iter()
            .map(|(id, package)| Package {
                id: id.clone(),
                name: package.name.clone(),
                price: package.price,
                duration_days: package.duration_days,
            })
            .collect()
    }
}
