pub mod validation;

use serde::{Deserialize, Serialize};

use crate::auth::AccountStatus;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP client configuration for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_timeout() -> u64 {
    600
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    90
}
fn default_user_agent() -> String {
    concat!("cloudcode-relay/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            user_agent: default_user_agent(),
            http_use_env_proxy: false,
            proxy: None,
        }
    }
}

/// Retry, rotation and backoff limits used by the failover engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_quota_backoff_base_ms")]
    pub quota_backoff_base_ms: u64,
    #[serde(default = "default_quota_backoff_max_ms")]
    pub quota_backoff_max_ms: u64,
    /// Cooldowns longer than this are surfaced instead of waited out.
    #[serde(default = "default_quota_wait_ceiling_ms")]
    pub quota_wait_ceiling_ms: u64,
    #[serde(default = "default_transient_max_attempts")]
    pub transient_max_attempts: u32,
    #[serde(default = "default_transient_backoff_base_ms")]
    pub transient_backoff_base_ms: u64,
    #[serde(default = "default_transient_backoff_max_ms")]
    pub transient_backoff_max_ms: u64,
    #[serde(default = "default_server_delay_max_ms")]
    pub server_delay_max_ms: u64,
}

fn default_quota_backoff_base_ms() -> u64 {
    1_000
}
fn default_quota_backoff_max_ms() -> u64 {
    60_000
}
fn default_quota_wait_ceiling_ms() -> u64 {
    120_000
}
fn default_transient_max_attempts() -> u32 {
    3
}
fn default_transient_backoff_base_ms() -> u64 {
    500
}
fn default_transient_backoff_max_ms() -> u64 {
    8_000
}
fn default_server_delay_max_ms() -> u64 {
    3_600_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            quota_backoff_base_ms: default_quota_backoff_base_ms(),
            quota_backoff_max_ms: default_quota_backoff_max_ms(),
            quota_wait_ceiling_ms: default_quota_wait_ceiling_ms(),
            transient_max_attempts: default_transient_max_attempts(),
            transient_backoff_base_ms: default_transient_backoff_base_ms(),
            transient_backoff_max_ms: default_transient_backoff_max_ms(),
            server_delay_max_ms: default_server_delay_max_ms(),
        }
    }
}

/// Stream buffering thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_text_min_chars")]
    pub text_min_chars: usize,
    #[serde(default = "default_text_max_latency_ms")]
    pub text_max_latency_ms: u64,
    /// Arrival rate (bytes per millisecond) above which thresholds halve.
    #[serde(default = "default_velocity_threshold")]
    pub velocity_threshold_bytes_per_ms: f64,
    #[serde(default = "default_thinking_chunk_chars")]
    pub thinking_chunk_chars: usize,
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,
    #[serde(default = "default_max_tag_buffer_bytes")]
    pub max_tag_buffer_bytes: usize,
}

fn default_text_min_chars() -> usize {
    32
}
fn default_text_max_latency_ms() -> u64 {
    80
}
fn default_velocity_threshold() -> f64 {
    4.0
}
fn default_thinking_chunk_chars() -> usize {
    48
}
fn default_liveness_interval_ms() -> u64 {
    2_000
}
fn default_max_tag_buffer_bytes() -> usize {
    512 * 1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            text_min_chars: default_text_min_chars(),
            text_max_latency_ms: default_text_max_latency_ms(),
            velocity_threshold_bytes_per_ms: default_velocity_threshold(),
            thinking_chunk_chars: default_thinking_chunk_chars(),
            liveness_interval_ms: default_liveness_interval_ms(),
            max_tag_buffer_bytes: default_max_tag_buffer_bytes(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prepend a filler thought part to the last assistant turn when thinking
    /// is enabled and the turn carries none.
    #[serde(default = "default_true")]
    pub filler_thinking: bool,
    /// Spread requests across accounts instead of sticking to the last
    /// successful one.
    #[serde(default)]
    pub load_distribution: bool,
    #[serde(default = "default_provider_key")]
    pub provider_key: String,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_provider_key() -> String {
    "cloudcode".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            filler_thinking: true,
            load_distribution: false,
            provider_key: default_provider_key(),
        }
    }
}

/// Statically configured account, used by the config-backed directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub project: Option<String>,
}

/// Statically configured model limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub max_input_tokens: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    #[serde(default = "default_true")]
    pub tool_calling: bool,
    #[serde(default = "default_true")]
    pub image_input: bool,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Same as [`load_config`] minus the I/O failure.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[0].ends_with("v1internal:"));
        assert_eq!(config.accounts.len(), 2);
        assert!(config.features.filler_thinking);
        assert!(!config.features.load_distribution);
        assert_eq!(config.retry.transient_max_attempts, 3);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("endpoints:\n  - https://example.test/v1internal:\n").unwrap();
        assert_eq!(config.transport.timeout, 600);
        assert_eq!(config.stream.text_min_chars, 32);
        assert_eq!(config.stream.liveness_interval_ms, 2_000);
        assert_eq!(config.retry.quota_backoff_base_ms, 1_000);
        assert_eq!(config.features.log_level, "INFO");
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn test_account_status_serde() {
        let yaml = "endpoints: [\"https://example.test\"]\naccounts:\n  - id: a\n    token: t\n    status: quota_limited\n";
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.accounts[0].status, AccountStatus::QuotaLimited);
    }

    #[test]
    fn test_missing_endpoints_is_yaml_error() {
        let err = parse_config("features: {}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }
}
