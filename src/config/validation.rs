use std::collections::HashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_endpoints(config)?;
    validate_transport_config(config)?;
    validate_retry_config(config)?;
    validate_stream_config(config)?;
    validate_accounts(config)?;
    validate_models(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_endpoints(config: &AppConfig) -> Result<(), ConfigError> {
    if config.endpoints.is_empty() {
        return Err(validation_err("endpoints cannot be empty"));
    }
    let mut seen = HashSet::new();
    for endpoint in &config.endpoints {
        let parsed = url::Url::parse(endpoint.trim())
            .map_err(|err| validation_err(format!("endpoint '{endpoint}' is not a valid URL: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(validation_err(format!(
                "endpoint '{endpoint}' must use http:// or https://"
            )));
        }
        if !seen.insert(endpoint.trim()) {
            return Err(validation_err(format!("duplicate endpoint '{endpoint}'")));
        }
    }
    Ok(())
}

fn validate_transport_config(config: &AppConfig) -> Result<(), ConfigError> {
    let transport = &config.transport;
    if transport.timeout == 0 {
        return Err(validation_err("transport.timeout must be greater than 0"));
    }
    if transport.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "transport.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if transport.user_agent.trim().is_empty() {
        return Err(validation_err("transport.user_agent cannot be empty"));
    }
    if let Some(proxy) = transport.proxy.as_deref().map(str::trim) {
        if proxy.is_empty() {
            return Err(validation_err("transport.proxy cannot be empty when set"));
        }
        let parsed = url::Url::parse(proxy)
            .map_err(|err| validation_err(format!("transport.proxy is not a valid URL: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
            return Err(validation_err(
                "transport.proxy must use http://, https:// or socks5://",
            ));
        }
    }
    Ok(())
}

fn validate_retry_config(config: &AppConfig) -> Result<(), ConfigError> {
    let retry = &config.retry;
    if retry.transient_max_attempts == 0 {
        return Err(validation_err(
            "retry.transient_max_attempts must be greater than 0",
        ));
    }
    if retry.quota_backoff_base_ms == 0 || retry.transient_backoff_base_ms == 0 {
        return Err(validation_err("retry backoff bases must be greater than 0"));
    }
    if retry.quota_backoff_max_ms < retry.quota_backoff_base_ms {
        return Err(validation_err(
            "retry.quota_backoff_max_ms must be >= retry.quota_backoff_base_ms",
        ));
    }
    if retry.transient_backoff_max_ms < retry.transient_backoff_base_ms {
        return Err(validation_err(
            "retry.transient_backoff_max_ms must be >= retry.transient_backoff_base_ms",
        ));
    }
    Ok(())
}

fn validate_stream_config(config: &AppConfig) -> Result<(), ConfigError> {
    let stream = &config.stream;
    if stream.text_min_chars == 0 {
        return Err(validation_err("stream.text_min_chars must be greater than 0"));
    }
    if stream.thinking_chunk_chars == 0 {
        return Err(validation_err(
            "stream.thinking_chunk_chars must be greater than 0",
        ));
    }
    if stream.liveness_interval_ms == 0 {
        return Err(validation_err(
            "stream.liveness_interval_ms must be greater than 0",
        ));
    }
    if !(stream.velocity_threshold_bytes_per_ms.is_finite()
        && stream.velocity_threshold_bytes_per_ms > 0.0)
    {
        return Err(validation_err(
            "stream.velocity_threshold_bytes_per_ms must be a positive number",
        ));
    }
    if stream.max_tag_buffer_bytes < 1024 {
        return Err(validation_err(
            "stream.max_tag_buffer_bytes must be at least 1024",
        ));
    }
    Ok(())
}

fn validate_accounts(config: &AppConfig) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for account in &config.accounts {
        if account.id.trim().is_empty() {
            return Err(validation_err("account id cannot be empty"));
        }
        if account.token.trim().is_empty() {
            return Err(validation_err(format!(
                "Account '{}': token cannot be empty",
                account.id
            )));
        }
        if !ids.insert(account.id.as_str()) {
            return Err(validation_err(format!(
                "duplicate account id '{}'",
                account.id
            )));
        }
    }
    if config.accounts.iter().filter(|a| a.is_default).count() > 1 {
        return Err(validation_err("at most one account can be marked is_default"));
    }
    Ok(())
}

fn validate_models(config: &AppConfig) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for model in &config.models {
        if model.id.trim().is_empty() {
            return Err(validation_err("model id cannot be empty"));
        }
        if !ids.insert(model.id.as_str()) {
            return Err(validation_err(format!("duplicate model entry '{}'", model.id)));
        }
        if model.max_output_tokens == Some(0) || model.max_input_tokens == Some(0) {
            return Err(validation_err(format!(
                "Model '{}': token limits must be greater than 0 when set",
                model.id
            )));
        }
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
