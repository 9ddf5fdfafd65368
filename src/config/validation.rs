use crate::config::types::{Config, CrawlerConfig, RetryConfig, StorageConfig};
use crate::engine::validate_domain_pattern;
use crate::storage::StorageType;
use crate::ConfigError;
use url::Url;

/// Highest accepted `max_retries`; the last backoff is 2^25 seconds
pub const MAX_RETRIES: u32 = 26;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_retry_config(&config.retry)?;
    validate_storage_config(&config.storage)?;
    validate_seeds(&config.seeds)?;
    Ok(())
}

/// Validates fetch engine configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.parallelism < 1 || config.parallelism > 100 {
        return Err(ConfigError::Validation(format!(
            "parallelism must be between 1 and 100, got {}",
            config.parallelism
        )));
    }

    if config.request_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "request_timeout_ms must be greater than 0".to_string(),
        ));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    for pattern in config
        .allowed_domains
        .iter()
        .chain(config.disallowed_domains.iter())
    {
        validate_domain_pattern(pattern).map_err(ConfigError::Validation)?;
    }

    Ok(())
}

/// Validates retry configuration
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if let Some(code) = config
        .retry_http_codes
        .iter()
        .find(|code| !(100..=599).contains(*code))
    {
        return Err(ConfigError::Validation(format!(
            "retry_http_codes contains invalid status code {}",
            code
        )));
    }

    // Later backoffs (2^retries seconds) exceed the longest timer tokio supports
    if config.max_retries > MAX_RETRIES {
        return Err(ConfigError::Validation(format!(
            "max_retries must be <= {}, got {}",
            MAX_RETRIES, config.max_retries
        )));
    }

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }

    if config.storage_type == StorageType::Sqlite
        && config.dsn.as_deref().map_or(true, str::is_empty)
        && config.dir.as_os_str().is_empty()
    {
        return Err(ConfigError::Validation(
            "sqlite storage requires either dir or dsn".to_string(),
        ));
    }

    if config.storage_type == StorageType::MySql
        && config.dsn.as_deref().map_or(true, str::is_empty)
    {
        return Err(ConfigError::Validation(
            "mysql storage requires a dsn".to_string(),
        ));
    }

    Ok(())
}

/// Validates seed URLs
fn validate_seeds(seeds: &[String]) -> Result<(), ConfigError> {
    for seed in seeds {
        let url = Url::parse(seed)
            .map_err(|e| ConfigError::Validation(format!("Invalid seed URL '{}': {}", seed, e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use http or https",
                seed
            )));
        }
    }

    Ok(())
}
