use crate::config::types::{
    ArchivalUnitConfig, Config, CrawlerConfig, HttpConfig, ManagerConfig, OutputConfig,
    UserAgentConfig, MAX_QUEUE_SIZE,
};
use crate::rate::{CrawlRateLimiter, Rate};
use crate::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_http_config(&config.http)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_manager_config(&config.manager)?;
    validate_output_config(&config.output)?;
    validate_archival_units(&config.archival_units)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_crawl_depth < 1 {
        return Err(ConfigError::Validation(format!(
            "max_crawl_depth must be >= 1, got {}",
            config.max_crawl_depth
        )));
    }

    if config.min_retry_delay > config.default_retry_delay {
        return Err(ConfigError::Validation(format!(
            "min_retry_delay ({}ms) must not exceed default_retry_delay ({}ms)",
            config.min_retry_delay, config.default_retry_delay
        )));
    }

    if config.default_retry_count > config.max_retry_count {
        return Err(ConfigError::Validation(format!(
            "default_retry_count ({}) must not exceed max_retry_count ({})",
            config.default_retry_count, config.max_retry_count
        )));
    }

    for host in &config.globally_permitted_hosts {
        validate_host_pattern(host)?;
    }

    Ok(())
}

/// Validates HTTP client configuration
fn validate_http_config(config: &HttpConfig) -> Result<(), ConfigError> {
    if config.connect_timeout == 0 {
        return Err(ConfigError::Validation(
            "connect_timeout must be > 0".to_string(),
        ));
    }

    if config.connect_timeout >= config.data_timeout {
        return Err(ConfigError::Validation(format!(
            "data_timeout ({}s) must be larger than connect_timeout ({}s)",
            config.data_timeout, config.connect_timeout
        )));
    }

    for code in config.result_map.keys() {
        match code.parse::<u16>() {
            Ok(n) if (100..600).contains(&n) => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "result_map key '{}' is not an HTTP status code",
                    code
                )))
            }
        }
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates pool sizing and crawl start rates
fn validate_manager_config(config: &ManagerConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 || config.pool_size > 100 {
        return Err(ConfigError::Validation(format!(
            "pool_size must be between 1 and 100, got {}",
            config.pool_size
        )));
    }

    if config.queue_size > MAX_QUEUE_SIZE {
        return Err(ConfigError::Validation(format!(
            "queue_size must be <= {}, got {}",
            MAX_QUEUE_SIZE, config.queue_size
        )));
    }

    for (name, rate) in [
        ("new_content_rate", &config.new_content_rate),
        ("repair_rate", &config.repair_rate),
        ("start_rate", &config.start_rate),
    ] {
        rate.parse::<Rate>()
            .map_err(|e| ConfigError::Validation(format!("{}: {}", name, e)))?;
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates archival unit tables
fn validate_archival_units(units: &[ArchivalUnitConfig]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();

    for au in units {
        if au.id.is_empty() {
            return Err(ConfigError::Validation(
                "archival unit id cannot be empty".to_string(),
            ));
        }

        if !ids.insert(au.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate archival unit id '{}'",
                au.id
            )));
        }

        if au.start_urls.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Archival unit '{}' must have at least one start URL",
                au.id
            )));
        }

        for url in au
            .base_urls
            .iter()
            .chain(&au.start_urls)
            .chain(&au.permission_urls)
        {
            validate_http_url(url)?;
        }

        for rule in &au.crawl_rules {
            Regex::new(&rule.pattern).map_err(|e| {
                ConfigError::InvalidPattern(format!(
                    "Archival unit '{}' crawl rule '{}': {}",
                    au.id, rule.pattern, e
                ))
            })?;
        }

        if let Some(pattern) = &au.explode_pattern {
            Regex::new(pattern).map_err(|e| {
                ConfigError::InvalidPattern(format!(
                    "Archival unit '{}' explode pattern: {}",
                    au.id, e
                ))
            })?;
        }

        for base in au.explode_stems.values() {
            validate_http_url(base)?;
        }

        if au.max_repeated_path_segments < 1 {
            return Err(ConfigError::Validation(format!(
                "Archival unit '{}': max_repeated_path_segments must be >= 1",
                au.id
            )));
        }

        for host in &au.permitted_hosts {
            validate_host_pattern(host)?;
        }

        // Builds every limiter once so bad rates fail at load time
        CrawlRateLimiter::new(&au.rate_limits).map_err(|e| {
            ConfigError::Validation(format!("Archival unit '{}': {}", au.id, e))
        })?;
    }

    Ok(())
}

fn validate_http_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidUrl(format!(
            "URL '{}' must use http or https, got {}",
            raw, other
        ))),
    }
}

/// Validates a host pattern (supports wildcards)
fn validate_host_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Host pattern cannot be empty".to_string(),
        ));
    }

    let host = pattern.strip_prefix("*.").unwrap_or(pattern);
    validate_host_string(host)
}

/// Validates a host name (without wildcard prefix)
fn validate_host_string(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Host cannot be empty".to_string(),
        ));
    }

    if !host
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.starts_with('-') || host.ends_with('-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' cannot start or end with '.' or '-'",
            host
        )));
    }

    if host.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' cannot contain consecutive dots",
            host
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let Some((local, domain)) = email.split_once('@') else {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
