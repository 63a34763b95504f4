//! Configuration validation module.
//!
//! Checks every section and reports all problems at once, so a bad deploy
//! fails at startup with the full list rather than one error per restart.

use crate::AppConfig;
use beacon_jobs::{JobsConfig, StoreBackend};
use beacon_resilience::{BackoffPolicy, CircuitBreakerConfig, RetryConfig};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// A concurrency ceiling is zero.
    InvalidConcurrency { name: String, value: usize },
    /// Timeout or interval value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// A count or capacity is out of range.
    InvalidLimit { name: String, message: String },
    /// Backoff parameters are inconsistent.
    InvalidBackoff { name: String, message: String },
    /// A ratio must lie in the given range.
    InvalidRatio { name: String, value: f64 },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Log filter is empty.
    EmptyLogFilter,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConcurrency { name, value } => {
                write!(f, "Concurrency '{}' must be at least 1, got {}", name, value)
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::InvalidLimit { name, message } => write!(f, "Invalid '{}': {}", name, message),
            Self::InvalidBackoff { name, message } => {
                write!(f, "Invalid backoff '{}': {}", name, message)
            }
            Self::InvalidRatio { name, value } => {
                write!(f, "Invalid ratio '{}': {} (must be between 0.0 and 1.0)", name, value)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::EmptyLogFilter => write!(f, "Log filter cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn require_positive(&mut self, name: &str, value: u64) {
        if value == 0 {
            self.add_error(ConfigValidationError::NonPositiveTimeout {
                name: name.to_string(),
                value,
            });
        }
    }

    fn require_ratio(&mut self, name: &str, value: f64, allow_zero: bool) {
        let in_range = if allow_zero {
            (0.0..=1.0).contains(&value)
        } else {
            value > 0.0 && value <= 1.0
        };
        if !in_range {
            self.add_error(ConfigValidationError::InvalidRatio {
                name: name.to_string(),
                value,
            });
        }
    }

    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the validation errors.
    pub fn errors(&self) -> &[ConfigValidationError] {
        &self.errors
    }

    /// Converts to Result, returning Err with all errors if any exist.
    pub fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Largest accepted Redis pool.
    const MAX_POOL_SIZE: usize = 1000;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::default();

        if config.logging.filter.trim().is_empty() {
            result.add_error(ConfigValidationError::EmptyLogFilter);
        }
        Self::validate_jobs(&config.jobs, &mut result);

        result.into_result()
    }

    /// Validates the job queue sections.
    pub fn validate_jobs(config: &JobsConfig, result: &mut ValidationResult) {
        let queue = &config.queue;
        if queue.global_concurrency == 0 {
            result.add_error(ConfigValidationError::InvalidConcurrency {
                name: "jobs.queue.global_concurrency".to_string(),
                value: 0,
            });
        }
        let mut types: Vec<_> = queue.type_concurrency.iter().collect();
        types.sort();
        for (job_type, limit) in types {
            if *limit == 0 {
                result.add_error(ConfigValidationError::InvalidConcurrency {
                    name: format!("jobs.queue.type_concurrency.{}", job_type),
                    value: 0,
                });
            }
        }
        result.require_positive("jobs.queue.poll_interval_ms", queue.poll_interval_ms);
        result.require_positive("jobs.queue.default_timeout_ms", queue.default_timeout_ms);
        result.require_positive("jobs.queue.shutdown_timeout_ms", queue.shutdown_timeout_ms);
        result.require_positive("jobs.queue.max_store_pause_ms", queue.max_store_pause_ms);
        result.require_positive("jobs.queue.store_timeout_ms", queue.store_timeout_ms);
        if queue.scan_limit == 0 {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: "jobs.queue.scan_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if queue.event_capacity == 0 {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: "jobs.queue.event_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Self::validate_retry("jobs.queue.store_retry", &queue.store_retry, result);
        Self::validate_retry("jobs.retry", &config.retry, result);

        Self::validate_breaker("jobs.breaker", &config.breaker.defaults, result);
        let mut resources: Vec<_> = config.breaker.resources.iter().collect();
        resources.sort_by(|a, b| a.0.cmp(b.0));
        for (name, breaker) in resources {
            Self::validate_breaker(&format!("jobs.breaker.resources.{}", name), breaker, result);
        }

        let health = &config.health;
        result.require_positive("jobs.health.interval_ms", health.interval_ms);
        result.require_positive("jobs.health.window_secs", health.window_secs);
        result.require_ratio("jobs.health.max_error_rate", health.max_error_rate, true);

        result.require_positive("jobs.maintenance.interval_ms", config.maintenance.interval_ms);

        if config.store.backend == StoreBackend::Redis {
            Self::validate_redis(&config.store.redis, result);
        }
    }

    fn validate_retry(name: &str, config: &RetryConfig, result: &mut ValidationResult) {
        if config.max_attempts == 0 {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: format!("{}.max_attempts", name),
                message: "must be at least 1".to_string(),
            });
        }
        Self::validate_backoff(name, &config.backoff, result);
    }

    fn validate_backoff(name: &str, backoff: &BackoffPolicy, result: &mut ValidationResult) {
        if backoff.multiplier < 1.0 || !backoff.multiplier.is_finite() {
            result.add_error(ConfigValidationError::InvalidBackoff {
                name: name.to_string(),
                message: format!("multiplier must be at least 1.0, got {}", backoff.multiplier),
            });
        }
        if backoff.initial_delay_ms > backoff.max_delay_ms {
            result.add_error(ConfigValidationError::InvalidBackoff {
                name: name.to_string(),
                message: format!(
                    "initial delay {}ms exceeds max delay {}ms",
                    backoff.initial_delay_ms, backoff.max_delay_ms
                ),
            });
        }
    }

    fn validate_breaker(name: &str, config: &CircuitBreakerConfig, result: &mut ValidationResult) {
        result.require_ratio(&format!("{}.failure_threshold", name), config.failure_threshold, false);
        if config.minimum_calls == 0 {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: format!("{}.minimum_calls", name),
                message: "must be at least 1".to_string(),
            });
        }
        result.require_positive(&format!("{}.recovery_timeout_ms", name), config.recovery_timeout_ms);
        result.require_positive(&format!("{}.monitoring_window_ms", name), config.monitoring_window_ms);
    }

    fn validate_redis(config: &beacon_jobs::RedisConfig, result: &mut ValidationResult) {
        match Url::parse(&config.url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(url) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("unsupported scheme '{}', expected redis:// or rediss://", url.scheme()),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        if config.pool_size == 0 || config.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: "jobs.store.redis.pool_size".to_string(),
                message: format!("must be between 1 and {}, got {}", Self::MAX_POOL_SIZE, config.pool_size),
            });
        }
        if config.key_prefix.is_empty() {
            result.add_error(ConfigValidationError::InvalidLimit {
                name: "jobs.store.redis.key_prefix".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_jobs::JobType;

    fn errors_for(config: &AppConfig) -> Vec<ConfigValidationError> {
        ConfigValidator::validate(config).unwrap_err()
    }

    #[test]
    fn test_default_config_passes() {
        assert!(ConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency() {
        let mut config = AppConfig::default();
        config.jobs.queue.global_concurrency = 0;
        config.jobs.queue.type_concurrency.insert(JobType::SeoAnalysis, 0);

        let errors = errors_for(&config);
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidConcurrency { name, .. } if name == "jobs.queue.global_concurrency"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidConcurrency { name, .. } if name == "jobs.queue.type_concurrency.seo_analysis"
        )));
    }

    #[test]
    fn test_zero_store_timeout() {
        let mut config = AppConfig::default();
        config.jobs.queue.store_timeout_ms = 0;

        assert_eq!(
            errors_for(&config),
            vec![ConfigValidationError::NonPositiveTimeout {
                name: "jobs.queue.store_timeout_ms".to_string(),
                value: 0,
            }]
        );
    }

    #[test]
    fn test_invalid_backoff() {
        let mut config = AppConfig::default();
        config.jobs.retry.backoff.multiplier = 0.5;
        config.jobs.retry.backoff.initial_delay_ms = 60_000;

        let errors = errors_for(&config);
        assert_eq!(
            errors
                .iter()
                .filter(|e| matches!(e, ConfigValidationError::InvalidBackoff { name, .. } if name == "jobs.retry"))
                .count(),
            2
        );
    }

    #[test]
    fn test_invalid_breaker_override() {
        let mut config = AppConfig::default();
        config.jobs.breaker.resources.insert(
            "openai".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1.5,
                minimum_calls: 0,
                ..Default::default()
            },
        );

        let errors = errors_for(&config);
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidRatio { name, .. } if name == "jobs.breaker.resources.openai.failure_threshold"
        )));
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidLimit { name, .. } if name == "jobs.breaker.resources.openai.minimum_calls"
        )));
    }

    #[test]
    fn test_redis_url_checked_only_for_redis_backend() {
        let mut config = AppConfig::default();
        config.jobs.store.redis.url = "http://localhost:6379".to_string();
        assert!(ConfigValidator::validate(&config).is_ok());

        config.jobs.store.backend = StoreBackend::Redis;
        let errors = errors_for(&config);
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidUrl { url_type, .. } if url_type == "redis"
        )));
    }

    #[test]
    fn test_multiple_errors() {
        let mut config = AppConfig::default();
        config.logging.filter = " ".to_string();
        config.jobs.queue.poll_interval_ms = 0;
        config.jobs.health.max_error_rate = 2.0;

        let errors = errors_for(&config);
        assert_eq!(errors.len(), 3);
        assert!(errors.contains(&ConfigValidationError::EmptyLogFilter));
    }

    #[test]
    fn test_format_validation_errors() {
        let errors = vec![
            ConfigValidationError::EmptyLogFilter,
            ConfigValidationError::NonPositiveTimeout {
                name: "jobs.queue.poll_interval_ms".to_string(),
                value: 0,
            },
        ];

        let formatted = format_validation_errors(&errors);
        assert!(formatted.contains("1. Log filter cannot be empty"));
        assert!(formatted.contains("2. Timeout 'jobs.queue.poll_interval_ms' must be positive"));
    }
}
