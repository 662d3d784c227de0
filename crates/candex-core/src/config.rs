//! Environment-driven configuration shared by the ingest and repair paths.
//!
//! Component-specific settings (processor, worker, embedding backend) live
//! next to the component and follow the same `from_env` + builder pattern.

use std::str::FromStr;
use std::time::Duration;

use crate::defaults;
use crate::normalize::NormalizerConfig;

/// Read and parse an environment variable, falling back on absence or parse failure.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Read a boolean flag; anything except `false`/`0` counts as enabled.
pub fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

/// Ingest and repair settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    /// Base priority handed to the job queue on enqueue.
    pub base_priority: i32,
    /// Requests per caller per window.
    pub rate_limit_requests: u32,
    pub rate_limit_period: Duration,
    /// Default row bound for repair sweeps.
    pub repair_scan_limit: i64,
    /// In-progress jobs older than this are reclaimed by the stale sweep.
    pub stale_after: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            base_priority: defaults::JOB_BASE_PRIORITY,
            rate_limit_requests: defaults::INGEST_RATE_LIMIT_REQUESTS,
            rate_limit_period: Duration::from_secs(defaults::INGEST_RATE_LIMIT_PERIOD_SECS),
            repair_scan_limit: defaults::REPAIR_SCAN_LIMIT,
            stale_after: Duration::from_secs(defaults::JOB_STALE_AFTER_SECS),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DEFAULT_COUNTRY_CODE` | `+44` | Prefix for national phone numbers |
    /// | `JOB_BASE_PRIORITY` | `50` | Base priority for enqueued jobs |
    /// | `INGEST_RATE_LIMIT_REQUESTS` | `60` | Ingest calls per caller per window |
    /// | `INGEST_RATE_LIMIT_PERIOD_SECS` | `60` | Rate limit window |
    /// | `REPAIR_SCAN_LIMIT` | `500` | Rows examined per repair sweep |
    /// | `JOB_STALE_AFTER_SECS` | `900` | Age at which in-progress jobs are reclaimed |
    pub fn from_env() -> Self {
        let normalizer = std::env::var("DEFAULT_COUNTRY_CODE")
            .map(|cc| NormalizerConfig::new(&cc))
            .unwrap_or_default();

        Self {
            normalizer,
            base_priority: env_or("JOB_BASE_PRIORITY", defaults::JOB_BASE_PRIORITY),
            rate_limit_requests: env_or(
                "INGEST_RATE_LIMIT_REQUESTS",
                defaults::INGEST_RATE_LIMIT_REQUESTS,
            )
            .max(1),
            rate_limit_period: Duration::from_secs(env_or(
                "INGEST_RATE_LIMIT_PERIOD_SECS",
                defaults::INGEST_RATE_LIMIT_PERIOD_SECS,
            )),
            repair_scan_limit: env_or("REPAIR_SCAN_LIMIT", defaults::REPAIR_SCAN_LIMIT),
            stale_after: Duration::from_secs(env_or(
                "JOB_STALE_AFTER_SECS",
                defaults::JOB_STALE_AFTER_SECS,
            )),
        }
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_base_priority(mut self, priority: i32) -> Self {
        self.base_priority = priority;
        self
    }

    /// Set the ingest rate limit.
    pub fn with_rate_limit(mut self, requests: u32, period: Duration) -> Self {
        self.rate_limit_requests = requests.max(1);
        self.rate_limit_period = period;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_missing_var() {
        let v: u64 = env_or("CANDEX_TEST_SURELY_UNSET_VAR", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_priority, defaults::JOB_BASE_PRIORITY);
        assert_eq!(
            config.normalizer.default_country_code,
            defaults::DEFAULT_COUNTRY_CODE
        );
    }

    #[test]
    fn test_builder_clamps_rate_limit() {
        let config = PipelineConfig::default().with_rate_limit(0, Duration::from_secs(1));
        assert_eq!(config.rate_limit_requests, 1);
    }
}
