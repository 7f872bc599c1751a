// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! Every setting the core needs comes from an `APP_*` environment variable,
//! parsed once at process start into an immutable [`Config`] and passed to
//! each component's constructor — no globals, no lazy re-reads.

use std::time::Duration;

/// Restart policy for the Lifecycle Manager (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
    UnlessStopped,
}

impl RestartPolicy {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "never" => Ok(Self::Never),
            "on-failure" => Ok(Self::OnFailure),
            "always" => Ok(Self::Always),
            "unless-stopped" => Ok(Self::UnlessStopped),
            _ => Err(ConfigError::Invalid(
                "APP_RESTART_POLICY",
                "must be one of never|on-failure|always|unless-stopped",
            )),
        }
    }

    /// Whether a restart is permitted given the most recent exit was a failure.
    pub fn permits_restart(&self, failed: bool) -> bool {
        match self {
            Self::Never => false,
            Self::OnFailure => failed,
            Self::Always => true,
            Self::UnlessStopped => failed,
        }
    }
}

/// Worker process configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub flow_name: String,
    pub instance_id_override: Option<String>,
    pub queue_dsn: String,
    pub source_dsns: Vec<String>,
    pub batch_size: u32,
    pub worker_concurrency: usize,
    pub orphan_timeout: Duration,
    pub orphan_check_interval: Duration,
    pub max_retries: i32,
    pub pool_size: u32,
    pub pool_overflow: u32,
    pub query_timeout: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub health_failure_threshold: u32,
    pub health_port: u16,
    pub slow_threshold: Duration,
    pub alert_depth: i64,
    pub backlog_watermark: i64,
    pub pool_saturation_threshold: Duration,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
    pub restart_base: Duration,
    pub restart_cap: Duration,
    pub grace_period: Duration,
    pub event_log_capacity: usize,
    pub log_level: String,
    pub log_format: String,
}

impl Config {
    /// Load and validate configuration from the process environment
    /// (spec.md §6.2). Fails fast on a missing required variable or an
    /// unparseable value — never guesses a default for something required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let flow_name =
            env_var("APP_FLOW_NAME").map_err(|_| ConfigError::Missing("APP_FLOW_NAME"))?;
        let queue_dsn =
            env_var("APP_QUEUE_DSN").map_err(|_| ConfigError::Missing("APP_QUEUE_DSN"))?;

        let mut source_dsns = Vec::new();
        if let Ok(single) = env_var("APP_SOURCE_DSN") {
            source_dsns.push(single);
        }
        for n in 0..16 {
            if let Ok(dsn) = env_var(&format!("APP_SOURCE_DSN_{n}")) {
                source_dsns.push(dsn);
            }
        }

        let batch_size = parse_env_default("APP_BATCH_SIZE", 100u32)?.clamp(1, 1000);
        let worker_concurrency = parse_env_default("APP_WORKER_CONCURRENCY", 1usize)?.max(1);
        let orphan_timeout =
            Duration::from_secs(parse_env_default("APP_ORPHAN_TIMEOUT_SEC", 3600u64)?);
        // spec.md §4.3.3 names a 5-minute default cadence for the orphan
        // recovery tick, independent of the orphan threshold itself.
        let orphan_check_interval =
            Duration::from_secs(parse_env_default("APP_ORPHAN_CHECK_INTERVAL_SEC", 300u64)?);
        let max_retries = parse_env_default("APP_MAX_RETRIES", 3i32)?;
        let pool_size = parse_env_default("APP_POOL_SIZE", 5u32)?;
        let pool_overflow = parse_env_default("APP_POOL_OVERFLOW", 10u32)?;
        let query_timeout = Duration::from_secs(parse_env_default("APP_QUERY_TIMEOUT_SEC", 30u64)?);
        let health_interval =
            Duration::from_secs(parse_env_default("APP_HEALTH_INTERVAL_SEC", 30u64)?);
        let health_timeout = Duration::from_secs(parse_env_default("APP_HEALTH_TIMEOUT_SEC", 2u64)?);
        // spec.md §4.5 "Running health": Remediating escalates to Failed
        // after K consecutive probe failures, default 3.
        let health_failure_threshold = parse_env_default("APP_HEALTH_FAILURE_THRESHOLD", 3u32)?;
        let health_port = parse_env_default("APP_HEALTH_PORT", 8080u16)?;
        let slow_threshold =
            Duration::from_millis(parse_env_default("APP_SLOW_THRESHOLD_MS", 500u64)?);
        let alert_depth = parse_env_default("APP_ALERT_DEPTH", 10_000i64)?;
        // spec.md §5 "Back-pressure": speed up idle back-off once pending
        // backlog crosses this watermark.
        let backlog_watermark = parse_env_default("APP_BACKLOG_WATERMARK", 500i64)?;
        // ...and slow back down toward idle_backoff_max once claim_batch
        // itself is taking this long, a proxy for pool/store saturation.
        let pool_saturation_threshold =
            Duration::from_millis(parse_env_default("APP_POOL_SATURATION_MS", 250u64)?);

        let restart_policy = match env_var("APP_RESTART_POLICY") {
            Ok(s) => RestartPolicy::parse(&s)?,
            Err(_) => RestartPolicy::OnFailure,
        };
        let max_restarts = parse_env_default("APP_MAX_RESTARTS", 5u32)?;
        let restart_base = Duration::from_secs(parse_env_default("APP_RESTART_BASE_SEC", 10u64)?);
        let restart_cap = Duration::from_secs(parse_env_default("APP_RESTART_CAP_SEC", 300u64)?);
        let grace_period = Duration::from_secs(parse_env_default("APP_GRACE_PERIOD_SEC", 30u64)?);
        let event_log_capacity = parse_env_default("APP_EVENT_LOG_CAPACITY", 1000usize)?;

        let log_level = env_var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env_var("APP_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

        Ok(Self {
            flow_name,
            instance_id_override: env_var("APP_INSTANCE_ID").ok(),
            queue_dsn,
            source_dsns,
            batch_size,
            worker_concurrency,
            orphan_timeout,
            orphan_check_interval,
            max_retries,
            pool_size,
            pool_overflow,
            query_timeout,
            health_interval,
            health_timeout,
            health_failure_threshold,
            health_port,
            slow_threshold,
            alert_depth,
            backlog_watermark,
            pool_saturation_threshold,
            restart_policy,
            max_restarts,
            restart_base,
            restart_cap,
            grace_period,
            event_log_capacity,
            log_level,
            log_format,
        })
    }
}

fn env_var(key: &str) -> Result<String, std::env::VarError> {
    std::env::var(key)
}

fn parse_env_default<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "could not be parsed")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors (spec.md §7: configuration errors fail fast at
/// startup with exit code 1).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_parses_known_values() {
        assert_eq!(RestartPolicy::parse("never").unwrap(), RestartPolicy::Never);
        assert_eq!(
            RestartPolicy::parse("unless-stopped").unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert!(RestartPolicy::parse("whenever").is_err());
    }

    #[test]
    fn restart_policy_permits_restart_rules() {
        assert!(!RestartPolicy::Never.permits_restart(true));
        assert!(RestartPolicy::OnFailure.permits_restart(true));
        assert!(!RestartPolicy::OnFailure.permits_restart(false));
        assert!(RestartPolicy::Always.permits_restart(false));
    }
}
