//! Runtime configuration.
//!
//! Defaults cover every field; `ERPBRIDGE_*` environment variables override them.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use erpbridge_core::{ConnectorConfig, ResolutionStrategy};

use crate::exec::{RateLimiter, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub retry: RetryPolicy,
    pub rate_limit_per_minute: u32,
    pub cache_ttl: Duration,
    /// Quiet period before a change-triggered re-sync runs.
    pub resync_debounce: Duration,
    /// Per-subscriber queue length of the orchestrator event bus.
    pub event_bus_capacity: usize,
    pub batch_size: usize,
    /// Strategy used when no connection configures one for an entity kind.
    pub default_resolution: ResolutionStrategy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit_per_minute: 60,
            cache_ttl: Duration::from_secs(5 * 60),
            resync_debounce: Duration::from_secs(5),
            event_bus_capacity: 1024,
            batch_size: 100,
            default_resolution: ResolutionStrategy::LastWriteWins,
        }
    }
}

impl BridgeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse_var::<u32, _>(&lookup, "ERPBRIDGE_MAX_RETRIES")? {
            cfg.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ERPBRIDGE_RETRY_INITIAL_MS")? {
            cfg.retry.initial_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<f64, _>(&lookup, "ERPBRIDGE_RETRY_MULTIPLIER")? {
            anyhow::ensure!(v.is_finite() && v >= 1.0, "ERPBRIDGE_RETRY_MULTIPLIER must be >= 1.0, got {v}");
            cfg.retry.backoff_multiplier = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, "ERPBRIDGE_RATE_LIMIT_PER_MINUTE")? {
            anyhow::ensure!(v > 0, "ERPBRIDGE_RATE_LIMIT_PER_MINUTE must be positive");
            cfg.rate_limit_per_minute = v;
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ERPBRIDGE_CACHE_TTL_SECS")? {
            cfg.cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64, _>(&lookup, "ERPBRIDGE_RESYNC_DEBOUNCE_MS")? {
            cfg.resync_debounce = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "ERPBRIDGE_EVENT_BUS_CAPACITY")? {
            cfg.event_bus_capacity = v.max(1);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, "ERPBRIDGE_BATCH_SIZE")? {
            cfg.batch_size = v.max(1);
        }
        if let Some(v) = lookup("ERPBRIDGE_CONFLICT_RESOLUTION") {
            cfg.default_resolution = ResolutionStrategy::from_str(v.trim())
                .context("invalid ERPBRIDGE_CONFLICT_RESOLUTION")?;
        }

        Ok(cfg)
    }

    /// Retry policy for one connection; `error_retry_limit` overrides `max_retries`.
    pub fn retry_policy_for(&self, connector: &ConnectorConfig) -> RetryPolicy {
        let mut policy = self.retry.clone();
        if let Some(limit) = connector.error_retry_limit {
            policy.max_retries = limit;
        }
        policy
    }

    /// Rate limiter for one connection; `rate_limit_per_minute` overrides the default.
    pub fn rate_limit_for(&self, connector: &ConnectorConfig) -> RateLimiter {
        RateLimiter::per_minute(
            connector
                .rate_limit_per_minute
                .unwrap_or(self.rate_limit_per_minute),
        )
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}: {raw:?}")),
    }
}
