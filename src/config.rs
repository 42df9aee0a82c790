//! Hub configuration module
//! Handles the runtime parameters of the notification hub and its WebSocket listener

use crate::constants::{
    DEFAULT_DELIVERY_TIMEOUT_MS, DEFAULT_EVICTION_THRESHOLD, DEFAULT_HOST,
    DEFAULT_MAX_CONCURRENT_DELIVERIES, DEFAULT_OUTBOUND_QUEUE_SIZE, DEFAULT_PORT,
};
use crate::error::{HubError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Hub configuration parameters
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// Consecutive delivery failures after which a connection is evicted
    pub eviction_threshold: u32,
    /// Upper bound on a single delivery attempt
    pub delivery_timeout: Duration,
    /// Capacity of each connection's outbound FIFO queue
    pub outbound_queue_size: usize,
    /// Maximum number of delivery attempts in flight across the whole hub
    pub max_concurrent_deliveries: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            eviction_threshold: DEFAULT_EVICTION_THRESHOLD,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            max_concurrent_deliveries: DEFAULT_MAX_CONCURRENT_DELIVERIES,
        }
    }
}

impl HubConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Missing keys fall back to defaults; present but unparsable keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("NOTIFY_HUB_HOST").unwrap_or(DEFAULT_HOST.to_string());
        let port = parse_var(&lookup, "NOTIFY_HUB_PORT", DEFAULT_PORT)?;

        let eviction_threshold = parse_var(
            &lookup,
            "NOTIFY_HUB_EVICTION_THRESHOLD",
            DEFAULT_EVICTION_THRESHOLD,
        )?;

        let timeout_ms = parse_var(
            &lookup,
            "NOTIFY_HUB_DELIVERY_TIMEOUT_MS",
            DEFAULT_DELIVERY_TIMEOUT_MS,
        )?;

        let outbound_queue_size = parse_var(
            &lookup,
            "NOTIFY_HUB_OUTBOUND_QUEUE_SIZE",
            DEFAULT_OUTBOUND_QUEUE_SIZE,
        )?;

        let max_concurrent_deliveries = parse_var(
            &lookup,
            "NOTIFY_HUB_MAX_CONCURRENT_DELIVERIES",
            DEFAULT_MAX_CONCURRENT_DELIVERIES,
        )?;

        let config = Self {
            host,
            port,
            eviction_threshold,
            delivery_timeout: Duration::from_millis(timeout_ms),
            outbound_queue_size,
            max_concurrent_deliveries,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the hub cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.eviction_threshold < 1 {
            return Err(HubError::ConfigError(
                "eviction threshold must be at least 1".to_string(),
            ));
        }
        if self.delivery_timeout.is_zero() {
            return Err(HubError::ConfigError(
                "delivery timeout must be greater than zero".to_string(),
            ));
        }
        if self.outbound_queue_size == 0 {
            return Err(HubError::ConfigError(
                "outbound queue size must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(HubError::ConfigError(
                "max concurrent deliveries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_eviction_threshold(mut self, threshold: u32) -> Self {
        self.eviction_threshold = threshold;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_outbound_queue_size(mut self, size: usize) -> Self {
        self.outbound_queue_size = size;
        self
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            HubError::ConfigError(format!("{} has an invalid value: {}", key, raw))
        }),
        None => Ok(default),
    }
}
