//! Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heartbeat scanning and reclaim policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// How often the monitor scans for stale entities.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Silence after which an entity is parked as unavailable.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// How long an unavailable entity is retained before release.
    #[serde(default = "default_reclaim_window_secs")]
    pub reclaim_window_secs: u64,
}

fn default_scan_interval_secs() -> u64 {
    5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_reclaim_window_secs() -> u64 {
    15 * 60
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            timeout_secs: default_timeout_secs(),
            reclaim_window_secs: default_reclaim_window_secs(),
        }
    }
}

impl HeartbeatConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_secs * 1000
    }

    pub fn reclaim_window_ms(&self) -> u64 {
        self.reclaim_window_secs * 1000
    }
}

/// Placement retry and wait policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pending requests older than this fail with a wait-exceeded result.
    #[serde(default = "default_wait_threshold_secs")]
    pub wait_threshold_secs: u64,
    /// Lifetime of an unconsumed reservation token.
    #[serde(default = "default_reservation_ttl_ms")]
    pub reservation_ttl_ms: u64,
    /// Delay before a requeued request is evaluated again.
    #[serde(default = "default_requeue_delay_ms")]
    pub requeue_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_wait_threshold_secs() -> u64 {
    20
}

fn default_reservation_ttl_ms() -> u64 {
    30_000
}

fn default_requeue_delay_ms() -> u64 {
    500
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            wait_threshold_secs: default_wait_threshold_secs(),
            reservation_ttl_ms: default_reservation_ttl_ms(),
            requeue_delay_ms: default_requeue_delay_ms(),
        }
    }
}

impl RouteConfig {
    pub fn wait_threshold(&self) -> Duration {
        Duration::from_secs(self.wait_threshold_secs)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

/// Top-level registry service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Sender tag on published messages; also used for self-filtering.
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub route: RouteConfig,
    /// Bound on concurrently dispatched inbound messages.
    #[serde(default = "default_worker_permits")]
    pub worker_permits: usize,
}

fn default_identity() -> String {
    "fulcrum-registry".to_string()
}

fn default_worker_permits() -> usize {
    32
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            heartbeat: HeartbeatConfig::default(),
            route: RouteConfig::default(),
            worker_permits: default_worker_permits(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.identity.is_empty() {
            return Err("identity must not be empty".to_string());
        }
        if self.worker_permits == 0 {
            return Err("worker_permits must be greater than 0".to_string());
        }
        if self.heartbeat.scan_interval_secs == 0 {
            return Err("heartbeat scan interval must be greater than 0".to_string());
        }
        if self.heartbeat.timeout_secs < self.heartbeat.scan_interval_secs {
            return Err("heartbeat timeout must be at least the scan interval".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RegistryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_timeout_below_scan_interval() {
        let mut config = RegistryConfig::default();
        config.heartbeat.timeout_secs = 1;
        config.heartbeat.scan_interval_secs = 5;
        assert!(config.validate().is_err());
    }
}
