use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the select producer/consumer pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Hand-off buffer capacity (default: 50)
    pub channel_capacity: usize,
    /// Completion records awaited before a mismatch is fatal (default: 30)
    pub match_retries: u32,
    /// Pause between mismatched completion reads (default: 1000ms)
    pub match_retry_interval_ms: u64,
    /// Producer restart backoff after a failure (default: 10s)
    pub select_backoff_secs: u64,
    /// Consumer restart backoff after a failure (default: 30s)
    pub termin_backoff_secs: u64,
    /// Pause before refetching when a rollback raced a process grant (default: 10s)
    pub rollback_pause_secs: u64,
    /// Lease check interval of the select task (default: 5s)
    pub health_check_secs: u64,
    /// Minimum spacing of idle delay resets (default: 60s)
    pub delay_reset_interval_secs: u64,
    /// Re-check the lease before every fetch and every matched completion
    pub verify_lease_per_batch: bool,
}

impl Default for SelectConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 50,
            match_retries: 30,
            match_retry_interval_ms: 1000,
            select_backoff_secs: 10,
            termin_backoff_secs: 30,
            rollback_pause_secs: 10,
            health_check_secs: 5,
            delay_reset_interval_secs: 60,
            verify_lease_per_batch: false,
        }
    }
}

impl SelectConfig {
    pub fn match_retry_interval(&self) -> Duration {
        Duration::from_millis(self.match_retry_interval_ms)
    }

    pub fn select_backoff(&self) -> Duration {
        Duration::from_secs(self.select_backoff_secs)
    }

    pub fn termin_backoff(&self) -> Duration {
        Duration::from_secs(self.termin_backoff_secs)
    }

    pub fn rollback_pause(&self) -> Duration {
        Duration::from_secs(self.rollback_pause_secs)
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn delay_reset_interval(&self) -> Duration {
        Duration::from_secs(self.delay_reset_interval_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.channel_capacity == 0 {
            errors.push("select.channel_capacity must be > 0".to_string());
        }
        if self.match_retries == 0 {
            errors.push("select.match_retries must be > 0".to_string());
        }
        if self.health_check_secs == 0 {
            errors.push("select.health_check_secs must be > 0".to_string());
        }
        errors
    }
}
