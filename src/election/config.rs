use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing of the mainstem election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Wait before re-electing after an orderly release (default: 5s)
    pub settle_delay_secs: u64,
    /// Periodic re-election attempt healing missed notifications (default: 300s)
    pub reload_interval_secs: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            settle_delay_secs: 5,
            reload_interval_secs: 300,
        }
    }
}

impl ElectionConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.reload_interval_secs == 0 {
            errors.push("election.reload_interval_secs must be > 0".to_string());
        }
        errors
    }
}
