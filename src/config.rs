use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::adapters::{LocalChainConfig, MemorySourceConfig};
use crate::domain::{NodeId, PipelineId};
use crate::election::ElectionConfig;
use crate::select::SelectConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub election: ElectionConfig,
    #[serde(default)]
    pub select: SelectConfig,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity written into leases this node takes
    pub id: u64,
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        NodeId(self.id)
    }
}

/// One pipeline hosted by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: u64,
    /// Source destination name, used for cursor paths
    pub destination: String,
    #[serde(default = "default_client_id")]
    pub client_id: u16,
    /// Maximum rows per selected batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wait for new rows before an empty batch is returned
    #[serde(default = "default_source_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_client_id() -> u16 {
    1001
}

fn default_batch_size() -> usize {
    100
}

fn default_source_poll_ms() -> u64 {
    1000
}

impl PipelineConfig {
    pub fn pipeline_id(&self) -> PipelineId {
        PipelineId(self.id)
    }

    pub fn source_config(&self) -> MemorySourceConfig {
        MemorySourceConfig {
            destination: self.destination.clone(),
            client_id: self.client_id,
            batch_size: self.batch_size,
            poll_interval_ms: self.poll_interval_ms,
        }
    }
}

/// Local run mode: simulated cluster, change generator and stage chain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Nodes competing for every pipeline (default: 2)
    pub nodes: usize,
    /// Simulated duration of each downstream stage (default: 50ms)
    pub stage_latency_ms: u64,
    /// Interval between generated change ticks (default: 200ms)
    pub ingest_interval_ms: u64,
    /// Rows generated per tick (default: 20)
    pub rows_per_tick: usize,
    /// Fail every n-th dispatch
    pub fail_every: Option<u64>,
    /// Process slots granted at once (default: 5)
    pub max_in_flight: usize,
    /// Interval of the progress log line (default: 10s)
    pub progress_interval_secs: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            nodes: 2,
            stage_latency_ms: 50,
            ingest_interval_ms: 200,
            rows_per_tick: 20,
            fail_every: None,
            max_in_flight: 5,
            progress_interval_secs: 10,
        }
    }
}

impl LocalConfig {
    pub fn chain_config(&self) -> LocalChainConfig {
        LocalChainConfig {
            stage_latency_ms: self.stage_latency_ms,
            max_in_flight: self.max_in_flight,
            fail_every: self.fail_every,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("node.id", 1)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("select.channel_capacity", 50)?
            .set_default("election.settle_delay_secs", 5)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("ARBITER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (ARBITER_NODE__ID, etc.)
            .add_source(
                Environment::with_prefix("ARBITER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Single-pipeline configuration used when no files are present
    pub fn default_config(node_id: u64) -> Self {
        Self {
            node: NodeConfig { id: node_id },
            election: ElectionConfig::default(),
            select: SelectConfig::default(),
            pipelines: vec![PipelineConfig {
                id: 1,
                destination: "local".to_string(),
                client_id: default_client_id(),
                batch_size: default_batch_size(),
                poll_interval_ms: default_source_poll_ms(),
            }],
            local: LocalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.id == 0 {
            errors.push("node.id must be non-zero".to_string());
        }

        errors.extend(self.election.validate());
        errors.extend(self.select.validate());

        if self.pipelines.is_empty() {
            errors.push("at least one pipeline must be configured".to_string());
        }

        let mut seen = HashSet::new();
        for pipeline in &self.pipelines {
            if !seen.insert(pipeline.id) {
                errors.push(format!("pipeline {} is configured twice", pipeline.id));
            }
            if pipeline.batch_size == 0 {
                errors.push(format!("pipeline {}: batch_size must be > 0", pipeline.id));
            }
            if pipeline.destination.is_empty() || pipeline.destination.contains('/') {
                errors.push(format!(
                    "pipeline {}: destination must be a non-empty name without '/'",
                    pipeline.id
                ));
            }
        }

        if self.local.nodes == 0 {
            errors.push("local.nodes must be > 0".to_string());
        }
        if self.local.max_in_flight == 0 {
            errors.push("local.max_in_flight must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config(1);
        assert!(config.validate().is_ok());
        assert_eq!(config.select.channel_capacity, 50);
        assert_eq!(config.select.match_retries, 30);
        assert_eq!(config.election.reload_interval_secs, 300);
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default_config(0);
        config.pipelines.push(config.pipelines[0].clone());
        config.select.channel_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("configured twice")));
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent-config-dir").unwrap();
        assert_eq!(config.select.termin_backoff_secs, 30);
        assert_eq!(config.logging.level, "info");
        assert!(config.pipelines.is_empty());
    }
}
