use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "arbiter")]
#[command(version = "0.1.0")]
#[command(about = "Mainstem election and batch arbitration for sync pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus the ARBITER_ENV file)
    #[arg(short, long, default_value = "config", env = "ARBITER_CONFIG_DIR")]
    pub config_dir: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a local cluster: simulated nodes competing for every pipeline
    Run {
        /// Number of nodes (overrides local.nodes)
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Fail every n-th dispatch to exercise rollback
        #[arg(long)]
        fail_every: Option<u64>,

        /// Stop after this many seconds instead of waiting for a signal
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Stop the current mainstem holder after this many seconds
        #[arg(long)]
        failover_after_secs: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}
