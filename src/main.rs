use std::sync::Arc;

use anyhow::{bail, Context};
use arbiter::adapters::{MemoryBatchSource, MemoryStore};
use arbiter::cli::{Cli, Commands};
use arbiter::config::{AppConfig, PipelineConfig};
use arbiter::coordination::{install_signal_handlers, Shutdown, ShutdownSignal};
use arbiter::domain::{ChangeKind, ChangeRow, NodeId};
use arbiter::logging::{init_logging, init_logging_simple};
use arbiter::node::{local_bindings, ArbiterNode};
use arbiter::view::ProgressView;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config) => {
            init_logging_simple();
            let config = load_config(&cli.config_dir)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Some(Commands::Run {
            nodes,
            fail_every,
            duration_secs,
            failover_after_secs,
        }) => {
            let mut config = load_config(&cli.config_dir)?;
            if let Some(nodes) = nodes {
                config.local.nodes = nodes;
            }
            if fail_every.is_some() {
                config.local.fail_every = fail_every;
            }
            init_logging(&config.logging);
            run_local(config, duration_secs, failover_after_secs).await?;
        }
        None => {
            let config = load_config(&cli.config_dir)?;
            init_logging(&config.logging);
            run_local(config, None, None).await?;
        }
    }

    Ok(())
}

fn load_config(dir: &str) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load_from(dir).context("failed to load configuration")?;
    if config.pipelines.is_empty() {
        config.pipelines = AppConfig::default_config(config.node.id).pipelines;
    }
    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    Ok(config)
}

async fn run_local(
    config: AppConfig,
    duration_secs: Option<u64>,
    failover_after_secs: Option<u64>,
) -> anyhow::Result<()> {
    info!(
        nodes = config.local.nodes,
        pipelines = config.pipelines.len(),
        "Starting local cluster"
    );

    let store = MemoryStore::new();
    let shutdown = Arc::new(Shutdown::with_defaults());
    install_signal_handlers(shutdown.clone());

    let mut nodes = Vec::with_capacity(config.local.nodes);
    let mut sources: Vec<(PipelineConfig, Vec<Arc<MemoryBatchSource>>)> = config
        .pipelines
        .iter()
        .map(|p| (p.clone(), Vec::new()))
        .collect();

    for i in 0..config.local.nodes {
        let node_id = NodeId(config.node.id + i as u64);
        let node = ArbiterNode::new(
            node_id,
            config.election.clone(),
            config.select.clone(),
            Arc::new(store.session()),
        );
        for (pipeline, pipeline_sources) in sources.iter_mut() {
            let local = local_bindings(pipeline, &config.local, node_id, Arc::new(store.session()));
            node.start_pipeline(pipeline.pipeline_id(), local.bindings())?;
            pipeline_sources.push(local.source.clone());
        }
        nodes.push(Arc::new(node));
    }

    let generator = spawn_generator(&config, sources.clone());
    let progress = spawn_progress(&config, Arc::new(store.session()));

    if let Some(secs) = failover_after_secs {
        let nodes = nodes.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            for node in &nodes {
                let status = node.status().await;
                for pipeline in status.pipelines.iter().filter(|p| p.active) {
                    info!(
                        node_id = %node.node_id(),
                        pipeline_id = %pipeline.pipeline_id,
                        "Stopping mainstem holder to force failover"
                    );
                    if let Err(e) = node.stop_pipeline(pipeline.pipeline_id).await {
                        warn!("Failover stop failed: {}", e);
                    }
                }
            }
        });
    }

    if let Some(secs) = duration_secs {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        });
    }

    let signal = shutdown.token().cancelled().await;
    info!("Shutting down local cluster ({})", signal);

    generator.abort();
    progress.abort();
    for node in &nodes {
        if let Err(e) = node.shutdown().await {
            warn!(node_id = %node.node_id(), "Node shutdown failed: {}", e);
        }
    }

    for (pipeline, pipeline_sources) in &sources {
        let committed = pipeline_sources
            .iter()
            .map(|s| s.committed_position())
            .max()
            .unwrap_or(0);
        info!(
            pipeline_id = pipeline.id,
            committed, "Final committed position"
        );
    }
    Ok(())
}

/// Append the same generated rows to every node's copy of a source log
fn spawn_generator(
    config: &AppConfig,
    sources: Vec<(PipelineConfig, Vec<Arc<MemoryBatchSource>>)>,
) -> JoinHandle<()> {
    let rows_per_tick = config.local.rows_per_tick;
    let mut ticker = interval(Duration::from_millis(config.local.ingest_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        let mut sequence: u64 = 0;
        loop {
            ticker.tick().await;
            for (pipeline, pipeline_sources) in &sources {
                let rows: Vec<ChangeRow> = (0..rows_per_tick)
                    .map(|i| {
                        sequence += 1;
                        generate_row(&pipeline.destination, sequence, i)
                    })
                    .collect();
                for source in pipeline_sources {
                    source.append(rows.clone());
                }
            }
        }
    })
}

fn generate_row(table: &str, sequence: u64, i: usize) -> ChangeRow {
    let kind = match i % 3 {
        0 => ChangeKind::Insert,
        1 => ChangeKind::Update,
        _ => ChangeKind::Delete,
    };
    let mut columns = serde_json::Map::new();
    columns.insert("id".to_string(), serde_json::json!(sequence));
    ChangeRow {
        schema: "arbiter".to_string(),
        table: table.to_string(),
        kind,
        execute_time: chrono::Utc::now().timestamp_millis(),
        columns,
    }
}

/// Periodically log lease holder, in-flight processes and source cursor
fn spawn_progress(
    config: &AppConfig,
    store: Arc<dyn arbiter::store::CoordinationStore>,
) -> JoinHandle<()> {
    let pipelines = config.pipelines.clone();
    let mut ticker = interval(Duration::from_secs(config.local.progress_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let view = ProgressView::new(store);

    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            for pipeline in &pipelines {
                let pipeline_id = pipeline.pipeline_id();
                let owner = match view.mainstem(pipeline_id).await {
                    Ok(lease) => lease.map(|l| l.owner_node_id.to_string()),
                    Err(e) => {
                        warn!(pipeline_id = %pipeline_id, "Failed to read mainstem: {}", e);
                        continue;
                    }
                };
                let in_flight = view
                    .list_processes(pipeline_id)
                    .await
                    .map(|p| p.len())
                    .unwrap_or_default();
                let cursor = view
                    .source_cursor(&pipeline.destination, pipeline.client_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|c| c.position);
                info!(
                    pipeline_id = %pipeline_id,
                    owner = owner.as_deref().unwrap_or("none"),
                    in_flight,
                    cursor = cursor.as_deref().unwrap_or("none"),
                    "Pipeline progress"
                );
            }
        }
    })
}
