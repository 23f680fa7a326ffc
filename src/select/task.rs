//! Select Task
//!
//! Outer loop of one pipeline on one node: wait for the mainstem, run a
//! fresh orchestrator while the lease holds, tear it down when the lease is
//! lost, and go back to waiting.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use super::config::SelectConfig;
use super::orchestrator::{SelectBindings, SelectOrchestrator};
use crate::coordination::ShutdownToken;
use crate::domain::PipelineId;
use crate::election::MainstemMonitor;
use crate::error::Result;

/// Snapshot of the running orchestrator, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SelectSnapshot {
    pub running: bool,
    pub epoch: u64,
    pub gate_open: bool,
    pub pending: usize,
}

pub struct SelectTask {
    pipeline_id: PipelineId,
    config: SelectConfig,
    monitor: Arc<MainstemMonitor>,
    bindings: SelectBindings,
    current: RwLock<Option<Arc<SelectOrchestrator>>>,
}

impl SelectTask {
    pub fn new(
        config: SelectConfig,
        monitor: Arc<MainstemMonitor>,
        bindings: SelectBindings,
    ) -> Self {
        Self {
            pipeline_id: monitor.pipeline_id(),
            config,
            monitor,
            bindings,
            current: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Option<SelectSnapshot> {
        self.current.read().await.as_ref().map(|o| SelectSnapshot {
            running: o.is_running(),
            epoch: o.epoch(),
            gate_open: o.gate_open(),
            pending: o.pending(),
        })
    }

    /// Run until shutdown, then release the lease
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) -> Result<()> {
        info!(pipeline_id = %self.pipeline_id, "Select task started");

        'outer: loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'outer,
                elected = self.monitor.wait_for_active() => {
                    if let Err(e) = elected {
                        warn!("Waiting for mainstem failed: {}", e);
                        if self.pause(&mut shutdown).await {
                            break 'outer;
                        }
                        continue;
                    }
                }
            }

            if let Err(e) = self.startup().await {
                if e.should_stop() {
                    self.stopup().await;
                    continue;
                }
                error!("Select task startup failed: {}", e);
                self.stopup().await;
                if let Err(e) = self
                    .bindings
                    .completions
                    .signal_rollback(None, e.to_string())
                    .await
                {
                    warn!("Failed to signal rollback: {}", e);
                }
                if self.pause(&mut shutdown).await {
                    break 'outer;
                }
                continue;
            }

            let mut health = interval(self.config.health_check());
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            health.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'outer,
                    _ = health.tick() => {
                        if !self.monitor.check().await {
                            warn!("Mainstem no longer held by this node, stopping");
                            self.stopup().await;
                            break;
                        }
                        if !self.orchestrator_running().await {
                            warn!("Select loops stopped on their own, restarting");
                            self.stopup().await;
                            break;
                        }
                    }
                }
            }
        }

        self.stopup().await;
        self.monitor.release().await?;
        info!(pipeline_id = %self.pipeline_id, "Select task stopped");
        Ok(())
    }

    async fn startup(&self) -> Result<()> {
        self.bindings.source.start().await?;

        let mut orchestrator =
            SelectOrchestrator::new(self.pipeline_id, self.config.clone(), self.bindings.clone());
        if self.config.verify_lease_per_batch {
            orchestrator = orchestrator.with_lease_check(self.monitor.clone());
        }
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start();
        *self.current.write().await = Some(orchestrator);

        if !self.monitor.promote().await? {
            return Err(crate::error::ArbiterError::NotMainstem {
                pipeline_id: self.pipeline_id,
                node_id: self.monitor.node_id(),
            });
        }
        info!(pipeline_id = %self.pipeline_id, "Pipeline is now selecting on this node");
        Ok(())
    }

    async fn stopup(&self) {
        let orchestrator = self.current.write().await.take();
        if let Some(orchestrator) = orchestrator {
            orchestrator.stop().await;
        }
        if let Err(e) = self.bindings.source.stop().await {
            warn!("Failed to stop batch source: {}", e);
        }
    }

    async fn orchestrator_running(&self) -> bool {
        self.current
            .read()
            .await
            .as_ref()
            .map_or(false, |o| o.is_running())
    }

    /// Back off before retrying; true when shutdown arrived meanwhile
    async fn pause(&self, shutdown: &mut ShutdownToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = sleep(self.config.select_backoff()) => false,
        }
    }
}
