use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use super::state::{NodeStatus, PipelineStatus};
use crate::coordination::{Shutdown, ShutdownSignal};
use crate::domain::{NodeId, PipelineId};
use crate::election::{ElectionConfig, MainstemMonitor};
use crate::error::{ArbiterError, Result};
use crate::select::{SelectBindings, SelectConfig, SelectTask};
use crate::store::CoordinationStore;

struct PipelineContext {
    monitor: Arc<MainstemMonitor>,
    task: Arc<SelectTask>,
    shutdown: Arc<Shutdown>,
    handle: JoinHandle<Result<()>>,
}

/// One process competing for the mainstem of every pipeline it hosts
pub struct ArbiterNode {
    node_id: NodeId,
    election: ElectionConfig,
    select: SelectConfig,
    store: Arc<dyn CoordinationStore>,
    pipelines: DashMap<PipelineId, PipelineContext>,
    shutdown: Arc<Shutdown>,
    started_at: DateTime<Utc>,
}

impl ArbiterNode {
    pub fn new(
        node_id: NodeId,
        election: ElectionConfig,
        select: SelectConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            node_id,
            election,
            select,
            store,
            pipelines: DashMap::new(),
            shutdown: Arc::new(Shutdown::with_defaults()),
            started_at: Utc::now(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Node-wide shutdown coordinator, for signal handlers
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        let mut ids: Vec<_> = self.pipelines.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Enter the election for `pipeline_id` and select whenever it is won
    pub fn start_pipeline(&self, pipeline_id: PipelineId, bindings: SelectBindings) -> Result<()> {
        if self.shutdown.is_shutdown_requested() {
            return Err(ArbiterError::Validation(format!(
                "node {} is shutting down",
                self.node_id
            )));
        }

        match self.pipelines.entry(pipeline_id) {
            Entry::Occupied(_) => Err(ArbiterError::Validation(format!(
                "pipeline {} already started on node {}",
                pipeline_id, self.node_id
            ))),
            Entry::Vacant(slot) => {
                let monitor = Arc::new(MainstemMonitor::new(
                    pipeline_id,
                    self.node_id,
                    self.election.clone(),
                    self.store.clone(),
                ));
                monitor.start();

                let task = Arc::new(SelectTask::new(
                    self.select.clone(),
                    monitor.clone(),
                    bindings,
                ));
                let shutdown = Arc::new(Shutdown::with_defaults());
                let span = info_span!("pipeline", pipeline_id = %pipeline_id, node_id = %self.node_id);
                let handle = tokio::spawn(task.clone().run(shutdown.token()).instrument(span));

                slot.insert(PipelineContext {
                    monitor,
                    task,
                    shutdown,
                    handle,
                });
                info!(pipeline_id = %pipeline_id, node_id = %self.node_id, "Pipeline started");
                Ok(())
            }
        }
    }

    /// Stop the select task and release the lease. False if not hosted here.
    pub async fn stop_pipeline(&self, pipeline_id: PipelineId) -> Result<bool> {
        let Some((_, context)) = self.pipelines.remove(&pipeline_id) else {
            return Ok(false);
        };

        let PipelineContext {
            monitor,
            shutdown,
            handle,
            ..
        } = context;
        let abort = handle.abort_handle();

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        let result = shutdown
            .execute(join_task(pipeline_id, handle), stop_monitor(monitor))
            .await;
        abort.abort();

        result.map_err(|e| ArbiterError::Internal(e.to_string()))?;
        info!(pipeline_id = %pipeline_id, node_id = %self.node_id, "Pipeline stopped");
        Ok(true)
    }

    pub async fn status(&self) -> NodeStatus {
        let hosted: Vec<_> = self
            .pipelines
            .iter()
            .map(|e| {
                (
                    *e.key(),
                    e.monitor.clone(),
                    e.task.clone(),
                    e.handle.is_finished(),
                )
            })
            .collect();

        let mut pipelines = Vec::with_capacity(hosted.len());
        for (pipeline_id, monitor, task, finished) in hosted {
            pipelines.push(PipelineStatus {
                pipeline_id,
                active: monitor.is_active(),
                lease_owner: monitor.current_lease().await.map(|l| l.owner_node_id),
                select: task.snapshot().await,
                finished,
            });
        }
        pipelines.sort_by_key(|p| p.pipeline_id);

        NodeStatus {
            node_id: self.node_id,
            started_at: self.started_at,
            pipelines,
        }
    }

    /// Block until shutdown is requested, then shut down
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let signal = self.shutdown.token().cancelled().await;
        info!(node_id = %self.node_id, "Shutdown signal received: {}", signal);
        self.shutdown().await
    }

    /// Stop every pipeline, then release every lease
    pub async fn shutdown(&self) -> Result<()> {
        if !self.shutdown.is_shutdown_requested() {
            self.shutdown.request_shutdown(ShutdownSignal::Graceful);
        }

        let ids = self.pipeline_ids();
        let mut tasks = Vec::with_capacity(ids.len());
        let mut monitors = Vec::with_capacity(ids.len());
        let mut aborts = Vec::with_capacity(ids.len());
        for pipeline_id in ids {
            if let Some((_, context)) = self.pipelines.remove(&pipeline_id) {
                context.shutdown.request_shutdown(ShutdownSignal::Graceful);
                aborts.push(context.handle.abort_handle());
                tasks.push(join_task(pipeline_id, context.handle));
                monitors.push(stop_monitor(context.monitor));
            }
        }

        let result = self
            .shutdown
            .execute(
                async {
                    join_all(tasks).await;
                },
                async {
                    join_all(monitors).await;
                },
            )
            .await;
        for abort in aborts {
            abort.abort();
        }

        result.map_err(|e| ArbiterError::Internal(e.to_string()))?;
        info!(node_id = %self.node_id, "Node shut down");
        Ok(())
    }
}

async fn join_task(pipeline_id: PipelineId, handle: JoinHandle<Result<()>>) {
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(pipeline_id = %pipeline_id, "Select task ended with error: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(pipeline_id = %pipeline_id, "Select task panicked: {}", e),
    }
}

async fn stop_monitor(monitor: Arc<MainstemMonitor>) {
    if let Err(e) = monitor.stop().await {
        warn!(pipeline_id = %monitor.pipeline_id(), "Failed to stop monitor: {}", e);
    }
}
