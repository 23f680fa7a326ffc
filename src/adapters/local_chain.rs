//! Local Stage Chain
//!
//! Simulates the extract/transform/load half of a pipeline inside one
//! process. It grants process slots, writes a stage entry to the store as
//! each simulated stage finishes, and publishes termination records in
//! process order, which is the order the select consumer expects them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    Batch, BatchId, DispatchReceipt, NodeId, PipelineId, ProcessId, ProcessNodeData,
    ProcessStatus, Stage, StageEventData, StageTicket, TerminationRecord,
};
use crate::error::{ArbiterError, Result, StoreError};
use crate::select::{CompletionChannel, Dispatcher};
use crate::store::{CoordinationStore, CreateMode, StorePaths};

/// Configuration for [`LocalChain`]
#[derive(Debug, Clone)]
pub struct LocalChainConfig {
    /// Simulated duration of each downstream stage
    pub stage_latency_ms: u64,
    /// Process slots granted at once
    pub max_in_flight: usize,
    /// Fail every n-th dispatch, for exercising rollback
    pub fail_every: Option<u64>,
}

impl Default for LocalChainConfig {
    fn default() -> Self {
        Self {
            stage_latency_ms: 50,
            max_in_flight: 5,
            fail_every: None,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    batch_id: Option<BatchId>,
    first_time: Option<i64>,
    cancelled: bool,
    result: Option<TerminationRecord>,
    published: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    next_process: Option<u64>,
    slots: BTreeMap<ProcessId, Slot>,
    records: VecDeque<TerminationRecord>,
    dispatched: u64,
}

impl ChainState {
    /// Move finished results to the record queue, lowest process first
    fn publish_ready(&mut self) -> bool {
        let mut published = false;
        for slot in self.slots.values_mut() {
            if slot.published {
                continue;
            }
            match slot.result.clone() {
                Some(record) => {
                    self.records.push_back(record);
                    slot.published = true;
                    published = true;
                }
                None => break,
            }
        }
        published
    }
}

struct ChainShared {
    pipeline_id: PipelineId,
    node_id: NodeId,
    config: LocalChainConfig,
    store: Arc<dyn CoordinationStore>,
    state: Mutex<ChainState>,
    slot_freed: Notify,
    record_ready: Notify,
}

impl ChainShared {
    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, process_id: ProcessId) -> bool {
        self.lock()
            .slots
            .get(&process_id)
            .map_or(false, |slot| !slot.cancelled)
    }

    fn finish(&self, process_id: ProcessId, record: TerminationRecord) {
        let published = {
            let mut state = self.lock();
            match state.slots.get_mut(&process_id) {
                Some(slot) if slot.result.is_none() => slot.result = Some(record),
                _ => return,
            }
            state.publish_ready()
        };
        if published {
            self.record_ready.notify_waiters();
        }
    }

    async fn remove_processes(&self, process_ids: Vec<ProcessId>) {
        for process_id in process_ids {
            let path = StorePaths::process(self.pipeline_id, process_id);
            if let Err(e) = self.store.delete_recursive(&path).await {
                warn!("Failed to remove process {}: {}", process_id, e);
            }
        }
        self.slot_freed.notify_waiters();
    }

    async fn write_stage(&self, receipt: &DispatchReceipt, stage: Stage) -> Result<()> {
        let event = StageEventData {
            number: Some(receipt.number),
            size: Some(receipt.size),
            curr_node_id: Some(self.node_id),
            next_node_id: receipt.next_node_id,
            description: receipt.pipe_keys.clone(),
        };
        let path = StorePaths::stage(self.pipeline_id, receipt.process_id, stage);
        match self
            .store
            .create(&path, serde_json::to_vec(&event)?, CreateMode::Persistent)
            .await
        {
            Ok(()) | Err(StoreError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        if !self.is_live(receipt.process_id) {
            // Cancelled while writing; don't leave a ghost entry behind
            let process = StorePaths::process(self.pipeline_id, receipt.process_id);
            self.store.delete_recursive(&process).await?;
        }
        Ok(())
    }

    async fn run_loader(self: Arc<Self>, mut receipts: mpsc::UnboundedReceiver<DispatchReceipt>) {
        let latency = Duration::from_millis(self.config.stage_latency_ms);

        'receipts: while let Some(receipt) = receipts.recv().await {
            for stage in [Stage::Extract, Stage::Transform, Stage::Load] {
                tokio::time::sleep(latency).await;
                if !self.is_live(receipt.process_id) {
                    debug!("Process {} cancelled before {}", receipt.process_id, stage);
                    continue 'receipts;
                }
                if let Err(e) = self.write_stage(&receipt, stage).await {
                    warn!("Stage {} of process {} failed: {}", stage, receipt.process_id, e);
                    self.finish(
                        receipt.process_id,
                        TerminationRecord::exception(
                            self.pipeline_id,
                            Some(receipt.batch_id),
                            receipt.process_id,
                            format!("{} failed: {}", stage, e),
                        ),
                    );
                    continue 'receipts;
                }
            }

            let end_time = Utc::now().timestamp_millis();
            let record = TerminationRecord::normal(self.pipeline_id, receipt.batch_id, receipt.process_id)
                .with_times(receipt.first_time.unwrap_or(end_time), end_time);
            self.finish(receipt.process_id, record);
        }
    }
}

/// In-process dispatcher and completion channel for one pipeline
pub struct LocalChain {
    shared: Arc<ChainShared>,
    loader_tx: mpsc::UnboundedSender<DispatchReceipt>,
    loader: JoinHandle<()>,
}

impl LocalChain {
    /// Create the chain and spawn its loader task
    pub fn new(
        pipeline_id: PipelineId,
        node_id: NodeId,
        config: LocalChainConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let shared = Arc::new(ChainShared {
            pipeline_id,
            node_id,
            config,
            store,
            state: Mutex::new(ChainState::default()),
            slot_freed: Notify::new(),
            record_ready: Notify::new(),
        });
        let (loader_tx, loader_rx) = mpsc::unbounded_channel();
        let loader = tokio::spawn(Arc::clone(&shared).run_loader(loader_rx));
        Self {
            shared,
            loader_tx,
            loader,
        }
    }

    /// Process slots currently granted
    pub fn in_flight(&self) -> usize {
        self.shared.lock().slots.len()
    }

    /// Published records not yet acknowledged
    pub fn pending_records(&self) -> usize {
        self.shared.lock().records.len()
    }

    async fn first_process_id(&self) -> Result<u64> {
        let root = StorePaths::process_root(self.shared.pipeline_id);
        match self.shared.store.children(&root).await {
            Ok((_, stat)) => Ok(((stat.cversion + stat.num_children) / 2).max(0) as u64),
            Err(StoreError::NoNode(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_allocate(&self) -> Result<Option<ProcessId>> {
        let needs_seed = self.shared.lock().next_process.is_none();
        if needs_seed {
            let seed = self.first_process_id().await?;
            self.shared.lock().next_process.get_or_insert(seed);
        }

        let mut state = self.shared.lock();
        if state.slots.len() >= self.shared.config.max_in_flight {
            return Ok(None);
        }
        let Some(next) = state.next_process else {
            return Ok(None);
        };
        state.next_process = Some(next + 1);
        let process_id = ProcessId(next);
        state.slots.insert(process_id, Slot::default());
        Ok(Some(process_id))
    }

    /// Exception records for every other live process, replacing normal
    /// results not yet consumed
    fn fail_in_flight(&self, failed: ProcessId) {
        let mut state = self.shared.lock();
        let pipeline_id = self.shared.pipeline_id;
        let reason = format!("process {} failed upstream", failed);

        for (process_id, slot) in state.slots.iter_mut() {
            if *process_id == failed || slot.cancelled {
                continue;
            }
            slot.cancelled = true;
            if !slot.published {
                slot.result = Some(TerminationRecord::exception(
                    pipeline_id,
                    slot.batch_id,
                    *process_id,
                    reason.clone(),
                ));
            }
        }
        for record in state.records.iter_mut() {
            if record.outcome.is_normal() && record.process_id != failed {
                *record = TerminationRecord::exception(
                    pipeline_id,
                    record.batch_id,
                    record.process_id,
                    reason.clone(),
                );
            }
        }
    }
}

impl Drop for LocalChain {
    fn drop(&mut self) {
        self.loader.abort();
    }
}

#[async_trait]
impl Dispatcher for LocalChain {
    async fn await_process(&self) -> Result<StageTicket> {
        loop {
            let freed = self.shared.slot_freed.notified();
            if let Some(process_id) = self.try_allocate().await? {
                let node = ProcessNodeData {
                    status: ProcessStatus::Used,
                    node_id: Some(self.shared.node_id),
                };
                let path = StorePaths::process(self.shared.pipeline_id, process_id);
                if let Err(e) = self
                    .shared
                    .store
                    .create(&path, serde_json::to_vec(&node)?, CreateMode::Persistent)
                    .await
                {
                    self.shared.lock().slots.remove(&process_id);
                    return Err(e.into());
                }

                debug!("Granted process {}", process_id);
                return Ok(StageTicket {
                    process_id,
                    start_time: Utc::now().timestamp_millis(),
                    next_node_id: Some(self.shared.node_id),
                });
            }
            freed.await;
        }
    }

    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReceipt> {
        let process_id = batch
            .process_id
            .ok_or_else(|| ArbiterError::Dispatch(format!("batch {} is not bound", batch.batch_id)))?;

        let fail = {
            let mut state = self.shared.lock();
            state.dispatched += 1;
            let fail = self
                .shared
                .config
                .fail_every
                .map_or(false, |n| n > 0 && state.dispatched % n == 0);
            let slot = state.slots.get_mut(&process_id).ok_or_else(|| {
                ArbiterError::Dispatch(format!("process {} is no longer allocated", process_id))
            })?;
            slot.batch_id = Some(batch.batch_id);
            slot.first_time = batch.first_time();
            fail
        };
        if fail {
            return Err(ArbiterError::Dispatch(format!(
                "simulated failure dispatching batch {}",
                batch.batch_id
            )));
        }

        let size = batch
            .rows
            .iter()
            .map(|row| serde_json::to_vec(&row.columns).map_or(0, |bytes| bytes.len() as u64))
            .sum();
        Ok(DispatchReceipt {
            batch_id: batch.batch_id,
            process_id,
            number: batch.len() as u64,
            size,
            first_time: batch.first_time(),
            next_node_id: batch.origin.as_ref().and_then(|t| t.next_node_id),
            pipe_keys: vec![Uuid::new_v4().to_string()],
        })
    }

    async fn commit(&self, receipt: DispatchReceipt) -> Result<()> {
        if !self.shared.is_live(receipt.process_id) {
            debug!("Process {} no longer live, not committing", receipt.process_id);
            return Ok(());
        }
        self.shared.write_stage(&receipt, Stage::Select).await?;
        self.loader_tx
            .send(receipt)
            .map_err(|_| ArbiterError::Dispatch("loader stopped".into()))
    }
}

#[async_trait]
impl CompletionChannel for LocalChain {
    async fn await_next(&self) -> Result<TerminationRecord> {
        loop {
            let ready = self.shared.record_ready.notified();
            if let Some(record) = self.shared.lock().records.front().cloned() {
                return Ok(record);
            }
            ready.await;
        }
    }

    async fn acknowledge(&self, record: &TerminationRecord) -> Result<()> {
        {
            let mut state = self.shared.lock();
            match state.records.front() {
                Some(head) if head.process_id == record.process_id && head.batch_id == record.batch_id => {}
                _ => {
                    return Err(ArbiterError::Completion(format!(
                        "record for process {} is not at the head of the queue",
                        record.process_id
                    )))
                }
            }
            state.records.pop_front();
            state.slots.remove(&record.process_id);
        }

        if !record.outcome.is_normal() {
            self.fail_in_flight(record.process_id);
        }
        let published = self.shared.lock().publish_ready();
        if published {
            self.shared.record_ready.notify_waiters();
        }
        self.shared.remove_processes(vec![record.process_id]).await;
        Ok(())
    }

    async fn exhaust_pending(&self) -> Result<()> {
        let removed: Vec<ProcessId> = {
            let mut state = self.shared.lock();
            state.records.clear();
            let removed = state.slots.keys().copied().collect();
            state.slots.clear();
            removed
        };
        if !removed.is_empty() {
            info!("Exhausted {} in-flight processes", removed.len());
        }
        self.shared.remove_processes(removed).await;
        Ok(())
    }

    async fn signal_rollback(&self, process_id: Option<ProcessId>, reason: String) -> Result<()> {
        let pipeline_id = self.shared.pipeline_id;
        let (target, released) = {
            let mut state = self.shared.lock();
            let released: Vec<ProcessId> = match process_id {
                Some(_) => Vec::new(),
                None => {
                    let idle: Vec<ProcessId> = state
                        .slots
                        .iter()
                        .filter(|(_, slot)| slot.batch_id.is_none())
                        .map(|(id, _)| *id)
                        .collect();
                    for id in &idle {
                        state.slots.remove(id);
                    }
                    idle
                }
            };
            let target = process_id.or_else(|| {
                state
                    .slots
                    .iter()
                    .find(|(_, slot)| !slot.published)
                    .map(|(id, _)| *id)
            });
            (target, released)
        };
        self.shared.remove_processes(released).await;

        let Some(target) = target else {
            info!("Rollback signalled with nothing in flight: {}", reason);
            return Ok(());
        };

        warn!("Rollback signalled for process {}: {}", target, reason);
        let record = TerminationRecord::exception(pipeline_id, None, target, reason);
        {
            let mut guard = self.shared.lock();
            let state = &mut *guard;
            match state.slots.get_mut(&target) {
                Some(slot) if slot.published => {
                    slot.cancelled = true;
                    if let Some(queued) = state.records.iter_mut().find(|r| r.process_id == target) {
                        *queued = record;
                    }
                }
                Some(slot) => {
                    slot.cancelled = true;
                    slot.result = Some(record);
                    state.publish_ready();
                }
                // Slot already gone; the consumer may still wait on its descriptor
                None => state.records.push_back(record),
            }
        }
        self.shared.record_ready.notify_waiters();
        Ok(())
    }
}
