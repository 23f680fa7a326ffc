//! Shared fakes for integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arbiter::adapters::{MemoryBatchSource, MemorySourceConfig, MemoryStore};
use arbiter::domain::{
    Batch, BatchId, ChangeKind, ChangeRow, DispatchReceipt, PipelineId, ProcessId, StageTicket,
    TerminationRecord,
};
use arbiter::error::Result;
use arbiter::select::{
    BatchSource, CompletionChannel, DelayReport, Dispatcher, SelectBindings, StatisticsSink,
};
use async_trait::async_trait;
use tokio::sync::Notify;

pub const PIPELINE: PipelineId = PipelineId(7);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

pub fn rows(count: usize) -> Vec<ChangeRow> {
    (0..count)
        .map(|i| {
            let mut columns = serde_json::Map::new();
            columns.insert("id".into(), serde_json::json!(i));
            ChangeRow {
                schema: "shop".into(),
                table: "orders".into(),
                kind: ChangeKind::Insert,
                execute_time: chrono::Utc::now().timestamp_millis(),
                columns,
            }
        })
        .collect()
}

pub fn source(store: &Arc<MemoryStore>, batch_size: usize) -> Arc<MemoryBatchSource> {
    Arc::new(MemoryBatchSource::new(
        MemorySourceConfig {
            destination: "orders".into(),
            client_id: 1001,
            batch_size,
            poll_interval_ms: 1000,
        },
        Arc::new(store.session()),
    ))
}

/// Memory source that counts the rollbacks it receives
pub struct CountingSource {
    inner: Arc<MemoryBatchSource>,
    rollbacks: AtomicUsize,
}

impl CountingSource {
    pub fn new(inner: Arc<MemoryBatchSource>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rollbacks: AtomicUsize::new(0),
        })
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSource for CountingSource {
    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop().await
    }

    async fn fetch_next(&self) -> Result<Batch> {
        self.inner.fetch_next().await
    }

    async fn acknowledge(&self, batch_id: BatchId) -> Result<()> {
        self.inner.acknowledge(batch_id).await
    }

    async fn rollback(&self, batch_id: Option<BatchId>) -> Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback(batch_id).await
    }

    async fn discard_uncommitted(&self) -> Result<()> {
        self.inner.discard_uncommitted().await
    }

    fn last_entry_time(&self) -> Option<i64> {
        self.inner.last_entry_time()
    }
}

#[derive(Default)]
struct ChainState {
    next_process: u64,
    dispatches: u64,
    dispatched: Vec<(BatchId, ProcessId)>,
    committed: Vec<BatchId>,
    records: BTreeMap<ProcessId, TerminationRecord>,
    awaits: usize,
    acknowledged: Vec<TerminationRecord>,
    exhausts: usize,
    signals: Vec<Option<ProcessId>>,
}

/// Dispatcher and completion channel in one: a committed batch turns into a
/// termination record right away, unless `manual` is set.
pub struct FakeChain {
    manual: bool,
    fail_dispatches: HashSet<u64>,
    state: Mutex<ChainState>,
    record_ready: Notify,
}

impl FakeChain {
    /// Completes every batch normally except the listed dispatch ordinals
    pub fn auto(fail_dispatches: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            manual: false,
            fail_dispatches: fail_dispatches.iter().copied().collect(),
            state: Mutex::new(ChainState {
                next_process: 1,
                ..Default::default()
            }),
            record_ready: Notify::new(),
        })
    }

    /// Never produces records on its own; tests inject them
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            manual: true,
            fail_dispatches: HashSet::new(),
            state: Mutex::new(ChainState {
                next_process: 1,
                ..Default::default()
            }),
            record_ready: Notify::new(),
        })
    }

    pub fn inject(&self, record: TerminationRecord) {
        lock(&self.state).records.insert(record.process_id, record);
        self.record_ready.notify_waiters();
    }

    pub fn dispatched(&self) -> Vec<(BatchId, ProcessId)> {
        lock(&self.state).dispatched.clone()
    }

    pub fn committed(&self) -> Vec<BatchId> {
        lock(&self.state).committed.clone()
    }

    pub fn awaits(&self) -> usize {
        lock(&self.state).awaits
    }

    pub fn acknowledged(&self) -> Vec<TerminationRecord> {
        lock(&self.state).acknowledged.clone()
    }

    pub fn exhausts(&self) -> usize {
        lock(&self.state).exhausts
    }

    pub fn signals(&self) -> Vec<Option<ProcessId>> {
        lock(&self.state).signals.clone()
    }
}

#[async_trait]
impl Dispatcher for FakeChain {
    async fn await_process(&self) -> Result<StageTicket> {
        let mut state = lock(&self.state);
        let process_id = ProcessId(state.next_process);
        state.next_process += 1;
        Ok(StageTicket {
            process_id,
            start_time: chrono::Utc::now().timestamp_millis(),
            next_node_id: None,
        })
    }

    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReceipt> {
        let process_id = batch.process_id.unwrap_or(ProcessId(0));
        let mut state = lock(&self.state);
        state.dispatches += 1;
        state.dispatched.push((batch.batch_id, process_id));
        Ok(DispatchReceipt {
            batch_id: batch.batch_id,
            process_id,
            number: state.dispatches,
            size: batch.len() as u64,
            first_time: batch.first_time(),
            next_node_id: None,
            pipe_keys: Vec::new(),
        })
    }

    async fn commit(&self, receipt: DispatchReceipt) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.committed.push(receipt.batch_id);
            if self.manual {
                return Ok(());
            }
            let record = if self.fail_dispatches.contains(&receipt.number) {
                TerminationRecord::exception(
                    PIPELINE,
                    Some(receipt.batch_id),
                    receipt.process_id,
                    "load failed",
                )
            } else {
                TerminationRecord::normal(PIPELINE, receipt.batch_id, receipt.process_id)
            };
            let now = chrono::Utc::now().timestamp_millis();
            let record = record.with_times(receipt.first_time.unwrap_or(now), now);
            state.records.insert(receipt.process_id, record);
        }
        self.record_ready.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl CompletionChannel for FakeChain {
    async fn await_next(&self) -> Result<TerminationRecord> {
        loop {
            let notified = self.record_ready.notified();
            {
                let mut state = lock(&self.state);
                state.awaits += 1;
                if let Some(record) = state.records.values().next().cloned() {
                    return Ok(record);
                }
                state.awaits -= 1;
            }
            notified.await;
        }
    }

    async fn acknowledge(&self, record: &TerminationRecord) -> Result<()> {
        let mut state = lock(&self.state);
        state.records.remove(&record.process_id);
        state.acknowledged.push(record.clone());
        Ok(())
    }

    async fn exhaust_pending(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.records.clear();
        state.exhausts += 1;
        Ok(())
    }

    async fn signal_rollback(&self, process_id: Option<ProcessId>, _reason: String) -> Result<()> {
        lock(&self.state).signals.push(process_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingStats {
    reports: Mutex<Vec<DelayReport>>,
}

impl RecordingStats {
    pub fn reports(&self) -> Vec<DelayReport> {
        lock(&self.reports).clone()
    }
}

impl StatisticsSink for RecordingStats {
    fn report(&self, report: DelayReport) {
        lock(&self.reports).push(report);
    }
}

pub fn bindings(
    source: &Arc<MemoryBatchSource>,
    chain: &Arc<FakeChain>,
    stats: &Arc<RecordingStats>,
) -> SelectBindings {
    SelectBindings {
        source: source.clone(),
        dispatcher: chain.clone(),
        completions: chain.clone(),
        stats: stats.clone(),
    }
}

/// Poll `condition` every 50ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}
