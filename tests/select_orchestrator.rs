mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbiter::adapters::MemoryStore;
use arbiter::domain::{BatchId, ProcessId, TerminationOutcome, TerminationRecord};
use arbiter::select::{
    BatchSource, LeaseCheck, SelectBindings, SelectConfig, SelectOrchestrator,
};
use arbiter::view::ProgressView;
use async_trait::async_trait;
use common::{bindings, rows, wait_until, CountingSource, FakeChain, RecordingStats, PIPELINE};

async fn started(
    store: &Arc<MemoryStore>,
    batch_size: usize,
    chain: &Arc<FakeChain>,
) -> (
    Arc<SelectOrchestrator>,
    Arc<arbiter::adapters::MemoryBatchSource>,
    Arc<RecordingStats>,
) {
    let source = common::source(store, batch_size);
    source.start().await.unwrap();
    let stats = Arc::new(RecordingStats::default());
    let orchestrator = Arc::new(SelectOrchestrator::new(
        PIPELINE,
        SelectConfig::default(),
        bindings(&source, chain, &stats),
    ));
    orchestrator.start();
    (orchestrator, source, stats)
}

/// Every dispatched batch that completes normally is acknowledged, in order.
#[tokio::test(start_paused = true)]
async fn normal_batches_are_acknowledged_in_order() {
    let store = MemoryStore::new();
    let chain = FakeChain::auto(&[]);
    let (orchestrator, source, stats) = started(&store, 10, &chain).await;

    source.append(rows(30));
    assert!(wait_until(Duration::from_secs(10), || source.committed_position() == 30).await);

    assert_eq!(chain.committed(), vec![BatchId(1), BatchId(2), BatchId(3)]);
    let acked: Vec<_> = chain.acknowledged().iter().map(|r| r.batch_id).collect();
    assert_eq!(acked, vec![Some(BatchId(1)), Some(BatchId(2)), Some(BatchId(3))]);
    assert_eq!(orchestrator.epoch(), 0);
    assert!(stats.reports().iter().filter(|r| r.delay_millis.is_some()).count() >= 3);

    let view = ProgressView::new(Arc::new(store.session()));
    let cursor = view.source_cursor("orders", 1001).await.unwrap().unwrap();
    assert_eq!(cursor.position, "30");

    orchestrator.stop().await;
    assert!(!orchestrator.is_running());
}

/// An empty source never reaches the dispatcher but keeps the loops turning.
#[tokio::test(start_paused = true)]
async fn empty_batches_bypass_the_stage_chain() {
    let store = MemoryStore::new();
    let chain = FakeChain::auto(&[]);
    let (orchestrator, _source, stats) = started(&store, 10, &chain).await;

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(chain.dispatched().is_empty());
    assert_eq!(chain.awaits(), 0);
    assert_eq!(orchestrator.epoch(), 0);
    assert!(orchestrator.gate_open());
    let reports = stats.reports();
    assert!(!reports.is_empty());
    assert_eq!(reports[0].delay_millis, None);

    orchestrator.stop().await;
}

/// An exceptional completion rewinds the source; the rows are selected again.
#[tokio::test(start_paused = true)]
async fn exception_rolls_back_and_rows_are_reselected() {
    let store = MemoryStore::new();
    let chain = FakeChain::auto(&[2]);
    let (orchestrator, source, _stats) = started(&store, 10, &chain).await;

    source.append(rows(30));
    assert!(wait_until(Duration::from_secs(120), || source.committed_position() == 30).await);

    assert!(orchestrator.epoch() >= 1);
    assert!(chain.dispatched().len() > 3);
    assert!(chain
        .acknowledged()
        .iter()
        .any(|r| r.outcome == TerminationOutcome::Exception));
    assert!(wait_until(Duration::from_secs(5), || orchestrator.gate_open()).await);

    orchestrator.stop().await;
}

/// A record that never matches is retried, then treated as a violation.
#[tokio::test(start_paused = true)]
async fn unmatched_record_becomes_violation_after_retries() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let (orchestrator, source, _stats) = started(&store, 10, &chain).await;

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 1).await);
    chain.inject(TerminationRecord::normal(PIPELINE, BatchId(999), ProcessId(999)));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(orchestrator.epoch(), 0);
    assert!(chain.awaits() >= 20);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(orchestrator.epoch(), 1);
    assert!(chain.awaits() >= 30);
    assert!(chain.acknowledged().is_empty());
    assert_eq!(source.committed_position(), 0);
    assert_eq!(chain.exhausts(), 1);

    // Consumer restarts after its backoff and drops what was pending
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(chain.exhausts(), 2);

    orchestrator.stop().await;
}

/// A record without a batch id terminates the batch of its process.
#[tokio::test(start_paused = true)]
async fn out_of_band_abort_matches_by_process() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let (orchestrator, source, _stats) = started(&store, 10, &chain).await;

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 1).await);
    let (_, process_id) = chain.dispatched()[0];

    chain.inject(TerminationRecord::exception(
        PIPELINE,
        None,
        process_id,
        "operator abort",
    ));
    assert!(wait_until(Duration::from_secs(5), || orchestrator.epoch() >= 1).await);
    assert_eq!(chain.acknowledged()[0].batch_id, None);
    assert_eq!(source.committed_position(), 0);

    // The same rows come back under a new batch and process
    assert!(wait_until(Duration::from_secs(10), || chain.committed().len() == 2).await);
    let (batch_id, process_id) = chain.dispatched()[1];
    assert_ne!(batch_id, BatchId(1));
    chain.inject(TerminationRecord::normal(PIPELINE, batch_id, process_id));
    assert!(wait_until(Duration::from_secs(5), || source.committed_position() == 10).await);

    orchestrator.stop().await;
}

/// Once a batch rolled back, a normal completion for a later batch is refused.
#[tokio::test(start_paused = true)]
async fn normal_completion_after_rollback_is_refused() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let (orchestrator, source, _stats) = started(&store, 5, &chain).await;

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 2).await);
    let dispatched = chain.dispatched();
    let (first_batch, first_process) = dispatched[0];
    let (second_batch, second_process) = dispatched[1];

    chain.inject(TerminationRecord::exception(
        PIPELINE,
        Some(first_batch),
        first_process,
        "load failed",
    ));
    chain.inject(TerminationRecord::normal(PIPELINE, second_batch, second_process));

    assert!(wait_until(Duration::from_secs(5), || orchestrator.epoch() == 2).await);
    let acknowledged = chain.acknowledged();
    assert_eq!(acknowledged.len(), 1);
    assert_eq!(acknowledged[0].batch_id, Some(first_batch));
    assert_eq!(source.committed_position(), 0);

    orchestrator.stop().await;
}

/// Once a batch rolled back, an exception for a later in-flight batch is
/// acknowledged without declaring a second rollback.
#[tokio::test(start_paused = true)]
async fn stale_exception_after_rollback_is_discarded() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let memory = common::source(&store, 5);
    let source = CountingSource::new(memory.clone());
    source.start().await.unwrap();
    let orchestrator = Arc::new(SelectOrchestrator::new(
        PIPELINE,
        SelectConfig::default(),
        SelectBindings {
            source: source.clone(),
            dispatcher: chain.clone(),
            completions: chain.clone(),
            stats: Arc::new(RecordingStats::default()),
        },
    ));
    orchestrator.start();

    memory.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 2).await);
    let dispatched = chain.dispatched();
    let (first_batch, first_process) = dispatched[0];
    let (second_batch, second_process) = dispatched[1];

    chain.inject(TerminationRecord::exception(
        PIPELINE,
        Some(first_batch),
        first_process,
        "load failed",
    ));
    chain.inject(TerminationRecord::exception(
        PIPELINE,
        Some(second_batch),
        second_process,
        "swept",
    ));

    assert!(wait_until(Duration::from_secs(5), || chain.acknowledged().len() == 2).await);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(orchestrator.epoch(), 1);
    assert_eq!(source.rollbacks(), 1);
    let acked: Vec<_> = chain.acknowledged().iter().map(|r| r.batch_id).collect();
    assert_eq!(acked, vec![Some(first_batch), Some(second_batch)]);
    assert_eq!(memory.committed_position(), 0);

    orchestrator.stop().await;
}

/// An out-of-band record naming a later process never matches the head batch.
#[tokio::test(start_paused = true)]
async fn out_of_band_record_for_later_process_is_not_matched() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let (orchestrator, source, _stats) = started(&store, 5, &chain).await;

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 2).await);
    let (_, second_process) = chain.dispatched()[1];

    chain.inject(TerminationRecord::exception(
        PIPELINE,
        None,
        second_process,
        "operator abort",
    ));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(orchestrator.epoch(), 0);

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(orchestrator.epoch(), 1);
    assert!(chain.awaits() >= 30);
    assert!(chain.acknowledged().is_empty());
    assert_eq!(source.committed_position(), 0);

    orchestrator.stop().await;
}

/// An out-of-band abort of the head batch rolls it back; a normal completion
/// of the next batch is then refused.
#[tokio::test(start_paused = true)]
async fn out_of_band_head_abort_then_normal_is_refused() {
    let store = MemoryStore::new();
    let chain = FakeChain::manual();
    let (orchestrator, source, _stats) = started(&store, 5, &chain).await;

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || chain.committed().len() == 2).await);
    let dispatched = chain.dispatched();
    let (_, first_process) = dispatched[0];
    let (second_batch, second_process) = dispatched[1];

    chain.inject(TerminationRecord::exception(
        PIPELINE,
        None,
        first_process,
        "operator abort",
    ));
    chain.inject(TerminationRecord::normal(PIPELINE, second_batch, second_process));

    assert!(wait_until(Duration::from_secs(5), || orchestrator.epoch() == 2).await);
    let acknowledged = chain.acknowledged();
    assert_eq!(acknowledged.len(), 1);
    assert_eq!(acknowledged[0].batch_id, None);
    assert_eq!(acknowledged[0].process_id, first_process);
    assert_eq!(source.committed_position(), 0);

    orchestrator.stop().await;
}

struct FlagLease(AtomicBool);

#[async_trait]
impl LeaseCheck for FlagLease {
    async fn check(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// With per-batch verification, losing the lease stops the loops.
#[tokio::test(start_paused = true)]
async fn lost_lease_stops_selection() {
    let store = MemoryStore::new();
    let chain = FakeChain::auto(&[]);
    let source = common::source(&store, 10);
    source.start().await.unwrap();
    let stats = Arc::new(RecordingStats::default());
    let lease = Arc::new(FlagLease(AtomicBool::new(true)));

    let config = SelectConfig {
        verify_lease_per_batch: true,
        ..SelectConfig::default()
    };
    let orchestrator = Arc::new(
        SelectOrchestrator::new(PIPELINE, config, bindings(&source, &chain, &stats))
            .with_lease_check(lease.clone()),
    );
    orchestrator.start();

    source.append(rows(10));
    assert!(wait_until(Duration::from_secs(5), || source.committed_position() == 10).await);
    assert!(orchestrator.is_running());

    lease.0.store(false, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || !orchestrator.is_running()).await);

    orchestrator.stop().await;
}
