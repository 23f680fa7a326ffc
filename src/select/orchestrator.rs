//! Select Orchestrator
//!
//! Runs the producer ("select") and consumer ("termin") loops of one
//! pipeline. The producer fetches batches, obtains a process slot, enqueues
//! a descriptor and dispatches the rows on a worker task. The consumer pops
//! descriptors in order, matches each against the next termination record
//! and acknowledges or rolls back the batch source accordingly.
//!
//! Both loops share a [`SelectContext`]: a bounded hand-off buffer, the
//! gate the producer waits on, and the rollback epoch. Work computed under a
//! stale epoch is dropped instead of committed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::config::SelectConfig;
use super::context::SelectContext;
use super::traits::{BatchSource, CompletionChannel, DelayReport, Dispatcher, LeaseCheck, StatisticsSink};
use crate::domain::{Batch, BatchDescriptor, BatchId, PipelineId, ProcessId};
use crate::error::{ArbiterError, Result};

/// Collaborators one orchestrator drives
#[derive(Clone)]
pub struct SelectBindings {
    pub source: Arc<dyn BatchSource>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub completions: Arc<dyn CompletionChannel>,
    pub stats: Arc<dyn StatisticsSink>,
}

/// Producer/consumer engine for one pipeline
pub struct SelectOrchestrator {
    config: SelectConfig,
    ctx: Arc<SelectContext>,
    bindings: SelectBindings,
    lease: Option<Arc<dyn LeaseCheck>>,
    running: AtomicBool,
    last_delay_reset: Mutex<Option<Instant>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SelectOrchestrator {
    pub fn new(pipeline_id: PipelineId, config: SelectConfig, bindings: SelectBindings) -> Self {
        let ctx = Arc::new(SelectContext::new(pipeline_id, config.channel_capacity));
        Self {
            config,
            ctx,
            bindings,
            lease: None,
            running: AtomicBool::new(false),
            last_delay_reset: Mutex::new(None),
            loops: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Lease probe used when `verify_lease_per_batch` is set
    pub fn with_lease_check(mut self, lease: Arc<dyn LeaseCheck>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.ctx.pipeline_id
    }

    pub fn context(&self) -> &Arc<SelectContext> {
        &self.ctx
    }

    pub fn epoch(&self) -> u64 {
        self.ctx.epoch.current()
    }

    pub fn gate_open(&self) -> bool {
        self.ctx.gate.is_open()
    }

    /// Descriptors waiting for the consumer
    pub fn pending(&self) -> usize {
        self.ctx.buffer.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Close the gate and spawn the consumer, then the producer
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(pipeline_id = %self.ctx.pipeline_id, "Select orchestrator already running");
            return;
        }

        self.ctx.gate.close();
        let span = info_span!("pipeline", pipeline_id = %self.ctx.pipeline_id);
        let termin = tokio::spawn(Arc::clone(self).run_termin().instrument(span.clone()));
        let select = tokio::spawn(Arc::clone(self).run_select().instrument(span));

        let mut loops = lock(&self.loops);
        loops.push(termin);
        loops.push(select);
        info!(pipeline_id = %self.ctx.pipeline_id, "Select orchestrator started");
    }

    /// Stop both loops and every in-flight dispatch worker
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = {
            let mut loops = lock(&self.loops);
            let mut workers = lock(&self.workers);
            loops.drain(..).chain(workers.drain(..)).collect()
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(pipeline_id = %self.ctx.pipeline_id, "Select orchestrator stopped");
    }

    // ==================== producer ====================

    async fn run_select(self: Arc<Self>) {
        while self.is_running() {
            match self.select_once().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Lease no longer held, stopping select loops");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
                Err(e) if e.should_stop() => {
                    info!("Select loop interrupted: {}", e);
                    break;
                }
                Err(e) => {
                    error!("Select loop failed: {}", e);
                    self.notify_rollback();
                    self.signal_abort(None, e.to_string()).await;
                    sleep(self.config.select_backoff()).await;
                }
            }
        }
        debug!("Select loop exited");
    }

    /// One producer iteration; `Ok(false)` when the lease was lost
    pub(crate) async fn select_once(self: &Arc<Self>) -> Result<bool> {
        self.ctx.gate.wait_open().await;

        if self.config.verify_lease_per_batch && !self.lease_held().await {
            return Ok(false);
        }

        let mut batch = self.bindings.source.fetch_next().await?;
        if !self.ctx.gate.is_open() {
            // rows stay uncommitted and are rewound when the consumer drains
            warn!("Gate closed during fetch, dropping batch {}", batch.batch_id);
            return Ok(true);
        }

        if batch.is_empty() {
            self.ctx
                .buffer
                .put(BatchDescriptor::passthrough(batch.batch_id))
                .await?;
            return Ok(true);
        }

        let mut start_epoch = self.ctx.epoch.current();
        let ticket = self.bindings.dispatcher.await_process().await?;
        if self.ctx.epoch.current() != start_epoch {
            warn!(
                "Rollback while waiting for process {}, dropping batch {} and refetching",
                ticket.process_id, batch.batch_id
            );
            self.ctx.gate.wait_open().await;
            sleep(self.config.rollback_pause()).await;
            batch = self.bindings.source.fetch_next().await?;
            start_epoch = self.ctx.epoch.current();
        }

        let process_id = ticket.process_id;
        let batch = batch.bind(ticket);
        self.ctx
            .buffer
            .put(BatchDescriptor::awaiting(batch.batch_id, process_id))
            .await?;
        self.spawn_dispatch(batch, start_epoch);
        Ok(true)
    }

    fn spawn_dispatch(self: &Arc<Self>, batch: Batch, start_epoch: u64) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(
            async move {
                let process_id = batch.process_id;
                match this.dispatch_batch(&batch, start_epoch).await {
                    Ok(()) => {}
                    Err(e) if e.should_stop() => {
                        debug!("Dispatch of batch {} interrupted", batch.batch_id);
                    }
                    Err(e) => {
                        error!("Dispatch of batch {} failed: {}", batch.batch_id, e);
                        this.signal_abort(process_id, e.to_string()).await;
                    }
                }
            }
            .instrument(Span::current()),
        );

        let mut workers = lock(&self.workers);
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }

    async fn dispatch_batch(&self, batch: &Batch, start_epoch: u64) -> Result<()> {
        let receipt = self.bindings.dispatcher.dispatch(batch).await?;
        if self.ctx.epoch.current() != start_epoch {
            warn!(
                "Epoch moved during dispatch of batch {}, discarding result",
                batch.batch_id
            );
            return Ok(());
        }
        self.bindings.dispatcher.commit(receipt).await
    }

    // ==================== consumer ====================

    async fn run_termin(self: Arc<Self>) {
        while self.is_running() {
            match self.termin_cycle().await {
                Ok(()) => break,
                Err(e) if e.should_stop() => {
                    info!("Termination loop interrupted: {}", e);
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("Termination cycle failed, retrying: {}", e);
                    self.notify_rollback();
                }
                Err(e) => {
                    error!("Termination cycle failed: {}", e);
                    self.notify_rollback();
                    self.signal_abort(None, e.to_string()).await;
                }
            }

            if self.is_running() {
                sleep(self.config.termin_backoff()).await;
            }
        }
        debug!("Termination loop exited");
    }

    /// Runs until stopped; any error ends the cycle
    pub(crate) async fn termin_cycle(&self) -> Result<()> {
        let mut last_ok = true;
        self.bindings.completions.exhaust_pending().await?;
        let dropped = self.ctx.buffer.clear().await;
        if dropped > 0 {
            info!("Dropped {} stale descriptors", dropped);
        }

        while self.is_running() {
            if self.ctx.buffer.is_empty() {
                if !self.ctx.gate.is_open() {
                    self.bindings.source.discard_uncommitted().await?;
                }
                last_ok = true;
                self.ctx.gate.open();
            }

            let Some(descriptor) = self.next_descriptor().await? else {
                continue;
            };

            debug!("Start termination of {}", descriptor);
            if descriptor.requires_termination {
                last_ok = self.process_termination(last_ok, &descriptor).await?;
            } else if last_ok {
                self.ack(descriptor.batch_id).await?;
                self.maybe_reset_delay();
            } else {
                debug!("Skipping {} after rollback", descriptor);
            }
            debug!("End termination of {}, ok={}", descriptor, last_ok);
        }
        Ok(())
    }

    /// Next descriptor, or `None` when the gate closes on an idle buffer
    async fn next_descriptor(&self) -> Result<Option<BatchDescriptor>> {
        tokio::select! {
            biased;
            descriptor = self.ctx.buffer.take() => descriptor.map(Some),
            _ = self.ctx.gate.wait_closed(), if self.ctx.buffer.is_empty() => Ok(None),
        }
    }

    /// Match the next termination record against `descriptor` and apply it.
    ///
    /// Returns whether the batch completed normally.
    async fn process_termination(&self, last_ok: bool, descriptor: &BatchDescriptor) -> Result<bool> {
        let mut matched = None;
        for attempt in 1..=self.config.match_retries {
            let record = self.bindings.completions.await_next().await?;
            if record.matches(descriptor) {
                matched = Some(record);
                break;
            }
            warn!(
                attempt,
                "Termination for process {} (batch {:?}) does not match {}",
                record.process_id, record.batch_id, descriptor
            );
            sleep(self.config.match_retry_interval()).await;
        }

        let Some(record) = matched else {
            return Err(ArbiterError::ProtocolViolation(format!(
                "no matching termination for {} after {} attempts",
                descriptor, self.config.match_retries
            )));
        };

        if self.config.verify_lease_per_batch && !self.lease_held().await {
            return Err(ArbiterError::Interrupted);
        }

        let normal = record.outcome.is_normal();
        if !last_ok && normal {
            return Err(ArbiterError::ProtocolViolation(format!(
                "normal completion of {} after a rollback",
                descriptor
            )));
        }

        if !last_ok {
            // already rolled back under the current epoch
            debug!(
                "Discarding abnormal termination of process {} after rollback",
                record.process_id
            );
            self.bindings.completions.acknowledge(&record).await?;
            return Ok(false);
        }

        if normal {
            self.ack(descriptor.batch_id).await?;
            self.bindings.stats.report(DelayReport {
                pipeline_id: self.ctx.pipeline_id,
                delay_millis: record.delay_millis(),
                number: 0,
            });
        } else {
            warn!(
                "Process {} terminated abnormally: {}",
                record.process_id,
                record.reason.as_deref().unwrap_or("no reason given")
            );
            self.rollback(descriptor.batch_id).await?;
        }

        self.bindings.completions.acknowledge(&record).await?;
        Ok(normal)
    }

    async fn ack(&self, batch_id: Option<BatchId>) -> Result<()> {
        self.ctx.gate.open();
        match batch_id {
            Some(id) => self.bindings.source.acknowledge(id).await,
            None => Ok(()),
        }
    }

    async fn rollback(&self, batch_id: Option<BatchId>) -> Result<()> {
        self.notify_rollback();
        self.bindings.source.rollback(batch_id).await
    }

    /// Close the gate and move to a new epoch
    fn notify_rollback(&self) {
        self.ctx.gate.close();
        let epoch = self.ctx.epoch.advance();
        warn!("Rollback declared, epoch now {}", epoch);
    }

    fn maybe_reset_delay(&self) {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_delay_reset);
            if let Some(at) = *last {
                if now.duration_since(at) < self.config.delay_reset_interval() {
                    return;
                }
            }
            *last = Some(now);
        }

        let delay = self
            .bindings
            .source
            .last_entry_time()
            .map(|t| Utc::now().timestamp_millis() - t);
        self.bindings.stats.report(DelayReport {
            pipeline_id: self.ctx.pipeline_id,
            delay_millis: delay,
            number: 0,
        });
    }

    async fn signal_abort(&self, process_id: Option<ProcessId>, reason: String) {
        if let Err(e) = self
            .bindings
            .completions
            .signal_rollback(process_id, reason)
            .await
        {
            error!("Failed to signal rollback downstream: {}", e);
        }
    }

    async fn lease_held(&self) -> bool {
        match &self.lease {
            Some(lease) => lease.check().await,
            None => true,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DispatchReceipt, StageTicket, TerminationRecord};
    use crate::select::traits::{
        MockBatchSource, MockCompletionChannel, MockDispatcher, MockStatisticsSink,
    };
    use mockall::predicate::eq;

    const PIPELINE: PipelineId = PipelineId(3);

    fn orchestrator(
        source: MockBatchSource,
        dispatcher: MockDispatcher,
        completions: MockCompletionChannel,
    ) -> Arc<SelectOrchestrator> {
        let mut stats = MockStatisticsSink::new();
        stats.expect_report().return_const(());
        Arc::new(SelectOrchestrator::new(
            PIPELINE,
            SelectConfig::default(),
            SelectBindings {
                source: Arc::new(source),
                dispatcher: Arc::new(dispatcher),
                completions: Arc::new(completions),
                stats: Arc::new(stats),
            },
        ))
    }

    fn ticket(process_id: u64) -> StageTicket {
        StageTicket {
            process_id: ProcessId(process_id),
            start_time: 1_000,
            next_node_id: None,
        }
    }

    fn receipt(batch: &Batch) -> DispatchReceipt {
        DispatchReceipt {
            batch_id: batch.batch_id,
            process_id: batch.process_id.unwrap_or(ProcessId(0)),
            number: batch.len() as u64,
            size: 0,
            first_time: batch.first_time(),
            next_node_id: None,
            pipe_keys: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_empty_fetch_is_queued_without_a_process() {
        let mut source = MockBatchSource::new();
        source
            .expect_fetch_next()
            .times(1)
            .returning(|| Ok(Batch::empty(BatchId(4))));
        let mut dispatcher = MockDispatcher::new();
        dispatcher.expect_await_process().never();

        let orchestrator = orchestrator(source, dispatcher, MockCompletionChannel::new());
        orchestrator.context().gate.open();

        assert!(orchestrator.select_once().await.unwrap());
        let descriptor = orchestrator.context().buffer.take().await.unwrap();
        assert_eq!(descriptor, BatchDescriptor::passthrough(BatchId(4)));
    }

    #[tokio::test]
    async fn test_dispatch_under_stale_epoch_is_not_committed() {
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(1)
            .returning(|batch| Ok(receipt(batch)));
        dispatcher.expect_commit().never();

        let orchestrator =
            orchestrator(MockBatchSource::new(), dispatcher, MockCompletionChannel::new());
        let batch = Batch::new(BatchId(1), Vec::new()).bind(ticket(9));
        let stale = orchestrator.epoch();
        orchestrator.context().epoch.advance();

        orchestrator.dispatch_batch(&batch, stale).await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_under_current_epoch_commits() {
        let mut dispatcher = MockDispatcher::new();
        dispatcher
            .expect_dispatch()
            .times(1)
            .returning(|batch| Ok(receipt(batch)));
        dispatcher
            .expect_commit()
            .withf(|receipt| receipt.process_id == ProcessId(9))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator =
            orchestrator(MockBatchSource::new(), dispatcher, MockCompletionChannel::new());
        let batch = Batch::new(BatchId(1), Vec::new()).bind(ticket(9));

        orchestrator
            .dispatch_batch(&batch, orchestrator.epoch())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_normal_completion_acknowledges_once() {
        let mut completions = MockCompletionChannel::new();
        completions.expect_await_next().times(1).returning(|| {
            Ok(TerminationRecord::normal(PIPELINE, BatchId(5), ProcessId(2)).with_times(10, 25))
        });
        completions.expect_acknowledge().times(1).returning(|_| Ok(()));
        let mut source = MockBatchSource::new();
        source
            .expect_acknowledge()
            .with(eq(BatchId(5)))
            .times(1)
            .returning(|_| Ok(()));
        source.expect_rollback().never();

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        let descriptor = BatchDescriptor::awaiting(BatchId(5), ProcessId(2));

        assert!(orchestrator.process_termination(true, &descriptor).await.unwrap());
        assert_eq!(orchestrator.epoch(), 0);
        assert!(orchestrator.gate_open());
    }

    #[tokio::test]
    async fn test_exception_rolls_back_once_and_closes_gate() {
        let mut completions = MockCompletionChannel::new();
        completions.expect_await_next().times(1).returning(|| {
            Ok(TerminationRecord::exception(
                PIPELINE,
                Some(BatchId(5)),
                ProcessId(2),
                "load failed",
            ))
        });
        completions.expect_acknowledge().times(1).returning(|_| Ok(()));
        let mut source = MockBatchSource::new();
        source
            .expect_rollback()
            .with(eq(Some(BatchId(5))))
            .times(1)
            .returning(|_| Ok(()));
        source.expect_acknowledge().never();

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        orchestrator.context().gate.open();
        let descriptor = BatchDescriptor::awaiting(BatchId(5), ProcessId(2));

        assert!(!orchestrator.process_termination(true, &descriptor).await.unwrap());
        assert_eq!(orchestrator.epoch(), 1);
        assert!(!orchestrator.gate_open());
    }

    #[tokio::test]
    async fn test_normal_after_rollback_is_a_violation() {
        let mut completions = MockCompletionChannel::new();
        completions
            .expect_await_next()
            .times(1)
            .returning(|| Ok(TerminationRecord::normal(PIPELINE, BatchId(6), ProcessId(3))));
        completions.expect_acknowledge().never();
        let mut source = MockBatchSource::new();
        source.expect_acknowledge().never();
        source.expect_rollback().never();

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        let descriptor = BatchDescriptor::awaiting(BatchId(6), ProcessId(3));

        let err = orchestrator
            .process_termination(false, &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_exception_after_rollback_is_acknowledged_without_rollback() {
        let mut completions = MockCompletionChannel::new();
        completions.expect_await_next().times(1).returning(|| {
            Ok(TerminationRecord::exception(
                PIPELINE,
                Some(BatchId(7)),
                ProcessId(4),
                "stale",
            ))
        });
        completions.expect_acknowledge().times(1).returning(|_| Ok(()));
        let mut source = MockBatchSource::new();
        source.expect_acknowledge().never();
        source.expect_rollback().never();

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        let descriptor = BatchDescriptor::awaiting(BatchId(7), ProcessId(4));

        assert!(!orchestrator.process_termination(false, &descriptor).await.unwrap());
        assert_eq!(orchestrator.epoch(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_records_fail_after_all_retries() {
        let mut completions = MockCompletionChannel::new();
        completions
            .expect_await_next()
            .times(30)
            .returning(|| Ok(TerminationRecord::normal(PIPELINE, BatchId(8), ProcessId(8))));
        completions.expect_acknowledge().never();
        let mut source = MockBatchSource::new();
        source.expect_acknowledge().never();
        source.expect_rollback().never();

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        let descriptor = BatchDescriptor::awaiting(BatchId(5), ProcessId(2));

        let started = Instant::now();
        let err = orchestrator
            .process_termination(true, &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, ArbiterError::ProtocolViolation(_)));
        assert!(started.elapsed() >= std::time::Duration::from_secs(30));
        assert_eq!(orchestrator.epoch(), 0);
    }

    #[tokio::test]
    async fn test_out_of_band_record_matches_by_process() {
        let mut completions = MockCompletionChannel::new();
        completions.expect_await_next().times(1).returning(|| {
            Ok(TerminationRecord::exception(
                PIPELINE,
                None,
                ProcessId(2),
                "operator abort",
            ))
        });
        completions.expect_acknowledge().times(1).returning(|_| Ok(()));
        let mut source = MockBatchSource::new();
        source
            .expect_rollback()
            .with(eq(Some(BatchId(5))))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(source, MockDispatcher::new(), completions);
        let descriptor = BatchDescriptor::awaiting(BatchId(5), ProcessId(2));

        assert!(!orchestrator.process_termination(true, &descriptor).await.unwrap());
        assert_eq!(orchestrator.epoch(), 1);
    }
}
