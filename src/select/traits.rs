//! Collaborator seams of the select orchestrator

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::domain::{
    Batch, BatchId, DispatchReceipt, PipelineId, ProcessId, StageTicket, TerminationRecord,
};
use crate::error::Result;

/// Ordered reader of captured changes with acknowledge/rollback semantics
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Next batch after the current read position; may be empty
    async fn fetch_next(&self) -> Result<Batch>;

    /// Commit the read position past `batch_id`
    async fn acknowledge(&self, batch_id: BatchId) -> Result<()>;

    /// Rewind to the last committed position
    async fn rollback(&self, batch_id: Option<BatchId>) -> Result<()>;

    /// Drop any read position that was never acknowledged
    async fn discard_uncommitted(&self) -> Result<()>;

    /// Execution time of the last acknowledged row
    fn last_entry_time(&self) -> Option<i64>;
}

/// Entry point of the downstream stage chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Block until the chain grants a process slot
    async fn await_process(&self) -> Result<StageTicket>;

    /// Hand a bound batch's rows to the extract stage
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReceipt>;

    /// Publish the select stage as complete so extraction may begin
    async fn commit(&self, receipt: DispatchReceipt) -> Result<()>;
}

/// Stream of termination records produced by the stage chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionChannel: Send + Sync {
    /// Oldest record not yet acknowledged; waits until one exists
    async fn await_next(&self) -> Result<TerminationRecord>;

    /// Mark a record consumed so the next one becomes visible
    async fn acknowledge(&self, record: &TerminationRecord) -> Result<()>;

    /// Drop every pending record and in-flight process
    async fn exhaust_pending(&self) -> Result<()>;

    /// Ask the chain to abort work, optionally for one process
    async fn signal_rollback(&self, process_id: Option<ProcessId>, reason: String) -> Result<()>;
}

/// Replication delay sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayReport {
    pub pipeline_id: PipelineId,
    pub delay_millis: Option<i64>,
    pub number: u64,
}

/// Best-effort sink for delay statistics
#[cfg_attr(test, mockall::automock)]
pub trait StatisticsSink: Send + Sync {
    fn report(&self, report: DelayReport);
}

/// Sink that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatisticsSink;

impl StatisticsSink for LogStatisticsSink {
    fn report(&self, report: DelayReport) {
        match report.delay_millis {
            Some(delay) => info!(pipeline_id = %report.pipeline_id, "Replication delay {}ms", delay),
            None => info!(pipeline_id = %report.pipeline_id, "Replication delay unknown"),
        }
    }
}

/// Fresh confirmation that this node still holds the pipeline lease
#[async_trait]
pub trait LeaseCheck: Send + Sync {
    async fn check(&self) -> bool;
}
