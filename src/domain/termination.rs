use serde::{Deserialize, Serialize};

use super::{BatchDescriptor, BatchId, PipelineId, ProcessId};

/// How a batch left the stage chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    Normal,
    Exception,
}

impl TerminationOutcome {
    pub fn is_normal(&self) -> bool {
        matches!(self, TerminationOutcome::Normal)
    }
}

/// Downstream report that a batch finished or failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub pipeline_id: PipelineId,
    /// `None` marks an out-of-band rollback command
    pub batch_id: Option<BatchId>,
    pub process_id: ProcessId,
    pub outcome: TerminationOutcome,
    pub end_time: Option<i64>,
    pub first_time: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl TerminationRecord {
    pub fn normal(pipeline_id: PipelineId, batch_id: BatchId, process_id: ProcessId) -> Self {
        Self {
            pipeline_id,
            batch_id: Some(batch_id),
            process_id,
            outcome: TerminationOutcome::Normal,
            end_time: None,
            first_time: None,
            reason: None,
        }
    }

    pub fn exception(
        pipeline_id: PipelineId,
        batch_id: Option<BatchId>,
        process_id: ProcessId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_id,
            batch_id,
            process_id,
            outcome: TerminationOutcome::Exception,
            end_time: None,
            first_time: None,
            reason: Some(reason.into()),
        }
    }

    pub fn with_times(mut self, first_time: i64, end_time: i64) -> Self {
        self.first_time = Some(first_time);
        self.end_time = Some(end_time);
        self
    }

    pub fn is_out_of_band(&self) -> bool {
        self.batch_id.is_none()
    }

    /// Whether this record terminates the batch behind `descriptor`.
    ///
    /// Out-of-band records match on process id, all others on batch id. A
    /// descriptor missing the compared id matches any record.
    pub fn matches(&self, descriptor: &BatchDescriptor) -> bool {
        match self.batch_id {
            None => descriptor
                .process_id
                .map_or(true, |process_id| process_id == self.process_id),
            Some(batch_id) => descriptor
                .batch_id
                .map_or(true, |expected| expected == batch_id),
        }
    }

    /// Replication delay carried by a normal completion
    pub fn delay_millis(&self) -> Option<i64> {
        match (self.first_time, self.end_time) {
            (Some(first), Some(end)) => Some(end - first),
            _ => None,
        }
    }
}
