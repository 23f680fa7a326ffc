use serde::{Deserialize, Serialize};

use super::{BatchId, NodeId, ProcessId};

/// Kind of row change captured from the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One changed row read from the source log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRow {
    pub schema: String,
    pub table: String,
    pub kind: ChangeKind,
    /// Source-side execution time (unix millis)
    pub execute_time: i64,
    pub columns: serde_json::Map<String, serde_json::Value>,
}

/// Process slot granted by the downstream chain for one batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTicket {
    pub process_id: ProcessId,
    /// Time the slot was granted (unix millis)
    pub start_time: i64,
    pub next_node_id: Option<NodeId>,
}

/// Unit of selected change rows moving through the stage chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: BatchId,
    /// Assigned when the batch is bound to a granted process slot
    pub process_id: Option<ProcessId>,
    pub rows: Vec<ChangeRow>,
    pub origin: Option<StageTicket>,
}

impl Batch {
    /// Unbound batch as returned by a batch source
    pub fn new(batch_id: BatchId, rows: Vec<ChangeRow>) -> Self {
        Self {
            batch_id,
            process_id: None,
            rows,
            origin: None,
        }
    }

    pub fn empty(batch_id: BatchId) -> Self {
        Self::new(batch_id, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Attach the granted process slot
    pub fn bind(mut self, ticket: StageTicket) -> Self {
        self.process_id = Some(ticket.process_id);
        self.origin = Some(ticket);
        self
    }

    /// Execution time of the first row, falling back to the slot grant time
    pub fn first_time(&self) -> Option<i64> {
        self.rows
            .first()
            .map(|row| row.execute_time)
            .or_else(|| self.origin.as_ref().map(|t| t.start_time))
    }
}

/// Hand-off element between the select producer and the termination consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDescriptor {
    pub batch_id: Option<BatchId>,
    pub process_id: Option<ProcessId>,
    pub requires_termination: bool,
}

impl BatchDescriptor {
    /// Descriptor for a dispatched batch that must be matched to a termination
    pub fn awaiting(batch_id: BatchId, process_id: ProcessId) -> Self {
        Self {
            batch_id: Some(batch_id),
            process_id: Some(process_id),
            requires_termination: true,
        }
    }

    /// Descriptor for an empty batch that never goes downstream
    pub fn passthrough(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            process_id: None,
            requires_termination: false,
        }
    }
}

impl std::fmt::Display for BatchDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_opt = |v: Option<u64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "batch={} process={} wait={}",
            fmt_opt(self.batch_id.map(|b| b.get())),
            fmt_opt(self.process_id.map(|p| p.get())),
            self.requires_termination
        )
    }
}

/// Result of handing a batch's rows to the extract stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub batch_id: BatchId,
    pub process_id: ProcessId,
    pub number: u64,
    pub size: u64,
    pub first_time: Option<i64>,
    pub next_node_id: Option<NodeId>,
    /// Keys under which the rows were handed downstream
    pub pipe_keys: Vec<String>,
}
