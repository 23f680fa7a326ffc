//! Node state snapshots for status output

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{NodeId, PipelineId};
use crate::select::SelectSnapshot;

/// Per-pipeline view of one node
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub pipeline_id: PipelineId,
    /// This node holds the mainstem lease
    pub active: bool,
    /// Owner named by the lease, if any
    pub lease_owner: Option<NodeId>,
    /// Present while an orchestrator runs here
    pub select: Option<SelectSnapshot>,
    /// Task ended; it no longer competes for the lease
    pub finished: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub started_at: DateTime<Utc>,
    pub pipelines: Vec<PipelineStatus>,
}

impl NodeStatus {
    pub fn active_count(&self) -> usize {
        self.pipelines.iter().filter(|p| p.active).count()
    }
}
