use serde::{Deserialize, Serialize};

use super::{NodeId, PipelineId};

/// Lease lifecycle as stored in the mainstem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    /// Lease created, orchestrator not yet running
    Taking,
    /// Orchestrator running on the owner node
    Active,
}

impl std::fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseStatus::Taking => write!(f, "taking"),
            LeaseStatus::Active => write!(f, "active"),
        }
    }
}

/// The single live lease naming a pipeline's mainstem node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainstemLease {
    pub status: LeaseStatus,
    pub owner_node_id: NodeId,
    pub pipeline_id: PipelineId,
}

impl MainstemLease {
    /// Fresh lease for a node that is about to take over
    pub fn taking(pipeline_id: PipelineId, owner_node_id: NodeId) -> Self {
        Self {
            status: LeaseStatus::Taking,
            owner_node_id,
            pipeline_id,
        }
    }

    pub fn is_owned_by(&self, node_id: NodeId) -> bool {
        self.owner_node_id == node_id
    }

    pub fn is_active(&self) -> bool {
        self.status == LeaseStatus::Active
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
