use serde::{Deserialize, Serialize};

use super::{NodeId, PipelineId, ProcessId};

/// One of the four ordered pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Select,
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Select, Stage::Extract, Stage::Transform, Stage::Load];

    /// Fixed precedence used to order stage entries
    pub fn ordinal(&self) -> u8 {
        match self {
            Stage::Select => 0,
            Stage::Extract => 1,
            Stage::Transform => 2,
            Stage::Load => 3,
        }
    }

    /// Name of the child entry written when this stage completes
    pub fn node_name(&self) -> &'static str {
        match self {
            Stage::Select => "selected",
            Stage::Extract => "extracted",
            Stage::Transform => "transformed",
            Stage::Load => "loaded",
        }
    }

    pub fn from_node_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.node_name() == name)
    }

    /// Stage that follows this one, `None` after load
    pub fn next(&self) -> Option<Self> {
        match self {
            Stage::Select => Some(Stage::Extract),
            Stage::Extract => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Load),
            Stage::Load => None,
        }
    }
}

impl PartialOrd for Stage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ordinal().cmp(&other.ordinal())
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Select => write!(f, "select"),
            Stage::Extract => write!(f, "extract"),
            Stage::Transform => write!(f, "transform"),
            Stage::Load => write!(f, "load"),
        }
    }
}

/// Body of a completed-stage entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageEventData {
    pub number: Option<u64>,
    pub size: Option<u64>,
    pub curr_node_id: Option<NodeId>,
    pub next_node_id: Option<NodeId>,
    pub description: Vec<String>,
}

/// Whether a process entry carries a batch yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Unused,
    Used,
}

/// Body of a process entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessNodeData {
    pub status: ProcessStatus,
    #[serde(default)]
    pub node_id: Option<NodeId>,
}

/// One interval of a process timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub start_time: i64,
    /// `None` for the synthetic in-progress record
    pub end_time: Option<i64>,
    pub number: Option<u64>,
    pub size: Option<u64>,
    pub curr_node_id: Option<NodeId>,
    pub next_node_id: Option<NodeId>,
    pub description: Vec<String>,
}

impl StageRecord {
    /// Synthetic record for the stage currently running
    pub fn current(stage: Stage, start_time: i64) -> Self {
        Self {
            stage,
            start_time,
            end_time: None,
            number: None,
            size: None,
            curr_node_id: None,
            next_node_id: None,
            description: Vec::new(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Reconstructed stage timeline of one in-flight process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessStageRecord {
    pub pipeline_id: PipelineId,
    pub process_id: ProcessId,
    pub stages: Vec<StageRecord>,
}

impl ProcessStageRecord {
    pub fn current_stage(&self) -> Option<Stage> {
        self.stages.iter().find(|s| s.is_current()).map(|s| s.stage)
    }
}
