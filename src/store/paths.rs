use crate::domain::{PipelineId, ProcessId, Stage};

const ROOT: &str = "/arbiter";

/// Store path layout, one subtree per pipeline
pub struct StorePaths;

impl StorePaths {
    pub fn pipeline(pipeline_id: PipelineId) -> String {
        format!("{}/pipelines/{}", ROOT, pipeline_id)
    }

    pub fn mainstem(pipeline_id: PipelineId) -> String {
        format!("{}/mainstem", Self::pipeline(pipeline_id))
    }

    pub fn process_root(pipeline_id: PipelineId) -> String {
        format!("{}/process", Self::pipeline(pipeline_id))
    }

    pub fn process(pipeline_id: PipelineId, process_id: ProcessId) -> String {
        format!(
            "{}/{}",
            Self::process_root(pipeline_id),
            Self::process_node_name(process_id)
        )
    }

    pub fn stage(pipeline_id: PipelineId, process_id: ProcessId, stage: Stage) -> String {
        format!(
            "{}/{}",
            Self::process(pipeline_id, process_id),
            stage.node_name()
        )
    }

    pub fn source(destination: &str) -> String {
        format!("{}/source/{}", ROOT, destination)
    }

    pub fn source_client(destination: &str, client_id: u16) -> String {
        format!("{}/{}", Self::source(destination), client_id)
    }

    pub fn source_cursor(destination: &str, client_id: u16) -> String {
        format!("{}/cursor", Self::source_client(destination, client_id))
    }

    /// Zero-padded so lexical and numeric order agree
    pub fn process_node_name(process_id: ProcessId) -> String {
        format!("{:010}", process_id.get())
    }

    pub fn parse_process_id(node_name: &str) -> Option<ProcessId> {
        node_name.parse::<u64>().ok().map(ProcessId)
    }
}
