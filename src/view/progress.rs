//! Stage Progress View
//!
//! Rebuilds per-process stage timelines from the store on every call.
//! Timestamps come from the store's modification times, so the view agrees
//! across nodes regardless of local clocks.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{
    MainstemLease, PipelineId, ProcessId, ProcessNodeData, ProcessStageRecord, ProcessStatus,
    Stage, StageEventData, StageRecord,
};
use crate::error::{Result, StoreError};
use crate::store::{CoordinationStore, StorePaths};

/// Persisted read position of one source client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCursor {
    pub position: String,
    pub created_at: i64,
    pub modified_at: i64,
}

pub struct ProgressView {
    store: Arc<dyn CoordinationStore>,
}

impl ProgressView {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Stage timelines of every in-flight process, oldest first
    pub async fn list_processes(&self, pipeline_id: PipelineId) -> Result<Vec<ProcessStageRecord>> {
        let root = StorePaths::process_root(pipeline_id);
        let names = match self.store.children(&root).await {
            Ok((names, _)) => names,
            Err(StoreError::NoNode(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut process_ids: Vec<ProcessId> = names
            .iter()
            .filter_map(|name| StorePaths::parse_process_id(name))
            .collect();
        process_ids.sort();

        let mut records = Vec::with_capacity(process_ids.len());
        for (index, process_id) in process_ids.into_iter().enumerate() {
            match self.process_record(pipeline_id, process_id, index == 0).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(
                    pipeline_id = %pipeline_id,
                    "Skipping process {}: {}", process_id, e
                ),
            }
        }
        Ok(records)
    }

    async fn process_record(
        &self,
        pipeline_id: PipelineId,
        process_id: ProcessId,
        oldest: bool,
    ) -> Result<Option<ProcessStageRecord>> {
        let process_path = StorePaths::process(pipeline_id, process_id);
        let Some((process_data, process_stat)) = self.store.read(&process_path).await? else {
            debug!("Process {} vanished while listing", process_id);
            return Ok(None);
        };
        let stage_names = match self.store.children(&process_path).await {
            Ok((names, _)) => names,
            Err(StoreError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut stages: Vec<Stage> = stage_names
            .iter()
            .filter_map(|name| Stage::from_node_name(name))
            .collect();
        stages.sort();
        stages.dedup();

        let mut timeline = Vec::with_capacity(stages.len() + 1);
        let mut start_time = process_stat.mtime;
        for stage in stages {
            let path = StorePaths::stage(pipeline_id, process_id, stage);
            let Some((data, stat)) = self.store.read(&path).await? else {
                continue;
            };
            let event: StageEventData = match serde_json::from_slice(&data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Unreadable {} entry of process {}: {}", stage, process_id, e);
                    continue;
                }
            };

            timeline.push(StageRecord {
                stage,
                start_time,
                end_time: Some(stat.mtime),
                number: event.number,
                size: event.size,
                curr_node_id: event.curr_node_id,
                next_node_id: event.next_node_id,
                description: event.description,
            });
            start_time = stat.mtime;
        }

        let current = match timeline.last() {
            Some(last) if last.stage == Stage::Load => return Ok(None),
            Some(last) => last.stage.next(),
            None => {
                let used = serde_json::from_slice::<ProcessNodeData>(&process_data)
                    .map_or(false, |node| node.status == ProcessStatus::Used);
                if !used {
                    return Ok(None);
                }
                Some(Stage::Select)
            }
        };

        if let Some(stage) = current {
            if stage != Stage::Load || oldest {
                timeline.push(StageRecord::current(stage, start_time));
            }
        }

        Ok(Some(ProcessStageRecord {
            pipeline_id,
            process_id,
            stages: timeline,
        }))
    }

    /// Current lease, if any
    pub async fn mainstem(&self, pipeline_id: PipelineId) -> Result<Option<MainstemLease>> {
        match self.store.read(&StorePaths::mainstem(pipeline_id)).await? {
            Some((data, _)) => Ok(Some(MainstemLease::from_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// Id the next allocated process will receive
    pub async fn next_process_id(&self, pipeline_id: PipelineId) -> Result<Option<u64>> {
        match self
            .store
            .children(&StorePaths::process_root(pipeline_id))
            .await
        {
            Ok((_, stat)) => Ok(Some(
                ((stat.cversion + stat.num_children) / 2).max(0) as u64,
            )),
            Err(StoreError::NoNode(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn source_cursor(
        &self,
        destination: &str,
        client_id: u16,
    ) -> Result<Option<SourceCursor>> {
        let path = StorePaths::source_cursor(destination, client_id);
        Ok(self.store.read(&path).await?.map(|(data, stat)| SourceCursor {
            position: String::from_utf8_lossy(&data).into_owned(),
            created_at: stat.ctime,
            modified_at: stat.mtime,
        }))
    }

    pub async fn remove_source_cursor(&self, destination: &str, client_id: u16) -> Result<()> {
        let path = StorePaths::source_cursor(destination, client_id);
        self.store.delete(&path).await?;
        Ok(())
    }

    /// Remove a destination's stored state, or only one client's
    pub async fn remove_source(&self, destination: &str, client_id: Option<u16>) -> Result<()> {
        let path = match client_id {
            Some(client_id) => StorePaths::source_client(destination, client_id),
            None => StorePaths::source(destination),
        };
        self.store.delete_recursive(&path).await?;
        Ok(())
    }
}
