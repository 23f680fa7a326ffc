//! Wiring of the in-process adapters into select bindings

use std::sync::Arc;

use crate::adapters::{LocalChain, MemoryBatchSource};
use crate::config::{LocalConfig, PipelineConfig};
use crate::domain::{NodeId, PipelineId};
use crate::select::{LogStatisticsSink, SelectBindings};
use crate::store::CoordinationStore;

/// In-process collaborators of one pipeline on one node
pub struct LocalPipeline {
    pub pipeline_id: PipelineId,
    pub source: Arc<MemoryBatchSource>,
    pub chain: Arc<LocalChain>,
}

impl LocalPipeline {
    pub fn bindings(&self) -> SelectBindings {
        SelectBindings {
            source: self.source.clone(),
            dispatcher: self.chain.clone(),
            completions: self.chain.clone(),
            stats: Arc::new(LogStatisticsSink),
        }
    }
}

/// Build a memory source and a local stage chain for `pipeline` on `node_id`
pub fn local_bindings(
    pipeline: &PipelineConfig,
    local: &LocalConfig,
    node_id: NodeId,
    store: Arc<dyn CoordinationStore>,
) -> LocalPipeline {
    let pipeline_id = pipeline.pipeline_id();
    let source = Arc::new(MemoryBatchSource::new(pipeline.source_config(), store.clone()));
    let chain = Arc::new(LocalChain::new(
        pipeline_id,
        node_id,
        local.chain_config(),
        store,
    ));
    LocalPipeline {
        pipeline_id,
        source,
        chain,
    }
}
