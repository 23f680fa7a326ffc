//! Arbiter node
//!
//! Hosts the pipelines of one process: per pipeline a mainstem monitor and
//! a select task, started and stopped together, released on shutdown.

pub mod local;
pub mod runtime;
pub mod state;

pub use local::{local_bindings, LocalPipeline};
pub use runtime::ArbiterNode;
pub use state::{NodeStatus, PipelineStatus};
