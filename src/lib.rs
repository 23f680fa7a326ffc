pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod election;
pub mod error;
pub mod logging;
pub mod node;
pub mod select;
pub mod store;
pub mod view;

pub use config::AppConfig;
pub use coordination::{Shutdown, ShutdownSignal, ShutdownToken};
pub use election::{MainstemListener, MainstemMonitor};
pub use error::{ArbiterError, Result};
pub use node::{ArbiterNode, NodeStatus, PipelineStatus};
pub use select::{
    BatchSource, CompletionChannel, Dispatcher, SelectBindings, SelectOrchestrator, SelectTask,
};
pub use store::{CoordinationStore, StorePaths};
pub use view::ProgressView;
