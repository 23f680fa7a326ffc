//! Batch selection: producer/consumer orchestration with rollback epochs

pub mod config;
pub mod context;
pub mod gate;
pub mod orchestrator;
pub mod task;
pub mod traits;

pub use config::SelectConfig;
pub use context::{HandoffBuffer, RollbackEpoch, SelectContext};
pub use gate::SelectGate;
pub use orchestrator::{SelectBindings, SelectOrchestrator};
pub use task::{SelectSnapshot, SelectTask};
pub use traits::{
    BatchSource, CompletionChannel, DelayReport, Dispatcher, LeaseCheck, LogStatisticsSink,
    StatisticsSink,
};
