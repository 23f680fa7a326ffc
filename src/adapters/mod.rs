//! In-process adapters: a coordination store, a batch source and a stage
//! chain. Together they run a complete pipeline without external services.

pub mod local_chain;
pub mod memory_source;
pub mod memory_store;

pub use local_chain::{LocalChain, LocalChainConfig};
pub use memory_source::{MemoryBatchSource, MemorySourceConfig};
pub use memory_store::{MemorySession, MemoryStore};
