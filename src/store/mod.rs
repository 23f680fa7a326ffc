//! Coordination Store
//!
//! The hierarchical, versioned, watchable key-value service every node
//! shares. The arbiter only depends on the [`CoordinationStore`] trait; an
//! in-process implementation lives in `adapters::memory_store`.

pub mod paths;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub use paths::StorePaths;

/// Result type for store calls
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifetime of a created entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// Metadata the store keeps for every entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Data version, bumped on every write
    pub version: i32,
    /// Creation time on the store clock (unix millis)
    pub ctime: i64,
    /// Last modification time on the store clock (unix millis)
    pub mtime: i64,
    /// Child version, bumped on every child create/delete
    pub cversion: i32,
    pub num_children: i32,
    /// Session owning an ephemeral entry
    pub ephemeral_owner: Option<u64>,
}

/// Kind of change carried by a [`StoreEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    Created(Vec<u8>),
    DataChanged(Vec<u8>),
    Deleted,
}

/// Change notification for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub path: String,
    pub kind: StoreEventKind,
}

/// Shared coordination state, seen through one client session
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Session this handle operates under
    fn session_id(&self) -> u64;

    /// Atomically create `path`. Missing ancestors are created persistent.
    ///
    /// Fails with [`StoreError::NodeExists`] when the entry already exists.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<()>;

    /// Read an entry with its stat, `None` when absent
    async fn read(&self, path: &str) -> StoreResult<Option<(Vec<u8>, NodeStat)>>;

    /// Overwrite an entry, optionally conditioned on its current version
    async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat>;

    /// Delete a leaf entry; `false` when it was already gone
    async fn delete(&self, path: &str) -> StoreResult<bool>;

    /// Delete an entry and everything below it
    async fn delete_recursive(&self, path: &str) -> StoreResult<()>;

    /// Child names (unordered) and the parent's stat
    ///
    /// Fails with [`StoreError::NoNode`] when the parent does not exist.
    async fn children(&self, path: &str) -> StoreResult<(Vec<String>, NodeStat)>;

    /// Subscribe to change notifications for every path
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
