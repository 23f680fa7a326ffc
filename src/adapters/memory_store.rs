//! In-Memory Coordination Store
//!
//! A process-local [`CoordinationStore`] with sessions, ephemeral entries,
//! data/child versions and change broadcast. Every node in a single process
//! opens its own [`MemorySession`] against one shared [`MemoryStore`], which
//! is how the local run mode and the integration tests simulate a cluster.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{CoordinationStore, CreateMode, NodeStat, StoreEvent, StoreEventKind, StoreResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    stat: NodeStat,
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    expired: HashSet<u64>,
    last_tick: i64,
}

impl Tree {
    /// Store clock, never moving backwards
    fn tick(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis().max(self.last_tick);
        self.last_tick = now;
        now
    }

    fn parent_of(path: &str) -> Option<&str> {
        match path.rfind('/') {
            Some(0) | None => None,
            Some(idx) => Some(&path[..idx]),
        }
    }

    fn child_prefix(path: &str) -> String {
        format!("{}/", path)
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = Self::child_prefix(path);
        self.entries
            .range(prefix.clone()..)
            .next()
            .map_or(false, |(key, _)| key.starts_with(&prefix))
    }

    fn bump_parent(&mut self, path: &str, delta: i32) {
        if let Some(parent) = Self::parent_of(path) {
            if let Some(entry) = self.entries.get_mut(parent) {
                entry.stat.cversion += 1;
                entry.stat.num_children += delta;
            }
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, owner: Option<u64>) -> NodeStat {
        let now = self.tick();
        let stat = NodeStat {
            version: 0,
            ctime: now,
            mtime: now,
            cversion: 0,
            num_children: 0,
            ephemeral_owner: owner,
        };
        self.entries.insert(path.to_string(), Entry { data, stat });
        self.bump_parent(path, 1);
        stat
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.entries.remove(path).is_some() {
            self.bump_parent(path, -1);
            true
        } else {
            false
        }
    }
}

/// Shared backing tree for every session of one simulated cluster
pub struct MemoryStore {
    tree: Mutex<Tree>,
    events: broadcast::Sender<StoreEvent>,
    next_session: AtomicU64,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            tree: Mutex::new(Tree::default()),
            events,
            next_session: AtomicU64::new(1),
            offline: AtomicBool::new(false),
        })
    }

    /// Open a new client session
    pub fn session(self: &Arc<Self>) -> MemorySession {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        debug!("Opened store session {}", id);
        MemorySession {
            store: Arc::clone(self),
            id,
        }
    }

    /// End a session as if its client crashed: its ephemeral entries vanish
    /// and every further call through it fails with `SessionExpired`.
    pub fn expire_session(&self, session_id: u64) {
        let removed = {
            let mut tree = self.lock();
            tree.expired.insert(session_id);
            let owned: Vec<String> = tree
                .entries
                .iter()
                .filter(|(_, e)| e.stat.ephemeral_owner == Some(session_id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                tree.remove(path);
            }
            owned
        };

        info!("Store session {} expired, {} ephemeral entries removed", session_id, removed.len());
        for path in removed {
            self.publish(path, StoreEventKind::Deleted);
        }
    }

    /// Simulate a network partition: every call fails with `ConnectionLoss`
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, path: String, kind: StoreEventKind) {
        // No subscribers is fine
        let _ = self.events.send(StoreEvent { path, kind });
    }

    fn guard(&self, session_id: u64) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss("store offline".into()));
        }
        if self.lock().expired.contains(&session_id) {
            return Err(StoreError::SessionExpired(session_id));
        }
        Ok(())
    }
}

/// One client's view of a [`MemoryStore`]
#[derive(Clone)]
pub struct MemorySession {
    store: Arc<MemoryStore>,
    id: u64,
}

impl MemorySession {
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Close the session cleanly, dropping its ephemeral entries
    pub fn close(&self) {
        self.store.expire_session(self.id);
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<()> {
        self.store.guard(self.id)?;
        let mut created = Vec::new();
        {
            let mut tree = self.store.lock();
            if tree.entries.contains_key(path) {
                return Err(StoreError::NodeExists(path.to_string()));
            }

            let mut missing = Vec::new();
            let mut cursor = Tree::parent_of(path);
            while let Some(ancestor) = cursor {
                if tree.entries.contains_key(ancestor) {
                    break;
                }
                missing.push(ancestor.to_string());
                cursor = Tree::parent_of(ancestor);
            }
            for ancestor in missing.into_iter().rev() {
                tree.insert(&ancestor, Vec::new(), None);
                created.push((ancestor, Vec::new()));
            }

            let owner = match mode {
                CreateMode::Ephemeral => Some(self.id),
                CreateMode::Persistent => None,
            };
            tree.insert(path, data.clone(), owner);
            created.push((path.to_string(), data));
        }

        for (path, data) in created {
            self.store.publish(path, StoreEventKind::Created(data));
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> StoreResult<Option<(Vec<u8>, NodeStat)>> {
        self.store.guard(self.id)?;
        let tree = self.store.lock();
        Ok(tree.entries.get(path).map(|e| (e.data.clone(), e.stat)))
    }

    async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i32>,
    ) -> StoreResult<NodeStat> {
        self.store.guard(self.id)?;
        let stat = {
            let mut tree = self.store.lock();
            let now = tree.tick();
            let entry = tree
                .entries
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version {
                if entry.stat.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: entry.stat.version,
                    });
                }
            }
            entry.data = data.clone();
            entry.stat.version += 1;
            entry.stat.mtime = now;
            entry.stat
        };

        self.store
            .publish(path.to_string(), StoreEventKind::DataChanged(data));
        Ok(stat)
    }

    async fn delete(&self, path: &str) -> StoreResult<bool> {
        self.store.guard(self.id)?;
        let removed = {
            let mut tree = self.store.lock();
            if tree.has_children(path) {
                return Err(StoreError::NotEmpty(path.to_string()));
            }
            tree.remove(path)
        };

        if removed {
            self.store.publish(path.to_string(), StoreEventKind::Deleted);
        }
        Ok(removed)
    }

    async fn delete_recursive(&self, path: &str) -> StoreResult<()> {
        self.store.guard(self.id)?;
        let removed = {
            let mut tree = self.store.lock();
            let prefix = Tree::child_prefix(path);
            let mut doomed: Vec<String> = tree
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            // Deepest first so parent counters stay consistent
            doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
            doomed.push(path.to_string());
            doomed.retain(|p| tree.remove(p));
            doomed
        };

        for path in removed {
            self.store.publish(path, StoreEventKind::Deleted);
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<(Vec<String>, NodeStat)> {
        self.store.guard(self.id)?;
        let tree = self.store.lock();
        let stat = tree
            .entries
            .get(path)
            .map(|e| e.stat)
            .ok_or_else(|| StoreError::NoNode(path.to_string()))?;

        let prefix = Tree::child_prefix(path);
        let names = tree
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok((names, stat))
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.events.subscribe()
    }
}
