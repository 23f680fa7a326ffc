//! Mainstem Monitor
//!
//! Elects and defends the single active node of a pipeline. Election is a
//! race to create the ephemeral lease entry; whoever creates it owns the
//! pipeline until its session ends, it releases, or the entry is rewritten
//! naming someone else. Ownership is never trusted from memory: every
//! state-changing caller confirms it with [`MainstemMonitor::check`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use super::config::ElectionConfig;
use super::listener::{ListenerHandle, ListenerRegistry, MainstemListener};
use crate::domain::{LeaseStatus, MainstemLease, NodeId, PipelineId};
use crate::error::{ArbiterError, Result, StoreError};
use crate::select::LeaseCheck;
use crate::store::{CoordinationStore, CreateMode, StoreEvent, StoreEventKind, StorePaths};

/// Election participant for one (pipeline, node) pair
pub struct MainstemMonitor {
    pipeline_id: PipelineId,
    node_id: NodeId,
    config: ElectionConfig,
    store: Arc<dyn CoordinationStore>,
    path: String,
    active: watch::Sender<bool>,
    released: AtomicBool,
    current: RwLock<Option<MainstemLease>>,
    listeners: ListenerRegistry,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl MainstemMonitor {
    pub fn new(
        pipeline_id: PipelineId,
        node_id: NodeId,
        config: ElectionConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let (active, _) = watch::channel(false);
        Self {
            pipeline_id,
            node_id,
            config,
            store,
            path: StorePaths::mainstem(pipeline_id),
            active,
            released: AtomicBool::new(false),
            current: RwLock::new(None),
            listeners: ListenerRegistry::default(),
            watcher: Mutex::new(None),
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Local belief of ownership; use [`check`](Self::check) before acting on it
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Last lease observed through a read or notification
    pub async fn current_lease(&self) -> Option<MainstemLease> {
        self.current.read().await.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn MainstemListener>) -> ListenerHandle {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.remove(handle)
    }

    /// Race for the lease. Returns whether this node now owns it.
    pub async fn try_become_active(&self) -> Result<bool> {
        let lease = MainstemLease::taking(self.pipeline_id, self.node_id);
        let data = lease.to_bytes()?;

        loop {
            match self
                .store
                .create(&self.path, data.clone(), CreateMode::Ephemeral)
                .await
            {
                Ok(()) => {
                    info!(pipeline_id = %self.pipeline_id, node_id = %self.node_id, "Took mainstem");
                    *self.current.write().await = Some(lease);
                    self.released.store(false, Ordering::SeqCst);
                    self.enter_active(true).await;
                    return Ok(true);
                }
                Err(StoreError::NodeExists(_)) => {
                    let Some((existing, _)) = self.store.read(&self.path).await? else {
                        debug!("Lease vanished between create and read, retrying");
                        continue;
                    };
                    let existing = MainstemLease::from_bytes(&existing)?;
                    let mine = existing.is_owned_by(self.node_id);
                    *self.current.write().await = Some(existing);

                    if mine {
                        // Session reconnected while we still hold it
                        self.enter_active(false).await;
                    } else {
                        self.exit_active().await;
                    }
                    return Ok(mine);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fresh read of the lease; true only when it names this node
    pub async fn check(&self) -> bool {
        loop {
            match self.store.read(&self.path).await {
                Ok(Some((data, _))) => match MainstemLease::from_bytes(&data) {
                    Ok(lease) => {
                        let mine = lease.is_owned_by(self.node_id);
                        *self.current.write().await = Some(lease);
                        return mine;
                    }
                    Err(e) => {
                        warn!(pipeline_id = %self.pipeline_id, "Unreadable lease: {}", e);
                        return false;
                    }
                },
                Ok(None) => {
                    debug!(pipeline_id = %self.pipeline_id, "No mainstem lease present");
                    return false;
                }
                Err(StoreError::Interrupted) => {
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    warn!(pipeline_id = %self.pipeline_id, "Lease check failed: {}", e);
                    return false;
                }
            }
        }
    }

    /// Give up the lease if held; exit listeners always fire
    pub async fn release(&self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        if self.check().await {
            match self.store.delete(&self.path).await {
                Ok(_) => info!(pipeline_id = %self.pipeline_id, "Released mainstem"),
                Err(e) => warn!(pipeline_id = %self.pipeline_id, "Lease release failed: {}", e),
            }
        }

        self.active.send_replace(false);
        self.listeners.fire_exit(self.pipeline_id).await;
        Ok(())
    }

    /// Enter the election and wait until this node owns the lease
    pub async fn wait_for_active(&self) -> Result<()> {
        let mut rx = self.active.subscribe();
        if let Err(e) = self.try_become_active().await {
            warn!(pipeline_id = %self.pipeline_id, "Election attempt failed: {}", e);
        }
        rx.wait_for(|active| *active)
            .await
            .map_err(|_| ArbiterError::Interrupted)?;
        Ok(())
    }

    /// Mark the lease as backing a running orchestrator
    pub async fn promote(&self) -> Result<bool> {
        if !self.check().await {
            return Ok(false);
        }

        let lease = MainstemLease {
            status: LeaseStatus::Active,
            owner_node_id: self.node_id,
            pipeline_id: self.pipeline_id,
        };
        self.store.write(&self.path, lease.to_bytes()?, None).await?;
        *self.current.write().await = Some(lease);
        info!(pipeline_id = %self.pipeline_id, "Mainstem promoted to active");
        Ok(true)
    }

    /// Spawn the watcher that follows lease notifications
    pub fn start(self: &Arc<Self>) {
        let mut watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if watcher.is_some() {
            return;
        }

        let events = self.store.subscribe();
        let span = info_span!("election", pipeline_id = %self.pipeline_id, node_id = %self.node_id);
        *watcher = Some(tokio::spawn(Arc::clone(self).watch(events).instrument(span)));
    }

    /// Stop watching, then release
    pub async fn stop(&self) -> Result<()> {
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.release().await
    }

    async fn watch(self: Arc<Self>, mut events: broadcast::Receiver<StoreEvent>) {
        let reload = self.config.reload_interval();
        let mut reload_at = Instant::now() + reload;
        let mut retry_at: Option<Instant> = None;

        loop {
            let retry_deadline = retry_at.unwrap_or(reload_at);
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.path == self.path => {
                        if let Some(at) = self.handle_event(event.kind).await {
                            retry_at = Some(at);
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Missed {} store notifications, re-electing", missed);
                        self.elect().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sleep_until(retry_deadline), if retry_at.is_some() => {
                    retry_at = None;
                    self.elect().await;
                }
                _ = sleep_until(reload_at) => {
                    reload_at = Instant::now() + reload;
                    self.elect().await;
                }
            }
        }
        debug!("Lease watcher exited");
    }

    /// React to a lease notification; returns when a delayed election is due
    async fn handle_event(&self, kind: StoreEventKind) -> Option<Instant> {
        match kind {
            StoreEventKind::Deleted => {
                let was_mine = self
                    .current
                    .read()
                    .await
                    .as_ref()
                    .map_or(false, |l| l.is_owned_by(self.node_id));
                let voluntary = self.released.load(Ordering::SeqCst);
                self.exit_active().await;

                if was_mine && !voluntary {
                    warn!("Lost mainstem unexpectedly, re-electing now");
                    self.elect().await;
                    None
                } else {
                    debug!("Mainstem released, re-electing after settle delay");
                    Some(Instant::now() + self.config.settle_delay())
                }
            }
            StoreEventKind::Created(data) => {
                if let Ok(lease) = MainstemLease::from_bytes(&data) {
                    let mine = lease.is_owned_by(self.node_id);
                    *self.current.write().await = Some(lease);
                    if !mine {
                        self.exit_active().await;
                    }
                }
                None
            }
            StoreEventKind::DataChanged(data) => {
                let lease = match MainstemLease::from_bytes(&data) {
                    Ok(lease) => lease,
                    Err(e) => {
                        warn!("Unreadable lease notification: {}", e);
                        return None;
                    }
                };
                let mine = lease.is_owned_by(self.node_id);
                let handoff = mine && lease.status == LeaseStatus::Taking;
                *self.current.write().await = Some(lease);

                if !mine {
                    self.exit_active().await;
                } else if handoff {
                    info!("Handoff requested, releasing mainstem");
                    if let Err(e) = self.release().await {
                        warn!("Handoff release failed: {}", e);
                    }
                }
                None
            }
        }
    }

    async fn elect(&self) {
        if let Err(e) = self.try_become_active().await {
            warn!("Election attempt failed: {}", e);
        }
    }

    async fn enter_active(&self, notify: bool) {
        self.active.send_replace(true);
        if notify {
            self.listeners.fire_enter(self.pipeline_id).await;
        }
    }

    async fn exit_active(&self) {
        if self.active.send_replace(false) {
            self.listeners.fire_exit(self.pipeline_id).await;
        }
    }
}

#[async_trait]
impl LeaseCheck for MainstemMonitor {
    async fn check(&self) -> bool {
        MainstemMonitor::check(self).await
    }
}
