use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::error;

use crate::domain::PipelineId;
use crate::error::Result;

/// Callback for mainstem ownership changes
#[async_trait]
pub trait MainstemListener: Send + Sync {
    async fn on_active_enter(&self, pipeline_id: PipelineId) -> Result<()>;

    async fn on_active_exit(&self, pipeline_id: PipelineId) -> Result<()>;
}

/// Token returned by [`ListenerRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Registered listeners, notified from a snapshot so callbacks may
/// add or remove listeners without deadlocking
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerHandle, Arc<dyn MainstemListener>)>>,
}

impl ListenerRegistry {
    pub fn add(&self, listener: Arc<dyn MainstemListener>) -> ListenerHandle {
        let handle = ListenerHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.write().push((handle, listener));
        handle
    }

    /// Returns false when the handle was not registered
    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn fire_enter(&self, pipeline_id: PipelineId) {
        for listener in self.snapshot() {
            if let Err(e) = listener.on_active_enter(pipeline_id).await {
                error!(pipeline_id = %pipeline_id, "Active-enter listener failed: {}", e);
            }
        }
    }

    pub async fn fire_exit(&self, pipeline_id: PipelineId) {
        for listener in self.snapshot() {
            if let Err(e) = listener.on_active_exit(pipeline_id).await {
                error!(pipeline_id = %pipeline_id, "Active-exit listener failed: {}", e);
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn MainstemListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ListenerHandle, Arc<dyn MainstemListener>)>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArbiterError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        enters: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MainstemListener for Counting {
        async fn on_active_enter(&self, _: PipelineId) -> Result<()> {
            self.enters.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ArbiterError::Internal("listener exploded".into()));
            }
            Ok(())
        }

        async fn on_active_exit(&self, _: PipelineId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_fanout() {
        let registry = ListenerRegistry::default();
        let failing = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Counting::default());
        registry.add(failing.clone());
        registry.add(healthy.clone());

        registry.fire_enter(PipelineId(1)).await;
        assert_eq!(failing.enters.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.enters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let registry = ListenerRegistry::default();
        let listener = Arc::new(Counting::default());
        let handle = registry.add(listener.clone());

        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        registry.fire_enter(PipelineId(1)).await;
        assert_eq!(listener.enters.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }
}
