//! Shared state between the select producer and the termination consumer

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, Mutex};

use super::gate::SelectGate;
use crate::domain::{BatchDescriptor, PipelineId};
use crate::error::{ArbiterError, Result};

/// Bounded FIFO of descriptors with an exact pending count
#[derive(Debug)]
pub struct HandoffBuffer {
    tx: mpsc::Sender<BatchDescriptor>,
    rx: Mutex<mpsc::Receiver<BatchDescriptor>>,
    pending: AtomicUsize,
}

impl HandoffBuffer {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    /// Enqueue, waiting while the buffer is full
    pub async fn put(&self, descriptor: BatchDescriptor) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(descriptor).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(ArbiterError::Internal("hand-off buffer closed".into()));
        }
        Ok(())
    }

    /// Dequeue, waiting while the buffer is empty
    pub async fn take(&self) -> Result<BatchDescriptor> {
        let descriptor = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ArbiterError::Internal("hand-off buffer closed".into()))?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Ok(descriptor)
    }

    /// Descriptors enqueued (or being enqueued) and not yet taken
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything currently buffered
    pub async fn clear(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            dropped += 1;
        }
        dropped
    }
}

/// Monotonic counter bumped on every declared rollback
#[derive(Debug, Default)]
pub struct RollbackEpoch(AtomicU64);

impl RollbackEpoch {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Increment and return the new epoch
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Per-pipeline state owned by one orchestrator
#[derive(Debug)]
pub struct SelectContext {
    pub pipeline_id: PipelineId,
    pub buffer: HandoffBuffer,
    pub gate: SelectGate,
    pub epoch: RollbackEpoch,
}

impl SelectContext {
    pub fn new(pipeline_id: PipelineId, capacity: usize) -> Self {
        Self {
            pipeline_id,
            buffer: HandoffBuffer::new(capacity),
            gate: SelectGate::new(false),
            epoch: RollbackEpoch::default(),
        }
    }
}
