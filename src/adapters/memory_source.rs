//! In-Memory Batch Source
//!
//! An append-only change log with a committed read position. Batches are
//! handed out in order, must be acknowledged in the same order, and any
//! rollback rewinds reading to the last acknowledged position so the rows
//! are fetched again. The committed position is mirrored to the
//! coordination store as the source cursor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::domain::{Batch, BatchId, ChangeRow};
use crate::error::{ArbiterError, Result, StoreError};
use crate::select::BatchSource;
use crate::store::{CoordinationStore, CreateMode, StorePaths};

/// Configuration for [`MemoryBatchSource`]
#[derive(Debug, Clone)]
pub struct MemorySourceConfig {
    /// Destination name used in the cursor path
    pub destination: String,
    pub client_id: u16,
    /// Maximum rows per batch
    pub batch_size: usize,
    /// How long a fetch waits for new rows before returning an empty batch
    pub poll_interval_ms: u64,
}

impl Default for MemorySourceConfig {
    fn default() -> Self {
        Self {
            destination: "local".to_string(),
            client_id: 1001,
            batch_size: 100,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    batch_id: BatchId,
    end: u64,
}

#[derive(Debug, Default)]
struct LogState {
    /// Rows at absolute positions `base..base + rows.len()`
    rows: VecDeque<ChangeRow>,
    base: u64,
    committed: u64,
    read_pos: u64,
    outstanding: VecDeque<Outstanding>,
    next_batch_id: u64,
    last_entry_time: Option<i64>,
}

impl LogState {
    fn head(&self) -> u64 {
        self.base + self.rows.len() as u64
    }

    fn rewind(&mut self) -> u64 {
        let dropped = self.read_pos - self.committed;
        self.read_pos = self.committed;
        self.outstanding.clear();
        dropped
    }
}

/// Batch source over an in-process change log
pub struct MemoryBatchSource {
    config: MemorySourceConfig,
    store: Arc<dyn CoordinationStore>,
    state: Mutex<LogState>,
    appended: Notify,
    started: AtomicBool,
}

impl MemoryBatchSource {
    pub fn new(config: MemorySourceConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(LogState {
                next_batch_id: 1,
                ..Default::default()
            }),
            appended: Notify::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Append captured changes to the log
    pub fn append(&self, rows: impl IntoIterator<Item = ChangeRow>) {
        let added = {
            let mut state = self.lock();
            let before = state.rows.len();
            state.rows.extend(rows);
            state.rows.len() - before
        };
        if added > 0 {
            self.appended.notify_waiters();
        }
    }

    /// Rows appended but not yet acknowledged
    pub fn backlog(&self) -> u64 {
        let state = self.lock();
        state.head() - state.committed
    }

    pub fn committed_position(&self) -> u64 {
        self.lock().committed
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cursor_path(&self) -> String {
        StorePaths::source_cursor(&self.config.destination, self.config.client_id)
    }

    fn take_batch(&self, allow_empty: bool) -> Option<Batch> {
        let mut state = self.lock();
        let available = state.head() - state.read_pos;
        if available == 0 && !allow_empty {
            return None;
        }

        let count = available.min(self.config.batch_size as u64);
        let offset = (state.read_pos - state.base) as usize;
        let rows: Vec<ChangeRow> = state
            .rows
            .iter()
            .skip(offset)
            .take(count as usize)
            .cloned()
            .collect();

        let batch_id = BatchId(state.next_batch_id);
        state.next_batch_id += 1;
        state.read_pos += count;
        let end = state.read_pos;
        state.outstanding.push_back(Outstanding { batch_id, end });
        Some(Batch::new(batch_id, rows))
    }

    async fn persist_cursor(&self, position: u64) -> Result<()> {
        let path = self.cursor_path();
        let data = position.to_string().into_bytes();
        match self.store.write(&path, data.clone(), None).await {
            Ok(_) => Ok(()),
            Err(StoreError::NoNode(_)) => {
                match self.store.create(&path, data, CreateMode::Persistent).await {
                    Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_cursor(&self) -> Result<Option<u64>> {
        let Some((data, _)) = self.store.read(&self.cursor_path()).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&data);
        text.trim().parse::<u64>().map(Some).map_err(|e| {
            ArbiterError::BatchSource(format!("unreadable cursor '{}': {}", text, e))
        })
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ArbiterError::BatchSource(format!(
                "source {}/{} is not started",
                self.config.destination, self.config.client_id
            )))
        }
    }
}

#[async_trait]
impl BatchSource for MemoryBatchSource {
    async fn start(&self) -> Result<()> {
        let persisted = self.load_cursor().await?;
        {
            let mut state = self.lock();
            if let Some(position) = persisted {
                if position > state.committed && position <= state.head() {
                    let skip = (position - state.base) as usize;
                    state.rows.drain(..skip);
                    state.base = position;
                    state.committed = position;
                    state.read_pos = position;
                }
            }
            state.read_pos = state.read_pos.max(state.committed);
            state.rewind();
            info!(
                destination = %self.config.destination,
                client_id = self.config.client_id,
                "Batch source started at position {}",
                state.committed
            );
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::SeqCst) {
            let dropped = self.lock().rewind();
            info!("Batch source stopped, {} unacknowledged rows will be re-read", dropped);
        }
        self.appended.notify_waiters();
        Ok(())
    }

    async fn fetch_next(&self) -> Result<Batch> {
        self.ensure_started()?;

        let notified = self.appended.notified();
        if let Some(batch) = self.take_batch(false) {
            return Ok(batch);
        }

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let _ = tokio::time::timeout(poll, notified).await;
        self.ensure_started()?;

        let batch = self.take_batch(true).unwrap_or_else(|| Batch::empty(BatchId(0)));
        debug!("Fetched batch {} with {} rows", batch.batch_id, batch.len());
        Ok(batch)
    }

    async fn acknowledge(&self, batch_id: BatchId) -> Result<()> {
        let position = {
            let mut state = self.lock();
            match state.outstanding.front() {
                Some(front) if front.batch_id == batch_id => {}
                Some(front) => {
                    return Err(ArbiterError::BatchSource(format!(
                        "ack for batch {} but oldest outstanding batch is {}",
                        batch_id, front.batch_id
                    )))
                }
                None => {
                    return Err(ArbiterError::BatchSource(format!(
                        "ack for batch {} with nothing outstanding",
                        batch_id
                    )))
                }
            }

            let Some(acked) = state.outstanding.pop_front() else {
                return Ok(());
            };
            let consumed = (acked.end - state.base) as usize;
            if let Some(last) = state.rows.get(consumed.wrapping_sub(1)) {
                state.last_entry_time = Some(last.execute_time);
            }
            state.rows.drain(..consumed);
            state.base = acked.end;
            state.committed = acked.end;
            acked.end
        };

        self.persist_cursor(position).await
    }

    async fn rollback(&self, batch_id: Option<BatchId>) -> Result<()> {
        let dropped = self.lock().rewind();
        match batch_id {
            Some(id) => warn!("Rolled back source at batch {}, {} rows will be re-read", id, dropped),
            None => warn!("Rolled back source, {} rows will be re-read", dropped),
        }
        Ok(())
    }

    async fn discard_uncommitted(&self) -> Result<()> {
        let dropped = self.lock().rewind();
        if dropped > 0 {
            debug!("Discarded {} uncommitted rows", dropped);
        }
        Ok(())
    }

    fn last_entry_time(&self) -> Option<i64> {
        self.lock().last_entry_time
    }
}
