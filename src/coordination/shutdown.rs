//! Graceful Shutdown Handler
//!
//! Coordinates node shutdown: pipeline tasks observe a [`ShutdownToken`],
//! stop their select loops, and release their leases so another node can
//! take over without waiting for session expiry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - skip waiting for pipelines
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for pipeline tasks to stop (default: 30s)
    pub pipeline_stop_timeout_secs: u64,
    /// Time to wait for lease release (default: 10s)
    pub release_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            pipeline_stop_timeout_secs: 30,
            release_timeout_secs: 10,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Select tasks are stopping
    StoppingPipelines,
    /// Leases are being released
    ReleasingLeases,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingPipelines => write!(f, "stopping_pipelines"),
            ShutdownPhase::ReleasingLeases => write!(f, "releasing_leases"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, Error)]
pub enum ShutdownError {
    #[error("shutdown phase {0} timed out")]
    Timeout(ShutdownPhase),
}

/// Shutdown coordinator shared by every pipeline task of a node
pub struct Shutdown {
    config: ShutdownConfig,
    requested: AtomicBool,
    signal: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl Shutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            requested: AtomicBool::new(false),
            signal,
            phase,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown with specified signal type
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        self.signal.send_replace(Some(signal));
    }

    /// Token observed by tasks that must stop on shutdown
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            signal_rx: self.signal.subscribe(),
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Run the shutdown sequence: stop pipelines, then release leases.
    ///
    /// Urgent shutdowns skip waiting for pipelines to stop.
    pub async fn execute<S, R>(&self, stop_pipelines: S, release_leases: R) -> Result<(), ShutdownError>
    where
        S: Future<Output = ()>,
        R: Future<Output = ()>,
    {
        let urgent = *self.signal.borrow() == Some(ShutdownSignal::Urgent);

        self.set_phase(ShutdownPhase::StoppingPipelines);
        if urgent {
            debug!("Urgent shutdown, not waiting for pipelines");
        } else {
            let timeout = Duration::from_secs(self.config.pipeline_stop_timeout_secs);
            if tokio::time::timeout(timeout, stop_pipelines).await.is_err() {
                warn!(
                    "Pipelines did not stop within {}s, proceeding anyway",
                    self.config.pipeline_stop_timeout_secs
                );
            }
        }

        self.set_phase(ShutdownPhase::ReleasingLeases);
        let timeout = Duration::from_secs(self.config.release_timeout_secs);
        let released = tokio::time::timeout(timeout, release_leases).await;

        self.set_phase(ShutdownPhase::Complete);
        match released {
            Ok(()) => Ok(()),
            Err(_) => {
                error!("Lease release timed out after {}s", self.config.release_timeout_secs);
                Err(ShutdownError::Timeout(ShutdownPhase::ReleasingLeases))
            }
        }
    }
}

/// Token for checking shutdown status in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    signal_rx: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        self.signal_rx.borrow().is_some()
    }

    /// Resolves once shutdown is requested
    pub async fn cancelled(&mut self) -> ShutdownSignal {
        match self.signal_rx.wait_for(|signal| signal.is_some()).await {
            Ok(signal) => (*signal).unwrap_or(ShutdownSignal::Urgent),
            // Coordinator dropped
            Err(_) => ShutdownSignal::Urgent,
        }
    }
}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<Shutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, level) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                match signal(kind) {
                    Ok(mut stream) => {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(level);
                    }
                    Err(e) => error!("Failed to install {} handler: {}", name, e),
                }
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}
