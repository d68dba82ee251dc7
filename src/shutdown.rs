//! Graceful Shutdown Module
//!
//! Signal handling and shutdown fan-out. Listeners subscribe a
//! [`ShutdownSignal`] and stop accepting when it fires; cache writes still in
//! flight are given `shutdown_timeout` to commit or abort before the process
//! exits.

use crate::{ProxyError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
    cache_writes: Option<InFlightWrites>,
}

impl ShutdownCoordinator {
    /// Create new shutdown coordinator
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            shutdown_sender,
            shutdown_timeout,
            cache_writes: None,
        }
    }

    /// Wait for these cache writes during shutdown
    pub fn set_cache_writes(&mut self, cache_writes: InFlightWrites) {
        self.cache_writes = Some(cache_writes);
    }

    /// Get a shutdown signal for a component
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    /// Start listening for shutdown signals
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        // Listen for SIGINT (Ctrl+C) and SIGTERM
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Notify all subscribers, then wait for pending cache writes
    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No listener is running any more
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        let Some(cache_writes) = &self.cache_writes else {
            return Ok(());
        };

        let pending = cache_writes.count();
        if pending > 0 {
            info!("Waiting for {} cache writes to finish", pending);
        }

        match timeout(self.shutdown_timeout, cache_writes.wait_idle()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?} with {} cache writes pending",
                    self.shutdown_timeout,
                    cache_writes.count()
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    /// Create new shutdown signal from receiver
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    /// A second signal fed by the same sender
    pub fn resubscribe(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_requested: self.shutdown_requested,
        }
    }

    /// Check if shutdown has been requested (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal
    ///
    /// A closed or lagged channel counts as a shutdown request.
    pub async fn wait_for_shutdown(&mut self) {
        if self.shutdown_requested {
            return;
        }
        if let Err(broadcast::error::RecvError::Lagged(skipped)) = self.receiver.recv().await {
            warn!("Shutdown signal lagged by {} messages", skipped);
        }
        self.shutdown_requested = true;
    }
}

/// Count of cache writes still running
#[derive(Clone, Default)]
pub struct InFlightWrites {
    inner: Arc<InFlightInner>,
}

#[derive(Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one write; it is done when the guard drops
    pub fn track(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Resolve once no write is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks one in-flight cache write
pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
