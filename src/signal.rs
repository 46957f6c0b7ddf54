//! Signal handling for graceful shutdown.
//!
//! SIGINT and SIGTERM flip a process-wide flag; the reconciler observes it
//! at the next 1-second loop quantum and exits after the in-flight tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(test)]
pub fn reset_shutdown() {
    SHUTDOWN_REQUESTED.store(false, Ordering::Relaxed);
}

/// Spawns the signal listener task on construction.
///
/// Registration can fail in containers or restricted environments; the
/// daemon then runs without graceful shutdown rather than refusing to start.
pub struct ShutdownGuard {
    _marker: (),
}

impl ShutdownGuard {
    pub fn new() -> Self {
        tokio::spawn(async move {
            let sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGINT handler: {}", e);
                    None
                }
            };

            let sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {}", e);
                    None
                }
            };

            match (sigint, sigterm) {
                (Some(mut int), Some(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => {
                            info!("Received SIGINT, stopping after current sync");
                            request_shutdown();
                        }
                        _ = term.recv() => {
                            info!("Received SIGTERM, stopping after current sync");
                            request_shutdown();
                        }
                    }
                }
                (Some(mut int), None) => {
                    int.recv().await;
                    info!("Received SIGINT, stopping after current sync");
                    request_shutdown();
                }
                (None, Some(mut term)) => {
                    term.recv().await;
                    info!("Received SIGTERM, stopping after current sync");
                    request_shutdown();
                }
                (None, None) => {
                    warn!("No signal handlers registered, graceful shutdown disabled");
                }
            }
        });

        Self { _marker: () }
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle the reconciler polls between loop quanta. Cancelling a
/// token stops only holders of that token; a process signal stops everyone.
#[derive(Clone)]
pub struct ShutdownToken {
    flag: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || is_shutdown_requested()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
