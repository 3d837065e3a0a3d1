//! Process supervision: shutdown requests from signals and the operator.
//!
//! The tick loop samples [`Supervisor::is_shutting_down`] once per
//! iteration. Requests can come from any thread.

use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Line an operator types on stdin to stop the node.
pub const QUIT_COMMAND: &str = "q";

/// Shutdown signal manager.
pub struct Supervisor {
    /// Send side of the shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Receive side of the shutdown signal (clonable).
    shutdown_rx: watch::Receiver<bool>,
    /// Shutdown requests received, including repeats.
    requests: AtomicU64,
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            requests: AtomicU64::new(0),
        }
    }

    /// Get a receiver that will be notified on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown. Repeat requests are harmless.
    pub fn shutdown(&self, source: &str) {
        let previous = self.requests.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            info!(source, "Supervisor: initiating graceful shutdown");
        } else {
            debug!(source, "Supervisor: shutdown already requested");
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Number of shutdown requests received.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Request shutdown on Ctrl-C.
    pub fn spawn_signal_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => supervisor.shutdown("interrupt signal"),
                Err(e) => warn!(error = %e, "Supervisor: unable to listen for interrupt"),
            }
        })
    }

    /// Request shutdown when the operator enters `q` on stdin.
    ///
    /// Runs on its own thread since stdin reads block.
    pub fn spawn_keystroke_listener(self: &Arc<Self>) -> std::io::Result<std::thread::JoinHandle<()>> {
        let supervisor = Arc::clone(self);
        std::thread::Builder::new()
            .name("holonet-stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                supervisor.watch_operator_input(stdin.lock());
            })
    }

    /// Read lines until the quit command or end of input.
    ///
    /// End of input (a detached stdin) does not request shutdown.
    pub fn watch_operator_input(&self, input: impl BufRead) {
        for line in input.lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case(QUIT_COMMAND) => {
                    self.shutdown("operator");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Supervisor: stdin read failed");
                    return;
                }
            }
        }
        debug!("Supervisor: stdin closed");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
