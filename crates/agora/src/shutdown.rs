//! # Shutdown Signaling
//!
//! Oneshot-based shutdown fan-out for node components: the wire loop and
//! any auxiliary tasks subscribe once, and the controller signals them all,
//! waiting for each to confirm before returning.

use std::time::Duration;
use tokio::sync::oneshot::{Receiver, Sender};
use tracing::{debug, warn};

/// How long `signal` waits for a component to confirm before giving up
/// on it.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How to wind down: drain bodies first, or stop everything at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let every body drain its queue, then stop.
    Graceful,
    /// Stop at once; queued envelopes fail with target-terminated.
    Immediate,
}

/// A signal telling one component to stop.
#[derive(Debug)]
pub struct ShutdownSignal {
    pub mode: ShutdownMode,
    /// Confirmation channel back to the controller; `None` when the signal
    /// was synthesized after the controller went away.
    pub done: Option<Sender<()>>,
}

/// Broadcasts shutdown signals to every subscriber and waits for their
/// confirmations.
#[derive(Default)]
pub struct ShutdownController {
    subscribers: Vec<Sender<ShutdownSignal>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> ShutdownReceiver {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.subscribers.push(tx);
        ShutdownReceiver { receiver: rx }
    }

    /// Signal every subscriber, then wait up to
    /// [`DEFAULT_SHUTDOWN_TIMEOUT`] for each confirmation. A component
    /// that never confirms is abandoned rather than wedging the caller.
    pub async fn signal(self, mode: ShutdownMode) {
        let mut confirmations = Vec::new();
        for subscriber in self.subscribers {
            let (done, confirmation) = tokio::sync::oneshot::channel();
            confirmations.push(confirmation);
            if subscriber
                .send(ShutdownSignal {
                    mode,
                    done: Some(done),
                })
                .is_err()
            {
                debug!("shutdown subscriber already gone");
            }
        }
        for confirmation in confirmations {
            match tokio::time::timeout(DEFAULT_SHUTDOWN_TIMEOUT, confirmation).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("shutdown subscriber exited without confirming"),
                Err(_) => warn!("shutdown subscriber did not confirm in time"),
            }
        }
    }
}

/// One component's end of the shutdown channel.
pub struct ShutdownReceiver {
    receiver: Receiver<ShutdownSignal>,
}

impl ShutdownReceiver {
    /// Wait for the shutdown signal. If the controller disappeared, a
    /// graceful signal is synthesized so components still wind down.
    pub async fn wait(self) -> ShutdownSignal {
        match self.receiver.await {
            Ok(signal) => signal,
            Err(_) => ShutdownSignal {
                mode: ShutdownMode::Graceful,
                done: None,
            },
        }
    }
}
