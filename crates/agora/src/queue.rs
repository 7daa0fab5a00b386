//! # Request Queue
//!
//! Multi-producer/single-consumer queue owned by one body. Producers are
//! arbitrary surrogate threads; the sole consumer is the body's service
//! loop. A short mutex guards the entries and the lifecycle state together,
//! so queue cutover during migration (close + drain) is one atomic step and
//! no envelope can slip between the two.
//!
//! Exactly one ordering policy governs the queue at any time, fixed at
//! creation: oldest-first (the default) or newest-first. Immediate-mode
//! calls never pass through the queue at all.

use crate::envelope::RequestEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Ordering policy for selecting the next envelope to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServingPolicy {
    /// Serve the oldest queued envelope first.
    #[default]
    Fifo,
    /// Serve the most recently queued envelope first.
    NewestFirst,
}

/// Why an enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The body has terminated (or is draining toward termination).
    Terminated,
    /// The body has migrated away; the node-level forwarder decides what
    /// happens to the envelope next.
    Migrated,
}

/// A refused enqueue, handing the envelope back so the caller can redirect
/// or fail it.
#[derive(Debug)]
pub struct Rejected {
    pub reason: RejectReason,
    pub envelope: RequestEnvelope,
}

/// What the service loop should do next.
#[derive(Debug)]
pub enum Served {
    /// Execute this envelope.
    Request(RequestEnvelope),
    /// Graceful drain complete: stop cleanly.
    Drained,
    /// Immediate termination: fail these still-queued envelopes and stop.
    Halted(Vec<RequestEnvelope>),
    /// Queue was cut over to a migration; stop without touching anything.
    CutOver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Accepting,
    Draining,
    Terminated,
    Migrating,
}

struct QueueInner {
    entries: VecDeque<RequestEnvelope>,
    state: QueueState,
}

pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    policy: ServingPolicy,
    available: Notify,
}

impl RequestQueue {
    pub fn new(policy: ServingPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                state: QueueState::Accepting,
            }),
            policy,
            available: Notify::new(),
        }
    }

    pub fn policy(&self) -> ServingPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the queue accepts new envelopes (not terminating, not
    /// cut over to a migration).
    pub fn is_accepting(&self) -> bool {
        self.inner.lock().unwrap().state == QueueState::Accepting
    }

    /// Why an enqueue would be refused right now, if it would be.
    pub fn refusal(&self) -> Option<RejectReason> {
        match self.inner.lock().unwrap().state {
            QueueState::Accepting => None,
            QueueState::Draining | QueueState::Terminated => Some(RejectReason::Terminated),
            QueueState::Migrating => Some(RejectReason::Migrated),
        }
    }

    /// Append an envelope. Always succeeds while the body is accepting;
    /// fails fast once it has terminated or migrated away, handing the
    /// envelope back to the caller.
    pub fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), Rejected> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                QueueState::Accepting => inner.entries.push_back(envelope),
                QueueState::Draining | QueueState::Terminated => {
                    return Err(Rejected {
                        reason: RejectReason::Terminated,
                        envelope,
                    })
                }
                QueueState::Migrating => {
                    return Err(Rejected {
                        reason: RejectReason::Migrated,
                        envelope,
                    })
                }
            }
        }
        self.available.notify_waiters();
        Ok(())
    }

    /// Select the next action for the service loop, suspending while the
    /// queue is empty and still accepting. This is the loop's only
    /// suspension point.
    pub async fn serve_next(&self) -> Served {
        loop {
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    QueueState::Terminated => {
                        return Served::Halted(inner.entries.drain(..).collect());
                    }
                    QueueState::Migrating => return Served::CutOver,
                    QueueState::Accepting | QueueState::Draining => {
                        let picked = match self.policy {
                            ServingPolicy::Fifo => inner.entries.pop_front(),
                            ServingPolicy::NewestFirst => inner.entries.pop_back(),
                        };
                        if let Some(envelope) = picked {
                            return Served::Request(envelope);
                        }
                        if inner.state == QueueState::Draining {
                            return Served::Drained;
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Begin termination. Graceful termination lets the loop drain what is
    /// already queued; immediate termination halts it at once. Returns
    /// `false` without changing anything while a migration cutover is in
    /// flight; the caller retries once the migration settles, following
    /// the body wherever it lands.
    pub fn terminate(&self, immediate: bool) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                QueueState::Migrating => return false,
                QueueState::Terminated => return true,
                QueueState::Accepting | QueueState::Draining => {
                    inner.state = if immediate {
                        QueueState::Terminated
                    } else {
                        QueueState::Draining
                    };
                }
            }
        }
        self.available.notify_waiters();
        true
    }

    /// Atomically close the queue for migration and take every pending
    /// envelope, in original relative order. Fails if the queue is not in
    /// the plain accepting state.
    pub fn begin_cutover(&self) -> Result<Vec<RequestEnvelope>, RejectReason> {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                QueueState::Accepting => {
                    inner.state = QueueState::Migrating;
                    inner.entries.drain(..).collect()
                }
                QueueState::Draining | QueueState::Terminated => {
                    return Err(RejectReason::Terminated)
                }
                QueueState::Migrating => return Err(RejectReason::Migrated),
            }
        };
        self.available.notify_waiters();
        Ok(pending)
    }

    /// Undo a cutover after a failed migration: reinstate the drained
    /// envelopes ahead of anything that arrived since, and reopen.
    pub fn abort_cutover(&self, pending: Vec<RequestEnvelope>) {
        {
            let mut inner = self.inner.lock().unwrap();
            for envelope in pending.into_iter().rev() {
                inner.entries.push_front(envelope);
            }
            inner.state = QueueState::Accepting;
        }
        self.available.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CallMode;

    fn envelope(seq: u64) -> RequestEnvelope {
        RequestEnvelope::new("m", vec![], None, seq, CallMode::Async)
    }

    fn served_seq(served: Served) -> u64 {
        match served {
            Served::Request(env) => env.sequence,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fifo_serves_oldest_first() {
        let queue = RequestQueue::new(ServingPolicy::Fifo);
        for seq in 0..3 {
            queue.enqueue(envelope(seq)).unwrap();
        }
        assert_eq!(served_seq(queue.serve_next().await), 0);
        assert_eq!(served_seq(queue.serve_next().await), 1);
        assert_eq!(served_seq(queue.serve_next().await), 2);
    }

    #[tokio::test]
    async fn newest_first_serves_latest() {
        let queue = RequestQueue::new(ServingPolicy::NewestFirst);
        for seq in 0..3 {
            queue.enqueue(envelope(seq)).unwrap();
        }
        assert_eq!(served_seq(queue.serve_next().await), 2);
        assert_eq!(served_seq(queue.serve_next().await), 1);
        assert_eq!(served_seq(queue.serve_next().await), 0);
    }

    #[tokio::test]
    async fn immediate_termination_hands_back_pending() {
        let queue = RequestQueue::new(ServingPolicy::Fifo);
        queue.enqueue(envelope(1)).unwrap();
        queue.enqueue(envelope(2)).unwrap();
        queue.terminate(true);
        match queue.serve_next().await {
            Served::Halted(pending) => {
                assert_eq!(pending.len(), 2);
            }
            other => panic!("expected halt, got {other:?}"),
        }
        assert_eq!(
            queue.enqueue(envelope(3)).unwrap_err().reason,
            RejectReason::Terminated
        );
    }

    #[tokio::test]
    async fn graceful_termination_drains_first() {
        let queue = RequestQueue::new(ServingPolicy::Fifo);
        queue.enqueue(envelope(1)).unwrap();
        queue.terminate(false);
        assert_eq!(
            queue.enqueue(envelope(2)).unwrap_err().reason,
            RejectReason::Terminated
        );
        assert_eq!(served_seq(queue.serve_next().await), 1);
        assert!(matches!(queue.serve_next().await, Served::Drained));
    }

    #[tokio::test]
    async fn termination_is_refused_mid_cutover() {
        let queue = RequestQueue::new(ServingPolicy::Fifo);
        queue.enqueue(envelope(1)).unwrap();

        let pending = queue.begin_cutover().unwrap();
        assert!(!queue.terminate(false));
        // The cutover is untouched by the refused attempt.
        assert_eq!(queue.refusal(), Some(RejectReason::Migrated));

        queue.abort_cutover(pending);
        assert!(queue.terminate(false));
        assert_eq!(served_seq(queue.serve_next().await), 1);
        assert!(matches!(queue.serve_next().await, Served::Drained));
    }

    #[tokio::test]
    async fn cutover_is_atomic_and_reversible() {
        let queue = RequestQueue::new(ServingPolicy::Fifo);
        queue.enqueue(envelope(1)).unwrap();
        queue.enqueue(envelope(2)).unwrap();

        let pending = queue.begin_cutover().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(!queue.is_accepting());
        assert_eq!(
            queue.enqueue(envelope(3)).unwrap_err().reason,
            RejectReason::Migrated
        );
        assert!(matches!(queue.serve_next().await, Served::CutOver));

        queue.abort_cutover(pending);
        queue.enqueue(envelope(3)).unwrap();
        assert_eq!(served_seq(queue.serve_next().await), 1);
        assert_eq!(served_seq(queue.serve_next().await), 2);
        assert_eq!(served_seq(queue.serve_next().await), 3);
    }
}
