//! # Body and Service Loop
//!
//! A [`Body`] is the exclusive owner of one active object's state and its
//! request queue. One tokio task per body runs the service loop: take the
//! next envelope per the active ordering policy, execute it against the
//! owned state, resolve the matching future. Application faults are
//! captured and attached to the future — they never unwind the loop.
//!
//! Exclusivity is a single async mutex around the object. The loop holds it
//! only while a method runs; immediate-mode calls and the migration
//! coordinator acquire the same lock, which is what serializes out-of-band
//! execution and guarantees a quiesced state at cutover.

use crate::behavior::{ActiveObject, CallContext};
use crate::envelope::{ReplyTarget, RequestEnvelope};
use crate::errors::{ApplicationFault, DispatchError, FailurePhase};
use crate::future::CallOutcome;
use crate::id::{ActiveObjectId, NodeAddress};
use crate::queue::{Rejected, RequestQueue, Served, ServingPolicy};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delivers call outcomes to reply targets. The node supplies one that
/// resolves local futures directly and routes remote ones over the wire.
pub(crate) trait ReplySink: Send + Sync {
    fn deliver(&self, target: &ReplyTarget, outcome: CallOutcome);
}

/// Why a service loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// Terminated (graceful drain completed, or halted immediately).
    Terminated,
    /// The queue was cut over to a migration; the body lives on elsewhere.
    CutOver,
}

/// Callback the node installs to observe loop exits.
pub(crate) type ExitHook = Arc<dyn Fn(ActiveObjectId, LoopExit) + Send + Sync>;

/// Why a cutover attempt did not produce a transferable body. The two
/// cases leave the service loop in opposite states, and the coordinator
/// must treat them differently.
#[derive(Debug)]
pub(crate) enum CutoverError {
    /// The queue refused to cut over (the body is terminating). The loop
    /// never stopped and must be left alone.
    Refused,
    /// The snapshot faulted after the queue was cut over. The queue has
    /// been reinstated, but the loop retired at cutover and needs a
    /// respawn.
    Snapshot(ApplicationFault),
}

pub(crate) struct Body {
    pub id: ActiveObjectId,
    pub type_name: String,
    /// Migration generation this instance was installed at.
    pub epoch: u64,
    pub queue: Arc<RequestQueue>,
    address: NodeAddress,
    object: Arc<Mutex<Box<dyn ActiveObject>>>,
}

impl Body {
    /// Create a body and start its service loop.
    pub fn spawn(
        id: ActiveObjectId,
        type_name: String,
        epoch: u64,
        address: NodeAddress,
        policy: ServingPolicy,
        object: Box<dyn ActiveObject>,
        sink: Arc<dyn ReplySink>,
        on_exit: ExitHook,
    ) -> (Arc<Body>, JoinHandle<()>) {
        let body = Arc::new(Body {
            id,
            type_name,
            epoch,
            queue: Arc::new(RequestQueue::new(policy)),
            address,
            object: Arc::new(Mutex::new(object)),
        });
        let task = body.clone().start_loop(sink, on_exit);
        (body, task)
    }

    /// Restart the service loop after an aborted migration cutover.
    pub fn respawn(self: &Arc<Self>, sink: Arc<dyn ReplySink>, on_exit: ExitHook) -> JoinHandle<()> {
        self.clone().start_loop(sink, on_exit)
    }

    fn start_loop(self: Arc<Self>, sink: Arc<dyn ReplySink>, on_exit: ExitHook) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(id = %self.id, epoch = self.epoch, "service loop starting");
            loop {
                match self.queue.serve_next().await {
                    Served::Request(envelope) => {
                        self.execute(envelope, sink.as_ref()).await;
                    }
                    Served::Drained => {
                        debug!(id = %self.id, "queue drained, stopping gracefully");
                        on_exit(self.id, LoopExit::Terminated);
                        break;
                    }
                    Served::Halted(pending) => {
                        debug!(
                            id = %self.id,
                            dropped = pending.len(),
                            "halted, failing queued envelopes"
                        );
                        for envelope in pending {
                            if let Some(target) = &envelope.reply {
                                sink.deliver(
                                    target,
                                    Err(DispatchError::terminated(self.id, FailurePhase::Reply)),
                                );
                            }
                        }
                        on_exit(self.id, LoopExit::Terminated);
                        break;
                    }
                    Served::CutOver => {
                        debug!(id = %self.id, "queue cut over, loop retiring");
                        on_exit(self.id, LoopExit::CutOver);
                        break;
                    }
                }
            }
        })
    }

    /// Execute one envelope against the owned state and deliver the
    /// outcome. Used by the loop for queued envelopes and directly by
    /// immediate-mode callers; the object mutex serializes both.
    pub async fn execute(&self, envelope: RequestEnvelope, sink: &dyn ReplySink) {
        let ctx = CallContext {
            id: self.id,
            node: self.address.clone(),
            epoch: self.epoch,
            sequence: envelope.sequence,
        };
        let outcome = {
            let mut object = self.object.lock().await;
            object
                .dispatch(&ctx, &envelope.method, &envelope.args)
                .map_err(DispatchError::Application)
        };
        match (&envelope.reply, outcome) {
            (Some(target), outcome) => sink.deliver(target, outcome),
            (None, Err(error)) => {
                // One-way calls have nowhere to report to.
                warn!(id = %self.id, method = %envelope.method, %error, "one-way call failed");
            }
            (None, Ok(_)) => {}
        }
    }

    /// Quiesce for migration: atomically close the queue and take its
    /// pending envelopes, wait for any in-flight call to finish, then
    /// snapshot the state. The returned [`CutoverError`] tells the caller
    /// whether the service loop survived the attempt.
    pub async fn cutover(&self) -> Result<(Vec<u8>, Vec<RequestEnvelope>), CutoverError> {
        let pending = self
            .queue
            .begin_cutover()
            .map_err(|_| CutoverError::Refused)?;
        // Acquiring the exclusivity lock waits out the in-flight call.
        let snapshot = {
            let object = self.object.lock().await;
            object.snapshot()
        };
        match snapshot {
            Ok(snapshot) => Ok((snapshot, pending)),
            Err(fault) => {
                self.queue.abort_cutover(pending);
                Err(CutoverError::Snapshot(fault))
            }
        }
    }

    /// Serve an immediate-mode call right now, out-of-band of the queue,
    /// returning the outcome for the caller to deliver.
    ///
    /// The accepting check happens while holding the exclusivity lock:
    /// cutover closes the queue before acquiring the lock, so any immediate
    /// call that gets the lock afterwards sees the closed queue and is
    /// handed back for rerouting instead of mutating state the migration
    /// snapshot already captured.
    pub async fn serve_immediate(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<(Option<ReplyTarget>, CallOutcome), Rejected> {
        let ctx = CallContext {
            id: self.id,
            node: self.address.clone(),
            epoch: self.epoch,
            sequence: envelope.sequence,
        };
        let mut object = self.object.lock().await;
        if let Some(reason) = self.queue.refusal() {
            return Err(Rejected { reason, envelope });
        }
        let outcome = object
            .dispatch(&ctx, &envelope.method, &envelope.args)
            .map_err(DispatchError::Application);
        drop(object);
        Ok((envelope.reply, outcome))
    }
}
