//! # Migration
//!
//! Relocates a body to another node without losing identity, dropping
//! queued requests, or invalidating handles callers already hold. The
//! coordinator runs on the owning node: quiesce, snapshot, transfer, then
//! either commit (directory update + forwarding shim at the old address)
//! or abort atomically with the source body resumed unchanged.
//!
//! The forwarding shim is deliberately time-bounded: inside the configured
//! grace period, straggling requests sent with stale location info are
//! redirected to the new address; after expiry they fail with a
//! target-terminated error.

use crate::body::CutoverError;
use crate::envelope::ReplyTarget;
use crate::errors::{DispatchError, FailurePhase};
use crate::future::reply_slot;
use crate::id::{ActiveObjectId, NodeAddress};
use crate::node::NodeShared;
use crate::transport::{Transport, WireMessage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Result of one migration attempt, as handed to rebalancing logic and
/// carried in lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationTicket {
    pub id: ActiveObjectId,
    pub source: NodeAddress,
    pub destination: NodeAddress,
    /// Number of envelopes still queued at cutover, all of which execute
    /// exactly once at the destination on success.
    pub pending_at_cutover: usize,
    pub outcome: MigrationOutcome,
    /// Milliseconds since the Unix epoch.
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationOutcome {
    Completed,
    Failed { reason: String },
}

impl MigrationTicket {
    pub fn succeeded(&self) -> bool {
        self.outcome == MigrationOutcome::Completed
    }
}

/// Where a request for a migrated-away id should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// Still inside the grace period: redirect to the new address.
    Forward(NodeAddress),
    /// Grace period expired (or no shim was ever installed).
    Gone,
}

struct Shim {
    to: NodeAddress,
    deadline: Instant,
}

/// Time-bounded forwarding shims installed at a body's old address.
#[derive(Default)]
pub(crate) struct ForwarderTable {
    shims: Mutex<HashMap<ActiveObjectId, Shim>>,
}

impl ForwarderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, id: ActiveObjectId, to: NodeAddress, grace: Duration) {
        self.shims.lock().unwrap().insert(
            id,
            Shim {
                to,
                deadline: Instant::now() + grace,
            },
        );
    }

    /// Route a straggler. Expired shims are dropped on access.
    pub fn route(&self, id: ActiveObjectId) -> Route {
        let mut shims = self.shims.lock().unwrap();
        match shims.get(&id) {
            Some(shim) if Instant::now() <= shim.deadline => Route::Forward(shim.to.clone()),
            Some(_) => {
                shims.remove(&id);
                Route::Gone
            }
            None => Route::Gone,
        }
    }
}

/// Run the migration protocol for a locally-hosted body.
///
/// Preconditions are reported as `Err`; once the protocol is underway the
/// outcome (committed or aborted) is always reported inside the returned
/// ticket, with the matching lifecycle event emitted.
pub(crate) async fn coordinate(
    shared: &Arc<NodeShared>,
    id: ActiveObjectId,
    destination: NodeAddress,
) -> Result<MigrationTicket, DispatchError> {
    let source = shared.address.clone();
    if destination == source {
        return Err(DispatchError::MigrationFailed {
            id,
            destination,
            reason: "destination equals current address".into(),
        });
    }
    let process = shared
        .local_body(id)
        .ok_or(DispatchError::NotLocal {
            id,
            node: source.clone(),
        })?;
    let body = process.body.clone();
    let started_at_ms = chrono::Utc::now().timestamp_millis() as u64;

    // Step 1+2: quiesce and snapshot. The queue closes first, then the
    // exclusivity lock waits out the in-flight call.
    let (snapshot, pending) = match body.cutover().await {
        Ok(taken) => taken,
        Err(failure) => {
            let reason = match failure {
                // The queue refused the cutover (the body is terminating).
                // The service loop never stopped, so it must not be
                // restarted here.
                CutoverError::Refused => "body is terminating".to_string(),
                // The snapshot faulted after cutover: the queue is already
                // reinstated, but the loop retired and must be restarted.
                CutoverError::Snapshot(fault) => {
                    shared.respawn_loop(&body);
                    DispatchError::Application(fault).to_string()
                }
            };
            let ticket = ticket(
                id,
                &source,
                &destination,
                0,
                MigrationOutcome::Failed { reason },
                started_at_ms,
            );
            shared.events.emit(crate::events::RuntimeEvent::MigrationFailed {
                ticket: ticket.clone(),
            });
            return Ok(ticket);
        }
    };
    let pending_at_cutover = pending.len();

    shared
        .events
        .emit(crate::events::RuntimeEvent::MigrationStarted {
            id,
            source: source.clone(),
            destination: destination.clone(),
        });
    info!(%id, %source, %destination, pending = pending_at_cutover, "migration started");

    // Step 3: transfer. The destination acks through our future table.
    let (ack, resolver) = reply_slot();
    shared.futures.register(ack.id(), resolver);
    let next_epoch = body.epoch + 1;
    let transfer = WireMessage::InstallBody {
        id,
        type_name: body.type_name.clone(),
        epoch: next_epoch,
        policy: body.queue.policy(),
        snapshot,
        pending: pending.clone(),
        reply: ReplyTarget {
            future_id: ack.id(),
            node: source.clone(),
        },
    };
    let transfer_result = match shared.transport.send(&destination, transfer) {
        Ok(()) => ack.await_bytes().await.map(|_| ()),
        Err(e) => {
            shared.futures.forget(ack.id());
            Err(e)
        }
    };

    match transfer_result {
        Ok(()) => {
            // Step 4+5: commit. Body removal, shim install, and straggler
            // handoff happen under the parked-requests lock so no envelope
            // can fall between the old queue and the new address.
            let stragglers = {
                let mut parked = shared.parked.lock().unwrap();
                shared.forwarders.install(
                    id,
                    destination.clone(),
                    shared.config.forwarding_grace(),
                );
                shared.remove_body(id);
                parked.remove(&id).unwrap_or_default()
            };
            for envelope in stragglers {
                if let Err(e) = shared.transport.send(
                    &destination,
                    WireMessage::Request {
                        target: id,
                        epoch: next_epoch,
                        envelope,
                    },
                ) {
                    warn!(%id, %destination, error = %e, "failed to hand off straggler");
                }
            }
            shared
                .fabric
                .directory()
                .update(id, destination.clone(), next_epoch)?;

            let ticket = ticket(
                id,
                &source,
                &destination,
                pending_at_cutover,
                MigrationOutcome::Completed,
                started_at_ms,
            );
            shared
                .events
                .emit(crate::events::RuntimeEvent::MigrationCompleted {
                    ticket: ticket.clone(),
                });
            info!(%id, %destination, epoch = next_epoch, "migration completed");
            Ok(ticket)
        }
        Err(e) => {
            // Abort atomically: reinstate the drained envelopes ahead of
            // anything parked since, reopen the queue, restart the loop.
            // All under the parked lock so ordering cannot invert.
            {
                let mut parked = shared.parked.lock().unwrap();
                let mut reinstated = pending;
                reinstated.extend(parked.remove(&id).unwrap_or_default());
                body.queue.abort_cutover(reinstated);
            }
            shared.respawn_loop(&body);

            let ticket = ticket(
                id,
                &source,
                &destination,
                pending_at_cutover,
                MigrationOutcome::Failed {
                    reason: e.to_string(),
                },
                started_at_ms,
            );
            shared
                .events
                .emit(crate::events::RuntimeEvent::MigrationFailed {
                    ticket: ticket.clone(),
                });
            warn!(%id, %destination, error = %e, "migration aborted, source resumed");
            Ok(ticket)
        }
    }
}

fn ticket(
    id: ActiveObjectId,
    source: &NodeAddress,
    destination: &NodeAddress,
    pending_at_cutover: usize,
    outcome: MigrationOutcome,
    started_at_ms: u64,
) -> MigrationTicket {
    MigrationTicket {
        id,
        source: source.clone(),
        destination: destination.clone(),
        pending_at_cutover,
        outcome,
        started_at_ms,
        finished_at_ms: chrono::Utc::now().timestamp_millis() as u64,
    }
}

/// Error a straggler gets once the grace period has expired.
pub(crate) fn expired_error(id: ActiveObjectId) -> DispatchError {
    DispatchError::terminated(id, FailurePhase::Call)
}
