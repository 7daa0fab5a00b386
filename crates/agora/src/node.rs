//! # Node Runtime
//!
//! A [`Node`] is one logical host on a [`Fabric`]: it owns the bodies
//! placed on it, the reply-future table, the forwarding shims left behind
//! by migrations, and a single inbound wire loop that drains the node's
//! transport endpoint. All cross-node interaction goes through wire
//! messages; all local interaction goes through the shared state directly.
//!
//! ## Delivery
//!
//! Inbound requests are matched against the local body table first, then
//! the forwarder table. A request that races a migration cutover is parked
//! and replayed once the migration commits (forwarded) or aborts
//! (re-enqueued); parking and migration commit/abort coordinate through one
//! lock so no envelope can be stranded between the old queue and the new
//! address.

use crate::adapter::Invoke;
use crate::behavior::BehaviorRegistry;
use crate::body::{Body, ExitHook, LoopExit, ReplySink};
use crate::config::NodeConfig;
use crate::directory::LocationDirectory;
use crate::envelope::{CallMode, ReplyTarget, RequestEnvelope};
use crate::errors::{DispatchError, FailurePhase};
use crate::events::{EventBus, RuntimeEvent, StampedEvent};
use crate::future::{reply_slot, CallOutcome, FutureTable};
use crate::group::GroupHandle;
use crate::id::{ActiveObjectId, NodeAddress};
use crate::migration::{self, ForwarderTable, MigrationTicket, Route};
use crate::queue::{RejectReason, Rejected, ServingPolicy};
use crate::shutdown::{ShutdownController, ShutdownMode, ShutdownReceiver};
use crate::surrogate::Surrogate;
use crate::transport::{InProcTransport, Transport, WireMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared substrate joining the nodes of one deployment: the transport,
/// the location directory, and the behavior registry.
#[derive(Default)]
pub struct Fabric {
    transport: Arc<InProcTransport>,
    directory: Arc<LocationDirectory>,
    behaviors: Arc<BehaviorRegistry>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(&self) -> &Arc<InProcTransport> {
        &self.transport
    }

    pub fn directory(&self) -> &Arc<LocationDirectory> {
        &self.directory
    }

    pub fn behaviors(&self) -> &Arc<BehaviorRegistry> {
        &self.behaviors
    }
}

/// A locally-hosted body.
#[derive(Clone)]
pub(crate) struct LocalProcess {
    pub body: Arc<Body>,
}

/// Node state shared between the public handle, the wire loop, surrogates,
/// and the migration coordinator.
pub(crate) struct NodeShared {
    pub address: NodeAddress,
    pub config: NodeConfig,
    pub fabric: Arc<Fabric>,
    pub transport: Arc<InProcTransport>,
    pub bodies: Mutex<HashMap<ActiveObjectId, LocalProcess>>,
    pub futures: FutureTable,
    pub forwarders: ForwarderTable,
    /// Envelopes that arrived while their target was mid-cutover, replayed
    /// by the migration coordinator on commit or abort.
    pub parked: Mutex<HashMap<ActiveObjectId, Vec<RequestEnvelope>>>,
    pub events: EventBus,
}

// Delivery retries only recur while a migration settles; two passes cover
// the commit and abort paths, the rest is slack.
const DELIVERY_ATTEMPTS: usize = 8;

impl NodeShared {
    pub(crate) fn local_body(&self, id: ActiveObjectId) -> Option<LocalProcess> {
        self.bodies.lock().unwrap().get(&id).cloned()
    }

    pub(crate) fn remove_body(&self, id: ActiveObjectId) {
        self.bodies.lock().unwrap().remove(&id);
    }

    fn sink(self: &Arc<Self>) -> Arc<dyn ReplySink> {
        self.clone()
    }

    fn exit_hook(self: &Arc<Self>) -> ExitHook {
        let shared = Arc::downgrade(self);
        Arc::new(move |id, exit| {
            if exit == LoopExit::Terminated {
                if let Some(shared) = shared.upgrade() {
                    shared.remove_body(id);
                    shared.fabric.directory().remove(id);
                    shared.events.emit(RuntimeEvent::BodyTerminated { id });
                }
            }
        })
    }

    /// Restart a body's service loop after an aborted migration cutover.
    pub(crate) fn respawn_loop(self: &Arc<Self>, body: &Arc<Body>) {
        let _task = body.respawn(self.sink(), self.exit_hook());
    }

    /// Instantiate and host a fresh body at epoch 0, registering it in the
    /// directory.
    fn install_fresh(
        self: &Arc<Self>,
        id: ActiveObjectId,
        type_name: &str,
        ctor_args: &[u8],
        policy: ServingPolicy,
    ) -> Result<(), DispatchError> {
        let factory = self.fabric.behaviors().lookup(type_name)?;
        let object = factory.instantiate(ctor_args)?;
        let (body, _task) = Body::spawn(
            id,
            type_name.to_string(),
            0,
            self.address.clone(),
            policy,
            object,
            self.sink(),
            self.exit_hook(),
        );
        self.bodies.lock().unwrap().insert(id, LocalProcess { body });
        self.fabric.directory().register(id, self.address.clone());
        info!(%id, type_name, "hosting new body");
        Ok(())
    }

    /// Rebuild a migrated body from its snapshot, re-enqueueing the
    /// envelopes drained at cutover ahead of anything forwarded later.
    fn install_migrated(
        self: &Arc<Self>,
        id: ActiveObjectId,
        type_name: &str,
        epoch: u64,
        policy: ServingPolicy,
        snapshot: &[u8],
        pending: Vec<RequestEnvelope>,
    ) -> Result<(), DispatchError> {
        let factory = self.fabric.behaviors().lookup(type_name)?;
        let object = factory.restore(snapshot)?;
        let (body, _task) = Body::spawn(
            id,
            type_name.to_string(),
            epoch,
            self.address.clone(),
            policy,
            object,
            self.sink(),
            self.exit_hook(),
        );
        for envelope in pending {
            if let Err(rejected) = body.queue.enqueue(envelope) {
                // Freshly spawned queue is accepting; unreachable in
                // practice, but never drop an envelope silently.
                self.fail_envelope(rejected.envelope, DispatchError::terminated(id, FailurePhase::Call));
            }
        }
        self.bodies.lock().unwrap().insert(id, LocalProcess { body });
        info!(%id, type_name, epoch, "installed migrated body");
        Ok(())
    }

    /// Resolve or report a failed envelope: to its reply target when it has
    /// one, to the log when it is one-way.
    fn fail_envelope(&self, envelope: RequestEnvelope, error: DispatchError) {
        match envelope.reply {
            Some(target) => self.deliver(&target, Err(error)),
            None => {
                warn!(method = %envelope.method, %error, "dropping failed one-way envelope");
            }
        }
    }

    /// Route an inbound request to its body, a forwarding shim, or a
    /// failure. Retries around migration cutover; parks when the cutover is
    /// still settling.
    pub(crate) fn deliver_request(
        self: &Arc<Self>,
        target: ActiveObjectId,
        epoch: u64,
        envelope: RequestEnvelope,
    ) {
        let mut envelope = envelope;
        for _ in 0..DELIVERY_ATTEMPTS {
            if let Some(process) = self.local_body(target) {
                if envelope.mode == CallMode::Immediate {
                    self.spawn_immediate(target, epoch, process.body.clone(), envelope);
                    return;
                }
                match process.body.queue.enqueue(envelope) {
                    Ok(()) => return,
                    Err(Rejected {
                        reason: RejectReason::Terminated,
                        envelope: returned,
                    }) => {
                        self.fail_envelope(
                            returned,
                            DispatchError::terminated(target, FailurePhase::Call),
                        );
                        return;
                    }
                    Err(Rejected {
                        reason: RejectReason::Migrated,
                        envelope: returned,
                    }) => {
                        // Park only while the same cutover is still open;
                        // once the coordinator has drained the parked
                        // entry the body table or queue state has changed
                        // and the retry takes the settled path.
                        let mut parked = self.parked.lock().unwrap();
                        let still_cutting_over = self
                            .local_body(target)
                            .map(|p| p.body.queue.refusal() == Some(RejectReason::Migrated))
                            .unwrap_or(false);
                        if still_cutting_over {
                            parked.entry(target).or_default().push(returned);
                            debug!(%target, "parked request during migration cutover");
                            return;
                        }
                        drop(parked);
                        envelope = returned;
                        continue;
                    }
                }
            }
            match self.forwarders.route(target) {
                Route::Forward(next) => {
                    debug!(%target, %next, "forwarding stale-location request");
                    if let Err(error) = self.transport.send(
                        &next,
                        WireMessage::Request {
                            target,
                            epoch,
                            envelope: envelope.clone(),
                        },
                    ) {
                        self.fail_envelope(envelope, error);
                    }
                    return;
                }
                Route::Gone => {
                    self.fail_envelope(envelope, migration::expired_error(target));
                    return;
                }
            }
        }
        self.fail_envelope(
            envelope,
            DispatchError::Transport(format!("delivery to {target} did not settle")),
        );
    }

    /// Serve an immediate-mode request on a task of its own, off the wire
    /// loop. A rejection mid-migration re-enters normal delivery, which
    /// parks or forwards it.
    fn spawn_immediate(
        self: &Arc<Self>,
        target: ActiveObjectId,
        epoch: u64,
        body: Arc<Body>,
        envelope: RequestEnvelope,
    ) {
        let shared = self.clone();
        tokio::spawn(async move {
            match body.serve_immediate(envelope).await {
                Ok((Some(reply), outcome)) => shared.deliver(&reply, outcome),
                Ok((None, Err(error))) => {
                    warn!(%target, %error, "one-way immediate call failed");
                }
                Ok((None, Ok(_))) => {}
                Err(Rejected { envelope, .. }) => {
                    shared.deliver_request(target, epoch, envelope);
                }
            }
        });
    }

    fn handle_message(self: &Arc<Self>, message: WireMessage) {
        match message {
            WireMessage::Request {
                target,
                epoch,
                envelope,
            } => self.deliver_request(target, epoch, envelope),
            WireMessage::Reply { future_id, outcome } => {
                self.futures.resolve(future_id, outcome);
            }
            WireMessage::CreateBody {
                id,
                type_name,
                ctor_args,
                reply,
            } => {
                let outcome = self
                    .install_fresh(id, &type_name, &ctor_args, self.config.default_policy)
                    .map(|()| Vec::new());
                self.deliver(&reply, outcome);
            }
            WireMessage::Terminate {
                id,
                immediate,
                reply,
            } => {
                if let Some(process) = self.local_body(id) {
                    if process.body.queue.terminate(immediate) {
                        self.deliver(&reply, Ok(Vec::new()));
                    } else {
                        // Mid-cutover: retry once the migration settles.
                        // If it commits, the retry finds the forwarding
                        // shim and follows the body to its new address.
                        let shared = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            let target = reply.clone();
                            let retry = WireMessage::Terminate {
                                id,
                                immediate,
                                reply,
                            };
                            if let Err(error) = shared.transport.send(&shared.address, retry) {
                                shared.deliver(&target, Err(error));
                            }
                        });
                    }
                    return;
                }
                match self.forwarders.route(id) {
                    Route::Forward(next) => {
                        debug!(%id, %next, "forwarding termination to migrated body");
                        let target = reply.clone();
                        let message = WireMessage::Terminate {
                            id,
                            immediate,
                            reply,
                        };
                        if let Err(error) = self.transport.send(&next, message) {
                            self.deliver(&target, Err(error));
                        }
                    }
                    // Terminating an already-gone body is idempotent.
                    Route::Gone => self.deliver(&reply, Ok(Vec::new())),
                }
            }
            WireMessage::InstallBody {
                id,
                type_name,
                epoch,
                policy,
                snapshot,
                pending,
                reply,
            } => {
                let outcome =
                    self.install_migrated(id, &type_name, epoch, policy, &snapshot, pending);
                let ack = WireMessage::InstallOutcome {
                    future_id: reply.future_id,
                    outcome,
                };
                if let Err(error) = self.transport.send(&reply.node, ack) {
                    warn!(%id, %error, "failed to ack body install");
                }
            }
            WireMessage::InstallOutcome { future_id, outcome } => {
                self.futures.resolve(future_id, outcome.map(|()| Vec::new()));
            }
        }
    }

    fn wind_down(&self, mode: ShutdownMode) {
        let immediate = mode == ShutdownMode::Immediate;
        let processes: Vec<_> = self.bodies.lock().unwrap().values().cloned().collect();
        info!(address = %self.address, bodies = processes.len(), ?mode, "node winding down");
        for process in processes {
            if !process.body.queue.terminate(immediate) {
                warn!(id = %process.body.id, "body mid-cutover at shutdown, left to the migration coordinator");
            }
        }
        if immediate {
            let address = self.address.clone();
            self.futures.fail_all(move || {
                DispatchError::Transport(format!("node {address} shut down"))
            });
        }
    }
}

impl ReplySink for NodeShared {
    fn deliver(&self, target: &ReplyTarget, outcome: CallOutcome) {
        if target.node == self.address {
            self.futures.resolve(target.future_id, outcome);
        } else if let Err(error) = self.transport.send(
            &target.node,
            WireMessage::Reply {
                future_id: target.future_id,
                outcome,
            },
        ) {
            warn!(node = %target.node, %error, "failed to deliver reply");
        }
    }
}

/// One logical host on a fabric.
pub struct Node {
    shared: Arc<NodeShared>,
    shutdown: Mutex<Option<ShutdownController>>,
}

impl Node {
    /// Join the fabric at `address`: bind the transport endpoint and start
    /// the inbound wire loop.
    pub fn join(address: impl Into<NodeAddress>, config: NodeConfig, fabric: Arc<Fabric>) -> Self {
        let address = address.into();
        let inbound = fabric.transport().bind(address.clone());
        let shared = Arc::new(NodeShared {
            address: address.clone(),
            config,
            transport: fabric.transport().clone(),
            fabric,
            bodies: Mutex::new(HashMap::new()),
            futures: FutureTable::new(),
            forwarders: ForwarderTable::new(),
            parked: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        });

        let mut controller = ShutdownController::new();
        let receiver = controller.subscribe();
        tokio::spawn(run_wire_loop(shared.clone(), inbound, receiver));
        info!(%address, "node joined fabric");

        Self {
            shared,
            shutdown: Mutex::new(Some(controller)),
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.shared.address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Create an active object hosted on this node.
    pub fn create<C: Serialize>(
        &self,
        type_name: &str,
        ctor_args: &C,
    ) -> Result<Surrogate, DispatchError> {
        self.create_with_policy(type_name, ctor_args, self.shared.config.default_policy)
    }

    /// Create an active object hosted on this node with an explicit
    /// serving policy. The policy is fixed for the object's lifetime.
    pub fn create_with_policy<C: Serialize>(
        &self,
        type_name: &str,
        ctor_args: &C,
        policy: ServingPolicy,
    ) -> Result<Surrogate, DispatchError> {
        let args = serde_json::to_vec(ctor_args).map_err(DispatchError::serialization)?;
        let id = ActiveObjectId::generate();
        self.shared.install_fresh(id, type_name, &args, policy)?;
        self.surrogate(id)
    }

    /// Create an active object hosted on another node, via `CreateBody`
    /// and its ack.
    pub async fn create_at<C: Serialize>(
        &self,
        destination: &NodeAddress,
        type_name: &str,
        ctor_args: &C,
    ) -> Result<Surrogate, DispatchError> {
        if *destination == self.shared.address {
            return self.create(type_name, ctor_args);
        }
        let args = serde_json::to_vec(ctor_args).map_err(DispatchError::serialization)?;
        let id = ActiveObjectId::generate();
        let (ack, resolver) = reply_slot();
        self.shared.futures.register(ack.id(), resolver);
        let message = WireMessage::CreateBody {
            id,
            type_name: type_name.to_string(),
            ctor_args: args,
            reply: ReplyTarget {
                future_id: ack.id(),
                node: self.shared.address.clone(),
            },
        };
        if let Err(error) = self.shared.transport.send(destination, message) {
            self.shared.futures.forget(ack.id());
            return Err(error);
        }
        ack.await_bytes().await?;
        self.surrogate(id)
    }

    /// Build a surrogate for an object known to the directory.
    pub fn surrogate(&self, id: ActiveObjectId) -> Result<Surrogate, DispatchError> {
        self.shared
            .fabric
            .directory()
            .lookup(id)
            .ok_or(DispatchError::UnknownObject(id))?;
        Ok(Surrogate::new(id, self.shared.clone()))
    }

    /// Terminate an object, wherever it currently lives. Graceful
    /// termination drains the queue first; immediate termination fails
    /// everything still queued. Terminating twice is idempotent.
    pub async fn terminate(
        &self,
        id: ActiveObjectId,
        immediate: bool,
    ) -> Result<(), DispatchError> {
        if let Some(process) = self.shared.local_body(id) {
            if process.body.queue.terminate(immediate) {
                return Ok(());
            }
            // A migration cutover is in flight. Route through the wire so
            // the request retries until the migration settles, following
            // the body if it lands elsewhere.
        }
        let record = match self.shared.fabric.directory().lookup(id) {
            Some(record) => record,
            // Already terminated.
            None => return Ok(()),
        };
        let (ack, resolver) = reply_slot();
        self.shared.futures.register(ack.id(), resolver);
        let message = WireMessage::Terminate {
            id,
            immediate,
            reply: ReplyTarget {
                future_id: ack.id(),
                node: self.shared.address.clone(),
            },
        };
        if let Err(error) = self.shared.transport.send(&record.address, message) {
            self.shared.futures.forget(ack.id());
            return Err(error);
        }
        ack.await_bytes().await.map(|_| ())
    }

    /// Migrate a locally-hosted object to another node.
    pub async fn migrate(
        &self,
        id: ActiveObjectId,
        destination: &NodeAddress,
    ) -> Result<MigrationTicket, DispatchError> {
        migration::coordinate(&self.shared, id, destination.clone()).await
    }

    /// Build a group handle over surrogates for `ids`, in the given order.
    pub fn group_create(&self, ids: &[ActiveObjectId]) -> Result<GroupHandle, DispatchError> {
        let mut members: Vec<Arc<dyn Invoke>> = Vec::with_capacity(ids.len());
        for &id in ids {
            members.push(Arc::new(self.surrogate(id)?));
        }
        Ok(GroupHandle::new(members))
    }

    /// Subscribe to this node's lifecycle events.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<StampedEvent> {
        self.shared.events.subscribe()
    }

    /// Stop the node: signal the wire loop, wind down bodies per `mode`,
    /// and unbind the transport endpoint. Safe to call twice.
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let controller = self.shutdown.lock().unwrap().take();
        if let Some(controller) = controller {
            controller.signal(mode).await;
            self.shared.transport.unbind(&self.shared.address);
        }
    }
}

async fn run_wire_loop(
    shared: Arc<NodeShared>,
    mut inbound: mpsc::UnboundedReceiver<WireMessage>,
    shutdown: ShutdownReceiver,
) {
    let signal = shutdown.wait();
    tokio::pin!(signal);
    loop {
        tokio::select! {
            signal = &mut signal => {
                shared.wind_down(signal.mode);
                if let Some(done) = signal.done {
                    let _ = done.send(());
                }
                break;
            }
            message = inbound.recv() => {
                match message {
                    Some(message) => shared.handle_message(message),
                    None => {
                        debug!(address = %shared.address, "transport endpoint closed");
                        break;
                    }
                }
            }
        }
    }
}
