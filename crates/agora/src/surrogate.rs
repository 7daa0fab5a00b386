//! # Surrogates
//!
//! A [`Surrogate`] is the caller-side handle for one active object. It
//! carries no state of the object itself, only the identity, and resolves
//! the current location from the directory on every call, so a handle made
//! before a migration keeps working after it.
//!
//! Asynchronous and one-way calls always travel through the transport,
//! even when the target is hosted on the caller's own node: one inbound
//! channel per address is what keeps deliveries from a single caller in
//! submission order across migrations. Immediate-mode calls are exempt,
//! they bypass the queue by definition and take a local fast path on the
//! caller's own task when the body is here.

use crate::adapter::Invoke;
use crate::directory::LocationRecord;
use crate::envelope::{CallMode, ReplyTarget, RequestEnvelope};
use crate::errors::{DispatchError, FailurePhase};
use crate::future::{reply_slot, ReplyFuture};
use crate::id::ActiveObjectId;
use crate::node::NodeShared;
use crate::queue::Rejected;
use crate::transport::{Transport, WireMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Typed client handle for one active object.
pub struct Surrogate {
    id: ActiveObjectId,
    shared: Arc<NodeShared>,
    /// Per-surrogate submission counter, tagged onto every envelope.
    sequence: AtomicU64,
    /// Last record this surrogate saw. A directory miss after having seen
    /// a record means the target terminated, not that it never existed.
    last_known: Mutex<Option<LocationRecord>>,
}

impl Surrogate {
    pub(crate) fn new(id: ActiveObjectId, shared: Arc<NodeShared>) -> Self {
        let last_known = shared.fabric.directory().lookup(id);
        Self {
            id,
            shared,
            sequence: AtomicU64::new(0),
            last_known: Mutex::new(last_known),
        }
    }

    pub fn id(&self) -> ActiveObjectId {
        self.id
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve the target's current location.
    fn resolve(&self) -> Result<LocationRecord, DispatchError> {
        match self.shared.fabric.directory().lookup(self.id) {
            Some(record) => {
                *self.last_known.lock().unwrap() = Some(record.clone());
                Ok(record)
            }
            None if self.last_known.lock().unwrap().is_some() => {
                Err(DispatchError::terminated(self.id, FailurePhase::Call))
            }
            None => Err(DispatchError::UnknownObject(self.id)),
        }
    }

    fn reply_target(&self, future: &ReplyFuture) -> ReplyTarget {
        ReplyTarget {
            future_id: future.id(),
            node: self.shared.address.clone(),
        }
    }

    /// Asynchronous call: returns a [`ReplyFuture`] the moment the request
    /// is handed to the transport. The caller decides when, and whether,
    /// to wait.
    pub fn invoke<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<ReplyFuture, DispatchError> {
        let args = serde_json::to_vec(params).map_err(DispatchError::serialization)?;
        match self.dispatch_raw(method, args, CallMode::Async)? {
            Some(future) => Ok(future),
            // Async dispatch always registers a future.
            None => Err(DispatchError::Transport("async call returned no future".into())),
        }
    }

    /// Asynchronous call, waited to completion and decoded.
    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, DispatchError> {
        self.invoke(method, params)?.await_value().await
    }

    /// Fire-and-forget: no future, no reply, errors after the send are
    /// only logged at the executing side.
    pub fn invoke_oneway<P: Serialize>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<(), DispatchError> {
        let args = serde_json::to_vec(params).map_err(DispatchError::serialization)?;
        self.dispatch_raw(method, args, CallMode::OneWay)?;
        Ok(())
    }

    /// Immediate-mode call: bypasses the target's queue entirely. When the
    /// body is hosted here it executes inline on the calling task; a remote
    /// body serves it on an out-of-band task at its host. Either way the
    /// exclusivity lock still applies.
    pub async fn invoke_immediate<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, DispatchError> {
        let args = serde_json::to_vec(params).map_err(DispatchError::serialization)?;
        let record = self.resolve()?;

        if record.address == self.shared.address {
            if let Some(process) = self.shared.local_body(self.id) {
                let envelope = RequestEnvelope::new(
                    method,
                    args.clone(),
                    None,
                    self.next_sequence(),
                    CallMode::Immediate,
                );
                match process.body.serve_immediate(envelope).await {
                    Ok((_, outcome)) => {
                        let bytes = outcome?;
                        return serde_json::from_slice(&bytes)
                            .map_err(DispatchError::serialization);
                    }
                    Err(Rejected { .. }) => {
                        // Mid-migration: fall through to routed delivery,
                        // which parks or forwards to the new host.
                        debug!(id = %self.id, "immediate call rerouted around migration");
                    }
                }
            }
        }

        let (future, resolver) = reply_slot();
        self.shared.futures.register(future.id(), resolver);
        let envelope = RequestEnvelope::new(
            method,
            args,
            Some(self.reply_target(&future)),
            self.next_sequence(),
            CallMode::Immediate,
        );
        if record.address == self.shared.address {
            self.shared
                .deliver_request(self.id, record.epoch, envelope);
        } else if let Err(error) = self.shared.transport.send(
            &record.address,
            WireMessage::Request {
                target: self.id,
                epoch: record.epoch,
                envelope,
            },
        ) {
            self.shared.futures.forget(future.id());
            return Err(error);
        }
        future.await_value().await
    }

    fn dispatch_raw(
        &self,
        method: &str,
        args: Vec<u8>,
        mode: CallMode,
    ) -> Result<Option<ReplyFuture>, DispatchError> {
        let record = self.resolve()?;
        let future = match mode {
            CallMode::OneWay => None,
            CallMode::Async | CallMode::Immediate => {
                let (future, resolver) = reply_slot();
                self.shared.futures.register(future.id(), resolver);
                Some(future)
            }
        };
        let envelope = RequestEnvelope::new(
            method,
            args,
            future.as_ref().map(|f| self.reply_target(f)),
            self.next_sequence(),
            mode,
        );
        let message = WireMessage::Request {
            target: self.id,
            epoch: record.epoch,
            envelope,
        };
        if let Err(error) = self.shared.transport.send(&record.address, message) {
            if let Some(future) = &future {
                self.shared.futures.forget(future.id());
            }
            return Err(error);
        }
        Ok(future)
    }
}

impl Invoke for Surrogate {
    fn target(&self) -> ActiveObjectId {
        self.id
    }

    fn binding(&self) -> Option<LocationRecord> {
        self.resolve().ok()
    }

    fn invoke_raw(
        &self,
        method: &str,
        args: Vec<u8>,
        mode: CallMode,
    ) -> Result<Option<ReplyFuture>, DispatchError> {
        self.dispatch_raw(method, args, mode)
    }
}

impl std::fmt::Debug for Surrogate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surrogate").field("id", &self.id).finish()
    }
}
