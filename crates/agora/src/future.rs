//! # Reply Futures
//!
//! Single-resolution placeholders for call outcomes. A [`ReplyFuture`] is
//! handed to the caller the moment a call is made; the matching
//! [`FutureResolver`] travels with the dispatch machinery and resolves the
//! slot exactly once — a second resolution attempt is a no-op, which is what
//! makes normal completion racing termination safe.
//!
//! Waiting on a future is the only suspension point exposed to a caller;
//! a non-blocking poll form is also available. Dropping a future never
//! cancels the execution it is waiting for.

use crate::errors::DispatchError;
use crate::id::FutureId;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::warn;

/// Outcome of one call: serialized return value, or a dispatch error
/// (which includes application faults carried opaquely).
pub type CallOutcome = Result<Vec<u8>, DispatchError>;

struct FutureState {
    outcome: Mutex<Option<CallOutcome>>,
    resolved: Notify,
}

/// Caller-side placeholder for a not-yet-computed result.
#[derive(Clone)]
pub struct ReplyFuture {
    id: FutureId,
    state: Arc<FutureState>,
}

/// Dispatch-side handle that resolves the matching [`ReplyFuture`].
#[derive(Clone)]
pub struct FutureResolver {
    state: Arc<FutureState>,
}

/// Create a linked future/resolver pair.
pub fn reply_slot() -> (ReplyFuture, FutureResolver) {
    let state = Arc::new(FutureState {
        outcome: Mutex::new(None),
        resolved: Notify::new(),
    });
    let id = FutureId::generate();
    (
        ReplyFuture {
            id,
            state: state.clone(),
        },
        FutureResolver { state },
    )
}

/// A future that is already resolved at creation. Used for group slots
/// whose member call failed before it could be sent.
pub fn resolved(outcome: CallOutcome) -> ReplyFuture {
    let (future, resolver) = reply_slot();
    resolver.resolve(outcome);
    future
}

impl ReplyFuture {
    pub fn id(&self) -> FutureId {
        self.id
    }

    /// True once the outcome is available.
    pub fn is_resolved(&self) -> bool {
        self.state.outcome.lock().unwrap().is_some()
    }

    /// Non-blocking poll: the outcome if resolved, `None` otherwise.
    pub fn try_bytes(&self) -> Option<CallOutcome> {
        self.state.outcome.lock().unwrap().clone()
    }

    /// Non-blocking poll with typed decoding.
    pub fn try_value<R: DeserializeOwned>(&self) -> Option<Result<R, DispatchError>> {
        self.try_bytes().map(decode)
    }

    /// Suspend the calling task until the outcome is available.
    ///
    /// Only the calling logical thread is suspended; execution of the call
    /// proceeds independently whether or not anyone waits.
    pub async fn await_bytes(&self) -> CallOutcome {
        loop {
            let notified = self.state.resolved.notified();
            if let Some(outcome) = self.state.outcome.lock().unwrap().clone() {
                return outcome;
            }
            notified.await;
        }
    }

    /// Suspend until resolved, then decode the return value.
    pub async fn await_value<R: DeserializeOwned>(&self) -> Result<R, DispatchError> {
        decode(self.await_bytes().await)
    }
}

fn decode<R: DeserializeOwned>(outcome: CallOutcome) -> Result<R, DispatchError> {
    let bytes = outcome?;
    serde_json::from_slice(&bytes).map_err(DispatchError::serialization)
}

impl FutureResolver {
    /// Resolve the slot. Returns `true` if this attempt won; a losing
    /// attempt leaves the already-stored outcome untouched.
    pub fn resolve(&self, outcome: CallOutcome) -> bool {
        let mut slot = self.state.outcome.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        drop(slot);
        self.state.resolved.notify_waiters();
        true
    }
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Per-node table routing reply wire messages to their registered slots.
///
/// Entries are removed as they resolve; a reply for an unknown future id is
/// logged and dropped (the caller may have already received a losing-race
/// resolution, e.g. termination racing completion).
#[derive(Default)]
pub struct FutureTable {
    slots: Mutex<HashMap<FutureId, FutureResolver>>,
}

impl FutureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot so an inbound reply can find it.
    pub fn register(&self, id: FutureId, resolver: FutureResolver) {
        self.slots.lock().unwrap().insert(id, resolver);
    }

    /// Remove a slot without resolving it (e.g. the send failed and the
    /// caller got an invocation-time error instead).
    pub fn forget(&self, id: FutureId) {
        self.slots.lock().unwrap().remove(&id);
    }

    /// Resolve and remove the slot for `id`.
    pub fn resolve(&self, id: FutureId, outcome: CallOutcome) {
        let resolver = self.slots.lock().unwrap().remove(&id);
        match resolver {
            Some(resolver) => {
                resolver.resolve(outcome);
            }
            None => {
                warn!("reply for unknown future {id}, dropping");
            }
        }
    }

    /// Fail every outstanding slot. Used on forced node shutdown.
    pub fn fail_all(&self, make_error: impl Fn() -> DispatchError) {
        let drained: Vec<_> = self.slots.lock().unwrap().drain().collect();
        for (_, resolver) in drained {
            resolver.resolve(Err(make_error()));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}
