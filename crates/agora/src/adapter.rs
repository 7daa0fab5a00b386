//! # Invocation Seam
//!
//! [`Invoke`] is the capability every surrogate-shaped handle implements:
//! raw dispatch, target identity, and the current binding. Group members
//! and adapters are held through this trait, so anything that can dispatch
//! a call can stand wherever a surrogate does.
//!
//! [`SurrogateAdapter`] wraps a delegate behind a lock and lets it be
//! swapped atomically, with an optional hook run on each rebind. Calls in
//! flight against the old delegate finish against it; calls made after the
//! swap see the new one.

use crate::directory::LocationRecord;
use crate::envelope::CallMode;
use crate::errors::DispatchError;
use crate::future::ReplyFuture;
use crate::id::ActiveObjectId;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// The surrogate-shaped capability.
pub trait Invoke: Send + Sync {
    /// Identity of the object calls are dispatched to.
    fn target(&self) -> ActiveObjectId;

    /// Current location binding, if the target is still registered.
    fn binding(&self) -> Option<LocationRecord>;

    /// Dispatch a call with pre-serialized arguments. Returns the reply
    /// future for modes that have one, `None` for one-way.
    fn invoke_raw(
        &self,
        method: &str,
        args: Vec<u8>,
        mode: CallMode,
    ) -> Result<Option<ReplyFuture>, DispatchError>;
}

/// Hook run after each delegate swap, with the new target's id.
pub type RebindHook = Arc<dyn Fn(ActiveObjectId) + Send + Sync>;

/// A transparently-forwarding wrapper whose delegate can be replaced at
/// runtime.
pub struct SurrogateAdapter {
    delegate: RwLock<Arc<dyn Invoke>>,
    on_rebind: Option<RebindHook>,
}

impl SurrogateAdapter {
    pub fn new(delegate: Arc<dyn Invoke>) -> Self {
        Self {
            delegate: RwLock::new(delegate),
            on_rebind: None,
        }
    }

    pub fn with_rebind_hook(delegate: Arc<dyn Invoke>, hook: RebindHook) -> Self {
        Self {
            delegate: RwLock::new(delegate),
            on_rebind: Some(hook),
        }
    }

    /// Atomically replace the delegate and run the rebind hook.
    pub fn set_target(&self, delegate: Arc<dyn Invoke>) {
        let id = delegate.target();
        *self.delegate.write().unwrap() = delegate;
        debug!(%id, "adapter rebound");
        if let Some(hook) = &self.on_rebind {
            hook(id);
        }
    }

    pub fn delegate(&self) -> Arc<dyn Invoke> {
        self.delegate.read().unwrap().clone()
    }
}

impl Invoke for SurrogateAdapter {
    fn target(&self) -> ActiveObjectId {
        self.delegate().target()
    }

    fn binding(&self) -> Option<LocationRecord> {
        self.delegate().binding()
    }

    fn invoke_raw(
        &self,
        method: &str,
        args: Vec<u8>,
        mode: CallMode,
    ) -> Result<Option<ReplyFuture>, DispatchError> {
        self.delegate().invoke_raw(method, args, mode)
    }
}
