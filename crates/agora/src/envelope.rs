//! # Request Envelopes
//!
//! A [`RequestEnvelope`] is the immutable, serializable description of one
//! asynchronous call: method name, argument snapshot, reply routing, and a
//! submission sequence tag. Envelopes are what queues hold, what the wire
//! carries, and what a migration re-ships to the destination — so nothing
//! in an envelope may reference process-local state.

use crate::id::{FutureId, NodeAddress};
use serde::{Deserialize, Serialize};

/// How a call is served by the target body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMode {
    /// Default path: enqueue, serve under the active ordering policy,
    /// resolve the reply future.
    Async,
    /// Bypass the queue; serve out-of-band, still mutually exclusive with
    /// queued execution against the same body.
    Immediate,
    /// Fire-and-forget: no future is allocated and no reply is sent.
    OneWay,
}

/// Where the reply for a call should be routed: the future table of the
/// calling node, keyed by future id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyTarget {
    pub future_id: FutureId,
    pub node: NodeAddress,
}

/// Immutable description of one asynchronous method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Name of the method to invoke on the target object.
    pub method: String,
    /// Serialized argument snapshot, taken at call time.
    pub args: Vec<u8>,
    /// Reply routing; `None` for one-way calls.
    pub reply: Option<ReplyTarget>,
    /// Per-surrogate submission sequence tag. Monotonic for calls made
    /// through the same surrogate; used to preserve per-channel ordering.
    pub sequence: u64,
    /// Serving mode requested by the caller.
    pub mode: CallMode,
}

impl RequestEnvelope {
    pub fn new(
        method: impl Into<String>,
        args: Vec<u8>,
        reply: Option<ReplyTarget>,
        sequence: u64,
        mode: CallMode,
    ) -> Self {
        Self {
            method: method.into(),
            args,
            reply,
            sequence,
            mode,
        }
    }

    /// True when the envelope expects no reply.
    pub fn is_one_way(&self) -> bool {
        self.reply.is_none()
    }
}
