//! # Transport
//!
//! Message shapes that cross node boundaries, and the trait a wire
//! implementation must provide. The serialization codec itself is out of
//! scope: every [`WireMessage`] is `Serialize`/`Deserialize` so any codec
//! can carry it, and the in-process reference transport moves the typed
//! values directly.

use crate::envelope::{ReplyTarget, RequestEnvelope};
use crate::errors::DispatchError;
use crate::future::CallOutcome;
use crate::id::{ActiveObjectId, FutureId, NodeAddress};
use crate::queue::ServingPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Everything one node can say to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Deliver a request envelope to the body identified by `target`.
    /// `epoch` is the caller's view of the target's migration epoch.
    Request {
        target: ActiveObjectId,
        epoch: u64,
        envelope: RequestEnvelope,
    },
    /// Resolve the future registered at the destination node.
    Reply {
        future_id: FutureId,
        outcome: CallOutcome,
    },
    /// Instantiate a fresh body. The ack travels back as a `Reply` with an
    /// empty payload.
    CreateBody {
        id: ActiveObjectId,
        type_name: String,
        ctor_args: Vec<u8>,
        reply: ReplyTarget,
    },
    /// Terminate the body hosted at the destination. Acked via `Reply`.
    Terminate {
        id: ActiveObjectId,
        immediate: bool,
        reply: ReplyTarget,
    },
    /// Migration transfer: state snapshot plus every envelope still queued
    /// at cutover, in original relative order. The serving policy carries
    /// over so the rebuilt body keeps the ordering it was created with.
    InstallBody {
        id: ActiveObjectId,
        type_name: String,
        epoch: u64,
        policy: ServingPolicy,
        snapshot: Vec<u8>,
        pending: Vec<RequestEnvelope>,
        reply: ReplyTarget,
    },
    /// Acknowledges an `InstallBody` transfer back to the coordinator.
    InstallOutcome {
        future_id: FutureId,
        outcome: Result<(), DispatchError>,
    },
}

/// One-way message passing between node addresses. Sending is synchronous
/// and non-blocking; delivery order per sender/destination pair is
/// preserved.
pub trait Transport: Send + Sync {
    fn send(&self, to: &NodeAddress, message: WireMessage) -> Result<(), DispatchError>;
}

/// Reference transport: an in-process registry of per-address endpoints.
/// Used by tests and single-process deployments; a real wire transport
/// implements [`Transport`] against sockets instead.
#[derive(Default)]
pub struct InProcTransport {
    endpoints: RwLock<HashMap<NodeAddress, mpsc::UnboundedSender<WireMessage>>>,
}

impl InProcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an address, returning the inbound message stream for the
    /// node's wire loop. Re-binding an address replaces the endpoint.
    pub fn bind(&self, address: NodeAddress) -> mpsc::UnboundedReceiver<WireMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.write().unwrap().insert(address, tx);
        rx
    }

    /// Drop an endpoint; subsequent sends to it fail with a transport
    /// error, as a dead peer would.
    pub fn unbind(&self, address: &NodeAddress) {
        self.endpoints.write().unwrap().remove(address);
    }
}

impl Transport for InProcTransport {
    fn send(&self, to: &NodeAddress, message: WireMessage) -> Result<(), DispatchError> {
        let endpoints = self.endpoints.read().unwrap();
        let endpoint = endpoints
            .get(to)
            .ok_or_else(|| DispatchError::Transport(format!("no route to {to}")))?;
        endpoint
            .send(message)
            .map_err(|_| DispatchError::Transport(format!("endpoint {to} closed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_bound_endpoint() {
        let transport = InProcTransport::new();
        let mut rx = transport.bind("node-a".into());

        let id = ActiveObjectId::generate();
        transport
            .send(
                &"node-a".into(),
                WireMessage::Reply {
                    future_id: FutureId::generate(),
                    outcome: Ok(vec![]),
                },
            )
            .unwrap();
        assert!(matches!(rx.recv().await, Some(WireMessage::Reply { .. })));

        let err = transport
            .send(
                &"node-b".into(),
                WireMessage::Request {
                    target: id,
                    epoch: 0,
                    envelope: RequestEnvelope::new(
                        "m",
                        vec![],
                        None,
                        0,
                        crate::envelope::CallMode::OneWay,
                    ),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }

    #[tokio::test]
    async fn unbind_severs_the_route() {
        let transport = InProcTransport::new();
        let _rx = transport.bind("node-a".into());
        transport.unbind(&"node-a".into());
        let err = transport
            .send(
                &"node-a".into(),
                WireMessage::Reply {
                    future_id: FutureId::generate(),
                    outcome: Ok(vec![]),
                },
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }
}
