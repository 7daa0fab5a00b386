//! # Error Taxonomy
//!
//! Every failure mode the dispatch machinery can surface to a caller.
//! Errors are cloneable and serializable because they travel inside reply
//! wire messages and are attached to futures.
//!
//! Application-level faults are deliberately opaque: the core carries them
//! inside [`ApplicationFault`] without ever interpreting the payload, and
//! delivers them only through future resolution — a service loop never
//! propagates one.

use crate::id::{ActiveObjectId, NodeAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which side of a call a target-terminated failure was detected on.
///
/// `Call` means the request never reached a live body; `Reply` means the
/// body accepted the request but terminated before producing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailurePhase {
    Call,
    Reply,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePhase::Call => write!(f, "call"),
            FailurePhase::Reply => write!(f, "reply"),
        }
    }
}

/// An exception raised by user method code, carried opaquely through the
/// future that the call produced. The core never inspects `payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationFault {
    /// Human-readable description supplied by the raising method.
    pub message: String,
    /// Optional serialized fault value, opaque to the core.
    pub payload: Option<Vec<u8>>,
}

impl ApplicationFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    pub fn with_payload(message: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message: message.into(),
            payload: Some(payload),
        }
    }
}

impl fmt::Display for ApplicationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Errors surfaced at invocation time or at future resolution.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DispatchError {
    /// The call reached a non-existent or shutting-down body.
    #[error("target {id} terminated (phase: {phase})")]
    TargetTerminated {
        id: ActiveObjectId,
        phase: FailurePhase,
    },

    /// Network or connectivity failure. Never conflated with an
    /// application-level exception.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Exception raised by user method code, delivered via the future.
    #[error("application fault: {0}")]
    Application(ApplicationFault),

    /// A migration aborted: destination rejection, snapshot failure, or
    /// transfer failure. The source body resumed unchanged.
    #[error("migration of {id} to {destination} failed: {reason}")]
    MigrationFailed {
        id: ActiveObjectId,
        destination: NodeAddress,
        reason: String,
    },

    /// A group dispatch descriptor was malformed, e.g. a one-to-one
    /// parameter whose arity does not match the member count.
    #[error("group dispatch error: {0}")]
    GroupDispatch(String),

    /// No behavior factory registered under this type name.
    #[error("unknown active object type: {0}")]
    UnknownType(String),

    /// No body or location record exists for this id.
    #[error("unknown active object: {0}")]
    UnknownObject(ActiveObjectId),

    /// Argument or snapshot (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A location update carried an epoch at or below the one already in
    /// the directory. Epochs are strictly monotonic per id.
    #[error("stale epoch {epoch} for {id}, directory already at {current}")]
    StaleEpoch {
        id: ActiveObjectId,
        epoch: u64,
        current: u64,
    },

    /// The operation requires the body to be owned by the local node.
    #[error("active object {id} is not hosted on node {node}")]
    NotLocal {
        id: ActiveObjectId,
        node: NodeAddress,
    },
}

impl DispatchError {
    pub(crate) fn terminated(id: ActiveObjectId, phase: FailurePhase) -> Self {
        DispatchError::TargetTerminated { id, phase }
    }

    pub(crate) fn serialization(e: impl fmt::Display) -> Self {
        DispatchError::Serialization(e.to_string())
    }

    /// True when this error is a target-terminated failure in the given
    /// phase. Convenience for callers that branch on the taxonomy.
    pub fn is_terminated(&self, phase: FailurePhase) -> bool {
        matches!(self, DispatchError::TargetTerminated { phase: p, .. } if *p == phase)
    }
}

impl From<ApplicationFault> for DispatchError {
    fn from(fault: ApplicationFault) -> Self {
        DispatchError::Application(fault)
    }
}
