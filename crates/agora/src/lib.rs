//! # Agora Active Object Runtime
//!
//! Agora is a runtime for distributed active objects: ordinary state types
//! whose methods are invoked asynchronously through futures, executed
//! serially by a per-object service loop, and addressable uniformly whether
//! they live in the caller's process or on another node.
//!
//! ## Core Features
//!
//! * **Asynchronous dispatch**: every call returns a [`future::ReplyFuture`]
//!   immediately; waiting is explicit and optional
//! * **Serial execution**: one logical executor per object, no data races
//!   on object state by construction
//! * **Location transparency**: surrogates resolve the current location per
//!   call, so handles survive migration
//! * **Weak migration**: move a live object between nodes without losing
//!   queued requests or invalidating existing handles
//! * **Typed groups**: fan one call out over a member list with
//!   per-parameter broadcast, round-robin, or one-to-one dispatch
//!
//! ## Architecture
//!
//! * [`node::Fabric`]: the substrate nodes share, transport plus location
//!   directory plus behavior registry
//! * [`node::Node`]: one logical host, owning its bodies and wire loop
//! * `Body` (internal): the service loop that owns one object
//! * [`surrogate::Surrogate`]: the caller-side handle
//! * [`group::GroupHandle`]: ordered fan-out over surrogate-shaped handles

pub mod adapter;
pub mod behavior;
pub mod config;
pub mod directory;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod future;
pub mod group;
pub mod id;
pub mod logging;
pub mod migration;
pub mod node;
pub mod queue;
pub mod shutdown;
pub mod surrogate;
pub mod transport;

mod body;

pub use adapter::{Invoke, SurrogateAdapter};
pub use behavior::{ActiveObject, BehaviorFactory, BehaviorRegistry, CallContext, SerdeBehavior};
pub use config::NodeConfig;
pub use directory::{LocationDirectory, LocationRecord};
pub use envelope::{CallMode, ReplyTarget, RequestEnvelope};
pub use errors::{ApplicationFault, DispatchError, FailurePhase};
pub use events::{RuntimeEvent, StampedEvent};
pub use future::{CallOutcome, ReplyFuture};
pub use group::{GroupFuture, GroupHandle, ParamDispatch};
pub use id::{ActiveObjectId, FutureId, NodeAddress};
pub use logging::setup_global_logging;
pub use migration::{MigrationOutcome, MigrationTicket};
pub use node::{Fabric, Node};
pub use queue::ServingPolicy;
pub use shutdown::ShutdownMode;
pub use surrogate::Surrogate;
pub use transport::{InProcTransport, Transport, WireMessage};
