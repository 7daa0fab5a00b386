//! # Active Object Behaviors
//!
//! The [`ActiveObject`] trait is the contract a user type implements to
//! become an active object: a single dispatch entry point executed serially
//! by the owning body, plus a state snapshot used by migration. The
//! [`BehaviorRegistry`] maps type names to factories so a node can
//! instantiate objects on request and rehydrate migrated ones.

use crate::errors::{ApplicationFault, DispatchError};
use crate::id::{ActiveObjectId, NodeAddress};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

/// Execution context handed to every dispatch. Tells the object who it is
/// and where it currently runs; `epoch` increases by one per migration.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub id: ActiveObjectId,
    pub node: NodeAddress,
    pub epoch: u64,
    /// Submission sequence tag of the envelope being served.
    pub sequence: u64,
}

/// State and methods of one active object.
///
/// `dispatch` is only ever executed by one logical executor at a time; the
/// implementation may freely mutate `self` without further synchronization.
/// A returned [`ApplicationFault`] is attached to the caller's future and
/// never unwinds the service loop.
pub trait ActiveObject: Send + 'static {
    /// Execute `method` with the serialized `args` snapshot.
    fn dispatch(
        &mut self,
        ctx: &CallContext,
        method: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, ApplicationFault>;

    /// Serialize the full object state for migration. Snapshots are
    /// transient: in-memory-to-wire only, never persisted.
    fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault>;
}

/// Constructs and rehydrates objects of one registered type.
pub trait BehaviorFactory: Send + Sync {
    /// Build a fresh object from serialized constructor arguments.
    fn instantiate(&self, ctor_args: &[u8]) -> Result<Box<dyn ActiveObject>, DispatchError>;

    /// Rebuild an object from a migration snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<Box<dyn ActiveObject>, DispatchError>;
}

/// Factory for types whose constructor arguments and snapshot are both the
/// serde representation of the type itself.
pub struct SerdeBehavior<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> SerdeBehavior<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for SerdeBehavior<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BehaviorFactory for SerdeBehavior<T>
where
    T: ActiveObject + Serialize + DeserializeOwned,
{
    fn instantiate(&self, ctor_args: &[u8]) -> Result<Box<dyn ActiveObject>, DispatchError> {
        let object: T = serde_json::from_slice(ctor_args).map_err(DispatchError::serialization)?;
        Ok(Box::new(object))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<Box<dyn ActiveObject>, DispatchError> {
        let object: T = serde_json::from_slice(snapshot).map_err(DispatchError::serialization)?;
        Ok(Box::new(object))
    }
}

/// Type-name to factory map shared by every node on a fabric. Registration
/// happens at startup; lookup takes a short read lock only.
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn BehaviorFactory>>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `type_name`, replacing any previous one.
    pub fn register(&self, type_name: impl Into<String>, factory: Arc<dyn BehaviorFactory>) {
        self.factories
            .write()
            .unwrap()
            .insert(type_name.into(), factory);
    }

    /// Register a [`SerdeBehavior`] factory for `T` under `type_name`.
    pub fn register_serde<T>(&self, type_name: impl Into<String>)
    where
        T: ActiveObject + Serialize + DeserializeOwned,
    {
        self.register(type_name, Arc::new(SerdeBehavior::<T>::new()));
    }

    pub fn lookup(&self, type_name: &str) -> Result<Arc<dyn BehaviorFactory>, DispatchError> {
        self.factories
            .read()
            .unwrap()
            .get(type_name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownType(type_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Echo {
        prefix: String,
    }

    impl ActiveObject for Echo {
        fn dispatch(
            &mut self,
            _ctx: &CallContext,
            method: &str,
            args: &[u8],
        ) -> Result<Vec<u8>, ApplicationFault> {
            match method {
                "echo" => {
                    let input: String = serde_json::from_slice(args)
                        .map_err(|e| ApplicationFault::new(e.to_string()))?;
                    serde_json::to_vec(&format!("{}{}", self.prefix, input))
                        .map_err(|e| ApplicationFault::new(e.to_string()))
                }
                other => Err(ApplicationFault::new(format!("no such method: {other}"))),
            }
        }

        fn snapshot(&self) -> Result<Vec<u8>, ApplicationFault> {
            serde_json::to_vec(self).map_err(|e| ApplicationFault::new(e.to_string()))
        }
    }

    #[test]
    fn registry_instantiates_and_restores() {
        let registry = BehaviorRegistry::new();
        registry.register_serde::<Echo>("echo");

        let factory = registry.lookup("echo").unwrap();
        let ctor = serde_json::to_vec(&serde_json::json!({ "prefix": "re: " })).unwrap();
        let mut object = factory.instantiate(&ctor).unwrap();

        let ctx = CallContext {
            id: ActiveObjectId::generate(),
            node: "test".into(),
            epoch: 0,
            sequence: 0,
        };
        let out = object
            .dispatch(&ctx, "echo", &serde_json::to_vec("hi").unwrap())
            .unwrap();
        assert_eq!(serde_json::from_slice::<String>(&out).unwrap(), "re: hi");

        let snapshot = object.snapshot().unwrap();
        let restored = factory.restore(&snapshot).unwrap();
        drop(restored);

        assert!(matches!(
            registry.lookup("missing"),
            Err(DispatchError::UnknownType(_))
        ));
    }
}
