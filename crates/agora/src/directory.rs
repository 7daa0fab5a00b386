//! # Location Directory
//!
//! Process-wide identity-to-address map. Surrogates consult it on every
//! call; the migration coordinator updates it at cutover. Epochs increase
//! strictly per id so a stale cached record can always be told apart from
//! the current one — stale references are redirected, never silently
//! accepted as current.
//!
//! All operations take one short lock; the lock is never held while
//! application code executes.

use crate::errors::DispatchError;
use crate::id::{ActiveObjectId, NodeAddress};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Current address of one active object, tagged with its migration epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub address: NodeAddress,
    pub epoch: u64,
}

/// One owned concurrent map, shared by every node on a fabric.
#[derive(Default)]
pub struct LocationDirectory {
    records: Mutex<HashMap<ActiveObjectId, LocationRecord>>,
}

impl LocationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly created object at epoch 0.
    pub fn register(&self, id: ActiveObjectId, address: NodeAddress) -> LocationRecord {
        let record = LocationRecord { address, epoch: 0 };
        self.records.lock().unwrap().insert(id, record.clone());
        debug!(%id, address = %record.address, "registered location");
        record
    }

    /// Move `id` to a new address at `epoch`. The epoch must be strictly
    /// greater than the stored one; non-monotonic updates are rejected.
    pub fn update(
        &self,
        id: ActiveObjectId,
        address: NodeAddress,
        epoch: u64,
    ) -> Result<LocationRecord, DispatchError> {
        let mut records = self.records.lock().unwrap();
        let current = records
            .get(&id)
            .ok_or(DispatchError::UnknownObject(id))?;
        if epoch <= current.epoch {
            return Err(DispatchError::StaleEpoch {
                id,
                epoch,
                current: current.epoch,
            });
        }
        let record = LocationRecord { address, epoch };
        records.insert(id, record.clone());
        debug!(%id, address = %record.address, epoch, "relocated");
        Ok(record)
    }

    pub fn lookup(&self, id: ActiveObjectId) -> Option<LocationRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    /// Drop the record on termination. The id is never reused.
    pub fn remove(&self, id: ActiveObjectId) {
        self.records.lock().unwrap().remove(&id);
    }
}
