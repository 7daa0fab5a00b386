//! # Typed Groups
//!
//! A [`GroupHandle`] is an ordered collection of invocation handles that a
//! single call fans out over. Each parameter position carries its own
//! dispatch mode: broadcast the same value to every member, partition a
//! collection round-robin, or match values to members one-to-one.
//!
//! Membership mutates only between dispatches: every dispatch snapshots
//! the member list first, so a concurrent `add` or `remove` affects the
//! next call, never one already fanning out. One member's failure never
//! aborts its siblings; the failure surfaces in that member's slot of the
//! [`GroupFuture`].

use crate::adapter::Invoke;
use crate::envelope::CallMode;
use crate::errors::DispatchError;
use crate::future::{self, CallOutcome, ReplyFuture};
use crate::id::ActiveObjectId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Per-parameter fan-out mode, resolved once per call.
#[derive(Debug, Clone)]
pub enum ParamDispatch {
    /// Every member receives the same value.
    Broadcast(Value),
    /// The collection is partitioned contiguously over the members in
    /// declared order, the remainder going one extra to the earliest
    /// members. Each member receives its chunk as an array.
    RoundRobin(Vec<Value>),
    /// Value `i` goes to member `i`. Requires arity equal to the member
    /// count.
    OneToOne(Vec<Value>),
}

/// Ordered group of invocation handles.
pub struct GroupHandle {
    members: RwLock<Vec<Arc<dyn Invoke>>>,
}

impl GroupHandle {
    pub fn new(members: Vec<Arc<dyn Invoke>>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    pub fn len(&self) -> usize {
        self.members.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a member. Takes effect from the next dispatch.
    pub fn add(&self, member: Arc<dyn Invoke>) {
        self.members.write().unwrap().push(member);
    }

    /// Remove the first member targeting `id`. Takes effect from the next
    /// dispatch.
    pub fn remove(&self, id: ActiveObjectId) -> bool {
        let mut members = self.members.write().unwrap();
        match members.iter().position(|m| m.target() == id) {
            Some(index) => {
                members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn member_ids(&self) -> Vec<ActiveObjectId> {
        self.members
            .read()
            .unwrap()
            .iter()
            .map(|m| m.target())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Invoke>> {
        self.members.read().unwrap().clone()
    }

    /// Fan a call out over the current members. Returns one future per
    /// member, in member order. An empty group resolves immediately to an
    /// empty result set.
    pub fn invoke_group(
        &self,
        method: &str,
        params: &[ParamDispatch],
    ) -> Result<GroupFuture, DispatchError> {
        let members = self.snapshot();
        let plan = DispatchPlan::build(params, members.len())?;
        debug!(method, members = members.len(), "group fan-out");

        let mut slots = Vec::with_capacity(members.len());
        for (index, member) in members.iter().enumerate() {
            let args = plan.args_for(index)?;
            let slot = match member.invoke_raw(method, args, CallMode::Async) {
                Ok(Some(f)) => f,
                Ok(None) => future::resolved(Err(DispatchError::GroupDispatch(
                    "async member call returned no future".into(),
                ))),
                Err(e) => future::resolved(Err(e)),
            };
            slots.push(slot);
        }
        Ok(GroupFuture { slots })
    }

    /// Fan a one-way call out over the current members: no futures at all.
    /// Member failures are logged; the remaining members still receive the
    /// call.
    pub fn invoke_group_oneway(
        &self,
        method: &str,
        params: &[ParamDispatch],
    ) -> Result<(), DispatchError> {
        let members = self.snapshot();
        let plan = DispatchPlan::build(params, members.len())?;
        for (index, member) in members.iter().enumerate() {
            let args = plan.args_for(index)?;
            if let Err(error) = member.invoke_raw(method, args, CallMode::OneWay) {
                warn!(method, member = %member.target(), %error, "one-way group member failed");
            }
        }
        Ok(())
    }
}

/// Validated fan-out plan: arity checks happen once, before anything is
/// sent, so an invalid call reaches no member at all.
struct DispatchPlan<'p> {
    params: &'p [ParamDispatch],
    members: usize,
}

impl<'p> DispatchPlan<'p> {
    fn build(params: &'p [ParamDispatch], members: usize) -> Result<Self, DispatchError> {
        for (position, param) in params.iter().enumerate() {
            if let ParamDispatch::OneToOne(values) = param {
                if values.len() != members {
                    return Err(DispatchError::GroupDispatch(format!(
                        "one-to-one parameter {position} has {} values for {members} members",
                        values.len()
                    )));
                }
            }
        }
        Ok(Self { params, members })
    }

    /// Serialized argument payload for member `index`. A single parameter
    /// is sent bare, several as an array, matching the plain surrogate
    /// calling convention.
    fn args_for(&self, index: usize) -> Result<Vec<u8>, DispatchError> {
        let mut resolved = Vec::with_capacity(self.params.len());
        for param in self.params {
            resolved.push(match param {
                ParamDispatch::Broadcast(value) => value.clone(),
                ParamDispatch::RoundRobin(values) => {
                    Value::Array(chunk(values, self.members, index).to_vec())
                }
                ParamDispatch::OneToOne(values) => values[index].clone(),
            });
        }
        let payload = match resolved.len() {
            1 => resolved.pop().unwrap_or(Value::Null),
            _ => Value::Array(resolved),
        };
        serde_json::to_vec(&payload).map_err(DispatchError::serialization)
    }
}

/// Contiguous chunk of `values` for member `index` of `members`: base size
/// `len / members`, the first `len % members` members taking one extra.
/// Five values over three members gives chunks of 2, 2 and 1.
fn chunk(values: &[Value], members: usize, index: usize) -> &[Value] {
    debug_assert!(index < members);
    let base = values.len() / members;
    let remainder = values.len() % members;
    let start = index * base + index.min(remainder);
    let size = base + usize::from(index < remainder);
    &values[start..start + size]
}

/// One future per group member, resolvable incrementally.
#[derive(Debug)]
pub struct GroupFuture {
    slots: Vec<ReplyFuture>,
}

impl GroupFuture {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The future for member `index`, waitable on its own.
    pub fn get(&self, index: usize) -> Option<&ReplyFuture> {
        self.slots.get(index)
    }

    /// How many member calls have resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_resolved()).count()
    }

    /// True once every member call has resolved.
    pub fn is_resolved(&self) -> bool {
        self.slots.iter().all(|s| s.is_resolved())
    }

    /// Wait for every member to resolve; outcomes in member order.
    pub async fn await_all(&self) -> Vec<CallOutcome> {
        futures::future::join_all(self.slots.iter().map(|s| s.await_bytes())).await
    }

    /// Wait for every member and decode each outcome.
    pub async fn await_values<R: DeserializeOwned>(&self) -> Vec<Result<R, DispatchError>> {
        futures::future::join_all(self.slots.iter().map(|s| s.await_value::<R>())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn group_future_renders_for_assertion_messages() {
        let group = GroupFuture {
            slots: vec![future::resolved(Ok(vec![]))],
        };
        let rendered = format!("{group:?}");
        assert!(rendered.contains("GroupFuture"), "got {rendered}");
    }

    #[test]
    fn round_robin_chunks_are_contiguous_with_early_remainder() {
        let values: Vec<Value> = (0..5).map(|i| json!(i)).collect();
        let sizes: Vec<usize> = (0..3).map(|i| chunk(&values, 3, i).len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(chunk(&values, 3, 0), &[json!(0), json!(1)]);
        assert_eq!(chunk(&values, 3, 1), &[json!(2), json!(3)]);
        assert_eq!(chunk(&values, 3, 2), &[json!(4)]);
    }

    #[test]
    fn round_robin_with_fewer_values_than_members() {
        let values: Vec<Value> = (0..2).map(|i| json!(i)).collect();
        let sizes: Vec<usize> = (0..4).map(|i| chunk(&values, 4, i).len()).collect();
        assert_eq!(sizes, vec![1, 1, 0, 0]);
    }

    #[test]
    fn one_to_one_arity_is_checked_up_front() {
        let params = [ParamDispatch::OneToOne(vec![json!(1), json!(2)])];
        assert!(DispatchPlan::build(&params, 3).is_err());
        assert!(DispatchPlan::build(&params, 2).is_ok());
    }
}
