//! Conflict resolution for data written concurrently on different nodes.
//!
//! Every node owns one [`HybridLogicalClock`]. Its timestamps order events within a process
//! exactly and across processes up to a bounded clock skew; everything inside the skew window is
//! concurrent. Replicated state implements [`CRDT`]: its `join` is commutative, associative and
//! idempotent, so replicas that saw the same operations converge no matter in which order they
//! arrived. [`ConflictResolver`] applies batches of [`Operation`]s in a total order derived from
//! their timestamps.

use serde::{de::DeserializeOwned, Serialize};
use std::hash::Hash;

mod hlc;
mod resolver;

pub trait CRDT
where
  Self: Clone
    + DeserializeOwned
    + Eq
    + PartialEq
    + Hash
    + Send
    + Serialize
    + Sized
    + Sync
    + 'static,
{
  type Delta: DeltaMutator<Self> + Send;
  fn delta(&self, changes: &Self::Delta) -> Self;
  fn empty(&self) -> bool;
  fn join(self, other: Self) -> Self;
  fn minimum() -> Self;
}

pub trait DeltaMutator<T> {
  fn apply(&self, target: &T) -> T;
}

#[rustfmt::skip]
pub use {
  hlc::HlcTimestamp,
  hlc::HybridLogicalClock,
  hlc::PhysicalClock,
  hlc::SystemClock,
  resolver::Causality,
  resolver::ConflictResolver,
  resolver::InstanceEntry,
  resolver::InstanceSet,
  resolver::Operation,
  resolver::OperationType,
};
