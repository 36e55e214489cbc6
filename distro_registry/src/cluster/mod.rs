//! Who is in the cluster and who owns what.
//!
//! Membership discovery is not done here: a [`MembershipView`] hands out snapshots of the healthy
//! peers and the rest of the crate only ever reads them. [`OwnershipMapper`] places every peer on a
//! consistent-hash [`NodeRing`] and answers, for a resource key, whether the local node is the one
//! authoritative for it. Health checks, client expiry and the verify round all consult it so that
//! exactly one node acts on each key at a time.

mod membership;
mod node_ring;
mod ownership;

#[rustfmt::skip]
pub use {
  membership::MembershipSnapshot,
  membership::MembershipView,
  membership::StaticMembership,
  node_ring::hash_code,
  node_ring::NodeRing,
  ownership::OwnershipMapper,
};
