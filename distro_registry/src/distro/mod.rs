//! The replication pipeline.
//!
//! A local mutation enters through [`DistroProtocol::enqueue`] as a [`DistroTask`]. The
//! [`DelayTaskEngine`] holds it until its key has been quiet for the debounce window, merging
//! every further submission for the key into it. The [`TaskDispatcher`] turns the coalesced task
//! into a [`SyncUnit`] and runs it on the worker lane owning the key, which preserves per-key
//! order. The lane fans the unit out into one [`SyncTask`] per destination, and the
//! [`DataSyncer`] pushes each of them, retrying with a fixed backoff while the destination stays
//! in the cluster.
//!
//! Independently, the [`Verifier`] periodically asks every peer to confirm the data this node is
//! authoritative for and repairs whatever a peer could not confirm.
//!
//! [`DistroTask`]: crate::core::DistroTask
//! [`SyncTask`]: crate::core::SyncTask

mod dispatcher;
mod engine;
mod protocol;
mod store;
mod syncer;
mod transport;
mod verify;

#[rustfmt::skip]
pub use {
  dispatcher::SyncUnit,
  dispatcher::TaskDispatcher,
  dispatcher::UnitExecutor,
  engine::DelayTaskEngine,
  engine::TaskProcessor,
  protocol::DistroProtocol,
  store::DataStore,
  store::StoreRegistry,
  syncer::DataSyncer,
  transport::Transport,
  verify::Verifier,
};
