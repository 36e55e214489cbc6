//! Registered clients and the instances they publish.
//!
//! A client is either connection based (its id carries no `#`), an ephemeral ip-port client
//! (`ip:port#true`) or a persistent ip-port client (`ip:port#false`). Each kind lives in its own
//! sub-registry because liveness and ownership work differently for each: a connection client is
//! owned by the node holding the connection, ip-port clients by the node the ring assigns their
//! address to. [`ClientManagerDelegate`] routes every call to the right sub-registry.
//!
//! Only ephemeral data is replicated here. [`ClientDataStore`] exposes it to the replication core
//! and translates [`ClientEvent`]s into replication tasks.

#[allow(clippy::module_inception)]
mod client;
mod instance;
mod manager;
mod store;

#[rustfmt::skip]
pub use {
  client::responsible_id,
  client::Client,
  client::ClientEvent,
  client::ClientKind,
  client::ClientSyncData,
  instance::InstanceId,
  instance::InstanceRecord,
  instance::ServiceKey,
  manager::ClientManager,
  manager::ClientManagerDelegate,
  manager::ClientTable,
  manager::ConnectionBasedClientManager,
  manager::EphemeralIpPortClientManager,
  manager::PersistentIpPortClientManager,
  store::ClientDataStore,
  store::CLIENT_RESOURCE_TYPE,
};
