//! The AP replication engine of a clustered service registry.
//!
//! Ephemeral registry data (which instances each client has published) is kept eventually
//! consistent across the cluster without consensus. Each node decides which keys it is
//! authoritative for with a consistent-hash ring over the healthy peers ([`cluster`]), debounces
//! local mutations and pushes them to its peers with retries ([`distro`]), and resolves
//! concurrent writes with hybrid logical clocks and joinable instance sets ([`crdt`]). The client
//! registry in [`client`] is the data being replicated, [`node::RegistryNode`] wires everything
//! together.
//!
//! ```ignore
//! let membership = Arc::new(StaticMembership::new(peers));
//! let node = RegistryNode::start(DistroConfig::default(), local, membership, transport)?;
//! node.clients().register_instance(
//!   "10.0.0.7:8080#true",
//!   ServiceKey::new("public", "DEFAULT_GROUP", "orders"),
//!   InstanceRecord::new("10.0.0.7", 8080),
//! );
//! ```
//!
//! [`testkit`] holds the in-process transports and fault injection used by the tests.

pub mod client;
pub mod cluster;
pub mod core;
pub mod crdt;
pub mod distro;
pub mod node;
pub mod testkit;
