use crate::client::{InstanceRecord, ServiceKey};
use crate::crdt::{InstanceSet, CRDT};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

const ID_DELIMITER: char = '#';
const PERSISTENT_SUFFIX: &str = "false";

/// The three kinds of clients differ in how their liveness is tracked: connection clients live as
/// long as their connection, ephemeral ip-port clients as long as they keep sending heartbeats,
/// persistent ip-port clients until they are explicitly removed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum ClientKind {
  Connection,
  EphemeralIpPort,
  PersistentIpPort,
}
impl ClientKind {
  /// Routes a client id. Ids without a `#` belong to connections, ip-port ids end in
  /// `#<ephemeral>`. Anything that is not explicitly persistent is treated as ephemeral.
  pub fn of(client_id: &str) -> ClientKind {
    match client_id.rsplit_once(ID_DELIMITER) {
      None => ClientKind::Connection,
      Some((_, PERSISTENT_SUFFIX)) => ClientKind::PersistentIpPort,
      Some(_) => ClientKind::EphemeralIpPort,
    }
  }

  pub fn is_ephemeral(&self) -> bool {
    *self != ClientKind::PersistentIpPort
  }
}

/// The part of an ip-port client id that decides ownership: the address without the ephemeral
/// marker.
pub fn responsible_id(client_id: &str) -> &str {
  client_id
    .rsplit_once(ID_DELIMITER)
    .map_or(client_id, |(addr, _)| addr)
}

#[derive(Clone, Debug)]
pub struct Client {
  pub client_id: String,
  pub kind: ClientKind,
  /// Whether the client connected to this node, as opposed to being a replica synced from a peer.
  pub native: bool,
  pub revision: u64,
  pub last_active: Instant,
  pub published: im::OrdMap<ServiceKey, InstanceSet>,
}
impl Client {
  pub fn new<I: Into<String>>(client_id: I, native: bool) -> Client {
    let client_id = client_id.into();
    Client {
      kind: ClientKind::of(&client_id),
      client_id: client_id,
      native: native,
      revision: 0,
      last_active: Instant::now(),
      published: im::OrdMap::new(),
    }
  }

  pub fn touch(&mut self) {
    self.last_active = Instant::now();
  }

  pub fn has_instances(&self) -> bool {
    self.published.values().any(|set| !set.empty())
  }

  pub fn instances(&self, service: &ServiceKey) -> Vec<InstanceRecord> {
    self
      .published
      .get(service)
      .map(|set| set.live().cloned().collect())
      .unwrap_or_default()
  }

  pub fn sync_data(&self) -> ClientSyncData {
    ClientSyncData {
      client_id: self.client_id.clone(),
      revision: self.revision,
      services: self.published.clone(),
    }
  }
}

/// What peers receive for one client.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClientSyncData {
  pub client_id: String,
  pub revision: u64,
  pub services: im::OrdMap<ServiceKey, InstanceSet>,
}

/// Emitted by the [`ClientManagerDelegate`](crate::client::ClientManagerDelegate) for the
/// replication core to pick up.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
  /// A local change to a client's published instances.
  Changed { client_id: String },
  /// A client was removed. Responsibility is captured at removal time since the client itself is
  /// gone afterwards.
  Disconnected {
    client_id: String,
    kind: ClientKind,
    responsible: bool,
  },
}

#[test]
fn test_client_routing() {
  assert_eq!(ClientKind::of("1633410431321_127.0.0.1_51632"), ClientKind::Connection);
  assert_eq!(ClientKind::of("10.0.0.1:8080#true"), ClientKind::EphemeralIpPort);
  assert_eq!(ClientKind::of("10.0.0.1:8080#false"), ClientKind::PersistentIpPort);
  assert_eq!(ClientKind::of("10.0.0.1:8080#garbage"), ClientKind::EphemeralIpPort);
  assert_eq!(ClientKind::of("#"), ClientKind::EphemeralIpPort);
  assert_eq!(responsible_id("10.0.0.1:8080#true"), "10.0.0.1:8080");
  assert_eq!(responsible_id("conn-1"), "conn-1");
}
