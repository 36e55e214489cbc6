use crate::client::responsible_id;
use crate::client::{
  Client, ClientEvent, ClientKind, ClientSyncData, InstanceRecord, ServiceKey,
};
use crate::cluster::OwnershipMapper;
use crate::crdt::{
  ConflictResolver, HybridLogicalClock, InstanceSet, Operation, OperationType, CRDT,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Client storage shared by the sub-registries.
#[derive(Default)]
pub struct ClientTable {
  clients: DashMap<String, Client>,
}
impl ClientTable {
  pub fn get(&self, client_id: &str) -> Option<Client> {
    self.clients.get(client_id).map(|c| c.value().clone())
  }

  pub fn ids(&self) -> Vec<String> {
    self.clients.iter().map(|c| c.key().clone()).collect()
  }

  pub fn update<R, F: FnOnce(&mut Client) -> R>(&self, client_id: &str, f: F) -> Option<R> {
    self.clients.get_mut(client_id).map(|mut c| f(c.value_mut()))
  }
}

/// One of the registries a client can live in. Which one is decided by
/// [`ClientKind::of`] on the client id, and a client never moves between them.
pub trait ClientManager: Send + Sync + 'static {
  fn table(&self) -> &ClientTable;

  fn is_responsible_client(&self, client: &Client) -> bool;

  /// Checks a peer's claim that `client_id` is at `revision`. On success the client's liveness is
  /// refreshed.
  fn verify_client(&self, client_id: &str, revision: u64) -> bool;

  /// Whether the expiry sweep should remove `client`.
  fn is_expired(&self, client: &Client, now: Instant, expired_time: Duration) -> bool;

  fn client_connected(&self, client: Client) -> bool {
    self
      .table()
      .clients
      .entry(client.client_id.clone())
      .or_insert(client);
    true
  }

  fn client_disconnected(&self, client_id: &str) -> Option<Client> {
    self.table().clients.remove(client_id).map(|(_, c)| c)
  }

  fn get_client(&self, client_id: &str) -> Option<Client> {
    self.table().get(client_id)
  }

  fn contains(&self, client_id: &str) -> bool {
    self.table().clients.contains_key(client_id)
  }

  fn all_client_ids(&self) -> Vec<String> {
    self.table().ids()
  }
}

// Both liveness-tracked kinds accept revision 0 from peers that do not track revisions.
fn verify_revision(table: &ClientTable, client_id: &str, revision: u64) -> bool {
  table
    .update(client_id, |c| {
      if revision == 0 || c.revision == revision {
        c.touch();
        true
      } else {
        debug!(
          target: "client",
          client_id = client_id,
          local = c.revision,
          remote = revision,
          "revision mismatch"
        );
        false
      }
    })
    .unwrap_or(false)
}

/// Clients identified by a long-lived connection to some node. The node holding the connection
/// is authoritative.
#[derive(Default)]
pub struct ConnectionBasedClientManager {
  table: ClientTable,
}
impl ClientManager for ConnectionBasedClientManager {
  fn table(&self) -> &ClientTable {
    &self.table
  }

  fn is_responsible_client(&self, client: &Client) -> bool {
    client.native
  }

  fn verify_client(&self, client_id: &str, revision: u64) -> bool {
    verify_revision(&self.table, client_id, revision)
  }

  fn is_expired(&self, client: &Client, now: Instant, expired_time: Duration) -> bool {
    !client.native && now.saturating_duration_since(client.last_active) > expired_time
  }
}

/// Heartbeat-driven clients keyed by `ip:port#true`. Ownership follows the ring.
pub struct EphemeralIpPortClientManager {
  table: ClientTable,
  mapper: Arc<OwnershipMapper>,
}
impl EphemeralIpPortClientManager {
  pub fn new(mapper: Arc<OwnershipMapper>) -> EphemeralIpPortClientManager {
    EphemeralIpPortClientManager {
      table: ClientTable::default(),
      mapper: mapper,
    }
  }
}
impl ClientManager for EphemeralIpPortClientManager {
  fn table(&self) -> &ClientTable {
    &self.table
  }

  fn is_responsible_client(&self, client: &Client) -> bool {
    self.mapper.is_responsible(responsible_id(&client.client_id))
  }

  fn verify_client(&self, client_id: &str, revision: u64) -> bool {
    verify_revision(&self.table, client_id, revision)
  }

  // The owner expires clients that stopped publishing. Replicas are kept alive by the owner's
  // pushes and verify rounds, one that hears nothing for a whole period was dropped upstream.
  fn is_expired(&self, client: &Client, now: Instant, expired_time: Duration) -> bool {
    let idle = now.saturating_duration_since(client.last_active) > expired_time;
    if self.is_responsible_client(client) {
      idle && !client.has_instances()
    } else {
      idle && !client.native
    }
  }
}

/// Clients keyed by `ip:port#false`. They are never replicated through this core and never
/// expire.
pub struct PersistentIpPortClientManager {
  table: ClientTable,
  mapper: Arc<OwnershipMapper>,
}
impl PersistentIpPortClientManager {
  pub fn new(mapper: Arc<OwnershipMapper>) -> PersistentIpPortClientManager {
    PersistentIpPortClientManager {
      table: ClientTable::default(),
      mapper: mapper,
    }
  }
}
impl ClientManager for PersistentIpPortClientManager {
  fn table(&self) -> &ClientTable {
    &self.table
  }

  fn is_responsible_client(&self, client: &Client) -> bool {
    self.mapper.is_responsible(responsible_id(&client.client_id))
  }

  fn verify_client(&self, client_id: &str, _revision: u64) -> bool {
    warn!(target: "client", client_id = client_id, "persistent clients are not verified");
    false
  }

  fn is_expired(&self, _client: &Client, _now: Instant, _expired_time: Duration) -> bool {
    false
  }
}

/// The entry point for everything client related. Routes each call to the sub-registry that owns
/// the client id, stamps instance changes with the node's clock and reports changes as
/// [`ClientEvent`]s.
pub struct ClientManagerDelegate {
  connection: ConnectionBasedClientManager,
  ephemeral: EphemeralIpPortClientManager,
  persistent: PersistentIpPortClientManager,
  clock: Arc<HybridLogicalClock>,
  resolver: ConflictResolver,
  events: UnboundedSender<ClientEvent>,
}
impl ClientManagerDelegate {
  pub fn new(
    mapper: Arc<OwnershipMapper>,
    clock: Arc<HybridLogicalClock>,
    resolver: ConflictResolver,
  ) -> (ClientManagerDelegate, UnboundedReceiver<ClientEvent>) {
    let (tx, rx) = unbounded_channel();
    let delegate = ClientManagerDelegate {
      connection: ConnectionBasedClientManager::default(),
      ephemeral: EphemeralIpPortClientManager::new(mapper.clone()),
      persistent: PersistentIpPortClientManager::new(mapper),
      clock: clock,
      resolver: resolver,
      events: tx,
    };
    (delegate, rx)
  }

  fn route(&self, client_id: &str) -> &dyn ClientManager {
    match ClientKind::of(client_id) {
      ClientKind::Connection => &self.connection,
      ClientKind::EphemeralIpPort => &self.ephemeral,
      ClientKind::PersistentIpPort => &self.persistent,
    }
  }

  fn managers(&self) -> [&dyn ClientManager; 3] {
    [&self.connection, &self.ephemeral, &self.persistent]
  }

  fn emit(&self, event: ClientEvent) {
    if self.events.send(event).is_err() {
      debug!(target: "client", "client event receiver dropped");
    }
  }

  /// A client connected to this node. Its revision starts at the current clock so that a client
  /// re-created under the same id never repeats the revisions of an earlier incarnation.
  pub fn client_connected(&self, client_id: &str) -> bool {
    debug!(target: "client", client_id = client_id, "client connected");
    let mut client = Client::new(client_id, true);
    client.revision = self.clock.generate_for_sending().packed();
    self.route(client_id).client_connected(client)
  }

  /// A peer told us about a client connected to it.
  pub fn sync_client_connected(&self, client_id: &str) -> bool {
    self.route(client_id).client_connected(Client::new(client_id, false))
  }

  /// Removes a client. Removing an unknown client succeeds and emits nothing.
  pub fn client_disconnected(&self, client_id: &str) -> bool {
    let manager = self.route(client_id);
    let client = match manager.get_client(client_id) {
      Some(client) => client,
      None => return true,
    };
    let responsible = manager.is_responsible_client(&client);
    if let Some(client) = manager.client_disconnected(client_id) {
      info!(
        target: "client",
        client_id = client_id,
        native = client.native,
        "client disconnected"
      );
      self.emit(ClientEvent::Disconnected {
        client_id: client.client_id,
        kind: client.kind,
        responsible: responsible,
      });
    }
    true
  }

  pub fn get_client(&self, client_id: &str) -> Option<Client> {
    self.route(client_id).get_client(client_id)
  }

  pub fn contains(&self, client_id: &str) -> bool {
    self.route(client_id).contains(client_id)
  }

  pub fn all_client_ids(&self) -> Vec<String> {
    self
      .managers()
      .iter()
      .flat_map(|m| m.all_client_ids())
      .collect()
  }

  pub fn is_responsible_client(&self, client: &Client) -> bool {
    self.route(&client.client_id).is_responsible_client(client)
  }

  pub fn verify_client(&self, client_id: &str, revision: u64) -> bool {
    self.route(client_id).verify_client(client_id, revision)
  }

  /// Refreshes the liveness of a client without changing its data.
  pub fn heartbeat(&self, client_id: &str) -> bool {
    self
      .route(client_id)
      .table()
      .update(client_id, |c| c.touch())
      .is_some()
  }

  pub fn register_instance(&self, client_id: &str, service: ServiceKey, instance: InstanceRecord) {
    self.batch_register_instances(client_id, service, vec![instance])
  }

  /// Publishes `instances` for `service` on behalf of `client_id`. Ip-port clients are created
  /// on their first registration.
  pub fn batch_register_instances(
    &self,
    client_id: &str,
    service: ServiceKey,
    instances: Vec<InstanceRecord>,
  ) {
    if ClientKind::of(client_id) != ClientKind::Connection && !self.contains(client_id) {
      self.client_connected(client_id);
    }
    let ops = instances
      .into_iter()
      .map(|i| Operation::new(OperationType::AddInstance, i, self.clock.generate_for_sending()))
      .collect::<Vec<_>>();
    self.publish(client_id, service, ops);
  }

  pub fn deregister_instance(&self, client_id: &str, service: ServiceKey, instance: InstanceRecord) {
    let op = Operation::new(
      OperationType::RemoveInstance,
      instance,
      self.clock.generate_for_sending(),
    );
    self.publish(client_id, service, vec![op]);
  }

  fn publish(&self, client_id: &str, service: ServiceKey, ops: Vec<Operation>) {
    let resolver = self.resolver;
    let now = self.clock.current();
    let applied = self.route(client_id).table().update(client_id, |c| {
      let current = c.published.get(&service).cloned().unwrap_or_default();
      let resolved = resolver.resolve(current, ops);
      c.published
        .insert(service.clone(), resolver.prune(resolved, &now));
      c.revision += 1;
      c.touch();
    });
    match applied {
      Some(()) => self.emit(ClientEvent::Changed {
        client_id: client_id.to_string(),
      }),
      None => warn!(
        target: "client",
        client_id = client_id,
        service = %service,
        "publish for unknown client ignored"
      ),
    }
  }

  /// The live instances of `service` across all clients, one per instance identity.
  pub fn service_instances(&self, service: &ServiceKey) -> Vec<InstanceRecord> {
    let mut merged = InstanceSet::minimum();
    for manager in self.managers() {
      for id in manager.all_client_ids() {
        if let Some(set) = manager.get_client(&id).and_then(|c| c.published.get(service).cloned()) {
          let live = InstanceSet {
            entries: set.entries.into_iter().filter(|(_, e)| e.record.is_some()).collect(),
          };
          merged = self.resolver.merge(merged, live);
        }
      }
    }
    merged.live().cloned().collect()
  }

  /// Replaces the local copy of a client with the state a peer sent. A client that connected here
  /// and that this node is authoritative for is left alone. Returns whether anything changed.
  pub fn apply_sync_data(&self, data: ClientSyncData) -> bool {
    let manager = self.route(&data.client_id);
    if let Some(local) = manager.get_client(&data.client_id) {
      if local.native && manager.is_responsible_client(&local) {
        debug!(
          target: "client",
          client_id = %data.client_id,
          "ignoring peer state for an authoritative client"
        );
        return false;
      }
    }
    let created = !manager.contains(&data.client_id)
      && manager.client_connected(Client::new(data.client_id.clone(), false));
    let updated = manager
      .table()
      .update(&data.client_id, |c| {
        c.touch();
        let changed = c.revision != data.revision || c.published != data.services;
        c.published = data.services;
        c.revision = data.revision;
        changed
      })
      .unwrap_or(false);
    created || updated
  }

  /// Live ephemeral clients this node is authoritative for, with their revisions.
  pub fn responsible_revisions(&self) -> BTreeMap<String, u64> {
    [&self.connection as &dyn ClientManager, &self.ephemeral]
      .iter()
      .flat_map(|m| {
        m.all_client_ids()
          .into_iter()
          .filter_map(|id| m.get_client(&id))
          .filter(|c| m.is_responsible_client(c))
          .map(|c| (c.client_id, c.revision))
          .collect::<Vec<_>>()
      })
      .collect()
  }

  /// Every ephemeral client this node knows, native or replica.
  pub fn ephemeral_clients(&self) -> Vec<Client> {
    [&self.connection as &dyn ClientManager, &self.ephemeral]
      .iter()
      .flat_map(|m| {
        m.all_client_ids()
          .into_iter()
          .filter_map(|id| m.get_client(&id))
          .collect::<Vec<_>>()
      })
      .collect()
  }

  /// Disconnects every client whose sub-registry considers it expired. Returns the removed ids.
  pub fn remove_expired(&self, now: Instant, expired_time: Duration) -> Vec<String> {
    let expired = self
      .managers()
      .iter()
      .flat_map(|m| {
        m.all_client_ids()
          .into_iter()
          .filter_map(|id| m.get_client(&id))
          .filter(|c| m.is_expired(c, now, expired_time))
          .map(|c| c.client_id)
          .collect::<Vec<_>>()
      })
      .collect::<Vec<_>>();
    for id in expired.iter() {
      info!(target: "client", client_id = %id, "client expired");
      self.client_disconnected(id);
    }
    expired
  }
}
