use distro_registry::client::{
  ClientDataStore, ClientEvent, ClientKind, ClientManagerDelegate, ClientSyncData, InstanceRecord,
  ServiceKey, CLIENT_RESOURCE_TYPE,
};
use distro_registry::cluster::{OwnershipMapper, StaticMembership};
use distro_registry::core::{encode, DataOperation, Datum, DistroBatch, Socket, VerifyRecord};
use distro_registry::crdt::{ConflictResolver, HybridLogicalClock, PhysicalClock};
use distro_registry::distro::DataStore;
use maplit::btreemap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const EXPIRED: Duration = Duration::from_secs(180);

fn service() -> ServiceKey {
  ServiceKey::new("public", "DEFAULT_GROUP", "orders")
}

fn delegate_with(
  local: Socket,
  peers: Vec<Socket>,
) -> (Arc<ClientManagerDelegate>, UnboundedReceiver<ClientEvent>) {
  let membership = Arc::new(StaticMembership::new(peers));
  let mapper = Arc::new(OwnershipMapper::new(local.clone(), membership, 64));
  let clock = Arc::new(HybridLogicalClock::new(local.to_string()));
  let (delegate, events) =
    ClientManagerDelegate::new(mapper, clock, ConflictResolver::new(Duration::from_millis(500)));
  (Arc::new(delegate), events)
}

// Alone in the cluster, the node is responsible for everything.
fn delegate() -> (Arc<ClientManagerDelegate>, UnboundedReceiver<ClientEvent>) {
  delegate_with(Socket::localhost(8848), vec![])
}

// Ip-port addresses another peer of a two node cluster owns.
fn not_owned_by(local: &Socket, other: &Socket, count: usize) -> Vec<String> {
  let membership = Arc::new(StaticMembership::new(vec![local.clone(), other.clone()]));
  let mapper = OwnershipMapper::new(local.clone(), membership, 64);
  (0..255)
    .map(|i| format!("10.2.0.{}:80", i))
    .filter(|addr| !mapper.is_responsible(addr))
    .take(count)
    .collect()
}

fn drain(events: &mut UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
  let mut out = Vec::new();
  while let Ok(e) = events.try_recv() {
    out.push(e);
  }
  out
}

#[test]
fn test_routing_and_idempotent_disconnect() {
  let (clients, mut events) = delegate();
  assert!(clients.client_connected("conn-1"));
  assert!(clients.client_connected("10.0.0.1:80#true"));
  assert!(clients.client_connected("10.0.0.1:80#false"));
  assert_eq!(clients.get_client("conn-1").unwrap().kind, ClientKind::Connection);
  assert_eq!(
    clients.get_client("10.0.0.1:80#false").unwrap().kind,
    ClientKind::PersistentIpPort
  );
  let mut ids = clients.all_client_ids();
  ids.sort();
  assert_eq!(ids, vec!["10.0.0.1:80#false", "10.0.0.1:80#true", "conn-1"]);

  assert!(clients.get_client("unknown").is_none());
  assert!(clients.client_disconnected("conn-1"));
  assert!(clients.client_disconnected("conn-1"));
  assert!(!clients.contains("conn-1"));
  assert_eq!(
    drain(&mut events),
    vec![ClientEvent::Disconnected {
      client_id: "conn-1".to_string(),
      kind: ClientKind::Connection,
      responsible: true,
    }]
  );
}

#[test]
fn test_verify_client() {
  let (clients, _events) = delegate();
  let id = "10.0.0.2:80#true";
  clients.register_instance(id, service(), InstanceRecord::new("10.0.0.2", 80));
  let revision = clients.get_client(id).unwrap().revision;
  assert!(revision > 0);
  assert!(clients.verify_client(id, revision));
  assert!(clients.verify_client(id, 0));
  assert!(!clients.verify_client(id, revision + 1));
  assert!(!clients.verify_client("10.9.9.9:80#true", 1));

  clients.register_instance("10.0.0.3:80#false", service(), InstanceRecord::new("10.0.0.3", 80));
  assert!(!clients.verify_client("10.0.0.3:80#false", 0));
}

#[test]
fn test_events_become_tasks() {
  let (clients, mut events) = delegate();
  let store = ClientDataStore::new(clients.clone());
  clients.register_instance("10.0.0.4:80#true", service(), InstanceRecord::new("10.0.0.4", 80));
  clients.register_instance("10.0.0.5:80#false", service(), InstanceRecord::new("10.0.0.5", 80));
  clients.client_disconnected("10.0.0.4:80#true");
  clients.client_disconnected("10.0.0.5:80#false");

  let tasks = drain(&mut events)
    .iter()
    .filter_map(|e| store.on_event(e))
    .map(|(key, op)| (key.resource_key, key.resource_type, op))
    .collect::<Vec<_>>();
  assert_eq!(
    tasks,
    vec![(
      "10.0.0.4:80#true".to_string(),
      CLIENT_RESOURCE_TYPE.to_string(),
      DataOperation::Delete
    )]
  );
}

#[test]
fn test_changed_client_is_synced_only_when_responsible() {
  let (clients, mut events) = delegate();
  let store = ClientDataStore::new(clients.clone());
  clients.register_instance("10.0.0.4:80#true", service(), InstanceRecord::new("10.0.0.4", 80));
  let tasks = drain(&mut events)
    .iter()
    .filter_map(|e| store.on_event(e))
    .collect::<Vec<_>>();
  assert_eq!(tasks.len(), 1);
  assert_eq!(tasks[0].1, DataOperation::Change);

  let local = Socket::localhost(1);
  let other = Socket::localhost(2);
  let (clients, mut events) = delegate_with(local.clone(), vec![local.clone(), other.clone()]);
  let store = ClientDataStore::new(clients.clone());
  let foreign = (0..100)
    .map(|i| format!("10.1.0.{}:80", i))
    .find(|addr| {
      let membership = Arc::new(StaticMembership::new(vec![local.clone(), other.clone()]));
      !OwnershipMapper::new(local.clone(), membership, 64).is_responsible(addr)
    })
    .unwrap();
  clients.register_instance(
    &format!("{}#true", foreign),
    service(),
    InstanceRecord::new("10.1.0.1", 80),
  );
  assert!(drain(&mut events).iter().all(|e| store.on_event(e).is_none()));
}

#[test]
fn test_service_instances_deduplicated() {
  let (clients, _events) = delegate();
  let shared = InstanceRecord::new("10.0.0.9", 8080);
  clients.register_instance("conn-a", service(), shared.clone());
  clients.client_connected("conn-a");
  clients.register_instance("conn-a", service(), shared.clone());
  clients.batch_register_instances(
    "10.0.0.9:8080#true",
    service(),
    vec![shared.clone(), InstanceRecord::new("10.0.0.10", 8080)],
  );
  let mut ports = clients
    .service_instances(&service())
    .iter()
    .map(|i| (i.ip.clone(), i.port))
    .collect::<Vec<_>>();
  ports.sort();
  assert_eq!(
    ports,
    vec![("10.0.0.10".to_string(), 8080), ("10.0.0.9".to_string(), 8080)]
  );

  clients.deregister_instance("10.0.0.9:8080#true", service(), shared.clone());
  assert_eq!(clients.service_instances(&service()).len(), 2);
  let own = clients.get_client("10.0.0.9:8080#true").unwrap().instances(&service());
  assert_eq!(own, vec![InstanceRecord::new("10.0.0.10", 8080)]);
  clients.deregister_instance("conn-a", service(), shared);
  assert_eq!(clients.service_instances(&service()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remove_expired() {
  let (clients, mut events) = delegate();
  clients.client_connected("10.0.0.6:80#true");
  clients.register_instance("10.0.0.7:80#true", service(), InstanceRecord::new("10.0.0.7", 80));
  clients.client_connected("conn-native");
  clients.sync_client_connected("conn-replica");
  drain(&mut events);

  assert!(clients.remove_expired(Instant::now(), EXPIRED).is_empty());
  tokio::time::advance(Duration::from_secs(100)).await;
  assert!(clients.heartbeat("10.0.0.6:80#true"));
  assert!(!clients.heartbeat("10.0.0.99:80#true"));
  tokio::time::advance(Duration::from_secs(81)).await;
  assert_eq!(clients.remove_expired(Instant::now(), EXPIRED), vec!["conn-replica"]);

  tokio::time::advance(Duration::from_secs(100)).await;
  assert_eq!(
    clients.remove_expired(Instant::now(), EXPIRED),
    vec!["10.0.0.6:80#true"]
  );
  assert!(clients.contains("10.0.0.7:80#true"));
  assert!(clients.contains("conn-native"));
  assert_eq!(drain(&mut events).len(), 2);
}

#[test]
fn test_apply_remote_state() {
  let (origin, _) = delegate();
  origin.register_instance("conn-x", service(), InstanceRecord::new("10.0.0.8", 80));
  origin.client_connected("conn-x");
  origin.register_instance("conn-x", service(), InstanceRecord::new("10.0.0.8", 80));
  let remote = origin.get_client("conn-x").unwrap();

  let (replica, mut events) = delegate();
  let store = ClientDataStore::new(replica.clone());
  let batch = DistroBatch {
    resource_type: CLIENT_RESOURCE_TYPE.to_string(),
    operation: DataOperation::Change,
    origin: Socket::localhost(1),
    clock: HybridLogicalClock::new("remote").generate_for_sending(),
    data: btreemap! {
      "conn-x".to_string() => Datum {
        key: "conn-x".to_string(),
        value: encode(&remote.sync_data()).unwrap(),
        revision: remote.revision,
      },
    },
  };
  assert!(store.apply(&batch).unwrap());
  assert!(!store.apply(&batch).unwrap());

  let copy = replica.get_client("conn-x").unwrap();
  assert!(!copy.native);
  assert_eq!(copy.revision, remote.revision);
  assert_eq!(replica.service_instances(&service()).len(), 1);
  // replicas are not authoritative and produce no replication work
  assert!(drain(&mut events).iter().all(|e| store.on_event(e).is_none()));
  assert!(store.verify_records().is_empty());
  assert!(store.verify(&VerifyRecord {
    resource_type: CLIENT_RESOURCE_TYPE.to_string(),
    key: "conn-x".to_string(),
    revision: remote.revision,
  }));

  let delete = DistroBatch {
    operation: DataOperation::Delete,
    data: btreemap! { "conn-x".to_string() => Datum::tombstone("conn-x".to_string()) },
    ..batch
  };
  assert!(store.apply(&delete).unwrap());
  assert!(!replica.contains("conn-x"));
  assert!(!store.apply(&delete).unwrap());
}

#[test]
fn test_snapshot_contains_ephemeral_clients() {
  let (clients, _) = delegate();
  let store = ClientDataStore::new(clients.clone());
  clients.register_instance("10.0.0.1:80#true", service(), InstanceRecord::new("10.0.0.1", 80));
  clients.register_instance("10.0.0.2:80#false", service(), InstanceRecord::new("10.0.0.2", 80));
  clients.client_connected("conn-y");
  let snapshot = store.snapshot().unwrap();
  assert_eq!(
    snapshot.keys().cloned().collect::<Vec<_>>(),
    vec!["10.0.0.1:80#true", "conn-y"]
  );
  let data: ClientSyncData =
    distro_registry::core::decode(&snapshot["10.0.0.1:80#true"].value).unwrap();
  assert_eq!(data.services.len(), 1);
}

#[test]
fn test_reconnected_client_gets_a_fresh_revision() {
  let (clients, _events) = delegate();
  clients.client_connected("conn-r");
  let first = clients.get_client("conn-r").unwrap().revision;
  clients.client_disconnected("conn-r");
  clients.client_connected("conn-r");
  let second = clients.get_client("conn-r").unwrap().revision;
  assert!(second > first);
  assert!(!clients.verify_client("conn-r", first));
  assert!(clients.verify_client("conn-r", second));
}

#[test]
fn test_peer_state_replaces_replica() {
  let (replica, _events) = delegate();
  let pushed = |client_id: &str, port: u16, revision: u64| {
    let (origin, _) = delegate();
    origin.client_connected(client_id);
    origin.register_instance(client_id, service(), InstanceRecord::new("10.0.0.12", port));
    let mut data = origin.get_client(client_id).unwrap().sync_data();
    data.revision = revision;
    data
  };

  assert!(replica.apply_sync_data(pushed("conn-z", 80, 5)));
  // the same revision from a re-created client still replaces the copy
  assert!(replica.apply_sync_data(pushed("conn-z", 81, 5)));
  assert_eq!(
    replica.get_client("conn-z").unwrap().instances(&service()),
    vec![InstanceRecord::new("10.0.0.12", 81)]
  );
  assert_eq!(replica.service_instances(&service()).len(), 1);

  replica.client_connected("conn-own");
  replica.register_instance("conn-own", service(), InstanceRecord::new("10.0.0.13", 80));
  assert!(!replica.apply_sync_data(pushed("conn-own", 90, 1)));
  assert_eq!(
    replica.get_client("conn-own").unwrap().instances(&service()),
    vec![InstanceRecord::new("10.0.0.13", 80)]
  );
}

#[tokio::test(start_paused = true)]
async fn test_unverified_replica_expires() {
  let local = Socket::localhost(1);
  let other = Socket::localhost(2);
  let (clients, _events) = delegate_with(local.clone(), vec![local.clone(), other.clone()]);
  let foreign = not_owned_by(&local, &other, 2);
  let replica_id = format!("{}#true", foreign[0]);
  let native_id = format!("{}#true", foreign[1]);

  let (origin, _) = delegate();
  origin.register_instance(&replica_id, service(), InstanceRecord::new("10.2.1.1", 80));
  assert!(clients.apply_sync_data(origin.get_client(&replica_id).unwrap().sync_data()));
  clients.register_instance(&native_id, service(), InstanceRecord::new("10.2.1.2", 80));

  tokio::time::advance(Duration::from_secs(100)).await;
  assert!(clients.verify_client(&replica_id, 0));
  tokio::time::advance(Duration::from_secs(100)).await;
  assert!(clients.remove_expired(Instant::now(), EXPIRED).is_empty());
  tokio::time::advance(Duration::from_secs(81)).await;
  assert_eq!(clients.remove_expired(Instant::now(), EXPIRED), vec![replica_id]);
  assert!(clients.contains(&native_id));
}

struct ManualClock(AtomicI64);
impl PhysicalClock for ManualClock {
  fn now_millis(&self) -> i64 {
    self.0.load(Ordering::SeqCst)
  }
}

#[test]
fn test_removed_instances_are_forgotten() {
  let physical = Arc::new(ManualClock(AtomicI64::new(10_000)));
  let local = Socket::localhost(8848);
  let membership = Arc::new(StaticMembership::new(vec![]));
  let mapper = Arc::new(OwnershipMapper::new(local, membership, 64));
  let clock = Arc::new(HybridLogicalClock::with_clock(
    "p1",
    1,
    Duration::from_millis(500),
    physical.clone(),
  ));
  let resolver =
    ConflictResolver::new(Duration::from_millis(500)).with_tombstone_ttl(Duration::from_secs(2));
  let (clients, _events) = ClientManagerDelegate::new(mapper, clock, resolver);
  let id = "10.0.0.13:80#true";
  let entries = |clients: &ClientManagerDelegate| {
    clients.get_client(id).unwrap().published[&service()].entries.len()
  };

  clients.register_instance(id, service(), InstanceRecord::new("10.0.0.13", 80));
  clients.register_instance(id, service(), InstanceRecord::new("10.0.0.13", 81));
  clients.deregister_instance(id, service(), InstanceRecord::new("10.0.0.13", 81));
  assert_eq!(entries(&clients), 2);

  physical.0.store(13_000, Ordering::SeqCst);
  clients.register_instance(id, service(), InstanceRecord::new("10.0.0.13", 80));
  assert_eq!(entries(&clients), 1);
  assert_eq!(clients.service_instances(&service()).len(), 1);
}
