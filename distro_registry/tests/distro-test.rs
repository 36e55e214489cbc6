use distro_registry::client::{responsible_id, InstanceRecord, ServiceKey, CLIENT_RESOURCE_TYPE};
use distro_registry::cluster::StaticMembership;
use distro_registry::core::{DataOperation, DistroConfig, DistroError, DistroKey, Socket};
use distro_registry::distro::DataStore;
use distro_registry::node::RegistryNode;
use distro_registry::testkit::{init_logging, FailureConfig, FailureConfigMap, LocalTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn service() -> ServiceKey {
  ServiceKey::new("public", "DEFAULT_GROUP", "orders")
}

fn config() -> DistroConfig {
  DistroConfig {
    sync_delay: Duration::from_millis(100),
    sync_retry_delay: Duration::from_millis(500),
    verify_interval: Duration::from_secs(60),
    sync_workers: 4,
    ..DistroConfig::default()
  }
}

struct Cluster {
  nodes: Vec<Arc<RegistryNode>>,
  membership: Arc<StaticMembership>,
  transport: Arc<LocalTransport>,
}
impl Cluster {
  fn start(size: u16) -> Cluster {
    let peers = (0..size).map(|i| Socket::localhost(8848 + i)).collect::<Vec<_>>();
    let membership = Arc::new(StaticMembership::new(peers.clone()));
    let transport = Arc::new(LocalTransport::default());
    let nodes = peers
      .into_iter()
      .map(|peer| {
        let node =
          RegistryNode::start(config(), peer, membership.clone(), transport.clone()).unwrap();
        transport.register(node.protocol());
        node
      })
      .collect();
    Cluster {
      nodes: nodes,
      membership: membership,
      transport: transport,
    }
  }

  /// The node the ring assigns an ip-port client to.
  fn owner(&self, client_id: &str) -> &Arc<RegistryNode> {
    let owner = self.nodes[0]
      .protocol()
      .mapper()
      .map_server(responsible_id(client_id));
    self.nodes.iter().find(|n| *n.local() == owner).unwrap()
  }

  fn seen_by(&self, node: usize) -> Vec<u16> {
    let mut ports = self.nodes[node]
      .clients()
      .service_instances(&service())
      .iter()
      .map(|i| i.port)
      .collect::<Vec<_>>();
    ports.sort();
    ports
  }

  async fn shutdown(self) {
    for node in self.nodes.iter() {
      node.shutdown().await;
    }
  }
}

fn ip_port_client(port: u16) -> String {
  format!("10.0.0.1:{}#true", port)
}

#[tokio::test(start_paused = true)]
async fn test_registrations_converge() {
  init_logging();
  let cluster = Cluster::start(3);
  for port in 9000..9012 {
    let id = ip_port_client(port);
    cluster
      .owner(&id)
      .clients()
      .register_instance(&id, service(), InstanceRecord::new("10.0.0.1", port));
  }
  for (i, node) in cluster.nodes.iter().enumerate() {
    let id = format!("conn-{}", i);
    node.clients().client_connected(&id);
    node
      .clients()
      .register_instance(&id, service(), InstanceRecord::new("10.0.0.2", 7000 + i as u16));
  }

  sleep(Duration::from_secs(2)).await;
  let expected = (7000..7003).chain(9000..9012).collect::<Vec<u16>>();
  for i in 0..3 {
    assert_eq!(cluster.seen_by(i), expected, "node {}", i);
  }
  // replicas never become authoritative
  for node in cluster.nodes.iter() {
    for id in node.clients().all_client_ids() {
      let client = node.clients().get_client(&id).unwrap();
      if client.native {
        assert!(node.clients().is_responsible_client(&client));
      }
    }
  }
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_removals_propagate() {
  init_logging();
  let cluster = Cluster::start(3);
  let ip_port = ip_port_client(9100);
  let owner = cluster.owner(&ip_port).clone();
  owner.clients().batch_register_instances(
    &ip_port,
    service(),
    vec![
      InstanceRecord::new("10.0.0.1", 9100),
      InstanceRecord::new("10.0.0.1", 9101),
    ],
  );
  cluster.nodes[1].clients().client_connected("conn-a");
  cluster.nodes[1]
    .clients()
    .register_instance("conn-a", service(), InstanceRecord::new("10.0.0.3", 7100));
  sleep(Duration::from_secs(1)).await;
  for i in 0..3 {
    assert_eq!(cluster.seen_by(i), vec![7100, 9100, 9101]);
  }

  owner
    .clients()
    .deregister_instance(&ip_port, service(), InstanceRecord::new("10.0.0.1", 9101));
  cluster.nodes[1].clients().client_disconnected("conn-a");
  sleep(Duration::from_secs(1)).await;
  for i in 0..3 {
    assert_eq!(cluster.seen_by(i), vec![9100]);
    assert!(!cluster.nodes[i].clients().contains("conn-a"));
    assert!(cluster.nodes[i].clients().contains(&ip_port));
  }
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_rapid_changes_are_coalesced() {
  init_logging();
  let cluster = Cluster::start(2);
  cluster.nodes[0].clients().client_connected("conn-burst");
  for port in 0..50 {
    cluster.nodes[0]
      .clients()
      .register_instance("conn-burst", service(), InstanceRecord::new("10.0.0.4", port));
  }
  // let the event pump catch up, well inside the debounce window
  sleep(Duration::from_millis(10)).await;
  assert_eq!(cluster.nodes[0].protocol().engine().len(), 1);
  sleep(Duration::from_secs(1)).await;
  assert_eq!(cluster.seen_by(1).len(), 50);
  let replica = cluster.nodes[1].clients().get_client("conn-burst").unwrap();
  assert_eq!(
    replica.revision,
    cluster.nodes[0].clients().get_client("conn-burst").unwrap().revision
  );
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_peer_catches_up() {
  init_logging();
  let cluster = Cluster::start(3);
  let cut_off = cluster.nodes[2].local().clone();
  cluster.transport.partition(&cut_off);
  cluster.nodes[0].clients().client_connected("conn-b");
  cluster.nodes[0]
    .clients()
    .register_instance("conn-b", service(), InstanceRecord::new("10.0.0.5", 7200));

  sleep(Duration::from_secs(2)).await;
  assert_eq!(cluster.seen_by(1), vec![7200]);
  assert!(cluster.seen_by(2).is_empty());
  assert!(cluster.nodes[0]
    .protocol()
    .syncer()
    .is_claimed(CLIENT_RESOURCE_TYPE, "conn-b", &cut_off));

  cluster.transport.heal(&cut_off);
  sleep(Duration::from_secs(2)).await;
  assert_eq!(cluster.seen_by(2), vec![7200]);
  assert!(!cluster.nodes[0]
    .protocol()
    .syncer()
    .is_claimed(CLIENT_RESOURCE_TYPE, "conn-b", &cut_off));
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_departed_peer_is_given_up() {
  init_logging();
  let cluster = Cluster::start(3);
  let gone = cluster.nodes[2].local().clone();
  cluster.transport.partition(&gone);
  cluster.nodes[0].clients().client_connected("conn-c");
  cluster.nodes[0]
    .clients()
    .register_instance("conn-c", service(), InstanceRecord::new("10.0.0.6", 7300));
  sleep(Duration::from_secs(1)).await;
  cluster.membership.remove_peer(&gone);
  sleep(Duration::from_secs(2)).await;
  assert_eq!(cluster.nodes[0].protocol().syncer().in_flight(), 0);
  assert_eq!(cluster.seen_by(1), vec![7300]);
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lossy_network_converges() {
  init_logging();
  let cluster = Cluster::start(3);
  cluster.transport.set_failures(FailureConfigMap {
    cluster_wide: FailureConfig {
      drop_prob: 0.3,
      delay: Some((Duration::from_millis(5), Duration::from_millis(50))),
    },
    node_wide: im::HashMap::new(),
  });
  for (i, node) in cluster.nodes.iter().enumerate() {
    let id = format!("conn-lossy-{}", i);
    node.clients().client_connected(&id);
    for port in 0..4u16 {
      node.clients().register_instance(
        &id,
        service(),
        InstanceRecord::new("10.0.1.1", 100 * i as u16 + port),
      );
    }
  }
  sleep(Duration::from_secs(30)).await;
  for i in 0..3 {
    assert_eq!(cluster.seen_by(i).len(), 12, "node {}", i);
  }
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_verify_repairs_lost_replica() {
  init_logging();
  let cluster = Cluster::start(3);
  cluster.nodes[0].clients().client_connected("conn-d");
  cluster.nodes[0]
    .clients()
    .register_instance("conn-d", service(), InstanceRecord::new("10.0.0.7", 7400));
  sleep(Duration::from_secs(1)).await;
  assert_eq!(cluster.seen_by(1), vec![7400]);

  // a replica dropping the client does not touch the authoritative copy
  cluster.nodes[1].clients().client_disconnected("conn-d");
  assert!(cluster.seen_by(1).is_empty());
  assert_eq!(cluster.seen_by(2), vec![7400]);

  assert_eq!(cluster.nodes[0].protocol().verify_now().await, 1);
  sleep(Duration::from_secs(1)).await;
  assert_eq!(cluster.seen_by(1), vec![7400]);
  assert_eq!(cluster.nodes[0].protocol().verify_now().await, 0);
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_new_node_loads_snapshot() {
  init_logging();
  let cluster = Cluster::start(2);
  for (i, node) in cluster.nodes.iter().enumerate() {
    let id = format!("conn-snap-{}", i);
    node.clients().client_connected(&id);
    node
      .clients()
      .register_instance(&id, service(), InstanceRecord::new("10.0.0.8", 7500 + i as u16));
  }
  // persistent clients are not part of the snapshot
  cluster.nodes[0].clients().register_instance(
    "10.0.0.9:7600#false",
    service(),
    InstanceRecord::new("10.0.0.9", 7600),
  );
  sleep(Duration::from_secs(1)).await;

  let newcomer = RegistryNode::start(
    config(),
    Socket::localhost(8900),
    cluster.membership.clone(),
    cluster.transport.clone(),
  )
  .unwrap();
  cluster.transport.register(newcomer.protocol());
  let source = cluster.nodes[0].local().clone();
  assert_eq!(newcomer.protocol().load_snapshot(&source).await.unwrap(), 1);
  let mut ports = newcomer
    .clients()
    .service_instances(&service())
    .iter()
    .map(|i| i.port)
    .collect::<Vec<_>>();
  ports.sort();
  assert_eq!(ports, vec![7500, 7501]);
  assert!(newcomer
    .clients()
    .all_client_ids()
    .iter()
    .all(|id| !newcomer.clients().get_client(id).unwrap().native));

  cluster.transport.partition(&source);
  assert!(matches!(
    newcomer.protocol().load_snapshot(&source).await,
    Err(DistroError::PeerUnreachable(_))
  ));
  newcomer.shutdown().await;
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_replication() {
  init_logging();
  let cluster = Cluster::start(2);
  cluster.nodes[0].shutdown().await;
  assert!(matches!(
    cluster.nodes[0].protocol().start(),
    Err(DistroError::ShutDown)
  ));
  cluster.nodes[0].clients().client_connected("conn-e");
  cluster.nodes[0]
    .clients()
    .register_instance("conn-e", service(), InstanceRecord::new("10.0.0.10", 7700));
  sleep(Duration::from_secs(1)).await;
  assert!(cluster.nodes[0].protocol().engine().is_empty());
  assert!(cluster.seen_by(1).is_empty());
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_targeted_sync_reaches_only_its_target() {
  init_logging();
  let cluster = Cluster::start(3);
  cluster.nodes[0].clients().client_connected("conn-f");
  cluster.nodes[0]
    .clients()
    .register_instance("conn-f", service(), InstanceRecord::new("10.0.0.11", 7800));
  sleep(Duration::from_secs(1)).await;
  // replicas forgetting the client do not tell anyone
  for i in 1..3 {
    cluster.nodes[i].clients().client_disconnected("conn-f");
    assert!(cluster.seen_by(i).is_empty());
  }

  let origin = cluster.nodes[0].protocol();
  assert_eq!(cluster.nodes[0].store().verify_records().len(), 1);
  origin.sync_to_target(
    DistroKey::new("conn-f", CLIENT_RESOURCE_TYPE),
    DataOperation::Add,
    cluster.nodes[2].local().clone(),
    origin.config().sync_delay,
  );
  sleep(Duration::from_secs(1)).await;
  assert!(cluster.seen_by(1).is_empty());
  assert_eq!(cluster.seen_by(2), vec![7800]);
  cluster.shutdown().await;
}

// Cuts a replica of `client_id` off the cluster while the owner drops the client, so that the
// replica never hears of the removal, then brings it back.
async fn miss_removal(cluster: &Cluster, client_id: &str) -> Arc<RegistryNode> {
  let owner = cluster.owner(client_id).clone();
  let replica = cluster
    .nodes
    .iter()
    .find(|n| n.local() != owner.local())
    .unwrap()
    .clone();
  assert_eq!(replica.clients().get_client(client_id).map(|c| c.native), Some(false));
  let away = replica.local().clone();
  cluster.membership.remove_peer(&away);
  cluster.transport.partition(&away);
  owner.clients().client_disconnected(client_id);
  sleep(Duration::from_secs(2)).await;
  assert!(replica.clients().contains(client_id));
  cluster.membership.add_peer(away.clone());
  cluster.transport.heal(&away);
  replica
}

#[tokio::test(start_paused = true)]
async fn test_stale_replica_expires() {
  init_logging();
  let cluster = Cluster::start(3);
  let id = ip_port_client(9100);
  cluster
    .owner(&id)
    .clients()
    .register_instance(&id, service(), InstanceRecord::new("10.0.0.1", 9100));
  sleep(Duration::from_secs(1)).await;

  let replica = miss_removal(&cluster, &id).await;
  sleep(Duration::from_secs(60)).await;
  assert!(replica.clients().contains(&id));
  sleep(Duration::from_secs(540)).await;
  assert!(!replica.clients().contains(&id));
  for i in 0..3 {
    assert!(cluster.seen_by(i).is_empty(), "node {}", i);
  }
  cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recreated_client_replaces_replica() {
  init_logging();
  let cluster = Cluster::start(3);
  let id = ip_port_client(9100);
  let owner = cluster.owner(&id).clone();
  owner
    .clients()
    .register_instance(&id, service(), InstanceRecord::new("10.0.0.1", 9100));
  sleep(Duration::from_secs(1)).await;

  let replica = miss_removal(&cluster, &id).await;
  owner
    .clients()
    .register_instance(&id, service(), InstanceRecord::new("10.0.0.1", 9200));
  sleep(Duration::from_secs(2)).await;
  for i in 0..3 {
    assert_eq!(cluster.seen_by(i), vec![9200], "node {}", i);
  }
  assert_eq!(
    replica.clients().get_client(&id).unwrap().revision,
    owner.clients().get_client(&id).unwrap().revision
  );
  cluster.shutdown().await;
}
