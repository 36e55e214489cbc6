use distro_registry::client::{InstanceRecord, ServiceKey};
use distro_registry::cluster::StaticMembership;
use distro_registry::core::{DistroConfig, Socket};
use distro_registry::node::RegistryNode;
use distro_registry::testkit::LocalTransport;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// Starts a three node cluster in one process, registers a few instances on whichever node owns
// each client and prints what every node ends up seeing. An optional argument is a JSON config.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = match std::env::args().nth(1) {
    Some(path) => DistroConfig::from_json(&std::fs::read_to_string(path)?)?,
    None => DistroConfig {
      sync_delay: Duration::from_millis(200),
      ..DistroConfig::default()
    },
  };
  let peers = (8848u16..8851).map(Socket::localhost).collect::<Vec<_>>();
  let membership = Arc::new(StaticMembership::new(peers.clone()));
  let transport = Arc::new(LocalTransport::default());
  let mut nodes = Vec::new();
  for peer in peers.iter() {
    let node = RegistryNode::start(
      config.clone(),
      peer.clone(),
      membership.clone(),
      transport.clone(),
    )?;
    transport.register(node.protocol());
    nodes.push(node);
  }

  let service = ServiceKey::new("public", "DEFAULT_GROUP", "orders");
  for port in 9000u16..9006 {
    let client_id = format!("10.0.0.1:{}#true", port);
    let owner = nodes[0].protocol().mapper().map_server(&format!("10.0.0.1:{}", port));
    let node = nodes.iter().find(|n| *n.local() == owner).unwrap_or(&nodes[0]);
    node
      .clients()
      .register_instance(&client_id, service.clone(), InstanceRecord::new("10.0.0.1", port));
    info!(client_id = %client_id, owner = %owner, "registered");
  }

  tokio::time::sleep(config.sync_delay * 4 + Duration::from_millis(500)).await;
  for node in nodes.iter() {
    let ports = node
      .clients()
      .service_instances(&service)
      .iter()
      .map(|i| i.port)
      .collect::<Vec<_>>();
    println!("{} sees {} -> {:?}", node.local(), service, ports);
  }
  for node in nodes.iter() {
    node.shutdown().await;
  }
  Ok(())
}
