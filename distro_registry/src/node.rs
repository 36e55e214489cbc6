use crate::client::{ClientDataStore, ClientManagerDelegate};
use crate::cluster::MembershipView;
use crate::core::{DistroConfig, Result, Socket};
use crate::distro::{DistroProtocol, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A registry node: the client registry plus the replication core keeping it in sync with the
/// peers.
pub struct RegistryNode {
  protocol: Arc<DistroProtocol>,
  clients: Arc<ClientManagerDelegate>,
  store: Arc<ClientDataStore>,
  cancel: CancellationToken,
  workers: Mutex<Vec<JoinHandle<()>>>,
}
impl RegistryNode {
  /// Builds the node and spawns all of its background work. Must be called from within a tokio
  /// runtime.
  pub fn start(
    config: DistroConfig,
    local: Socket,
    membership: Arc<dyn MembershipView>,
    transport: Arc<dyn Transport>,
  ) -> Result<Arc<RegistryNode>> {
    let expire_interval = config.expire_interval;
    let expired_time = config.client_expired_time;
    let protocol = Arc::new(DistroProtocol::new(config, local, membership, transport)?);
    let (clients, events) = ClientManagerDelegate::new(
      protocol.mapper().clone(),
      protocol.clock().clone(),
      protocol.resolver(),
    );
    let clients = Arc::new(clients);
    let store = Arc::new(ClientDataStore::new(clients.clone()));
    protocol.register_store(store.clone());
    protocol.start()?;

    let cancel = protocol.cancel_token().child_token();
    let workers = vec![
      tokio::spawn(
        store
          .clone()
          .forward_events(events, protocol.clone(), cancel.clone()),
      ),
      tokio::spawn(expire_clients(
        clients.clone(),
        expire_interval,
        expired_time,
        cancel.clone(),
      )),
    ];
    info!(local = %protocol.local(), "registry node started");
    Ok(Arc::new(RegistryNode {
      protocol: protocol,
      clients: clients,
      store: store,
      cancel: cancel,
      workers: Mutex::new(workers),
    }))
  }

  pub fn local(&self) -> &Socket {
    self.protocol.local()
  }

  pub fn protocol(&self) -> &Arc<DistroProtocol> {
    &self.protocol
  }

  pub fn clients(&self) -> &Arc<ClientManagerDelegate> {
    &self.clients
  }

  pub fn store(&self) -> &Arc<ClientDataStore> {
    &self.store
  }

  pub async fn shutdown(&self) {
    self.cancel.cancel();
    let workers = std::mem::take(&mut *self.workers.lock());
    for worker in workers {
      if let Err(e) = worker.await {
        warn!(target: "client", error = %e, "client worker ended abnormally");
      }
    }
    self.protocol.shutdown().await;
  }
}

async fn expire_clients(
  clients: Arc<ClientManagerDelegate>,
  every: Duration,
  expired_time: Duration,
  cancel: CancellationToken,
) {
  let mut ticker = interval(every);
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => break,
      _ = ticker.tick() => {
        let expired = clients.remove_expired(Instant::now(), expired_time);
        if !expired.is_empty() {
          debug!(target: "client", count = expired.len(), "expired clients removed");
        }
      }
    }
  }
}
