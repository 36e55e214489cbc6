use crate::client::{ClientEvent, ClientManagerDelegate, ClientSyncData};
use crate::core::{
  decode, encode, DataOperation, Datum, DistroBatch, DistroKey, Result, VerifyRecord,
};
use crate::distro::{DataStore, DistroProtocol};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resource type of replicated client state.
pub const CLIENT_RESOURCE_TYPE: &str = "naming:client";

/// Exposes the ephemeral clients of a [`ClientManagerDelegate`] to the replication core.
pub struct ClientDataStore {
  clients: Arc<ClientManagerDelegate>,
}
impl ClientDataStore {
  pub fn new(clients: Arc<ClientManagerDelegate>) -> ClientDataStore {
    ClientDataStore { clients: clients }
  }

  /// What, if anything, a client event means for replication. Only ephemeral clients this node is
  /// authoritative for are replicated.
  pub fn on_event(&self, event: &ClientEvent) -> Option<(DistroKey, DataOperation)> {
    match event {
      ClientEvent::Changed { client_id } => {
        let client = self.clients.get_client(client_id)?;
        if !client.kind.is_ephemeral() || !self.clients.is_responsible_client(&client) {
          return None;
        }
        Some((
          DistroKey::new(client_id.clone(), CLIENT_RESOURCE_TYPE),
          DataOperation::Change,
        ))
      }
      ClientEvent::Disconnected {
        client_id,
        kind,
        responsible,
      } => {
        if !kind.is_ephemeral() || !responsible {
          return None;
        }
        Some((
          DistroKey::new(client_id.clone(), CLIENT_RESOURCE_TYPE),
          DataOperation::Delete,
        ))
      }
    }
  }

  /// Feeds client events into `protocol` until `cancel` fires or the delegate goes away.
  pub async fn forward_events(
    self: Arc<Self>,
    mut events: UnboundedReceiver<ClientEvent>,
    protocol: Arc<DistroProtocol>,
    cancel: CancellationToken,
  ) {
    loop {
      let event = tokio::select! {
        _ = cancel.cancelled() => break,
        event = events.recv() => match event {
          Some(event) => event,
          None => break,
        },
      };
      if let Some((key, action)) = self.on_event(&event) {
        protocol.enqueue(key, action);
      }
    }
    debug!(target: "client", "client event forwarding stopped");
  }

  fn datum(&self, client_id: &str) -> Result<Option<Datum>> {
    match self.clients.get_client(client_id) {
      Some(client) if client.kind.is_ephemeral() => Ok(Some(Datum {
        key: client_id.to_string(),
        value: encode(&client.sync_data())?,
        revision: client.revision,
      })),
      _ => Ok(None),
    }
  }
}
impl DataStore for ClientDataStore {
  fn resource_type(&self) -> &str {
    CLIENT_RESOURCE_TYPE
  }

  fn batch_get(&self, keys: &BTreeSet<String>) -> Result<BTreeMap<String, Datum>> {
    let mut data = BTreeMap::new();
    for key in keys.iter() {
      if let Some(datum) = self.datum(key)? {
        data.insert(key.clone(), datum);
      }
    }
    Ok(data)
  }

  fn apply(&self, batch: &DistroBatch) -> Result<bool> {
    let mut changed = false;
    match batch.operation {
      DataOperation::Delete => {
        for key in batch.data.keys() {
          changed |= self.clients.contains(key);
          self.clients.client_disconnected(key);
        }
      }
      DataOperation::Add | DataOperation::Change | DataOperation::Snapshot => {
        for datum in batch.data.values() {
          let data: ClientSyncData = match decode(&datum.value) {
            Ok(data) => data,
            Err(e) => {
              warn!(target: "client", key = %datum.key, error = %e, "skipping undecodable client");
              continue;
            }
          };
          changed |= self.clients.apply_sync_data(data);
        }
      }
      DataOperation::Verify => {}
    }
    Ok(changed)
  }

  fn verify_records(&self) -> Vec<VerifyRecord> {
    self
      .clients
      .responsible_revisions()
      .into_iter()
      .map(|(key, revision)| VerifyRecord {
        resource_type: CLIENT_RESOURCE_TYPE.to_string(),
        key: key,
        revision: revision,
      })
      .collect()
  }

  fn verify(&self, record: &VerifyRecord) -> bool {
    self.clients.verify_client(&record.key, record.revision)
  }

  fn snapshot(&self) -> Result<BTreeMap<String, Datum>> {
    let mut data = BTreeMap::new();
    for client in self.clients.ephemeral_clients() {
      let datum = Datum {
        key: client.client_id.clone(),
        value: encode(&client.sync_data())?,
        revision: client.revision,
      };
      data.insert(client.client_id, datum);
    }
    Ok(data)
  }
}
