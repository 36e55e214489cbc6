use crate::core::{decode, DistroBatch, DistroError, PushStatus, Result, Socket, VerifyRecord};
use crate::distro::{DistroProtocol, Transport};
use crate::testkit::FailureConfigMap;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::time::sleep;

/// Connects [`DistroProtocol`]s running in the same process. Requests are delivered by calling
/// the target's handlers directly, subject to partitions and the configured failure rates.
#[derive(Default)]
pub struct LocalTransport {
  nodes: DashMap<Socket, Weak<DistroProtocol>>,
  partitioned: DashSet<Socket>,
  failures: RwLock<FailureConfigMap>,
}
impl LocalTransport {
  pub fn register(&self, protocol: &Arc<DistroProtocol>) {
    self
      .nodes
      .insert(protocol.local().clone(), Arc::downgrade(protocol));
  }

  /// Makes `peer` unreachable until [`heal`](LocalTransport::heal) is called.
  pub fn partition(&self, peer: &Socket) {
    self.partitioned.insert(peer.clone());
  }

  pub fn heal(&self, peer: &Socket) {
    self.partitioned.remove(peer);
  }

  pub fn set_failures(&self, failures: FailureConfigMap) {
    *self.failures.write() = failures;
  }

  async fn deliver(&self, target: &Socket) -> Result<Arc<DistroProtocol>> {
    if self.partitioned.contains(target) {
      return Err(DistroError::PeerUnreachable(target.clone()));
    }
    let (dropped, delay) = {
      let failures = self.failures.read();
      let cfg = failures.get(target);
      (cfg.should_drop(), cfg.sample_delay())
    };
    if let Some(delay) = delay {
      sleep(delay).await;
    }
    if dropped {
      return Err(DistroError::PeerUnreachable(target.clone()));
    }
    self
      .nodes
      .get(target)
      .and_then(|n| n.value().upgrade())
      .ok_or_else(|| DistroError::PeerUnreachable(target.clone()))
  }
}
#[async_trait]
impl Transport for LocalTransport {
  async fn push(&self, target: &Socket, body: Vec<u8>) -> Result<PushStatus> {
    self.deliver(target).await?.on_receive(&body)
  }

  async fn verify(&self, target: &Socket, body: Vec<u8>) -> Result<Vec<VerifyRecord>> {
    self.deliver(target).await?.on_verify(&body)
  }

  async fn snapshot(&self, target: &Socket, resource_type: &str) -> Result<Vec<u8>> {
    self.deliver(target).await?.snapshot(resource_type)
  }
}

/// Remembers every push instead of delivering it. Pushes to a target can be made to fail a given
/// number of times, verifies can be made to reject everything.
#[derive(Default)]
pub struct RecordingTransport {
  pushes: Mutex<Vec<(Socket, DistroBatch)>>,
  attempts: DashMap<Socket, u32>,
  failures: DashMap<Socket, u32>,
  verifies: Mutex<Vec<(Socket, Vec<VerifyRecord>)>>,
  reject_verifies: RwLock<bool>,
}
impl RecordingTransport {
  pub fn fail_next(&self, target: &Socket, times: u32) {
    self.failures.insert(target.clone(), times);
  }

  pub fn reject_verifies(&self, reject: bool) {
    *self.reject_verifies.write() = reject;
  }

  /// Successful pushes in the order they happened.
  pub fn pushes(&self) -> Vec<(Socket, DistroBatch)> {
    self.pushes.lock().clone()
  }

  pub fn pushes_to(&self, target: &Socket) -> Vec<DistroBatch> {
    self
      .pushes
      .lock()
      .iter()
      .filter(|(t, _)| t == target)
      .map(|(_, b)| b.clone())
      .collect()
  }

  /// Pushes attempted towards `target`, failed ones included.
  pub fn attempts(&self, target: &Socket) -> u32 {
    self.attempts.get(target).map_or(0, |a| *a)
  }

  pub fn verifies(&self) -> Vec<(Socket, Vec<VerifyRecord>)> {
    self.verifies.lock().clone()
  }
}
#[async_trait]
impl Transport for RecordingTransport {
  async fn push(&self, target: &Socket, body: Vec<u8>) -> Result<PushStatus> {
    *self.attempts.entry(target.clone()).or_insert(0) += 1;
    let fail = self
      .failures
      .get_mut(target)
      .map(|mut left| {
        let fail = *left > 0;
        *left = left.saturating_sub(1);
        fail
      })
      .unwrap_or(false);
    if fail {
      return Err(DistroError::PeerUnreachable(target.clone()));
    }
    let batch: DistroBatch = decode(&body)?;
    self.pushes.lock().push((target.clone(), batch));
    Ok(PushStatus::Ok)
  }

  async fn verify(&self, target: &Socket, body: Vec<u8>) -> Result<Vec<VerifyRecord>> {
    let records: Vec<VerifyRecord> = decode(&body)?;
    self.verifies.lock().push((target.clone(), records.clone()));
    if *self.reject_verifies.read() {
      Ok(records)
    } else {
      Ok(Vec::new())
    }
  }

  async fn snapshot(&self, target: &Socket, _resource_type: &str) -> Result<Vec<u8>> {
    Err(DistroError::PeerUnreachable(target.clone()))
  }
}
