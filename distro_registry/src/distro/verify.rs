use crate::cluster::MembershipView;
use crate::core::{encode, DataOperation, DistroKey, DistroTask, Socket};
use crate::distro::{DelayTaskEngine, StoreRegistry, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Anti-entropy. Periodically asks every peer to confirm the revisions of the data this node is
/// authoritative for, and schedules a targeted re-sync of whatever a peer could not confirm.
pub struct Verifier {
  local: Socket,
  stores: Arc<StoreRegistry>,
  transport: Arc<dyn Transport>,
  membership: Arc<dyn MembershipView>,
  engine: Arc<DelayTaskEngine>,
  timeout: Duration,
}
impl Verifier {
  pub fn new(
    local: Socket,
    stores: Arc<StoreRegistry>,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn MembershipView>,
    engine: Arc<DelayTaskEngine>,
    timeout: Duration,
  ) -> Verifier {
    Verifier {
      local: local,
      stores: stores,
      transport: transport,
      membership: membership,
      engine: engine,
      timeout: timeout,
    }
  }

  /// Runs one verify round against every healthy peer. Returns the number of records that were
  /// scheduled for repair.
  pub async fn verify_round(&self) -> usize {
    let snapshot = self.membership.snapshot();
    let targets = snapshot.others(&self.local).cloned().collect::<Vec<_>>();
    if targets.is_empty() {
      return 0;
    }
    let mut repairs = 0;
    for store in self.stores.all() {
      let records = store.verify_records();
      if records.is_empty() {
        continue;
      }
      let body = match encode(&records) {
        Ok(body) => body,
        Err(e) => {
          warn!(target: "distro::verify", error = %e, "cannot encode verify records");
          continue;
        }
      };
      for target in targets.iter() {
        let rejected = match timeout(self.timeout, self.transport.verify(target, body.clone())).await
        {
          Ok(Ok(rejected)) => rejected,
          Ok(Err(e)) => {
            debug!(target: "distro::verify", target_server = %target, error = %e, "verify failed");
            continue;
          }
          Err(_) => {
            debug!(target: "distro::verify", target_server = %target, "verify timed out");
            continue;
          }
        };
        for record in rejected {
          info!(
            target: "distro::verify",
            target_server = %target,
            key = %record.key,
            "peer is out of date, scheduling repair"
          );
          let key = DistroKey::new(record.key, record.resource_type).with_target(target.clone());
          self
            .engine
            .submit(DistroTask::new(key, DataOperation::Add, Duration::ZERO));
          repairs += 1;
        }
      }
    }
    repairs
  }

  pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {
          self.verify_round().await;
        }
      }
    }
    debug!(target: "distro::verify", "verify loop stopped");
  }
}

#[cfg(test)]
use crate::cluster::StaticMembership;
#[cfg(test)]
use crate::testkit::{MemoryStore, RecordingTransport};

#[cfg(test)]
fn verifier(peers: Vec<Socket>) -> (Verifier, Arc<RecordingTransport>, Arc<DelayTaskEngine>) {
  let store = Arc::new(MemoryStore::new("client"));
  store.put("a", vec![1]);
  store.put("b", vec![2]);
  let stores = Arc::new(StoreRegistry::default());
  stores.register(store);
  let transport = Arc::new(RecordingTransport::default());
  let engine = Arc::new(DelayTaskEngine::new(Duration::from_millis(100)));
  let verifier = Verifier::new(
    Socket::localhost(9000),
    stores,
    transport.clone(),
    Arc::new(StaticMembership::new(peers)),
    engine.clone(),
    Duration::from_secs(1),
  );
  (verifier, transport, engine)
}

#[tokio::test]
async fn test_rejected_records_are_repaired() {
  let peers = vec![Socket::localhost(9000), Socket::localhost(9001)];
  let (verifier, transport, engine) = verifier(peers);
  assert_eq!(verifier.verify_round().await, 0);
  assert_eq!(transport.verifies().len(), 1);
  assert_eq!(transport.verifies()[0].1.len(), 2);
  assert!(engine.is_empty());

  transport.reject_verifies(true);
  assert_eq!(verifier.verify_round().await, 2);
  let repair = engine.pending(&DistroKey::new("a", "client")).unwrap();
  assert_eq!(repair.action, DataOperation::Add);
  assert_eq!(repair.key.target_server, Some(Socket::localhost(9001)));
}

#[tokio::test]
async fn test_nothing_to_verify_when_alone() {
  let (verifier, transport, _) = verifier(vec![Socket::localhost(9000)]);
  assert_eq!(verifier.verify_round().await, 0);
  assert!(transport.verifies().is_empty());
}
