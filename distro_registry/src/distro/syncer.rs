use crate::cluster::MembershipView;
use crate::core::{
  encode, DataOperation, Datum, DistroBatch, DistroConfig, DistroError, PushStatus, Result,
  Socket, SyncTask,
};
use crate::crdt::HybridLogicalClock;
use crate::distro::{StoreRegistry, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

type Marker = (String, String, Socket);

/// Pushes data to peers. At most one change task is pending or in flight for each
/// `(resource type, key, target)`; a fresh task drops the keys another task already claimed.
/// Failed pushes are retried with a fixed backoff for as long as the target stays in the cluster.
pub struct DataSyncer {
  local: Socket,
  stores: Arc<StoreRegistry>,
  transport: Arc<dyn Transport>,
  membership: Arc<dyn MembershipView>,
  clock: Arc<HybridLogicalClock>,
  in_flight: DashMap<Marker, u64>,
  next_id: AtomicU64,
  permits: Arc<Semaphore>,
  retry_delay: Duration,
  push_timeout: Duration,
  cancel: CancellationToken,
}
impl DataSyncer {
  pub fn new(
    local: Socket,
    config: &DistroConfig,
    stores: Arc<StoreRegistry>,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn MembershipView>,
    clock: Arc<HybridLogicalClock>,
    cancel: CancellationToken,
  ) -> DataSyncer {
    DataSyncer {
      local: local,
      stores: stores,
      transport: transport,
      membership: membership,
      clock: clock,
      in_flight: DashMap::new(),
      next_id: AtomicU64::new(0),
      permits: Arc::new(Semaphore::new(std::cmp::max(config.sync_workers, 1))),
      retry_delay: config.sync_retry_delay,
      push_timeout: config.push_timeout,
      cancel: cancel,
    }
  }

  /// Schedules `task` to run after `delay`. Returns the handle of the scheduled attempt, or
  /// `None` if nothing was left to do once already claimed keys were removed.
  pub fn submit(self: &Arc<Self>, mut task: SyncTask, delay: Duration) -> Option<JoinHandle<()>> {
    if self.cancel.is_cancelled() {
      self.release(&task);
      return None;
    }
    if task.is_fresh() {
      task.task_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
      if task.operation == DataOperation::Change {
        let before = task.keys.len();
        task.keys = self.claim(&task);
        if task.keys.len() < before {
          trace!(
            target: "distro::syncer",
            target_server = %task.target_server,
            skipped = before - task.keys.len(),
            "keys already claimed by another task"
          );
        }
      }
    }
    if task.keys.is_empty() {
      return None;
    }
    let syncer = self.clone();
    Some(tokio::spawn(async move { syncer.run(task, delay).await }))
  }

  pub fn is_claimed(&self, resource_type: &str, key: &str, target: &Socket) -> bool {
    self
      .in_flight
      .contains_key(&(resource_type.to_string(), key.to_string(), target.clone()))
  }

  pub fn in_flight(&self) -> usize {
    self.in_flight.len()
  }

  fn marker(task: &SyncTask, key: &str) -> Marker {
    (
      task.resource_type.clone(),
      key.to_string(),
      task.target_server.clone(),
    )
  }

  fn claim(&self, task: &SyncTask) -> BTreeSet<String> {
    task
      .keys
      .iter()
      .filter(|key| match self.in_flight.entry(Self::marker(task, key)) {
        Entry::Vacant(slot) => {
          slot.insert(task.task_id);
          true
        }
        Entry::Occupied(_) => false,
      })
      .cloned()
      .collect()
  }

  // Only markers still owned by this task are removed.
  fn release(&self, task: &SyncTask) {
    for key in task.keys.iter() {
      self
        .in_flight
        .remove_if(&Self::marker(task, key), |_, id| *id == task.task_id);
    }
  }

  async fn run(self: Arc<Self>, task: SyncTask, delay: Duration) {
    if !delay.is_zero() {
      tokio::select! {
        _ = self.cancel.cancelled() => {
          self.release(&task);
          return;
        }
        _ = sleep(delay) => {}
      }
    }
    let permit = match self.permits.clone().acquire_owned().await {
      Ok(permit) => permit,
      Err(_) => {
        self.release(&task);
        return;
      }
    };
    let snapshot = self.membership.snapshot();
    if snapshot.others(&self.local).next().is_none() {
      warn!(target: "distro::syncer", "no healthy peers, dropping sync task");
      self.release(&task);
      return;
    }
    if !snapshot.peers.contains(&task.target_server) {
      debug!(
        target: "distro::syncer",
        target_server = %task.target_server,
        retry = task.retry_count,
        "target left the cluster, dropping sync task"
      );
      self.release(&task);
      return;
    }
    let result = self.push(&task).await;
    drop(permit);
    match result {
      Ok(status) => {
        debug!(
          target: "distro::syncer",
          target_server = %task.target_server,
          keys = task.keys.len(),
          operation = ?task.operation,
          status = ?status,
          "sync task finished"
        );
        self.release(&task);
      }
      Err(e) if e.is_transient() => {
        warn!(
          target: "distro::syncer",
          target_server = %task.target_server,
          retry = task.retry_count,
          error = %e,
          "push failed, retrying"
        );
        self.retry(task);
      }
      Err(e) => {
        error!(
          target: "distro::syncer",
          target_server = %task.target_server,
          error = %e,
          "dropping sync task"
        );
        self.release(&task);
      }
    }
  }

  fn retry(self: &Arc<Self>, task: SyncTask) {
    if !self.membership.is_member(&task.target_server) {
      debug!(
        target: "distro::syncer",
        target_server = %task.target_server,
        "target left the cluster, not retrying"
      );
      self.release(&task);
      return;
    }
    self.submit(task.retry(), self.retry_delay);
  }

  // `None` when every key vanished before the push and there was nothing to send.
  async fn push(&self, task: &SyncTask) -> Result<Option<PushStatus>> {
    let store = self.stores.get(&task.resource_type)?;
    let data: BTreeMap<String, Datum> = match task.operation {
      DataOperation::Delete => task
        .keys
        .iter()
        .map(|k| (k.clone(), Datum::tombstone(k.clone())))
        .collect(),
      _ => store.batch_get(&task.keys)?,
    };
    if data.is_empty() {
      return Ok(None);
    }
    let batch = DistroBatch {
      resource_type: task.resource_type.clone(),
      operation: task.operation,
      origin: self.local.clone(),
      clock: self.clock.generate_for_sending(),
      data: data,
    };
    let body = encode(&batch)?;
    match timeout(self.push_timeout, self.transport.push(&task.target_server, body)).await {
      Ok(result) => result.map(Some),
      Err(_) => Err(DistroError::PushTimeout(task.target_server.clone())),
    }
  }
}

#[cfg(test)]
use crate::cluster::StaticMembership;
#[cfg(test)]
use crate::testkit::{MemoryStore, RecordingTransport};

#[cfg(test)]
struct Fixture {
  syncer: Arc<DataSyncer>,
  store: Arc<MemoryStore>,
  transport: Arc<RecordingTransport>,
  membership: Arc<StaticMembership>,
}

#[cfg(test)]
const LOCAL: u16 = 9000;
#[cfg(test)]
const PEER: u16 = 9001;

#[cfg(test)]
fn fixture() -> Fixture {
  let local = Socket::localhost(LOCAL);
  let membership = Arc::new(StaticMembership::new(vec![
    local.clone(),
    Socket::localhost(PEER),
  ]));
  let store = Arc::new(MemoryStore::new("client"));
  for key in ["a", "b", "c"] {
    store.put(key, key.as_bytes().to_vec());
  }
  let stores = Arc::new(StoreRegistry::default());
  stores.register(store.clone());
  let transport = Arc::new(RecordingTransport::default());
  let syncer = Arc::new(DataSyncer::new(
    local.clone(),
    &DistroConfig::default(),
    stores,
    transport.clone(),
    membership.clone(),
    Arc::new(HybridLogicalClock::new(local.to_string())),
    CancellationToken::new(),
  ));
  Fixture {
    syncer: syncer,
    store: store,
    transport: transport,
    membership: membership,
  }
}

#[cfg(test)]
fn change(keys: &[&str]) -> SyncTask {
  SyncTask::new(
    "client",
    DataOperation::Change,
    keys.iter().map(|k| k.to_string()).collect(),
    Socket::localhost(PEER),
  )
}

#[tokio::test(start_paused = true)]
async fn test_claimed_key_is_skipped() {
  let f = fixture();
  let peer = Socket::localhost(PEER);
  f.syncer
    .in_flight
    .insert(("client".to_string(), "b".to_string(), peer.clone()), 999);

  f.syncer.submit(change(&["a", "b", "c"]), Duration::ZERO).unwrap().await.unwrap();

  let pushes = f.transport.pushes_to(&peer);
  assert_eq!(pushes.len(), 1);
  assert_eq!(pushes[0].data.keys().cloned().collect::<Vec<_>>(), vec!["a", "c"]);
  assert!(f.syncer.is_claimed("client", "b", &peer));
  assert!(!f.syncer.is_claimed("client", "a", &peer));
  assert_eq!(f.syncer.in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fully_claimed_task_is_dropped() {
  let f = fixture();
  let first = f.syncer.submit(change(&["a"]), Duration::from_secs(1)).unwrap();
  assert!(f.syncer.submit(change(&["a"]), Duration::ZERO).is_none());
  first.await.unwrap();
  assert_eq!(f.transport.pushes().len(), 1);
  assert_eq!(f.syncer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_until_success() {
  let f = fixture();
  let peer = Socket::localhost(PEER);
  f.transport.fail_next(&peer, 2);
  f.syncer.submit(change(&["a"]), Duration::ZERO).unwrap().await.unwrap();
  assert!(f.syncer.is_claimed("client", "a", &peer));

  sleep(Duration::from_millis(1900)).await;
  assert_eq!(f.transport.attempts(&peer), 1);
  sleep(Duration::from_millis(2200)).await;
  assert_eq!(f.transport.attempts(&peer), 3);
  assert_eq!(f.transport.pushes_to(&peer).len(), 1);
  assert_eq!(f.syncer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_target_removed_mid_retry() {
  let f = fixture();
  let peer = Socket::localhost(PEER);
  f.transport.fail_next(&peer, 1);
  f.syncer.submit(change(&["a", "b"]), Duration::ZERO).unwrap().await.unwrap();
  assert_eq!(f.syncer.in_flight(), 2);

  f.membership.remove_peer(&peer);
  sleep(Duration::from_secs(5)).await;
  assert_eq!(f.transport.attempts(&peer), 1);
  assert!(f.transport.pushes().is_empty());
  assert_eq!(f.syncer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_data_is_a_tombstone() {
  let f = fixture();
  assert_eq!(f.syncer.push(&change(&["a"])).await.unwrap(), Some(PushStatus::Ok));
  f.store.remove("a");
  assert_eq!(f.syncer.push(&change(&["a"])).await.unwrap(), None);
  f.syncer.submit(change(&["a"]), Duration::ZERO).unwrap().await.unwrap();
  assert_eq!(f.transport.attempts(&Socket::localhost(PEER)), 1);
  assert_eq!(f.syncer.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_no_healthy_peers() {
  let f = fixture();
  let peer = Socket::localhost(PEER);
  let handle = f.syncer.submit(change(&["a"]), Duration::from_millis(10)).unwrap();
  f.membership.set_peers(vec![Socket::localhost(LOCAL)]);
  handle.await.unwrap();
  assert_eq!(f.syncer.in_flight(), 0);
  assert_eq!(f.transport.attempts(&peer), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deletes_are_not_deduplicated() {
  let f = fixture();
  let peer = Socket::localhost(PEER);
  let pending = f.syncer.submit(change(&["a"]), Duration::from_secs(1)).unwrap();
  let delete = SyncTask::new(
    "client",
    DataOperation::Delete,
    maplit::btreeset! {"a".to_string()},
    peer.clone(),
  );
  f.syncer.submit(delete, Duration::ZERO).unwrap().await.unwrap();
  let pushes = f.transport.pushes_to(&peer);
  assert_eq!(pushes.len(), 1);
  assert_eq!(pushes[0].operation, DataOperation::Delete);
  assert!(f.syncer.is_claimed("client", "a", &peer));
  pending.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims() {
  let f = fixture();
  let submits = (0..32)
    .map(|_| {
      let syncer = f.syncer.clone();
      tokio::spawn(async move {
        syncer
          .submit(change(&["a", "b", "c"]), Duration::from_secs(60))
          .map(|h| h.abort())
          .is_some()
      })
    })
    .collect::<Vec<_>>();
  let mut accepted = 0;
  for s in submits {
    accepted += s.await.unwrap() as usize;
  }
  assert_eq!(accepted, 1);
  assert_eq!(f.syncer.in_flight(), 3);
}
