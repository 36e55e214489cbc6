use crate::core::Socket;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;

/// What happened to a piece of replicable data. Only `Add`, `Change` and `Delete` are produced by
/// local mutations, `Verify` and `Snapshot` only ever travel between peers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum DataOperation {
  Add,
  Change,
  Delete,
  Verify,
  Snapshot,
}
impl DataOperation {
  /// Tie-break between different actions submitted at the same instant.
  pub fn priority(&self) -> u8 {
    match self {
      DataOperation::Delete => 3,
      DataOperation::Change => 2,
      DataOperation::Add => 1,
      DataOperation::Verify | DataOperation::Snapshot => 0,
    }
  }
}

/// Identifies one unit of replicable data, for example the state of one client.
///
/// Two keys are equal when their resource key and resource type are equal. The target server is
/// routing information only: a key with a target is synced to that peer alone, a key without one
/// is broadcast to every healthy peer.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DistroKey {
  pub resource_key: String,
  pub resource_type: String,
  pub target_server: Option<Socket>,
}
impl DistroKey {
  pub fn new<K: Into<String>, T: Into<String>>(resource_key: K, resource_type: T) -> DistroKey {
    DistroKey {
      resource_key: resource_key.into(),
      resource_type: resource_type.into(),
      target_server: None,
    }
  }

  pub fn with_target(mut self, target: Socket) -> DistroKey {
    self.target_server = Some(target);
    self
  }
}
impl PartialEq for DistroKey {
  fn eq(&self, other: &Self) -> bool {
    self.resource_key == other.resource_key && self.resource_type == other.resource_type
  }
}
impl Eq for DistroKey {}
impl Hash for DistroKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.resource_key.hash(state);
    self.resource_type.hash(state);
  }
}

/// A pending mutation waiting out its debounce window in the
/// [`DelayTaskEngine`](crate::distro::DelayTaskEngine).
#[derive(Clone, Debug)]
pub struct DistroTask {
  pub key: DistroKey,
  pub action: DataOperation,
  pub created_at: Instant,
  pub last_processed_at: Instant,
  pub delay: Duration,
}
impl DistroTask {
  pub fn new(key: DistroKey, action: DataOperation, delay: Duration) -> DistroTask {
    DistroTask::at(key, action, delay, Instant::now())
  }

  pub fn at(key: DistroKey, action: DataOperation, delay: Duration, now: Instant) -> DistroTask {
    DistroTask {
      key: key,
      action: action,
      created_at: now,
      last_processed_at: now,
      delay: delay,
    }
  }

  /// Folds a newer submission for the same key into this task.
  ///
  /// A different action replaces the current one only if the incoming task was created later,
  /// or at the same instant with a higher [`priority`](DataOperation::priority). The creation
  /// time follows the winning action, so equal actions keep the oldest creation time. The debounce
  /// window always restarts from the most recent submission. Differing sync targets widen the task
  /// to a broadcast.
  pub fn merge(&mut self, incoming: &DistroTask) {
    if self.action != incoming.action {
      let newer = incoming.created_at > self.created_at;
      let tie = incoming.created_at == self.created_at
        && incoming.action.priority() > self.action.priority();
      if newer || tie {
        self.action = incoming.action;
        self.created_at = incoming.created_at;
      }
    } else if incoming.created_at < self.created_at {
      self.created_at = incoming.created_at;
    }
    if self.key.target_server != incoming.key.target_server {
      self.key.target_server = None;
    }
    self.last_processed_at = self.last_processed_at.max(incoming.last_processed_at);
    self.delay = incoming.delay;
  }

  pub fn should_process(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.last_processed_at) >= self.delay
  }
}

/// One unit of network work for the [`DataSyncer`](crate::distro::DataSyncer): push the current
/// values of `keys` to `target_server`.
#[derive(Clone, Debug)]
pub struct SyncTask {
  pub resource_type: String,
  /// `Change` pushes current values, `Delete` pushes tombstones.
  pub operation: DataOperation,
  pub keys: BTreeSet<String>,
  pub target_server: Socket,
  pub retry_count: u32,
  pub last_execute_time: Option<Instant>,
  /// Assigned by the syncer on first submission and carried over to retries.
  pub task_id: u64,
}
impl SyncTask {
  pub fn new<T: Into<String>>(
    resource_type: T,
    operation: DataOperation,
    keys: BTreeSet<String>,
    target_server: Socket,
  ) -> SyncTask {
    SyncTask {
      resource_type: resource_type.into(),
      operation: operation,
      keys: keys,
      target_server: target_server,
      retry_count: 0,
      last_execute_time: None,
      task_id: 0,
    }
  }

  pub fn is_fresh(&self) -> bool {
    self.retry_count == 0
  }

  pub fn retry(&self) -> SyncTask {
    let mut next = self.clone();
    next.retry_count += 1;
    next.last_execute_time = Some(Instant::now());
    next
  }
}

#[cfg(test)]
use DataOperation::*;

#[cfg(test)]
fn task(action: DataOperation, created: Instant, offset_ms: u64) -> DistroTask {
  let at = created + Duration::from_millis(offset_ms);
  DistroTask::at(DistroKey::new("svc", "client"), action, Duration::from_millis(1000), at)
}

#[test]
fn test_key_equality_ignores_target() {
  let plain = DistroKey::new("a", "client");
  let targeted = DistroKey::new("a", "client").with_target(Socket::localhost(9000));
  assert_eq!(plain, targeted);
  assert_ne!(plain, DistroKey::new("a", "other"));
}

#[test]
fn test_merge_newer_action_wins() {
  let t0 = Instant::now();
  let mut t = task(Add, t0, 0);
  t.merge(&task(Delete, t0, 10));
  assert_eq!(t.action, Delete);
  assert_eq!(t.created_at, t0 + Duration::from_millis(10));

  let mut stale = task(Delete, t0, 10);
  stale.merge(&task(Add, t0, 0));
  assert_eq!(stale.action, Delete);
  assert_eq!(stale.last_processed_at, t0 + Duration::from_millis(10));
}

#[test]
fn test_merge_equal_actions_keep_oldest() {
  let t0 = Instant::now();
  let mut t = task(Change, t0, 0);
  t.merge(&task(Change, t0, 300));
  assert_eq!(t.created_at, t0);
  assert_eq!(t.last_processed_at, t0 + Duration::from_millis(300));
  assert!(!t.should_process(t0 + Duration::from_millis(1200)));
  assert!(t.should_process(t0 + Duration::from_millis(1300)));
}

#[test]
fn test_merge_tie_uses_priority() {
  let t0 = Instant::now();
  let mut a = task(Change, t0, 0);
  a.merge(&task(Delete, t0, 0));
  let mut b = task(Delete, t0, 0);
  b.merge(&task(Change, t0, 0));
  assert_eq!(a.action, Delete);
  assert_eq!(b.action, Delete);
}

#[test]
fn test_merge_idempotent() {
  let t0 = Instant::now();
  let pairs = vec![
    (task(Add, t0, 0), task(Delete, t0, 5)),
    (task(Delete, t0, 5), task(Add, t0, 0)),
    (task(Change, t0, 0), task(Change, t0, 0)),
    (task(Add, t0, 0), task(Change, t0, 0)),
    (task(Change, t0, 3), task(Change, t0, 1)),
  ];
  for (t1, t2) in pairs {
    let mut once = t1.clone();
    once.merge(&t2);
    let mut twice = once.clone();
    twice.merge(&t2);
    assert_eq!(once.action, twice.action);
    assert_eq!(once.created_at, twice.created_at);
  }
}

#[test]
fn test_merge_targets_widen() {
  let t0 = Instant::now();
  let mut t = task(Add, t0, 0);
  t.key.target_server = Some(Socket::localhost(1));
  let mut other = task(Add, t0, 1);
  other.key.target_server = Some(Socket::localhost(2));
  t.merge(&other);
  assert_eq!(t.key.target_server, None);
}
