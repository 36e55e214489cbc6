use crate::cluster::hash_code;
use crate::core::{DataOperation, DistroError, DistroKey, DistroTask, Result};
use crate::distro::TaskProcessor;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A concrete piece of propagation work: push the current value of a key, or its removal.
#[derive(Clone, Debug)]
pub struct SyncUnit {
  pub key: DistroKey,
  pub operation: DataOperation,
}

/// Runs units on a worker lane.
#[async_trait]
pub trait UnitExecutor: Send + Sync + 'static {
  async fn execute(&self, unit: SyncUnit) -> Result<()>;
}

/// Turns coalesced tasks into [`SyncUnit`]s and runs them on a fixed set of lanes. All units for
/// one key land on the same lane and run one after the other in submission order, units for
/// different keys run in parallel across lanes.
pub struct TaskDispatcher {
  lanes: Vec<UnboundedSender<SyncUnit>>,
}
impl TaskDispatcher {
  /// Spawns `lanes` workers feeding `executor`. Workers stop when `cancel` fires.
  pub fn start(
    lanes: usize,
    executor: Arc<dyn UnitExecutor>,
    cancel: CancellationToken,
  ) -> (TaskDispatcher, Vec<JoinHandle<()>>) {
    let (senders, handles): (Vec<_>, Vec<_>) = (0..std::cmp::max(lanes, 1))
      .map(|id| {
        let (tx, rx) = unbounded_channel();
        let handle = tokio::spawn(lane(id, rx, executor.clone(), cancel.clone()));
        (tx, handle)
      })
      .unzip();
    (TaskDispatcher { lanes: senders }, handles)
  }

  pub fn lane_of(&self, key: &DistroKey) -> usize {
    (hash_code(key) % self.lanes.len() as u64) as usize
  }

  pub fn dispatch(&self, task: DistroTask) -> Result<()> {
    let operation = match task.action {
      DataOperation::Add | DataOperation::Change => DataOperation::Change,
      DataOperation::Delete => DataOperation::Delete,
      other => return Err(DistroError::UnsupportedAction(other)),
    };
    let lane = self.lane_of(&task.key);
    self.lanes[lane]
      .send(SyncUnit {
        key: task.key,
        operation: operation,
      })
      .map_err(|_| DistroError::ShutDown)
  }
}
impl TaskProcessor for TaskDispatcher {
  fn process(&self, task: DistroTask) -> Result<()> {
    self.dispatch(task)
  }
}

async fn lane(
  id: usize,
  mut rx: UnboundedReceiver<SyncUnit>,
  executor: Arc<dyn UnitExecutor>,
  cancel: CancellationToken,
) {
  loop {
    let unit = tokio::select! {
      _ = cancel.cancelled() => break,
      unit = rx.recv() => match unit {
        Some(unit) => unit,
        None => break,
      },
    };
    let key = unit.key.resource_key.clone();
    if let Err(e) = executor.execute(unit).await {
      warn!(target: "distro::dispatcher", lane = id, key = %key, error = %e, "sync unit failed");
    }
  }
  debug!(target: "distro::dispatcher", lane = id, "lane stopped");
}

#[cfg(test)]
use crossbeam::channel::{unbounded, Sender};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
struct Record(Sender<(String, DataOperation)>);
#[cfg(test)]
#[async_trait]
impl UnitExecutor for Record {
  async fn execute(&self, unit: SyncUnit) -> Result<()> {
    // Yield so that lanes interleave.
    tokio::task::yield_now().await;
    self.0.send((unit.key.resource_key, unit.operation)).unwrap();
    Ok(())
  }
}

#[cfg(test)]
fn task(key: &str, action: DataOperation) -> DistroTask {
  DistroTask::new(DistroKey::new(key, "client"), action, Duration::ZERO)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_key_fifo() {
  let (tx, rx) = unbounded();
  let cancel = CancellationToken::new();
  let (dispatcher, handles) = TaskDispatcher::start(4, Arc::new(Record(tx)), cancel.clone());
  let keys = ["a", "b", "c", "d", "e", "f"];
  for round in 0..50 {
    for key in keys.iter() {
      let action = if round % 2 == 0 { DataOperation::Add } else { DataOperation::Delete };
      dispatcher.dispatch(task(key, action)).unwrap();
    }
  }
  let mut seen = std::collections::HashMap::<String, Vec<DataOperation>>::new();
  for _ in 0..300 {
    let (key, op) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    seen.entry(key).or_default().push(op);
  }
  for ops in seen.values() {
    assert_eq!(ops.len(), 50);
    for (round, op) in ops.iter().enumerate() {
      let expected = if round % 2 == 0 { DataOperation::Change } else { DataOperation::Delete };
      assert_eq!(*op, expected);
    }
  }
  cancel.cancel();
  for h in handles {
    h.await.unwrap();
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unsupported_action() {
  let (tx, rx) = unbounded();
  let cancel = CancellationToken::new();
  let (dispatcher, _) = TaskDispatcher::start(2, Arc::new(Record(tx)), cancel.clone());
  for action in [DataOperation::Verify, DataOperation::Snapshot] {
    match dispatcher.dispatch(task("k", action)) {
      Err(DistroError::UnsupportedAction(a)) => assert_eq!(a, action),
      other => panic!("unexpected {:?}", other),
    }
  }
  dispatcher.dispatch(task("k", DataOperation::Add)).unwrap();
  let (key, op) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
  assert_eq!((key.as_str(), op), ("k", DataOperation::Change));
  cancel.cancel();
}

#[tokio::test]
async fn test_lane_ignores_target() {
  let (tx, _rx) = unbounded();
  let cancel = CancellationToken::new();
  let (dispatcher, _) = TaskDispatcher::start(8, Arc::new(Record(tx)), cancel.clone());
  let key = DistroKey::new("10.0.0.1:80#true", "client");
  let lane = dispatcher.lane_of(&key);
  assert_eq!(lane as u64, hash_code(&key) % 8);
  for port in 9000..9010 {
    let targeted = key.clone().with_target(crate::core::Socket::localhost(port));
    assert_eq!(dispatcher.lane_of(&targeted), lane);
  }
  let lanes = (0..64)
    .map(|i| dispatcher.lane_of(&DistroKey::new(format!("k{}", i), "client")))
    .collect::<std::collections::HashSet<_>>();
  assert!(lanes.len() > 1);
  cancel.cancel();
}
