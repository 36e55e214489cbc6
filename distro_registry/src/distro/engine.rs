use crate::core::{DistroError, DistroKey, DistroTask, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Consumes tasks whose debounce window elapsed.
pub trait TaskProcessor: Send + Sync + 'static {
  fn process(&self, task: DistroTask) -> Result<()>;
}

/// Holds local mutations until they stop changing. A burst of submissions for one key collapses
/// into a single task that is handed to the processor registered for its resource type once
/// `delay` has passed since the last submission.
pub struct DelayTaskEngine {
  tasks: DashMap<DistroKey, DistroTask>,
  processors: DashMap<String, Arc<dyn TaskProcessor>>,
  default_processor: RwLock<Option<Arc<dyn TaskProcessor>>>,
  interval: Duration,
}
impl DelayTaskEngine {
  pub fn new(interval: Duration) -> DelayTaskEngine {
    DelayTaskEngine {
      tasks: DashMap::new(),
      processors: DashMap::new(),
      default_processor: RwLock::new(None),
      interval: interval,
    }
  }

  pub fn add_processor<T: Into<String>>(&self, resource_type: T, processor: Arc<dyn TaskProcessor>) {
    self.processors.insert(resource_type.into(), processor);
  }

  pub fn set_default_processor(&self, processor: Arc<dyn TaskProcessor>) {
    *self.default_processor.write() = Some(processor);
  }

  pub fn submit(&self, task: DistroTask) {
    match self.tasks.entry(task.key.clone()) {
      Entry::Occupied(mut pending) => {
        trace!(
          target: "distro::engine",
          key = %task.key.resource_key,
          action = ?task.action,
          "merged into pending task"
        );
        pending.get_mut().merge(&task);
      }
      Entry::Vacant(slot) => {
        slot.insert(task);
      }
    }
  }

  pub fn len(&self) -> usize {
    self.tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.tasks.is_empty()
  }

  pub fn pending(&self, key: &DistroKey) -> Option<DistroTask> {
    self.tasks.get(key).map(|t| t.value().clone())
  }

  pub fn process_tasks(&self) -> usize {
    self.process_due(Instant::now())
  }

  /// Hands every task due at `now` to its processor. A task is taken out of the pending map
  /// before it is processed, so a failing task never blocks later submissions for its key.
  pub fn process_due(&self, now: Instant) -> usize {
    let due = self
      .tasks
      .iter()
      .filter(|t| t.value().should_process(now))
      .map(|t| t.key().clone())
      .collect::<Vec<_>>();
    let mut processed = 0;
    for key in due {
      let task = match self.tasks.remove_if(&key, |_, t| t.should_process(now)) {
        Some((_, task)) => task,
        None => continue,
      };
      processed += 1;
      if let Err(e) = self.process(task) {
        warn!(
          target: "distro::engine",
          key = %key.resource_key,
          resource_type = %key.resource_type,
          error = %e,
          "dropping task that failed to process"
        );
      }
    }
    processed
  }

  fn process(&self, task: DistroTask) -> Result<()> {
    let processor = self
      .processors
      .get(&task.key.resource_type)
      .map(|p| p.value().clone())
      .or_else(|| self.default_processor.read().clone())
      .ok_or_else(|| DistroError::NoProcessor(task.key.resource_type.clone()))?;
    processor.process(task)
  }

  /// Scans for due tasks every `interval` until `cancel` fires.
  pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
    let mut ticker = interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = ticker.tick() => {
          self.process_tasks();
        }
      }
    }
    debug!(target: "distro::engine", pending = self.len(), "delay engine stopped");
  }
}

#[cfg(test)]
use crate::core::DataOperation::{self, *};
#[cfg(test)]
use crossbeam::channel::{unbounded, Receiver, Sender};

#[cfg(test)]
struct Capture(Sender<DistroTask>);
#[cfg(test)]
impl TaskProcessor for Capture {
  fn process(&self, task: DistroTask) -> Result<()> {
    let action = task.action;
    self.0.send(task).unwrap();
    match action {
      Verify => Err(DistroError::UnsupportedAction(action)),
      _ => Ok(()),
    }
  }
}

#[cfg(test)]
fn capture_engine() -> (DelayTaskEngine, Receiver<DistroTask>) {
  let (tx, rx) = unbounded();
  let engine = DelayTaskEngine::new(Duration::from_millis(100));
  engine.add_processor("client", Arc::new(Capture(tx)));
  (engine, rx)
}

#[cfg(test)]
fn submit_at(engine: &DelayTaskEngine, key: &str, action: DataOperation, at: Instant) {
  let key = DistroKey::new(key, "client");
  engine.submit(DistroTask::at(key, action, Duration::from_millis(1000), at));
}

#[test]
fn test_add_then_delete_yields_one_delete() {
  let (engine, rx) = capture_engine();
  let t0 = Instant::now();
  submit_at(&engine, "k", Add, t0);
  submit_at(&engine, "k", Delete, t0 + Duration::from_millis(400));
  assert_eq!(engine.len(), 1);

  assert_eq!(engine.process_due(t0 + Duration::from_millis(1000)), 0);
  assert_eq!(engine.process_due(t0 + Duration::from_millis(1400)), 1);
  let tasks = rx.try_iter().collect::<Vec<_>>();
  assert_eq!(tasks.len(), 1);
  assert_eq!(tasks[0].action, Delete);
  assert!(engine.is_empty());
}

#[test]
fn test_keys_process_independently() {
  let (engine, rx) = capture_engine();
  let t0 = Instant::now();
  submit_at(&engine, "a", Change, t0);
  submit_at(&engine, "b", Change, t0 + Duration::from_millis(500));
  assert_eq!(engine.process_due(t0 + Duration::from_millis(1000)), 1);
  assert_eq!(rx.try_recv().unwrap().key.resource_key, "a");
  assert_eq!(engine.process_due(t0 + Duration::from_millis(1500)), 1);
  assert_eq!(rx.try_recv().unwrap().key.resource_key, "b");
}

#[test]
fn test_failed_task_does_not_block_key() {
  let (engine, rx) = capture_engine();
  let t0 = Instant::now();
  submit_at(&engine, "k", Verify, t0);
  assert_eq!(engine.process_due(t0 + Duration::from_millis(1000)), 1);
  assert!(engine.pending(&DistroKey::new("k", "client")).is_none());

  submit_at(&engine, "k", Change, t0 + Duration::from_millis(1000));
  assert_eq!(engine.process_due(t0 + Duration::from_millis(2000)), 1);
  assert_eq!(rx.try_iter().map(|t| t.action).collect::<Vec<_>>(), vec![Verify, Change]);
}

#[test]
fn test_missing_processor_drops_task() {
  let engine = DelayTaskEngine::new(Duration::from_millis(100));
  let t0 = Instant::now();
  engine.submit(DistroTask::at(
    DistroKey::new("k", "unknown"),
    Change,
    Duration::ZERO,
    t0,
  ));
  assert_eq!(engine.process_due(t0), 1);
  assert!(engine.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_dispatches_after_delay() {
  let (engine, rx) = capture_engine();
  let engine = Arc::new(engine);
  let cancel = CancellationToken::new();
  let handle = tokio::spawn(engine.clone().run(cancel.clone()));

  engine.submit(DistroTask::new(DistroKey::new("k", "client"), Add, Duration::from_millis(1000)));
  tokio::time::sleep(Duration::from_millis(500)).await;
  engine.submit(DistroTask::new(DistroKey::new("k", "client"), Change, Duration::from_millis(1000)));
  tokio::time::sleep(Duration::from_millis(900)).await;
  assert!(rx.try_recv().is_err());
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(rx.try_recv().unwrap().action, Change);

  cancel.cancel();
  handle.await.unwrap();
}
