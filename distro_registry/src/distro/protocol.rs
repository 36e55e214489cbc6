use crate::cluster::{MembershipView, OwnershipMapper};
use crate::core::{
  decode, encode, DataOperation, DistroBatch, DistroConfig, DistroError, DistroKey, DistroTask,
  PushStatus, Result, Socket, SyncTask, VerifyRecord,
};
use crate::crdt::{ConflictResolver, HybridLogicalClock};
use crate::distro::{
  DataStore, DataSyncer, DelayTaskEngine, StoreRegistry, SyncUnit, TaskDispatcher, Transport,
  UnitExecutor, Verifier,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Wires the replication core together and is the only thing the rest of a registry node talks
/// to: local mutations go in through [`enqueue`](DistroProtocol::enqueue), peer traffic through
/// [`on_receive`](DistroProtocol::on_receive), [`on_verify`](DistroProtocol::on_verify) and
/// [`snapshot`](DistroProtocol::snapshot).
pub struct DistroProtocol {
  local: Socket,
  config: DistroConfig,
  membership: Arc<dyn MembershipView>,
  mapper: Arc<OwnershipMapper>,
  clock: Arc<HybridLogicalClock>,
  resolver: ConflictResolver,
  stores: Arc<StoreRegistry>,
  transport: Arc<dyn Transport>,
  engine: Arc<DelayTaskEngine>,
  syncer: Arc<DataSyncer>,
  verifier: Arc<Verifier>,
  cancel: CancellationToken,
  workers: Mutex<Vec<JoinHandle<()>>>,
  started: AtomicBool,
}
impl DistroProtocol {
  pub fn new(
    config: DistroConfig,
    local: Socket,
    membership: Arc<dyn MembershipView>,
    transport: Arc<dyn Transport>,
  ) -> Result<DistroProtocol> {
    config.check()?;
    let cancel = CancellationToken::new();
    let clock = Arc::new(HybridLogicalClock::with_clock(
      local.to_string(),
      config.hlc_step,
      config.max_clock_skew,
      Arc::new(crate::crdt::SystemClock),
    ));
    let mapper = Arc::new(OwnershipMapper::new(
      local.clone(),
      membership.clone(),
      config.vnodes,
    ));
    let stores = Arc::new(StoreRegistry::default());
    let engine = Arc::new(DelayTaskEngine::new(config.process_interval));
    let syncer = Arc::new(DataSyncer::new(
      local.clone(),
      &config,
      stores.clone(),
      transport.clone(),
      membership.clone(),
      clock.clone(),
      cancel.clone(),
    ));
    let verifier = Arc::new(Verifier::new(
      local.clone(),
      stores.clone(),
      transport.clone(),
      membership.clone(),
      engine.clone(),
      config.push_timeout,
    ));
    Ok(DistroProtocol {
      resolver: ConflictResolver::new(config.max_clock_skew)
        .with_tombstone_ttl(config.max_clock_skew + config.sync_delay),
      local: local,
      config: config,
      membership: membership,
      mapper: mapper,
      clock: clock,
      stores: stores,
      transport: transport,
      engine: engine,
      syncer: syncer,
      verifier: verifier,
      cancel: cancel,
      workers: Mutex::new(Vec::new()),
      started: AtomicBool::new(false),
    })
  }

  pub fn local(&self) -> &Socket {
    &self.local
  }

  pub fn config(&self) -> &DistroConfig {
    &self.config
  }

  pub fn mapper(&self) -> &Arc<OwnershipMapper> {
    &self.mapper
  }

  pub fn clock(&self) -> &Arc<HybridLogicalClock> {
    &self.clock
  }

  pub fn resolver(&self) -> ConflictResolver {
    self.resolver
  }

  pub fn engine(&self) -> &Arc<DelayTaskEngine> {
    &self.engine
  }

  pub fn syncer(&self) -> &Arc<DataSyncer> {
    &self.syncer
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn register_store(&self, store: Arc<dyn DataStore>) {
    info!(target: "distro", resource_type = store.resource_type(), "registered data store");
    self.stores.register(store);
  }

  /// Spawns the delay engine, the dispatcher lanes and the verify loop. Must be called from
  /// within a tokio runtime. Starting twice is a no-op.
  pub fn start(&self) -> Result<()> {
    if self.cancel.is_cancelled() {
      return Err(DistroError::ShutDown);
    }
    if self.started.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let fan_out = Arc::new(FanOut {
      local: self.local.clone(),
      membership: self.membership.clone(),
      syncer: self.syncer.clone(),
    });
    let (dispatcher, mut handles) =
      TaskDispatcher::start(self.config.dispatch_lanes, fan_out, self.cancel.clone());
    self.engine.set_default_processor(Arc::new(dispatcher));
    handles.push(tokio::spawn(self.engine.clone().run(self.cancel.clone())));
    handles.push(tokio::spawn(
      self
        .verifier
        .clone()
        .run(self.config.verify_interval, self.cancel.clone()),
    ));
    self.workers.lock().extend(handles);
    info!(target: "distro", local = %self.local, "replication started");
    Ok(())
  }

  /// Records a local mutation. It is replicated to every healthy peer once the key has been
  /// quiet for `sync_delay`.
  pub fn enqueue(&self, key: DistroKey, action: DataOperation) {
    self.submit(DistroTask::new(key, action, self.config.sync_delay));
  }

  /// Like [`enqueue`](DistroProtocol::enqueue) but only towards `target`, after `delay`.
  pub fn sync_to_target(&self, key: DistroKey, action: DataOperation, target: Socket, delay: Duration) {
    self.submit(DistroTask::new(key.with_target(target), action, delay));
  }

  fn submit(&self, task: DistroTask) {
    if self.cancel.is_cancelled() {
      debug!(target: "distro", key = %task.key.resource_key, "ignoring task after shutdown");
      return;
    }
    self.engine.submit(task);
  }

  /// Applies a batch pushed by a peer.
  pub fn on_receive(&self, body: &[u8]) -> Result<PushStatus> {
    let batch: DistroBatch = decode(body)?;
    self.clock.generate_for_receiving(&batch.clock);
    let store = self.stores.get(&batch.resource_type)?;
    let changed = store.apply(&batch)?;
    trace!(
      target: "distro",
      origin = %batch.origin,
      operation = ?batch.operation,
      keys = batch.data.len(),
      changed = changed,
      "received batch"
    );
    Ok(if changed {
      PushStatus::Ok
    } else {
      PushStatus::NotModified
    })
  }

  /// Checks a peer's verify records against local data. Returns the records that could not be
  /// confirmed.
  pub fn on_verify(&self, body: &[u8]) -> Result<Vec<VerifyRecord>> {
    let records: Vec<VerifyRecord> = decode(body)?;
    Ok(
      records
        .into_iter()
        .filter(|record| match self.stores.get(&record.resource_type) {
          Ok(store) => !store.verify(record),
          Err(e) => {
            warn!(target: "distro", error = %e, "cannot verify record");
            true
          }
        })
        .collect(),
    )
  }

  /// The full data set of one resource type, encoded for a peer.
  pub fn snapshot(&self, resource_type: &str) -> Result<Vec<u8>> {
    let store = self.stores.get(resource_type)?;
    let batch = DistroBatch {
      resource_type: resource_type.to_string(),
      operation: DataOperation::Snapshot,
      origin: self.local.clone(),
      clock: self.clock.generate_for_sending(),
      data: store.snapshot()?,
    };
    encode(&batch)
  }

  /// Loads the data of every registered store from `from`. Returns the number of stores loaded.
  pub async fn load_snapshot(&self, from: &Socket) -> Result<usize> {
    let mut loaded = 0;
    for store in self.stores.all() {
      let body = self.transport.snapshot(from, store.resource_type()).await?;
      let batch: DistroBatch = decode(&body)?;
      self.clock.generate_for_receiving(&batch.clock);
      store.apply(&batch)?;
      info!(
        target: "distro",
        from = %from,
        resource_type = store.resource_type(),
        keys = batch.data.len(),
        "loaded snapshot"
      );
      loaded += 1;
    }
    Ok(loaded)
  }

  /// Runs a verify round right away instead of waiting for the next tick.
  pub async fn verify_now(&self) -> usize {
    self.verifier.verify_round().await
  }

  /// Stops every background worker and waits for them to exit. Pending tasks are discarded.
  pub async fn shutdown(&self) {
    self.cancel.cancel();
    let workers = std::mem::take(&mut *self.workers.lock());
    for worker in workers {
      if let Err(e) = worker.await {
        warn!(target: "distro", error = %e, "worker ended abnormally");
      }
    }
    info!(target: "distro", local = %self.local, "replication stopped");
  }
}

/// Turns a unit into one sync task per destination: the key's target if it has one, every other
/// healthy peer otherwise. The first attempt of each task is awaited so that units of one key
/// reach the network in order.
struct FanOut {
  local: Socket,
  membership: Arc<dyn MembershipView>,
  syncer: Arc<DataSyncer>,
}
#[async_trait]
impl UnitExecutor for FanOut {
  async fn execute(&self, unit: SyncUnit) -> Result<()> {
    let targets = match &unit.key.target_server {
      Some(target) => vec![target.clone()],
      None => self
        .membership
        .snapshot()
        .others(&self.local)
        .cloned()
        .collect(),
    };
    let attempts = targets
      .into_iter()
      .filter(|t| *t != self.local)
      .filter_map(|target| {
        let keys: BTreeSet<String> = [unit.key.resource_key.clone()].into_iter().collect();
        let task = SyncTask::new(unit.key.resource_type.clone(), unit.operation, keys, target);
        self.syncer.submit(task, Duration::ZERO)
      })
      .collect::<Vec<_>>();
    for attempt in attempts {
      if let Err(e) = attempt.await {
        debug!(target: "distro::dispatcher", error = %e, "sync attempt aborted");
      }
    }
    Ok(())
  }
}
