use crate::client::{InstanceId, InstanceRecord};
use crate::crdt::{DeltaMutator, HlcTimestamp, CRDT};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum OperationType {
  AddInstance,
  RemoveInstance,
  UpdateInstance,
}

/// A change to one instance of a service, stamped by the clock of the node that made it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Operation {
  pub op_type: OperationType,
  pub target: InstanceRecord,
  pub real_time: HlcTimestamp,
}
impl Operation {
  pub fn new(op_type: OperationType, target: InstanceRecord, real_time: HlcTimestamp) -> Operation {
    Operation {
      op_type: op_type,
      target: target,
      real_time: real_time,
    }
  }
}
impl DeltaMutator<InstanceSet> for Operation {
  fn apply(&self, target: &InstanceSet) -> InstanceSet {
    let record = match self.op_type {
      OperationType::AddInstance | OperationType::UpdateInstance => Some(self.target.clone()),
      OperationType::RemoveInstance => None,
    };
    let entry = InstanceEntry {
      record: record,
      stamp: self.real_time.clone(),
    };
    let single = InstanceSet {
      entries: im::ordmap! { self.target.id() => entry },
    };
    target.clone().join(single)
  }
}

/// The last write seen for one instance. A `None` record is a removal that is kept around so a
/// late, older add cannot resurrect the instance.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct InstanceEntry {
  pub record: Option<InstanceRecord>,
  pub stamp: HlcTimestamp,
}

/// The instances one client publishes for one service, keyed by instance identity.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct InstanceSet {
  pub entries: im::OrdMap<InstanceId, InstanceEntry>,
}
impl InstanceSet {
  pub fn live(&self) -> impl Iterator<Item = &InstanceRecord> {
    self.entries.values().filter_map(|e| e.record.as_ref())
  }

  pub fn contains(&self, id: &InstanceId) -> bool {
    self.entries.get(id).map_or(false, |e| e.record.is_some())
  }

  pub fn len(&self) -> usize {
    self.live().count()
  }

  /// The newest stamp in the set, live or removed.
  pub fn latest(&self) -> Option<&HlcTimestamp> {
    self.entries.values().map(|e| &e.stamp).max()
  }
}
impl CRDT for InstanceSet {
  type Delta = Operation;

  fn delta(&self, changes: &Self::Delta) -> Self {
    changes.apply(self)
  }

  fn empty(&self) -> bool {
    self.live().next().is_none()
  }

  fn join(self, other: Self) -> Self {
    InstanceSet {
      entries: self
        .entries
        .union_with(other.entries, |a, b| if a.stamp >= b.stamp { a } else { b }),
    }
  }

  fn minimum() -> Self {
    InstanceSet::default()
  }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Causality {
  Before,
  After,
  Equal,
  Concurrent,
}

/// Orders and merges operations from different replicas.
#[derive(Clone, Copy, Debug)]
pub struct ConflictResolver {
  max_clock_skew: Duration,
  tombstone_ttl: Duration,
}
impl ConflictResolver {
  /// Removals are remembered for `max_clock_skew` unless told otherwise.
  pub fn new(max_clock_skew: Duration) -> ConflictResolver {
    ConflictResolver {
      max_clock_skew: max_clock_skew,
      tombstone_ttl: max_clock_skew,
    }
  }

  pub fn with_tombstone_ttl(mut self, ttl: Duration) -> ConflictResolver {
    self.tombstone_ttl = ttl;
    self
  }

  /// Within one process timestamps are ordered exactly. Across processes, `a` is only known to
  /// precede `b` when their wall times are further apart than the skew bound.
  pub fn happens_before(&self, a: &HlcTimestamp, b: &HlcTimestamp) -> bool {
    if a.same_process(b) {
      (a.wall_time, a.logical) < (b.wall_time, b.logical)
    } else {
      a.wall_time.saturating_add(self.max_clock_skew.as_millis() as i64) < b.wall_time
    }
  }

  pub fn causality(&self, a: &HlcTimestamp, b: &HlcTimestamp) -> Causality {
    if self.happens_before(a, b) {
      Causality::Before
    } else if self.happens_before(b, a) {
      Causality::After
    } else if a == b {
      Causality::Equal
    } else {
      Causality::Concurrent
    }
  }

  /// Sorts operations causally first and by the timestamp total order (wall time, counter,
  /// process id) where causality has nothing to say.
  pub fn order(&self, ops: &mut [Operation]) {
    ops.sort_by(|a, b| match self.causality(&a.real_time, &b.real_time) {
      Causality::Before => Ordering::Less,
      Causality::After => Ordering::Greater,
      Causality::Equal | Causality::Concurrent => a.real_time.cmp(&b.real_time),
    })
  }

  /// Applies `ops` to `base` in the order every replica agrees on.
  pub fn resolve(&self, base: InstanceSet, mut ops: Vec<Operation>) -> InstanceSet {
    self.order(&mut ops);
    ops.iter().fold(base, |set, op| set.delta(op))
  }

  pub fn merge(&self, local: InstanceSet, remote: InstanceSet) -> InstanceSet {
    local.join(remote)
  }

  /// Forgets removals stamped more than the tombstone ttl before `now`. Nothing older can still
  /// be in flight by then.
  pub fn prune(&self, set: InstanceSet, now: &HlcTimestamp) -> InstanceSet {
    let horizon = now
      .wall_time
      .saturating_sub(self.tombstone_ttl.as_millis() as i64);
    InstanceSet {
      entries: set
        .entries
        .into_iter()
        .filter(|(_, e)| e.record.is_some() || e.stamp.wall_time >= horizon)
        .collect(),
    }
  }
}

#[cfg(test)]
const X: (&str, u16) = ("10.0.0.1", 8080);
#[cfg(test)]
const Y: (&str, u16) = ("10.0.0.2", 8080);

#[cfg(test)]
fn op(op_type: OperationType, inst: (&str, u16), wall: i64, logical: i64, p: &str) -> Operation {
  Operation::new(
    op_type,
    InstanceRecord::new(inst.0, inst.1),
    HlcTimestamp::new(wall, logical, p),
  )
}

#[test]
fn test_causality() {
  let r = ConflictResolver::new(Duration::from_millis(500));
  let a = HlcTimestamp::new(100, 0, "p1");
  let b = HlcTimestamp::new(100, 1, "p1");
  assert_eq!(r.causality(&a, &b), Causality::Before);
  assert_eq!(r.causality(&b, &a), Causality::After);
  assert_eq!(r.causality(&a, &a.clone()), Causality::Equal);

  let c = HlcTimestamp::new(100, 1, "p2");
  assert_eq!(r.causality(&a, &c), Causality::Concurrent);
  let d = HlcTimestamp::new(700, 0, "p2");
  assert_eq!(r.causality(&a, &d), Causality::Before);
  let e = HlcTimestamp::new(600, 0, "p2");
  assert_eq!(r.causality(&a, &e), Causality::Concurrent);
}

#[test]
fn test_union_converges() {
  use OperationType::*;
  let r = ConflictResolver::new(Duration::from_millis(500));
  let add_x = op(AddInstance, X, 100, 0, "p1");
  let add_y = op(AddInstance, Y, 105, 0, "p2");
  let forward = r.resolve(InstanceSet::minimum(), vec![add_x.clone(), add_y.clone()]);
  let reverse = InstanceSet::minimum().delta(&add_y).delta(&add_x);
  assert_eq!(forward, reverse);
  assert_eq!(forward.len(), 2);
}

#[test]
fn test_concurrent_adds_of_same_instance() {
  use OperationType::*;
  let r = ConflictResolver::new(Duration::from_millis(500));
  let first = op(AddInstance, X, 100, 0, "p1");
  let second = op(AddInstance, X, 100, 1, "p2");
  assert_eq!(
    r.causality(&first.real_time, &second.real_time),
    Causality::Concurrent
  );
  let on_p1 = InstanceSet::minimum().delta(&first);
  let on_p2 = InstanceSet::minimum().delta(&second);
  let merged = r.merge(on_p1.clone(), on_p2.clone());
  assert_eq!(merged, r.merge(on_p2, on_p1));
  assert_eq!(merged.len(), 1);
  assert!(merged.contains(&InstanceRecord::new(X.0, X.1).id()));
}

#[test]
fn test_remove_wins_when_later() {
  use OperationType::*;
  let r = ConflictResolver::new(Duration::from_millis(500));
  let add = op(AddInstance, X, 100, 0, "p1");
  let remove = op(RemoveInstance, X, 100, 1, "p1");
  let a = r.resolve(InstanceSet::minimum(), vec![remove.clone(), add.clone()]);
  let b = r.resolve(InstanceSet::minimum(), vec![add, remove]);
  assert_eq!(a, b);
  assert!(a.empty());
  assert_eq!(a.latest(), Some(&HlcTimestamp::new(100, 1, "p1")));
}

#[test]
fn test_update_replaces_record() {
  use OperationType::*;
  let add = op(AddInstance, X, 100, 0, "p1");
  let mut heavier = op(UpdateInstance, X, 101, 0, "p1");
  heavier.target.weight = 5;
  let set = InstanceSet::minimum().delta(&heavier).delta(&add);
  assert_eq!(set.live().map(|r| r.weight).collect::<Vec<_>>(), vec![5]);
}

#[test]
fn test_old_tombstones_are_pruned() {
  use OperationType::*;
  let r =
    ConflictResolver::new(Duration::from_millis(500)).with_tombstone_ttl(Duration::from_secs(2));
  let set = r.resolve(
    InstanceSet::minimum(),
    vec![
      op(AddInstance, X, 100, 0, "p1"),
      op(AddInstance, Y, 100, 1, "p1"),
      op(RemoveInstance, Y, 200, 0, "p1"),
    ],
  );
  assert_eq!(set.entries.len(), 2);

  let kept = r.prune(set.clone(), &HlcTimestamp::new(2_200, 0, "p1"));
  assert_eq!(kept, set);
  let pruned = r.prune(set, &HlcTimestamp::new(2_201, 0, "p1"));
  assert_eq!(pruned.entries.len(), 1);
  assert!(pruned.contains(&InstanceRecord::new(X.0, X.1).id()));
}
