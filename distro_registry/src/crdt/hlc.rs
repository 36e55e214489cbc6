use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const COUNTER_BITS: u32 = 16;
const COUNTER_MAX: u64 = (1 << COUNTER_BITS) - 1;
const WALL_MAX: u64 = (1 << (64 - COUNTER_BITS)) - 1;

/// A hybrid logical timestamp. The derived ordering (wall time, then counter, then process id)
/// is the total order used to break ties between concurrent operations.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct HlcTimestamp {
  pub wall_time: i64,
  pub logical: i64,
  pub process_id: Arc<str>,
}
impl HlcTimestamp {
  pub fn new<P: Into<Arc<str>>>(wall_time: i64, logical: i64, process_id: P) -> HlcTimestamp {
    HlcTimestamp {
      wall_time: wall_time,
      logical: logical,
      process_id: process_id.into(),
    }
  }

  pub fn same_process(&self, other: &HlcTimestamp) -> bool {
    self.process_id == other.process_id
  }

  /// Wall time and counter in one word, ordered like the timestamps of a single process.
  pub fn packed(&self) -> u64 {
    let wall = self.wall_time.clamp(0, WALL_MAX as i64) as u64;
    let counter = self.logical.clamp(0, COUNTER_MAX as i64) as u64;
    pack(wall, counter)
  }
}
impl fmt::Display for HlcTimestamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {})@{}", self.wall_time, self.logical, self.process_id)
  }
}

/// Source of physical time in milliseconds since the epoch.
pub trait PhysicalClock: Send + Sync + 'static {
  fn now_millis(&self) -> i64;
}

pub struct SystemClock;
impl PhysicalClock for SystemClock {
  fn now_millis(&self) -> i64 {
    chrono::Utc::now().timestamp_millis()
  }
}

/// One per process. The wall time and the counter share a single atomic word (48 bits of
/// milliseconds, 16 bits of counter) so that both update together with one compare-and-swap.
pub struct HybridLogicalClock {
  state: AtomicU64,
  process_id: Arc<str>,
  step: u64,
  max_drift: Duration,
  physical: Arc<dyn PhysicalClock>,
}
impl HybridLogicalClock {
  pub fn new<P: Into<Arc<str>>>(process_id: P) -> HybridLogicalClock {
    HybridLogicalClock::with_clock(process_id, 1, Duration::from_millis(500), Arc::new(SystemClock))
  }

  pub fn with_clock<P: Into<Arc<str>>>(
    process_id: P,
    step: u16,
    max_drift: Duration,
    physical: Arc<dyn PhysicalClock>,
  ) -> HybridLogicalClock {
    HybridLogicalClock {
      state: AtomicU64::new(0),
      process_id: process_id.into(),
      step: std::cmp::max(step, 1) as u64,
      max_drift: max_drift,
      physical: physical,
    }
  }

  /// The latest timestamp handed out, without advancing the clock.
  pub fn current(&self) -> HlcTimestamp {
    let (wall, counter) = unpack(self.state.load(Ordering::Acquire));
    self.stamp(wall, counter)
  }

  /// Timestamp for a local event or an outgoing message.
  pub fn generate_for_sending(&self) -> HlcTimestamp {
    let (wall, counter) = self.advance(|wall, counter, now| {
      let target = wall.max(now);
      if target == wall {
        bump(wall, counter + self.step)
      } else {
        (target, 0)
      }
    });
    self.stamp(wall, counter)
  }

  /// Timestamp for the receipt of a message stamped `remote`. The result is never smaller than
  /// either the local clock before the call or `remote`. A `remote` that does not fit the clock's
  /// range is not merged, the clock then only advances as for a local event.
  pub fn generate_for_receiving(&self, remote: &HlcTimestamp) -> HlcTimestamp {
    let (remote_wall, remote_counter) = match in_range(remote) {
      Some(parts) => parts,
      None => {
        warn!(target: "hlc", remote = %remote, "remote timestamp out of range, not merged");
        return self.generate_for_sending();
      }
    };
    let now = self.physical_now();
    if remote_wall > now + self.max_drift.as_millis() as u64 {
      warn!(
        target: "hlc",
        remote = %remote,
        ahead_ms = remote_wall - now,
        "remote clock is far ahead of local physical time"
      );
    }
    let (wall, counter) = self.advance(|wall, counter, now| {
      let target = wall.max(remote_wall).max(now);
      if target == wall && target == remote_wall {
        bump(target, counter.max(remote_counter) + self.step)
      } else if target == wall {
        bump(target, counter + self.step)
      } else if target == remote_wall {
        bump(target, remote_counter + self.step)
      } else {
        (target, 0)
      }
    });
    self.stamp(wall, counter)
  }

  fn advance<F: Fn(u64, u64, u64) -> (u64, u64)>(&self, f: F) -> (u64, u64) {
    let mut cur = self.state.load(Ordering::Acquire);
    loop {
      let (wall, counter) = unpack(cur);
      let next = f(wall, counter, self.physical_now());
      match self.state.compare_exchange_weak(
        cur,
        pack(next.0, next.1),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return next,
        Err(actual) => cur = actual,
      }
    }
  }

  fn physical_now(&self) -> u64 {
    self.physical.now_millis().clamp(0, WALL_MAX as i64) as u64
  }

  fn stamp(&self, wall: u64, counter: u64) -> HlcTimestamp {
    HlcTimestamp {
      wall_time: wall as i64,
      logical: counter as i64,
      process_id: self.process_id.clone(),
    }
  }
}

// A counter overflow carries into the wall time. The clock stops at its maximum.
fn bump(wall: u64, counter: u64) -> (u64, u64) {
  if counter <= COUNTER_MAX {
    (wall, counter)
  } else if wall < WALL_MAX {
    (wall + 1, 0)
  } else {
    (WALL_MAX, COUNTER_MAX)
  }
}

fn in_range(ts: &HlcTimestamp) -> Option<(u64, u64)> {
  let wall = u64::try_from(ts.wall_time).ok().filter(|w| *w <= WALL_MAX)?;
  let counter = u64::try_from(ts.logical).ok().filter(|c| *c <= COUNTER_MAX)?;
  Some((wall, counter))
}

fn pack(wall: u64, counter: u64) -> u64 {
  (wall << COUNTER_BITS) | (counter & COUNTER_MAX)
}

fn unpack(state: u64) -> (u64, u64) {
  (state >> COUNTER_BITS, state & COUNTER_MAX)
}

#[cfg(test)]
struct FixedClock(std::sync::atomic::AtomicI64);
#[cfg(test)]
impl PhysicalClock for FixedClock {
  fn now_millis(&self) -> i64 {
    self.0.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
fn fixed(now: i64) -> (Arc<FixedClock>, HybridLogicalClock) {
  let physical = Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(now)));
  let hlc = HybridLogicalClock::with_clock("p1", 1, Duration::from_millis(500), physical.clone());
  (physical, hlc)
}

#[test]
fn test_sending_is_monotonic() {
  let hlc = HybridLogicalClock::new("p1");
  let mut last = hlc.generate_for_sending();
  for _ in 0..10_000 {
    let next = hlc.generate_for_sending();
    assert!((next.wall_time, next.logical) > (last.wall_time, last.logical));
    last = next;
  }
}

#[test]
fn test_sending_with_stalled_clock() {
  let (physical, hlc) = fixed(1_000);
  assert_eq!(hlc.generate_for_sending(), HlcTimestamp::new(1_000, 0, "p1"));
  assert_eq!(hlc.generate_for_sending(), HlcTimestamp::new(1_000, 1, "p1"));
  physical.0.store(900, Ordering::SeqCst);
  assert_eq!(hlc.generate_for_sending(), HlcTimestamp::new(1_000, 2, "p1"));
  physical.0.store(1_200, Ordering::SeqCst);
  assert_eq!(hlc.generate_for_sending(), HlcTimestamp::new(1_200, 0, "p1"));
}

#[test]
fn test_counter_overflow_moves_wall() {
  let (_, hlc) = fixed(50);
  hlc.state.store(pack(50, COUNTER_MAX), Ordering::SeqCst);
  assert_eq!(hlc.generate_for_sending(), HlcTimestamp::new(51, 0, "p1"));
}

#[test]
fn test_receiving_rules() {
  let (_, hlc) = fixed(1_000);
  hlc.generate_for_sending();
  hlc.generate_for_sending();

  // remote ahead
  let got = hlc.generate_for_receiving(&HlcTimestamp::new(2_000, 7, "p2"));
  assert_eq!((got.wall_time, got.logical), (2_000, 8));
  // equal wall, larger local counter wins
  let got = hlc.generate_for_receiving(&HlcTimestamp::new(2_000, 3, "p2"));
  assert_eq!((got.wall_time, got.logical), (2_000, 9));
  // remote behind
  let got = hlc.generate_for_receiving(&HlcTimestamp::new(10, 40, "p2"));
  assert_eq!((got.wall_time, got.logical), (2_000, 10));

  let (_, fresh) = fixed(5_000);
  let got = fresh.generate_for_receiving(&HlcTimestamp::new(10, 40, "p2"));
  assert_eq!((got.wall_time, got.logical), (5_000, 0));
}

#[test]
fn test_receiving_dominates_inputs() {
  let (physical, hlc) = fixed(100);
  let remotes = [(50, 3), (100, 9), (400, 0), (400, 2), (90, 65_000), (1_000_000, 1)];
  for (i, (wall, logical)) in remotes.iter().enumerate() {
    physical.0.store(100 + i as i64 * 10, Ordering::SeqCst);
    let before = hlc.current();
    let remote = HlcTimestamp::new(*wall, *logical, "p2");
    let got = hlc.generate_for_receiving(&remote);
    assert!((got.wall_time, got.logical) > (before.wall_time, before.logical));
    assert!((got.wall_time, got.logical) > (remote.wall_time, remote.logical));
  }
}

#[test]
fn test_far_future_remote_is_not_merged() {
  let (_, hlc) = fixed(1_000);
  let before = hlc.generate_for_sending();
  for (wall, logical) in [(i64::MAX, 0), (WALL_MAX as i64 + 1, 0), (-5, 0), (2_000, 1 << 20)] {
    let got = hlc.generate_for_receiving(&HlcTimestamp::new(wall, logical, "p2"));
    assert_eq!(got.wall_time, 1_000);
    assert!(got > before);
  }
  let got = hlc.generate_for_receiving(&HlcTimestamp::new(WALL_MAX as i64, 7, "p2"));
  assert_eq!((got.wall_time, got.logical), (WALL_MAX as i64, 8));
}

#[test]
fn test_saturated_clock_never_goes_back() {
  let (_, hlc) = fixed(1_000);
  hlc.state.store(pack(WALL_MAX, COUNTER_MAX - 2), Ordering::SeqCst);
  let mut last = hlc.current();
  for _ in 0..5 {
    let next = hlc.generate_for_sending();
    assert!((next.wall_time, next.logical) >= (last.wall_time, last.logical));
    last = next;
  }
  assert_eq!((last.wall_time, last.logical), (WALL_MAX as i64, COUNTER_MAX as i64));
}
