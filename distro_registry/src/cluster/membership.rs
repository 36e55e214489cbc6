use crate::core::Socket;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time view of the healthy cluster. The local node is part of `peers` when it
/// considers itself healthy. `version` changes whenever the peer set does.
#[derive(Clone, Debug, Default)]
pub struct MembershipSnapshot {
  pub version: u64,
  pub peers: im::OrdSet<Socket>,
}
impl MembershipSnapshot {
  /// Every healthy peer except `local`, in address order.
  pub fn others<'a>(&'a self, local: &'a Socket) -> impl Iterator<Item = &'a Socket> + 'a {
    self.peers.iter().filter(move |p| *p != local)
  }
}

/// The source of cluster membership. Discovery and health checking live outside the replication
/// core, which only ever reads snapshots.
pub trait MembershipView: Send + Sync + 'static {
  fn snapshot(&self) -> MembershipSnapshot;

  fn healthy_peers(&self) -> Vec<Socket> {
    self.snapshot().peers.into_iter().collect()
  }

  fn is_member(&self, peer: &Socket) -> bool {
    self.snapshot().peers.contains(peer)
  }
}

/// A membership list maintained by hand. Used by tests, the demo binary, and deployments with a
/// fixed peer list.
pub struct StaticMembership {
  state: RwLock<MembershipSnapshot>,
  versions: AtomicU64,
}
impl StaticMembership {
  pub fn new<I: IntoIterator<Item = Socket>>(peers: I) -> StaticMembership {
    StaticMembership {
      state: RwLock::new(MembershipSnapshot {
        version: 0,
        peers: peers.into_iter().collect(),
      }),
      versions: AtomicU64::new(0),
    }
  }

  pub fn set_peers<I: IntoIterator<Item = Socket>>(&self, peers: I) {
    let peers: im::OrdSet<Socket> = peers.into_iter().collect();
    self.update(|state| state.peers = peers);
  }

  pub fn add_peer(&self, peer: Socket) {
    self.update(|state| {
      state.peers.insert(peer);
    });
  }

  pub fn remove_peer(&self, peer: &Socket) {
    self.update(|state| {
      state.peers.remove(peer);
    });
  }

  fn update<F: FnOnce(&mut MembershipSnapshot)>(&self, f: F) {
    let mut state = self.state.write();
    f(&mut state);
    state.version = self.versions.fetch_add(1, Ordering::SeqCst) + 1;
  }
}
impl MembershipView for StaticMembership {
  fn snapshot(&self) -> MembershipSnapshot {
    self.state.read().clone()
  }
}

#[test]
fn test_static_membership() {
  let a = Socket::localhost(1);
  let b = Socket::localhost(2);
  let view = StaticMembership::new(vec![b.clone(), a.clone()]);
  let first = view.snapshot();
  assert_eq!(view.healthy_peers(), vec![a.clone(), b.clone()]);
  assert_eq!(first.others(&a).cloned().collect::<Vec<_>>(), vec![b.clone()]);

  view.remove_peer(&b);
  assert!(!view.is_member(&b));
  assert!(view.snapshot().version > first.version);
  view.add_peer(b.clone());
  assert!(view.is_member(&b));
}
