use crate::cluster::{MembershipView, NodeRing};
use crate::core::Socket;
use parking_lot::RwLock;
use std::sync::Arc;

/// Decides which node is authoritative for a resource key. The answer is a pure function of the
/// key and the current membership snapshot; the ring built for a snapshot is cached until the
/// membership version changes.
pub struct OwnershipMapper {
  local: Socket,
  membership: Arc<dyn MembershipView>,
  vnodes: u32,
  cache: RwLock<Option<(u64, Arc<NodeRing>)>>,
}
impl OwnershipMapper {
  pub fn new(local: Socket, membership: Arc<dyn MembershipView>, vnodes: u32) -> OwnershipMapper {
    OwnershipMapper {
      local: local,
      membership: membership,
      vnodes: vnodes,
      cache: RwLock::new(None),
    }
  }

  pub fn local(&self) -> &Socket {
    &self.local
  }

  pub fn membership(&self) -> &Arc<dyn MembershipView> {
    &self.membership
  }

  /// Whether this node owns `resource_key`. A node that cannot see itself among the healthy
  /// peers (or sees no peers at all) owns everything, so a lone node keeps working.
  pub fn is_responsible(&self, resource_key: &str) -> bool {
    match self.ring() {
      Some(ring) => ring.owner(resource_key) == Some(&self.local),
      None => true,
    }
  }

  /// The owner of `resource_key`, falling back to the local node under the same conditions as
  /// [`is_responsible`](OwnershipMapper::is_responsible).
  pub fn map_server(&self, resource_key: &str) -> Socket {
    self
      .ring()
      .and_then(|ring| ring.owner(resource_key).cloned())
      .unwrap_or_else(|| self.local.clone())
  }

  fn ring(&self) -> Option<Arc<NodeRing>> {
    let snapshot = self.membership.snapshot();
    if snapshot.peers.is_empty() || !snapshot.peers.contains(&self.local) {
      return None;
    }
    if let Some((version, ring)) = &*self.cache.read() {
      if *version == snapshot.version {
        return Some(ring.clone());
      }
    }
    let ring = Arc::new(NodeRing::from_peers(self.vnodes, snapshot.peers.iter()));
    *self.cache.write() = Some((snapshot.version, ring.clone()));
    Some(ring)
  }
}

#[cfg(test)]
use crate::cluster::StaticMembership;

#[test]
fn test_single_owner_per_key() {
  let peers = (7000u16..7004).map(Socket::localhost).collect::<Vec<_>>();
  let view = Arc::new(StaticMembership::new(peers.clone()));
  let mappers = peers
    .iter()
    .map(|p| OwnershipMapper::new(p.clone(), view.clone(), 64))
    .collect::<Vec<_>>();
  for i in 0..200 {
    let key = format!("10.0.{}.{}:8080#true", i / 10, i % 10);
    let owners = mappers.iter().filter(|m| m.is_responsible(&key)).count();
    assert_eq!(owners, 1);
    let owner = mappers[0].map_server(&key);
    assert!(mappers.iter().all(|m| m.map_server(&key) == owner));
  }
}

#[test]
fn test_responsible_when_alone() {
  let local = Socket::localhost(7100);
  let view = Arc::new(StaticMembership::new(vec![]));
  let mapper = OwnershipMapper::new(local.clone(), view.clone(), 64);
  assert!(mapper.is_responsible("anything"));
  assert_eq!(mapper.map_server("anything"), local);

  view.set_peers(vec![Socket::localhost(7101), Socket::localhost(7102)]);
  assert!(mapper.is_responsible("anything"));

  view.add_peer(local.clone());
  let owned = (0..300)
    .filter(|i| mapper.is_responsible(&format!("key-{}", i)))
    .count();
  assert!(owned > 0 && owned < 300);
}
