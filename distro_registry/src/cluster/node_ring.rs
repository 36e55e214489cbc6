use crate::core::Socket;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use wyhash::{wyrng, WyHash};

/// A consistent-hash ring over the healthy peers. Every peer occupies `vnodes` points, a key is
/// owned by the first peer found walking clockwise from the key's hash. Adding or removing one
/// peer only moves the keys that fall between its points and their predecessors.
pub struct NodeRing {
  pub(in crate::cluster) ring: BTreeMap<u64, Socket>,
  vnodes: u32,
}
impl NodeRing {
  pub fn new(vnodes: u32) -> NodeRing {
    NodeRing {
      ring: BTreeMap::new(),
      vnodes: vnodes,
    }
  }

  pub fn from_peers<'a, I: IntoIterator<Item = &'a Socket>>(vnodes: u32, peers: I) -> NodeRing {
    let mut ring = NodeRing::new(vnodes);
    peers.into_iter().for_each(|p| ring.insert(p.clone()));
    ring
  }

  pub fn is_empty(&self) -> bool {
    self.ring.is_empty()
  }

  /// The first `num` distinct peers clockwise from `item`.
  pub fn managers<H: Hash + ?Sized>(&self, item: &H, num: usize) -> Vec<Socket> {
    let key = hash_code(item);
    self
      .ring
      .range(key..)
      .chain(self.ring.range(..key))
      .map(|(_, x)| x)
      .unique()
      .take(num)
      .cloned()
      .collect()
  }

  pub fn owner<H: Hash + ?Sized>(&self, item: &H) -> Option<&Socket> {
    let key = hash_code(item);
    self
      .ring
      .range(key..)
      .chain(self.ring.range(..key))
      .map(|(_, x)| x)
      .next()
  }

  pub fn insert(&mut self, peer: Socket) {
    let mut key = peer_code(&peer);
    self.ring.insert(key, peer.clone());
    for _ in 1..self.vnodes {
      key = wyrng(&mut key);
      self.ring.insert(key, peer.clone());
    }
  }

  /// Removes every point of `peer`. On a partial removal, returns how many points were found.
  pub fn remove(&mut self, peer: &Socket) -> Result<(), u32> {
    let mut key = peer_code(peer);
    let mut removed = 0u32;
    for _ in 0..std::cmp::max(1, self.vnodes) {
      removed += self.ring.remove(&key).is_some() as u32;
      key = wyrng(&mut key);
    }
    if removed == self.vnodes {
      Result::Ok(())
    } else {
      Result::Err(removed)
    }
  }
}

// Peers hash by their printed address so every node places them identically.
fn peer_code(peer: &Socket) -> u64 {
  hash_code(peer.to_string().as_str())
}

pub fn hash_code<H: Hash + ?Sized>(item: &H) -> u64 {
  let mut hasher = WyHash::with_seed(0);
  item.hash(&mut hasher);
  hasher.finish()
}

#[test]
fn test_node_ring() {
  let peers = (5000u16..5005u16).map(Socket::localhost).collect::<Vec<_>>();
  let mut ring = NodeRing::from_peers(16, peers.iter());
  assert_eq!(ring.ring.len(), 80);

  for key in ["a", "b", "service@@group", "10.0.0.1:80#true"] {
    let managers = ring.managers(key, 3);
    assert_eq!(managers.len(), 3);
    assert_eq!(managers.iter().unique().count(), 3);
    assert_eq!(ring.owner(key), managers.first());
  }
  assert_eq!(ring.managers("a", 10).len(), 5);

  let owner = ring.owner("a").cloned().unwrap();
  let other = peers.iter().find(|p| **p != owner).unwrap().clone();
  ring.remove(&other).unwrap();
  assert_eq!(ring.owner("a"), Some(&owner));

  for p in peers.iter().filter(|p| **p != other) {
    ring.remove(p).unwrap();
  }
  assert!(ring.is_empty());
  assert_eq!(ring.owner("a"), None);
  assert_eq!(ring.remove(&owner), Err(0));
}
