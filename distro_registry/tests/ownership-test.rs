use distro_registry::cluster::{MembershipView, OwnershipMapper, StaticMembership};
use distro_registry::core::Socket;
use itertools::Itertools;
use std::sync::Arc;

const KEYS: usize = 10_000;

fn keys() -> Vec<String> {
  (0..KEYS).map(|i| format!("10.{}.{}.{}:8080", i / 65536, (i / 256) % 256, i % 256)).collect()
}

fn peers(n: u16) -> Vec<Socket> {
  (0..n).map(|i| Socket::localhost(7000 + i)).collect()
}

fn owners(mapper: &OwnershipMapper, keys: &[String]) -> Vec<Socket> {
  keys.iter().map(|k| mapper.map_server(k)).collect()
}

#[test]
fn test_every_node_agrees_on_the_owner() {
  let membership: Arc<dyn MembershipView> = Arc::new(StaticMembership::new(peers(5)));
  let mappers = peers(5)
    .into_iter()
    .map(|p| OwnershipMapper::new(p, membership.clone(), 64))
    .collect::<Vec<_>>();
  for key in keys().iter().take(1000) {
    let responsible = mappers.iter().filter(|m| m.is_responsible(key)).count();
    assert_eq!(responsible, 1, "{}", key);
    assert_eq!(
      mappers.iter().map(|m| m.map_server(key)).unique().count(),
      1,
      "{}",
      key
    );
  }
}

#[test]
fn test_adding_a_peer_moves_few_keys() {
  let membership = Arc::new(StaticMembership::new(peers(10)));
  let mapper = OwnershipMapper::new(Socket::localhost(7000), membership.clone(), 64);
  let keys = keys();
  let before = owners(&mapper, &keys);

  let newcomer = Socket::localhost(7010);
  membership.add_peer(newcomer.clone());
  let after = owners(&mapper, &keys);

  let moved = before
    .iter()
    .zip(after.iter())
    .filter(|(b, a)| b != a)
    .collect::<Vec<_>>();
  // roughly one key in eleven should move, all of them to the new peer
  assert!(moved.iter().all(|(_, a)| **a == newcomer));
  assert!(moved.len() > KEYS / 40, "moved {}", moved.len());
  assert!(moved.len() < KEYS / 5, "moved {}", moved.len());
}

#[test]
fn test_removing_a_peer_only_moves_its_keys() {
  let membership = Arc::new(StaticMembership::new(peers(10)));
  let mapper = OwnershipMapper::new(Socket::localhost(7000), membership.clone(), 64);
  let keys = keys();
  let before = owners(&mapper, &keys);

  let leaver = Socket::localhost(7005);
  membership.remove_peer(&leaver);
  let after = owners(&mapper, &keys);

  for (b, a) in before.iter().zip(after.iter()) {
    if *b == leaver {
      assert_ne!(*a, leaver);
    } else {
      assert_eq!(a, b);
    }
  }
}

#[test]
fn test_load_is_spread() {
  let membership = Arc::new(StaticMembership::new(peers(4)));
  let mapper = OwnershipMapper::new(Socket::localhost(7000), membership, 64);
  let counts = owners(&mapper, &keys()).into_iter().counts();
  assert_eq!(counts.len(), 4);
  for (peer, count) in counts {
    assert!(count > KEYS / 10, "{} owns only {}", peer, count);
  }
}

#[test]
fn test_local_node_missing_from_membership() {
  let membership = Arc::new(StaticMembership::new(peers(3)));
  let outsider = Socket::localhost(9999);
  let mapper = OwnershipMapper::new(outsider.clone(), membership, 64);
  assert!(keys().iter().take(100).all(|k| mapper.is_responsible(k)));
  assert_eq!(mapper.map_server("10.0.0.1:8080"), outsider);
}
