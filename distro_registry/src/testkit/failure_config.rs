use crate::core::Socket;
use im::HashMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How unreliable the path to a peer is: the probability that a request is lost, and an optional
/// range its delivery is delayed by.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  pub drop_prob: f64,
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn should_drop(&self) -> bool {
    self.drop_prob > 0.0 && rand::random::<f64>() < self.drop_prob
  }

  pub fn sample_delay(&self) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      let range = min.as_millis()..=max.as_millis().max(min.as_millis());
      Duration::from_millis(SmallRng::from_entropy().gen_range(range) as u64)
    })
  }
}

/// A cluster-wide default with per-peer overrides.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<Socket, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, socket: &Socket) -> &FailureConfig {
    self.node_wide.get(socket).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_config_map() {
  let lossy = FailureConfig {
    drop_prob: 1.0,
    delay: Some((Duration::from_millis(5), Duration::from_millis(10))),
  };
  let map = FailureConfigMap {
    cluster_wide: FailureConfig::default(),
    node_wide: im::hashmap! { Socket::localhost(1) => lossy },
  };
  assert!(map.get(&Socket::localhost(1)).should_drop());
  assert!(!map.get(&Socket::localhost(2)).should_drop());
  assert_eq!(map.get(&Socket::localhost(2)).sample_delay(), None);
  let delay = map.get(&Socket::localhost(1)).sample_delay().unwrap();
  assert!(delay >= Duration::from_millis(5) && delay <= Duration::from_millis(10));
}
