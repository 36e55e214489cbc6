use crate::core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Configures a [`DistroProtocol`](crate::distro::DistroProtocol) and the client registry
/// feeding it. Durations are written in milliseconds when (de)serialized.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DistroConfig {
  /// How long a local mutation waits for further mutations of the same key before it is
  /// replicated.
  ///
  /// default: `1 second`
  #[serde(with = "millis")]
  pub sync_delay: Duration,
  /// Fixed backoff between two pushes of a failed sync task.
  ///
  /// default: `2 seconds`
  #[serde(with = "millis")]
  pub sync_retry_delay: Duration,
  /// How often the delay engine scans for tasks whose debounce window elapsed.
  ///
  /// default: `100 milliseconds`
  #[serde(with = "millis")]
  #[validate(custom(function = "positive"))]
  pub process_interval: Duration,
  /// How often responsible data is verified against every peer.
  ///
  /// default: `5 seconds`
  #[serde(with = "millis")]
  #[validate(custom(function = "positive"))]
  pub verify_interval: Duration,
  /// Upper bound on a single push to a peer.
  ///
  /// default: `3 seconds`
  #[serde(with = "millis")]
  pub push_timeout: Duration,
  /// The number of worker lanes of the task dispatcher. All work for one key runs on one lane.
  ///
  /// default: `8`
  #[validate(range(min = 1_usize))]
  pub dispatch_lanes: usize,
  /// The number of sync jobs allowed to talk to peers at the same time.
  ///
  /// default: the number of CPU cores
  #[validate(range(min = 1_usize))]
  pub sync_workers: usize,
  /// The number of points each peer gets on the ownership ring.
  ///
  /// default: `64`
  #[validate(range(min = 1_u32))]
  pub vnodes: u32,
  /// Two timestamps from different processes closer than this are concurrent.
  ///
  /// default: `500 milliseconds`
  #[serde(with = "millis")]
  pub max_clock_skew: Duration,
  /// Logical counter increment of the hybrid logical clock.
  ///
  /// default: `1`
  #[validate(range(min = 1_u16))]
  pub hlc_step: u16,
  /// Idle time after which a client is expired.
  ///
  /// default: `3 minutes`
  #[serde(with = "millis")]
  pub client_expired_time: Duration,
  /// How often the expiry sweep runs.
  ///
  /// default: `5 seconds`
  #[serde(with = "millis")]
  #[validate(custom(function = "positive"))]
  pub expire_interval: Duration,
}
impl Default for DistroConfig {
  #[inline]
  fn default() -> Self {
    DistroConfig {
      sync_delay: Duration::from_millis(1000),
      sync_retry_delay: Duration::from_millis(2000),
      process_interval: Duration::from_millis(100),
      verify_interval: Duration::from_millis(5000),
      push_timeout: Duration::from_millis(3000),
      dispatch_lanes: 8,
      sync_workers: num_cpus::get(),
      vnodes: 64,
      max_clock_skew: Duration::from_millis(500),
      hlc_step: 1,
      client_expired_time: Duration::from_secs(180),
      expire_interval: Duration::from_secs(5),
    }
  }
}
impl DistroConfig {
  /// Reads a possibly partial JSON document, missing fields keep their defaults.
  pub fn from_json(json: &str) -> Result<DistroConfig> {
    let config: DistroConfig = serde_json::from_str(json)?;
    config.check()?;
    Ok(config)
  }

  /// Runs the field checks, reporting every violation at once.
  pub fn check(&self) -> Result<()> {
    Ok(self.validate()?)
  }
}

fn positive(d: &Duration) -> std::result::Result<(), ValidationError> {
  if d.is_zero() {
    return Err(ValidationError::new("zero_duration").with_message("must be positive".into()));
  }
  Ok(())
}

mod millis {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}

#[cfg(test)]
use crate::core::DistroError;

#[test]
fn test_partial_json() {
  let config = DistroConfig::from_json(r#"{"sync_delay": 250, "dispatch_lanes": 2}"#).unwrap();
  assert_eq!(config.sync_delay, Duration::from_millis(250));
  assert_eq!(config.dispatch_lanes, 2);
  assert_eq!(config.sync_retry_delay, Duration::from_millis(2000));
  assert_eq!(config.vnodes, 64);
}

#[test]
fn test_invalid_config() {
  assert!(matches!(
    DistroConfig::from_json(r#"{"dispatch_lanes": 0}"#),
    Err(DistroError::InvalidConfig(_))
  ));
  assert!(matches!(
    DistroConfig::from_json("not json"),
    Err(DistroError::Codec(_))
  ));
}

#[test]
fn test_every_violation_is_reported() {
  let config = DistroConfig {
    vnodes: 0,
    hlc_step: 0,
    verify_interval: Duration::ZERO,
    ..DistroConfig::default()
  };
  let msg = match config.check() {
    Err(DistroError::InvalidConfig(msg)) => msg,
    other => panic!("unexpected {:?}", other),
  };
  for field in ["vnodes", "hlc_step", "verify_interval"] {
    assert!(msg.contains(field), "{} missing from {}", field, msg);
  }
  assert!(DistroConfig::default().check().is_ok());
}
