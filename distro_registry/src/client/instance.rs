use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Names a service: `namespace`, `group` and `name` together.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ServiceKey {
  pub namespace: String,
  pub group: String,
  pub name: String,
}
impl ServiceKey {
  pub fn new<N, G, S>(namespace: N, group: G, name: S) -> ServiceKey
  where
    N: Into<String>,
    G: Into<String>,
    S: Into<String>,
  {
    ServiceKey {
      namespace: namespace.into(),
      group: group.into(),
      name: name.into(),
    }
  }
}
impl fmt::Display for ServiceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}##{}@@{}", self.namespace, self.group, self.name)
  }
}

/// Identity of an instance inside a service. Two records with the same identity describe the
/// same instance, whatever their other fields say.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct InstanceId {
  pub ip: String,
  pub port: u16,
  pub cluster: String,
}
impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}#{}", self.ip, self.port, self.cluster)
  }
}

#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct InstanceRecord {
  pub ip: String,
  pub port: u16,
  pub cluster: String,
  pub weight: u32,
  pub healthy: bool,
  pub enabled: bool,
  pub ephemeral: bool,
  pub metadata: BTreeMap<String, String>,
}
impl InstanceRecord {
  pub fn new<I: Into<String>>(ip: I, port: u16) -> InstanceRecord {
    InstanceRecord {
      ip: ip.into(),
      port: port,
      cluster: "DEFAULT".to_string(),
      weight: 1,
      healthy: true,
      enabled: true,
      ephemeral: true,
      metadata: BTreeMap::new(),
    }
  }

  pub fn id(&self) -> InstanceId {
    InstanceId {
      ip: self.ip.clone(),
      port: self.port,
      cluster: self.cluster.clone(),
    }
  }
}
