use crate::core::DistroError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// The DNS name or IP address of the machine hosting a registry node.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  /// A name that still has to be resolved.
  DNS(String),
  /// A literal address.
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "{}", s),
      Host::IP(ip) => write!(f, "{}", ip),
    }
  }
}

/// The address a registry node receives peer traffic on. Peers are identified by their
/// [`Socket`] everywhere in the replication core: membership lists, sync targets and the
/// ownership ring all key on it.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct Socket {
  /// The DNS name or IP address of the node.
  pub host: Host,
  /// The port peer requests are served on.
  pub port: u16,
}
impl Socket {
  /// Creates a new [`Socket`]
  pub fn new(host: Host, port: u16) -> Socket {
    Socket {
      host: host,
      port: port,
    }
  }

  /// Shorthand for a loopback address, mostly useful when running several nodes in one process.
  pub fn localhost(port: u16) -> Socket {
    Socket::new(Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST)), port)
  }
}
impl fmt::Display for Socket {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}
impl FromStr for Socket {
  type Err = DistroError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (host, port) = s
      .rsplit_once(':')
      .ok_or_else(|| DistroError::InvalidAddress(s.to_string()))?;
    if host.is_empty() {
      return Err(DistroError::InvalidAddress(s.to_string()));
    }
    let port = port
      .parse::<u16>()
      .map_err(|_| DistroError::InvalidAddress(s.to_string()))?;
    Ok(Socket::new(Host::from(host.to_string()), port))
  }
}
impl Default for Socket {
  fn default() -> Self {
    Self {
      host: Host::IP(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
      port: 0,
    }
  }
}

#[test]
fn test_socket_parse() {
  let socket = "10.0.0.7:8848".parse::<Socket>().unwrap();
  assert_eq!(socket.host, Host::IP("10.0.0.7".parse().unwrap()));
  assert_eq!(socket.port, 8848);
  assert_eq!(socket.to_string(), "10.0.0.7:8848");

  let named = "registry-2:9000".parse::<Socket>().unwrap();
  assert_eq!(named.host, Host::DNS("registry-2".to_string()));

  assert!("no-port".parse::<Socket>().is_err());
  assert!(":8848".parse::<Socket>().is_err());
  assert!("host:99999".parse::<Socket>().is_err());
}
