use crate::core::{DataOperation, Socket};
use thiserror::Error;

/// Result type for replication operations
pub type Result<T> = std::result::Result<T, DistroError>;

/// Everything that can go wrong inside the replication core. None of these surface to registry
/// callers: the components that produce them log them and fall back to retrying or dropping the
/// work, see [`DistroError::is_transient`].
#[derive(Debug, Error)]
pub enum DistroError {
  /// The dispatcher only turns `ADD`, `CHANGE` and `DELETE` into sync work.
  #[error("unsupported action for a delayed task: {0:?}")]
  UnsupportedAction(DataOperation),

  /// No data store or task processor was registered for a resource type.
  #[error("no processor registered for resource type {0}")]
  NoProcessor(String),

  #[error("peer unreachable: {0}")]
  PeerUnreachable(Socket),

  #[error("push to {0} timed out")]
  PushTimeout(Socket),

  #[error("push to {target} rejected: {reason}")]
  PushRejected { target: Socket, reason: String },

  #[error("codec error: {0}")]
  Codec(String),

  #[error("invalid address: {0}")]
  InvalidAddress(String),

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("replication core is shut down")]
  ShutDown,
}
impl DistroError {
  /// Transient failures are worth another attempt against the same peer.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      DistroError::PeerUnreachable(_)
        | DistroError::PushTimeout(_)
        | DistroError::PushRejected { .. }
    )
  }
}

impl From<serde_cbor::Error> for DistroError {
  fn from(e: serde_cbor::Error) -> Self {
    DistroError::Codec(e.to_string())
  }
}

impl From<serde_json::Error> for DistroError {
  fn from(e: serde_json::Error) -> Self {
    DistroError::Codec(e.to_string())
  }
}

impl From<validator::ValidationErrors> for DistroError {
  fn from(e: validator::ValidationErrors) -> Self {
    DistroError::InvalidConfig(e.to_string())
  }
}
