use crate::core::{PushStatus, Result, Socket, VerifyRecord};
use async_trait::async_trait;

/// How a node reaches its peers. Bodies are encoded [`DistroBatch`](crate::core::DistroBatch)es
/// or lists of [`VerifyRecord`]s, the transport only moves bytes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Delivers a batch to `target`.
  async fn push(&self, target: &Socket, body: Vec<u8>) -> Result<PushStatus>;

  /// Asks `target` to confirm a list of records. Answers with the records it could not confirm.
  async fn verify(&self, target: &Socket, body: Vec<u8>) -> Result<Vec<VerifyRecord>>;

  /// Fetches the full data set of one resource type from `target`.
  async fn snapshot(&self, target: &Socket, resource_type: &str) -> Result<Vec<u8>>;
}
