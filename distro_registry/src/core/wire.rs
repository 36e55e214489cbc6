use crate::core::{DataOperation, Result, Socket};
use crate::crdt::HlcTimestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One replicated record: the owning store's own encoding of the value plus the revision the
/// store assigned to it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Datum {
  pub key: String,
  pub value: Vec<u8>,
  pub revision: u64,
}
impl Datum {
  /// The payload carried by deletes.
  pub fn tombstone(key: String) -> Datum {
    Datum {
      key: key,
      value: Vec::new(),
      revision: 0,
    }
  }
}

/// The body of a push between peers.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DistroBatch {
  pub resource_type: String,
  pub operation: DataOperation,
  pub origin: Socket,
  pub clock: HlcTimestamp,
  pub data: BTreeMap<String, Datum>,
}

/// What a node asks its peers to confirm during a verify round.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VerifyRecord {
  pub resource_type: String,
  pub key: String,
  pub revision: u64,
}

/// Successful outcomes of a push. `NotModified` means the receiver already held this data or
/// newer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum PushStatus {
  Ok,
  NotModified,
}

pub fn encode<T: Serialize>(item: &T) -> Result<Vec<u8>> {
  Ok(serde_cbor::to_vec(item)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
  Ok(serde_cbor::from_slice(bytes)?)
}

#[test]
fn test_batch_codec() {
  use crate::crdt::HybridLogicalClock;
  use maplit::btreemap;

  let clock = HybridLogicalClock::new("node-a").generate_for_sending();
  let batch = DistroBatch {
    resource_type: "client".to_string(),
    operation: DataOperation::Change,
    origin: Socket::localhost(8848),
    clock: clock,
    data: btreemap! {
      "1.1.1.1:80#true".to_string() => Datum {
        key: "1.1.1.1:80#true".to_string(),
        value: vec![1, 2, 3],
        revision: 4,
      },
    },
  };
  let bytes = encode(&batch).unwrap();
  assert_eq!(decode::<DistroBatch>(&bytes).unwrap(), batch);
  assert!(decode::<DistroBatch>(&bytes[1..]).is_err());
}
