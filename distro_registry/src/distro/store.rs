use crate::core::{Datum, DistroBatch, DistroError, Result, VerifyRecord};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A source and sink of replicable data for one resource type.
pub trait DataStore: Send + Sync + 'static {
  fn resource_type(&self) -> &str;

  /// Current values of `keys`. Keys that no longer exist are left out.
  fn batch_get(&self, keys: &BTreeSet<String>) -> Result<BTreeMap<String, Datum>>;

  /// Applies a batch pushed by a peer. Returns whether local state changed.
  fn apply(&self, batch: &DistroBatch) -> Result<bool>;

  /// Records for the data this node is authoritative for, to be confirmed by every peer.
  fn verify_records(&self) -> Vec<VerifyRecord>;

  /// Whether the local replica agrees with a peer's record.
  fn verify(&self, record: &VerifyRecord) -> bool;

  /// Everything this store holds, for a joining peer.
  fn snapshot(&self) -> Result<BTreeMap<String, Datum>>;
}

/// Data stores by resource type.
#[derive(Default)]
pub struct StoreRegistry {
  stores: DashMap<String, Arc<dyn DataStore>>,
}
impl StoreRegistry {
  pub fn register(&self, store: Arc<dyn DataStore>) {
    self.stores.insert(store.resource_type().to_string(), store);
  }

  pub fn get(&self, resource_type: &str) -> Result<Arc<dyn DataStore>> {
    self
      .stores
      .get(resource_type)
      .map(|s| s.value().clone())
      .ok_or_else(|| DistroError::NoProcessor(resource_type.to_string()))
  }

  pub fn all(&self) -> Vec<Arc<dyn DataStore>> {
    self.stores.iter().map(|s| s.value().clone()).collect()
  }
}
