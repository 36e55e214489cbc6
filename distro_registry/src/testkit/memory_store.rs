use crate::core::{Datum, DataOperation, DistroBatch, Result, VerifyRecord};
use crate::distro::DataStore;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

/// A [`DataStore`] over a plain map of opaque values. Every key is considered locally owned.
pub struct MemoryStore {
  resource_type: String,
  data: DashMap<String, Datum>,
}
impl MemoryStore {
  pub fn new<T: Into<String>>(resource_type: T) -> MemoryStore {
    MemoryStore {
      resource_type: resource_type.into(),
      data: DashMap::new(),
    }
  }

  /// Stores `value` under `key` with the next revision.
  pub fn put<K: Into<String>>(&self, key: K, value: Vec<u8>) -> u64 {
    let key = key.into();
    let mut entry = self.data.entry(key.clone()).or_insert_with(|| Datum {
      key: key,
      value: Vec::new(),
      revision: 0,
    });
    entry.value = value;
    entry.revision += 1;
    entry.revision
  }

  pub fn get(&self, key: &str) -> Option<Datum> {
    self.data.get(key).map(|d| d.value().clone())
  }

  pub fn remove(&self, key: &str) -> Option<Datum> {
    self.data.remove(key).map(|(_, d)| d)
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}
impl DataStore for MemoryStore {
  fn resource_type(&self) -> &str {
    &self.resource_type
  }

  fn batch_get(&self, keys: &BTreeSet<String>) -> Result<BTreeMap<String, Datum>> {
    Ok(
      keys
        .iter()
        .filter_map(|k| self.get(k).map(|d| (k.clone(), d)))
        .collect(),
    )
  }

  fn apply(&self, batch: &DistroBatch) -> Result<bool> {
    let mut changed = false;
    for (key, datum) in batch.data.iter() {
      changed |= match batch.operation {
        DataOperation::Delete => self.remove(key).is_some(),
        _ => {
          let stale = self.get(key).map_or(true, |d| d.revision != datum.revision);
          if stale {
            self.data.insert(key.clone(), datum.clone());
          }
          stale
        }
      };
    }
    Ok(changed)
  }

  fn verify_records(&self) -> Vec<VerifyRecord> {
    self
      .data
      .iter()
      .map(|d| VerifyRecord {
        resource_type: self.resource_type.clone(),
        key: d.key().clone(),
        revision: d.revision,
      })
      .collect()
  }

  fn verify(&self, record: &VerifyRecord) -> bool {
    self.get(&record.key).map_or(false, |d| d.revision == record.revision)
  }

  fn snapshot(&self) -> Result<BTreeMap<String, Datum>> {
    Ok(
      self
        .data
        .iter()
        .map(|d| (d.key().clone(), d.value().clone()))
        .collect(),
    )
  }
}
