//! Identity index: `(model, id)` to record, plus sub-type aliases and the
//! id-only fast path for owned models.

use std::collections::HashMap;

use color_eyre::Result;

use crate::error::StoreError;
use crate::record::Record;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RecordKey {
  pub model_name: String,
  pub id: String,
}

impl RecordKey {
  pub fn new(model_name: &str, id: &str) -> Self {
    Self {
      model_name: model_name.to_string(),
      id: id.to_string(),
    }
  }
}

#[derive(Default)]
pub(crate) struct Index {
  records: HashMap<RecordKey, Record>,
  /// Sub-type name and id to the key of the primary record
  aliases: HashMap<RecordKey, RecordKey>,
  /// Owned records by id alone, for references that carry no type
  by_id: HashMap<String, Vec<RecordKey>>,
}

fn conflict(key: &RecordKey) -> color_eyre::Report {
  StoreError::IdentityConflict {
    model_name: key.model_name.clone(),
    id: key.id.clone(),
  }
  .into()
}

impl Index {
  /// Find the record for `requested` (a base or sub-type name) whose base key
  /// is `key`. Fails if the direct entry and an alias disagree.
  pub fn lookup(&self, requested: &RecordKey, key: &RecordKey) -> Result<Option<Record>> {
    let direct = self.records.get(key);
    let aliased = self
      .aliases
      .get(requested)
      .and_then(|primary| self.records.get(primary));
    match (direct, aliased) {
      (Some(a), Some(b)) if !a.ptr_eq(b) => Err(conflict(requested)),
      (Some(record), _) | (None, Some(record)) => Ok(Some(record.clone())),
      (None, None) => Ok(None),
    }
  }

  pub fn insert(&mut self, key: RecordKey, record: Record, owned: bool) {
    if owned {
      let keys = self.by_id.entry(key.id.clone()).or_default();
      if !keys.contains(&key) {
        keys.push(key.clone());
      }
    }
    self.records.insert(key, record);
  }

  /// Check that every alias can point at `primary` without rebinding an
  /// existing entry to a different record.
  pub fn check_aliases(&self, aliases: &[RecordKey], primary: &RecordKey) -> Result<()> {
    let target = self.records.get(primary);
    for alias in aliases.iter().filter(|a| *a != primary) {
      if let Some(bound) = self.aliases.get(alias) {
        if bound != primary {
          return Err(conflict(alias));
        }
      }
      if let Some(existing) = self.records.get(alias) {
        if !target.is_some_and(|target| existing.ptr_eq(target)) {
          return Err(conflict(alias));
        }
      }
    }
    Ok(())
  }

  pub fn bind_aliases(&mut self, aliases: Vec<RecordKey>, primary: &RecordKey) {
    for alias in aliases.into_iter().filter(|a| a != primary) {
      self.aliases.insert(alias, primary.clone());
    }
  }

  /// The single owned record with this id, if exactly one exists.
  pub fn by_id(&self, id: &str) -> Option<Record> {
    match self.by_id.get(id).map(Vec::as_slice) {
      Some([key]) => self.records.get(key).cloned(),
      _ => None,
    }
  }

  /// Remove the record stored under `key` and every entry that derives from it.
  pub fn remove(&mut self, key: &RecordKey) -> Option<Record> {
    let record = self.records.remove(key)?;
    self.aliases.retain(|_, primary| primary != key);
    if let Some(keys) = self.by_id.get_mut(&key.id) {
      keys.retain(|k| k != key);
      if keys.is_empty() {
        self.by_id.remove(&key.id);
      }
    }
    Some(record)
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }
}
