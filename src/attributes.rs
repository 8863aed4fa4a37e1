//! Attribute Table: arbitrary `(FileId, name) -> bytes` key/value pairs
//! attached to a file, capacity-capped the same way
//! `examples/chiro2001-rfs/src/rfs_lib/xattr.rs` bounds xattr storage
//! per inode. Overflow is surfaced to the caller rather than silently
//! truncated or evicted.

use dashmap::DashMap;

use crate::ids::FileId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AttributeKey {
    file: FileId,
    name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute '{0}' not found")]
    NotFound(String),
    #[error("attribute table capacity of {capacity} bytes exceeded by {requested} bytes")]
    CapacityExceeded { capacity: usize, requested: usize },
}

/// Concurrent attribute store with a total byte-size cap shared across all
/// files, enforced so a single commit's serialized attribute extent can
/// never outgrow what the allocator is willing to reserve for it.
pub struct AttributeTable {
    entries: DashMap<AttributeKey, Vec<u8>>,
    capacity: usize,
}

impl AttributeTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
        }
    }

    fn key(file: FileId, name: &str) -> AttributeKey {
        AttributeKey {
            file,
            name: name.to_string(),
        }
    }

    fn current_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key().name.len() + e.value().len())
            .sum()
    }

    pub fn upsert(&self, file: FileId, name: &str, value: Vec<u8>) -> Result<(), AttributeError> {
        let key = Self::key(file, name);
        let existing = self.entries.get(&key).map(|e| e.key().name.len() + e.value().len()).unwrap_or(0);
        let added = name.len() + value.len();
        let projected = self.current_size() - existing + added;
        if projected > self.capacity {
            return Err(AttributeError::CapacityExceeded {
                capacity: self.capacity,
                requested: projected,
            });
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Used only while replaying persisted records at mount time, where
    /// the capacity check already passed in the session that wrote them.
    pub fn insert_raw(&self, file: FileId, name: &str, value: Vec<u8>) {
        self.entries.insert(Self::key(file, name), value);
    }

    pub fn try_get(&self, file: FileId, name: &str) -> Option<Vec<u8>> {
        self.entries.get(&Self::key(file, name)).map(|e| e.clone())
    }

    pub fn remove(&self, file: FileId, name: &str) -> Result<(), AttributeError> {
        self.entries
            .remove(&Self::key(file, name))
            .map(|_| ())
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))
    }

    pub fn remove_all(&self, file: FileId) {
        self.entries.retain(|k, _| k.file != file);
    }

    pub fn enumerate(&self, file: FileId) -> Vec<(String, Vec<u8>)> {
        let mut attrs: Vec<(String, Vec<u8>)> = self
            .entries
            .iter()
            .filter(|e| e.key().file == file)
            .map(|e| (e.key().name.clone(), e.value().clone()))
            .collect();
        attrs.sort_by(|a, b| a.0.cmp(&b.0));
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_get_round_trips() {
        let table = AttributeTable::new(1024);
        table.upsert(FileId(2), "author", b"ada".to_vec()).unwrap();
        assert_eq!(table.try_get(FileId(2), "author").unwrap(), b"ada".to_vec());
    }

    #[test]
    fn overwrite_does_not_double_count_capacity() {
        let table = AttributeTable::new(32);
        table.upsert(FileId(2), "k", vec![0u8; 10]).unwrap();
        table.upsert(FileId(2), "k", vec![0u8; 10]).unwrap();
        assert_eq!(table.try_get(FileId(2), "k").unwrap().len(), 10);
    }

    #[test]
    fn overflow_is_rejected_not_evicted() {
        let table = AttributeTable::new(16);
        let err = table.upsert(FileId(2), "k", vec![0u8; 64]);
        assert!(err.is_err());
        assert!(table.try_get(FileId(2), "k").is_none());
    }

    #[test]
    fn remove_all_clears_every_attribute_for_file() {
        let table = AttributeTable::new(1024);
        table.upsert(FileId(2), "a", b"1".to_vec()).unwrap();
        table.upsert(FileId(2), "b", b"2".to_vec()).unwrap();
        table.remove_all(FileId(2));
        assert!(table.enumerate(FileId(2)).is_empty());
    }
}
