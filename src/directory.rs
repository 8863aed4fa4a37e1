//! Directory Index: maps `(parentFileId, name)` to a directory entry
//! pointing at a child `FileId`. Grounded on the same dashmap-backed
//! concurrent-table pattern as `file_table.rs`; the composite key mirrors
//! how `examples/chiro2001-rfs/src/rfs_lib/fs.rs` resolves a path
//! component against a parent inode's directory block before touching
//! the inode table itself.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::file_table::FileAttributes;
use crate::ids::{FileId, FileKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DirectoryKey {
    parent: FileId,
    name: String,
}

/// One linkage from a directory to a child. `generation` is a per-entry
/// link counter (distinct from the superblock's commit generation):
/// it increments every time this `(parent, name)` slot is (re)linked,
/// so a caller holding a stale entry can detect that the name now
/// points at a different link even if the underlying `child` id were
/// ever reused.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub parent: FileId,
    pub name: String,
    pub child: FileId,
    pub kind: FileKind,
    pub attributes: FileAttributes,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub generation: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("entry '{0}' already exists in parent")]
    AlreadyExists(String),
    #[error("entry '{0}' not found in parent")]
    NotFound(String),
}

/// Concurrent `(parent, name) -> entry` table. Names are matched
/// case-sensitively (a design decision recorded in `DESIGN.md`):
/// `"Foo"` and `"foo"` are distinct entries.
pub struct DirectoryIndex {
    entries: DashMap<DirectoryKey, DirectoryEntry>,
    next_generation: AtomicU64,
}

impl Default for DirectoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn key(parent: FileId, name: &str) -> DirectoryKey {
        DirectoryKey {
            parent,
            name: name.to_string(),
        }
    }

    /// Insert a new entry. Fails if an entry with the same `(parent,
    /// name)` already exists — callers must remove or rename first.
    pub fn insert(
        &self,
        parent: FileId,
        name: &str,
        child: FileId,
        kind: FileKind,
        attributes: FileAttributes,
        now: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let key = Self::key(parent, name);
        if self.entries.contains_key(&key) {
            return Err(DirectoryError::AlreadyExists(name.to_string()));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            key,
            DirectoryEntry {
                parent,
                name: name.to_string(),
                child,
                kind,
                attributes,
                created_at: now,
                modified_at: now,
                accessed_at: now,
                generation,
            },
        );
        Ok(())
    }

    /// Used only while replaying persisted records at mount time, where
    /// uniqueness was already guaranteed by the prior session. Advances
    /// the generation counter past `entry.generation` so freshly linked
    /// entries never reuse a replayed generation number.
    pub fn insert_raw(&self, entry: DirectoryEntry) {
        self.next_generation.fetch_max(entry.generation + 1, Ordering::SeqCst);
        let key = Self::key(entry.parent, &entry.name);
        self.entries.insert(key, entry);
    }

    pub fn try_get(&self, parent: FileId, name: &str) -> Option<DirectoryEntry> {
        self.entries.get(&Self::key(parent, name)).map(|e| e.clone())
    }

    pub fn remove(&self, parent: FileId, name: &str) -> Result<DirectoryEntry, DirectoryError> {
        self.entries
            .remove(&Self::key(parent, name))
            .map(|(_, v)| v)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }

    /// All children of `parent`, sorted by name for stable, deterministic
    /// enumeration order across runs.
    pub fn enumerate(&self, parent: FileId) -> Vec<DirectoryEntry> {
        let mut children: Vec<DirectoryEntry> = self
            .entries
            .iter()
            .filter(|e| e.key().parent == parent)
            .map(|e| e.value().clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        children
    }

    pub fn is_empty_dir(&self, parent: FileId) -> bool {
        !self.entries.iter().any(|e| e.key().parent == parent)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> FileAttributes {
        FileAttributes::empty()
    }

    #[test]
    fn insert_and_lookup_round_trips() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "notes.txt", FileId(5), FileKind::File, attrs(), Utc::now())
            .unwrap();
        let entry = idx.try_get(FileId::ROOT, "notes.txt").unwrap();
        assert_eq!(entry.child, FileId(5));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "a", FileId(2), FileKind::File, attrs(), Utc::now())
            .unwrap();
        let err = idx.insert(FileId::ROOT, "a", FileId(3), FileKind::File, attrs(), Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn names_are_case_sensitive() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "Foo", FileId(2), FileKind::File, attrs(), Utc::now())
            .unwrap();
        assert!(idx.try_get(FileId::ROOT, "foo").is_none());
    }

    #[test]
    fn enumerate_is_sorted_by_name() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "banana", FileId(3), FileKind::File, attrs(), Utc::now())
            .unwrap();
        idx.insert(FileId::ROOT, "apple", FileId(2), FileKind::File, attrs(), Utc::now())
            .unwrap();
        let names: Vec<String> = idx
            .enumerate(FileId::ROOT)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["apple".to_string(), "banana".to_string()]);
    }

    #[test]
    fn remove_then_empty_check() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "a", FileId(2), FileKind::File, attrs(), Utc::now())
            .unwrap();
        assert!(!idx.is_empty_dir(FileId::ROOT));
        idx.remove(FileId::ROOT, "a").unwrap();
        assert!(idx.is_empty_dir(FileId::ROOT));
    }

    #[test]
    fn insert_assigns_increasing_generations() {
        let idx = DirectoryIndex::new();
        idx.insert(FileId::ROOT, "a", FileId(2), FileKind::File, attrs(), Utc::now())
            .unwrap();
        idx.insert(FileId::ROOT, "b", FileId(3), FileKind::File, attrs(), Utc::now())
            .unwrap();
        let a = idx.try_get(FileId::ROOT, "a").unwrap();
        let b = idx.try_get(FileId::ROOT, "b").unwrap();
        assert!(b.generation > a.generation);
    }
}
