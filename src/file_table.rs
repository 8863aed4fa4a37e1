//! File Table: the authoritative map from `FileId` to file metadata.
//! Modeled on `examples/chiro2001-rfs/src/rfs_lib/desc.rs`'s `Ext2Inode`
//! bookkeeping, reduced to kind, attributes bitset, length, extents, and
//! timestamps, stored behind a `dashmap` the same way that FUSE layer
//! shares inode state across request handlers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::ids::{FileId, FileKind, PageSpan};

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0b0001;
        const HIDDEN    = 0b0010;
        const SYSTEM    = 0b0100;
        /// Set iff the owning entry's `kind` is `FileKind::Directory`; kept
        /// in lockstep with `FileMetadata::kind` rather than derived at
        /// read time, since attributes round-trip through the wire format
        /// independently of kind.
        const DIRECTORY = 0b1000;
    }
}

#[derive(Clone)]
pub struct FileMetadata {
    pub id: FileId,
    pub kind: FileKind,
    pub attributes: FileAttributes,
    pub length: u64,
    pub extents: Vec<PageSpan>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl FileMetadata {
    fn new(id: FileId, kind: FileKind, now: DateTime<Utc>) -> Self {
        let attributes = if kind.is_directory() {
            FileAttributes::DIRECTORY
        } else {
            FileAttributes::empty()
        };
        Self {
            id,
            kind,
            attributes,
            length: 0,
            extents: Vec::new(),
            created_at: now,
            modified_at: now,
            accessed_at: now,
        }
    }
}

/// Concurrent table of live file metadata, keyed by `FileId`. IDs are
/// assigned monotonically starting at 2 (`FileId::ROOT` is reserved for
/// the root directory and is seeded separately at mount).
pub struct FileTable {
    entries: DashMap<FileId, FileMetadata>,
    next_id: AtomicU64,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(2),
        }
    }

    /// Seed the table with the root directory entry. Only meaningful at
    /// first mount; a mount that rehydrates from disk instead inserts the
    /// root entry via `insert_raw` while replaying persisted records.
    pub fn seed_root(&self, now: DateTime<Utc>) {
        self.entries
            .entry(FileId::ROOT)
            .or_insert_with(|| FileMetadata::new(FileId::ROOT, FileKind::Directory, now));
    }

    pub fn allocate(&self, kind: FileKind, now: DateTime<Utc>) -> FileId {
        let id = FileId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.entries.insert(id, FileMetadata::new(id, kind, now));
        id
    }

    /// Insert a fully-formed entry, used when replaying persisted records
    /// at mount time. Advances the monotonic counter past `entry.id` so
    /// freshly allocated ids never collide with replayed ones.
    pub fn insert_raw(&self, entry: FileMetadata) {
        let id = entry.id;
        self.entries.insert(id, entry);
        self.next_id.fetch_max(id.0 + 1, Ordering::SeqCst);
    }

    pub fn try_get(&self, id: FileId) -> Option<FileMetadata> {
        self.entries.get(&id).map(|e| e.clone())
    }

    pub fn mutate<R>(&self, id: FileId, f: impl FnOnce(&mut FileMetadata) -> R) -> Option<R> {
        self.entries.get_mut(&id).map(|mut e| f(&mut e))
    }

    pub fn remove(&self, id: FileId) -> Option<FileMetadata> {
        self.entries.remove(&id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn enumerate(&self) -> Vec<FileMetadata> {
        self.entries.iter().map(|e| e.value().clone()).collect()
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

    #[test]
    fn allocate_assigns_monotonic_ids_starting_at_two() {
        let table = FileTable::new();
        let now = Utc::now();
        let a = table.allocate(FileKind::File, now);
        let b = table.allocate(FileKind::File, now);
        assert_eq!(a.0, 2);
        assert_eq!(b.0, 3);
    }

    #[test]
    fn insert_raw_advances_counter_past_replayed_id() {
        let table = FileTable::new();
        let now = Utc::now();
        table.insert_raw(FileMetadata::new(FileId(50), FileKind::File, now));
        let next = table.allocate(FileKind::File, now);
        assert_eq!(next.0, 51);
    }

    #[test]
    fn mutate_updates_length_and_modified_time() {
        let table = FileTable::new();
        let now = Utc::now();
        let id = table.allocate(FileKind::File, now);
        table.mutate(id, |meta| meta.length = 4096);
        assert_eq!(table.try_get(id).unwrap().length, 4096);
    }

    #[test]
    fn remove_drops_entry() {
        let table = FileTable::new();
        let now = Utc::now();
        let id = table.allocate(FileKind::File, now);
        assert!(table.remove(id).is_some());
        assert!(table.try_get(id).is_none());
    }
}
