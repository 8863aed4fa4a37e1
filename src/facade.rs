//! File-system facade: the path-addressed POSIX-style operations the
//! rest of this crate exists to serve, plus the compaction hook external
//! callers may wire in. Generalizes the shape of the FUSE callbacks in
//! `examples/chiro2001-rfs/src/rfs_lib/fs.rs` (`lookup`/`mkdir`/`create`/
//! `unlink`/`rmdir`) from kernel-supplied `(parent inode, name)` pairs to
//! path strings resolved against the Directory Index ourselves.

use crate::allocator::ExtentOwner;
use crate::attributes::AttributeError;
use crate::error::{VfsError, VfsResult};
use crate::file_table::FileAttributes;
use crate::ids::{FileId, FileKind};
use crate::path;
use crate::stream::{FileStream, StreamLock};
use crate::vfs::Vfs;
use storage_engine::{BackingContainer, ContainerIdentity, FsyncCapable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    CreateNew,
    Create,
    Open,
    OpenOrCreate,
    Truncate,
    Append,
}

/// Hook for an external compaction/garbage-collection pass.
/// `notify_file_changed` fires after any commit that touched a file's
/// extents; `trigger_full_scan` and `run_once` are host-driven.
pub trait CompactionSink: Send + Sync {
    fn notify_file_changed(&self, id: FileId);
    fn trigger_full_scan(&self);
    fn run_once(&self);
}

impl<C> Vfs<C>
where
    C: BackingContainer + ContainerIdentity + FsyncCapable,
{
    /// Resolve `components` from the root, returning the id and kind of
    /// the final component. An empty slice resolves to the root directory.
    /// Every component strictly before the last must itself be a
    /// directory; the last may be either kind.
    fn resolve_entry(&self, components: &[String]) -> VfsResult<(FileId, FileKind)> {
        let mut current = FileId::ROOT;
        let mut kind = FileKind::Directory;
        for name in components {
            if !kind.is_directory() {
                return Err(VfsError::NotADirectory(name.clone()));
            }
            let _guard = self.lock_manager.acquire_shared(current);
            let entry = self
                .directory_index
                .try_get(current, name)
                .ok_or_else(|| VfsError::NotFound(name.clone()))?;
            current = entry.child;
            kind = entry.kind;
        }
        Ok((current, kind))
    }

    fn resolve_directory(&self, components: &[String]) -> VfsResult<FileId> {
        let (id, kind) = self.resolve_entry(components)?;
        if !kind.is_directory() {
            return Err(VfsError::NotADirectory("path component is not a directory".into()));
        }
        Ok(id)
    }

    fn create_file_entry(&self, parent_id: FileId, name: &str) -> VfsResult<FileId> {
        let now = chrono::Utc::now();
        let id = self.file_table.allocate(FileKind::File, now);
        self.directory_index
            .insert(parent_id, name, id, FileKind::File, FileAttributes::empty(), now)
            .map_err(|e| VfsError::AlreadyExists(e.to_string()))?;
        Ok(id)
    }

    /// Remove a file's directory entry, file-table row, attributes, and
    /// staged-free its extents. `target_id` must be a file, not a
    /// directory — callers check `entry.kind` first.
    fn delete_file_entry(&self, parent_id: FileId, name: &str, target_id: FileId) -> VfsResult<()> {
        let target_guard = self.lock_manager.acquire_exclusive(target_id);
        if let Some(meta) = self.file_table.try_get(target_id) {
            for extent in meta.extents {
                self.allocator.free(ExtentOwner::FileData, extent);
            }
        }
        self.attribute_table.remove_all(target_id);
        self.directory_index
            .remove(parent_id, name)
            .map_err(|e| VfsError::NotFound(e.to_string()))?;
        self.file_table.remove(target_id);
        drop(target_guard);
        self.lock_manager.forget(target_id);
        Ok(())
    }

    /// Recursively remove every descendant of `dir_id`, locking each node
    /// exclusively before freeing it. `dir_id` itself is left in place;
    /// the caller removes its own entry once this returns.
    fn delete_subtree(&self, dir_id: FileId) -> VfsResult<()> {
        for child in self.directory_index.enumerate(dir_id) {
            let child_guard = self.lock_manager.acquire_exclusive(child.child);
            if child.kind.is_directory() {
                self.delete_subtree(child.child)?;
            } else if let Some(meta) = self.file_table.try_get(child.child) {
                for extent in meta.extents {
                    self.allocator.free(ExtentOwner::FileData, extent);
                }
                self.attribute_table.remove_all(child.child);
            }
            self.directory_index.remove(dir_id, &child.name).ok();
            self.file_table.remove(child.child);
            drop(child_guard);
            self.lock_manager.forget(child.child);
        }
        Ok(())
    }

    /// Create every missing segment of `path` as a directory. A no-op on
    /// an already-existing directory: the call returns `Ok(())` without
    /// advancing the superblock generation.
    pub fn create_directory(&self, path: &str) -> VfsResult<()> {
        let components = path::split(path);
        let mut current = FileId::ROOT;
        let mut created_any = false;

        for name in &components {
            let guard = self.lock_manager.acquire_exclusive(current);
            match self.directory_index.try_get(current, name) {
                Some(entry) => {
                    if !entry.kind.is_directory() {
                        return Err(VfsError::NotADirectory(name.clone()));
                    }
                    current = entry.child;
                }
                None => {
                    let now = chrono::Utc::now();
                    let new_id = self.file_table.allocate(FileKind::Directory, now);
                    self.directory_index
                        .insert(current, name, new_id, FileKind::Directory, FileAttributes::DIRECTORY, now)
                        .map_err(|e| VfsError::AlreadyExists(e.to_string()))?;
                    created_any = true;
                    current = new_id;
                }
            }
            drop(guard);
        }

        if created_any {
            self.commit_metadata()?;
        }
        Ok(())
    }

    pub fn create_file(&self, path: &str, attributes: FileAttributes) -> VfsResult<()> {
        let (parent_components, name) = path::split_parent(path)
            .ok_or_else(|| VfsError::InvalidArgument("cannot create a file at the root".into()))?;
        let parent_id = self.resolve_directory(&parent_components)?;

        let guard = self.lock_manager.acquire_exclusive(parent_id);
        if self.directory_index.try_get(parent_id, &name).is_some() {
            return Err(VfsError::AlreadyExists(name));
        }
        let id = self.create_file_entry(parent_id, &name)?;
        // files can never carry the directory bit regardless of what the
        // caller passed in; kind is the source of truth for it.
        self.file_table
            .mutate(id, |m| m.attributes = attributes & !FileAttributes::DIRECTORY);
        drop(guard);
        self.commit_metadata()
    }

    pub fn file_exists(&self, path: &str) -> bool {
        let components = path::split(path);
        matches!(self.resolve_entry(&components), Ok((_, FileKind::File)))
    }

    pub fn directory_exists(&self, path: &str) -> bool {
        let components = path::split(path);
        if components.is_empty() {
            return true;
        }
        matches!(self.resolve_entry(&components), Ok((_, FileKind::Directory)))
    }

    pub fn enumerate_directory(&self, path: &str) -> VfsResult<Vec<String>> {
        let components = path::split(path);
        let dir_id = self.resolve_directory(&components)?;
        let _guard = self.lock_manager.acquire_shared(dir_id);
        Ok(self
            .directory_index
            .enumerate(dir_id)
            .into_iter()
            .map(|e| e.name)
            .collect())
    }

    pub fn delete_file(&self, path: &str) -> VfsResult<()> {
        let (parent_components, name) = path::split_parent(path)
            .ok_or_else(|| VfsError::InvalidArgument("cannot delete the root".into()))?;
        let parent_id = self.resolve_directory(&parent_components)?;

        let parent_guard = self.lock_manager.acquire_exclusive(parent_id);
        let entry = self
            .directory_index
            .try_get(parent_id, &name)
            .ok_or_else(|| VfsError::NotFound(name.clone()))?;
        if entry.kind.is_directory() {
            return Err(VfsError::IsADirectory(name));
        }
        let target_id = entry.child;
        self.delete_file_entry(parent_id, &name, target_id)?;
        drop(parent_guard);

        self.commit_metadata()?;
        self.notify_file_changed(target_id);
        Ok(())
    }

    pub fn delete_directory(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let (parent_components, name) = path::split_parent(path)
            .ok_or_else(|| VfsError::InvalidArgument("cannot delete the root".into()))?;
        let parent_id = self.resolve_directory(&parent_components)?;

        let parent_guard = self.lock_manager.acquire_exclusive(parent_id);
        let entry = self
            .directory_index
            .try_get(parent_id, &name)
            .ok_or_else(|| VfsError::NotFound(name.clone()))?;
        if !entry.kind.is_directory() {
            return Err(VfsError::NotADirectory(name));
        }
        let target_id = entry.child;

        let target_guard = self.lock_manager.acquire_exclusive(target_id);
        if !recursive && !self.directory_index.is_empty_dir(target_id) {
            return Err(VfsError::DirectoryNotEmpty(name));
        }
        if recursive {
            self.delete_subtree(target_id)?;
        }
        self.directory_index
            .remove(parent_id, &name)
            .map_err(|e| VfsError::NotFound(e.to_string()))?;
        self.file_table.remove(target_id);
        drop(target_guard);
        self.lock_manager.forget(target_id);
        drop(parent_guard);

        self.commit_metadata()
    }

    pub fn set_attribute(&self, path: &str, name: &str, value: Vec<u8>) -> VfsResult<()> {
        let components = path::split(path);
        let (id, _) = self.resolve_entry(&components)?;
        let guard = self.lock_manager.acquire_exclusive(id);
        self.attribute_table
            .upsert(id, name, value)
            .map_err(attribute_error_to_vfs)?;
        drop(guard);
        self.commit_metadata()
    }

    pub fn try_get_attribute(&self, path: &str, name: &str) -> VfsResult<Option<Vec<u8>>> {
        let components = path::split(path);
        let (id, _) = self.resolve_entry(&components)?;
        let _guard = self.lock_manager.acquire_shared(id);
        Ok(self.attribute_table.try_get(id, name))
    }

    pub fn remove_attribute(&self, path: &str, name: &str) -> VfsResult<()> {
        let components = path::split(path);
        let (id, _) = self.resolve_entry(&components)?;
        let guard = self.lock_manager.acquire_exclusive(id);
        self.attribute_table
            .remove(id, name)
            .map_err(attribute_error_to_vfs)?;
        drop(guard);
        self.commit_metadata()
    }

    /// Open or create a file per `mode`, returning a stream positioned and
    /// locked per `access`. The returned `FileStream` borrows `self`, so
    /// it must be disposed (or simply dropped) before this `Vfs` can be
    /// disposed.
    pub fn open_file(&self, path: &str, mode: OpenMode, access: AccessMode) -> VfsResult<FileStream<'_, C>> {
        let (parent_components, name) = path::split_parent(path)
            .ok_or_else(|| VfsError::InvalidArgument("cannot open the root as a file".into()))?;
        let parent_id = self.resolve_directory(&parent_components)?;

        let parent_guard = self.lock_manager.acquire_exclusive(parent_id);
        let existing = self.directory_index.try_get(parent_id, &name);
        let mut mutated = false;

        let id = match (mode, existing) {
            (OpenMode::CreateNew, Some(_)) => return Err(VfsError::AlreadyExists(name)),
            (OpenMode::CreateNew, None) | (OpenMode::Create, None) => {
                mutated = true;
                self.create_file_entry(parent_id, &name)?
            }
            (OpenMode::Create, Some(entry)) => {
                if entry.kind.is_directory() {
                    return Err(VfsError::IsADirectory(name));
                }
                self.delete_file_entry(parent_id, &name, entry.child)?;
                mutated = true;
                self.create_file_entry(parent_id, &name)?
            }
            (OpenMode::Open, Some(entry)) | (OpenMode::Truncate, Some(entry)) => {
                if entry.kind.is_directory() {
                    return Err(VfsError::IsADirectory(name));
                }
                entry.child
            }
            (OpenMode::Open, None) | (OpenMode::Truncate, None) => {
                return Err(VfsError::NotFound(name));
            }
            (OpenMode::OpenOrCreate, Some(entry)) | (OpenMode::Append, Some(entry)) => {
                if entry.kind.is_directory() {
                    return Err(VfsError::IsADirectory(name));
                }
                entry.child
            }
            (OpenMode::OpenOrCreate, None) | (OpenMode::Append, None) => {
                mutated = true;
                self.create_file_entry(parent_id, &name)?
            }
        };
        drop(parent_guard);
        if mutated {
            self.commit_metadata()?;
        }

        let actual_access = if mode == OpenMode::Append {
            AccessMode::Write
        } else {
            access
        };
        let lock = match actual_access {
            AccessMode::Read => StreamLock::Shared(self.lock_manager.acquire_shared(id)),
            AccessMode::Write | AccessMode::ReadWrite => {
                StreamLock::Exclusive(self.lock_manager.acquire_exclusive(id))
            }
        };
        let pos = if mode == OpenMode::Append {
            self.file_length(id)?
        } else {
            0
        };

        Ok(FileStream::new(self, id, mode, actual_access, pos, lock))
    }

    /// Ask the compaction sink, if one was configured at mount, to run a
    /// full scan.
    pub fn trigger_compaction_scan(&self) {
        if let Some(sink) = &self.compaction {
            sink.trigger_full_scan();
        }
    }
}

fn attribute_error_to_vfs(e: AttributeError) -> VfsError {
    match e {
        AttributeError::NotFound(name) => VfsError::NotFound(name),
        AttributeError::CapacityExceeded { capacity, requested } => {
            VfsError::CommitOverflow { len: requested, capacity }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::Vfs;
    use storage_engine::MemoryContainer;

    fn mount() -> Vfs<MemoryContainer> {
        let _ = env_logger::builder().is_test(true).try_init();
        Vfs::mount(MemoryContainer::new(), None, Some(4096), None).unwrap()
    }

    #[test]
    fn create_directory_is_idempotent_without_new_generation() {
        let vfs = mount();
        vfs.create_directory("/a/b").unwrap();
        let before = vfs.engine.lock().generation();
        vfs.create_directory("/a/b").unwrap();
        let after = vfs.engine.lock().generation();
        assert_eq!(before, after);
    }

    #[test]
    fn create_file_then_enumerate_parent() {
        let vfs = mount();
        vfs.create_directory("/docs").unwrap();
        vfs.create_file("/docs/a.txt", FileAttributes::empty()).unwrap();
        let names = vfs.enumerate_directory("/docs").unwrap();
        assert_eq!(names, vec!["a.txt".to_string()]);
        assert!(vfs.file_exists("/docs/a.txt"));
        assert!(!vfs.directory_exists("/docs/a.txt"));
    }

    #[test]
    fn create_file_rejects_duplicate() {
        let vfs = mount();
        vfs.create_file("/a.txt", FileAttributes::empty()).unwrap();
        assert!(vfs.create_file("/a.txt", FileAttributes::empty()).is_err());
    }

    #[test]
    fn delete_file_removes_entry() {
        let vfs = mount();
        vfs.create_file("/a.txt", FileAttributes::empty()).unwrap();
        vfs.delete_file("/a.txt").unwrap();
        assert!(!vfs.file_exists("/a.txt"));
    }

    #[test]
    fn delete_directory_rejects_nonempty_without_recursive() {
        let vfs = mount();
        vfs.create_directory("/a").unwrap();
        vfs.create_file("/a/b.txt", FileAttributes::empty()).unwrap();
        assert!(vfs.delete_directory("/a", false).is_err());
        vfs.delete_directory("/a", true).unwrap();
        assert!(!vfs.directory_exists("/a"));
    }

    #[test]
    fn attribute_round_trip() {
        let vfs = mount();
        vfs.create_file("/a.txt", FileAttributes::empty()).unwrap();
        vfs.set_attribute("/a.txt", "owner", b"ada".to_vec()).unwrap();
        assert_eq!(
            vfs.try_get_attribute("/a.txt", "owner").unwrap(),
            Some(b"ada".to_vec())
        );
        vfs.remove_attribute("/a.txt", "owner").unwrap();
        assert_eq!(vfs.try_get_attribute("/a.txt", "owner").unwrap(), None);
    }
}
