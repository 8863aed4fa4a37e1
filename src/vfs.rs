//! Mount entry point: `mount`/`dispose`, plus the struct tying every
//! other component together. Generalizes the `RFS` struct in
//! `examples/chiro2001-rfs/src/rfs_lib/mod.rs`, which owns one
//! `DiskDriver` plus in-memory inode/bitmap caches, into one that owns a
//! generic `Engine<C>` plus the File Table, Directory Index, Attribute
//! Table, Allocator, and Lock Manager.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};
use parking_lot::Mutex;

use crate::allocator::{Allocator, ExtentOwner};
use crate::attributes::AttributeTable;
use crate::directory::DirectoryIndex;
use crate::error::{VfsError, VfsResult};
use crate::facade::CompactionSink;
use crate::file_table::FileTable;
use crate::ids::{FileId, PageId, PageSpan};
use crate::lock_manager::LockManager;
use crate::persistence::{self, SuperblockPayload};
use storage_engine::{BackingContainer, ContainerIdentity, Engine, FsyncCapable, MountResult};

/// Attribute-table byte budget: an implementer-chosen bound (documented
/// in `DESIGN.md`) past which `setAttribute` surfaces a capacity error
/// instead of growing unbounded.
pub const ATTRIBUTE_TABLE_CAPACITY: usize = 16 * 1024 * 1024;

pub struct Vfs<C> {
    pub(crate) engine: Mutex<Engine<C>>,
    pub(crate) allocator: Allocator,
    pub(crate) file_table: FileTable,
    pub(crate) directory_index: DirectoryIndex,
    pub(crate) attribute_table: AttributeTable,
    pub(crate) lock_manager: LockManager,
    pub(crate) page_size: usize,
    current_metadata_spans: Mutex<Option<[PageSpan; 3]>>,
    pub(crate) compaction: Option<Box<dyn CompactionSink>>,
    disposed: AtomicBool,
}

impl<C> Vfs<C>
where
    C: BackingContainer + ContainerIdentity + FsyncCapable,
{
    /// Mount procedure: synchronizes the mirror container (if any), then
    /// recovers the superblock and rehydrates metadata. `mirror` is the
    /// already-opened mirror container, if mirroring is enabled — the
    /// `<primary>.bak` default path convention lives at the call site
    /// that constructs `FileContainer`s, not in this generic core.
    pub fn mount(
        mut primary: C,
        mut mirror: Option<C>,
        page_size: Option<usize>,
        compaction: Option<Box<dyn CompactionSink>>,
    ) -> VfsResult<Self> {
        if let Some(mirror) = mirror.as_mut() {
            let slot_size = storage_engine::superblock::slot_size_for(
                page_size.unwrap_or(4096),
                storage_engine::superblock::HEADER_LEN,
            );
            storage_engine::mirror::synchronize(&mut primary, mirror, slot_size)?;
        }

        let MountResult { mut engine, payload } = Engine::mount(primary, mirror, page_size)?;
        let page_size = engine.page_size();
        let allocator = Allocator::new();

        let (file_table, directory_index, attribute_table, current_spans) = if payload.is_empty() {
            info!("mounting fresh container, seeding root directory");
            let file_table = FileTable::new();
            file_table.seed_root(chrono::Utc::now());
            (file_table, DirectoryIndex::new(), AttributeTable::new(ATTRIBUTE_TABLE_CAPACITY), None)
        } else {
            let sb_payload: SuperblockPayload = bincode::deserialize(&payload)
                .map_err(|e| VfsError::Corruption(format!("superblock payload decode failed: {e}")))?;

            let file_pages = read_extent(&mut engine, sb_payload.file_table.start, sb_payload.file_table.pages, page_size)?;
            let dir_pages = read_extent(&mut engine, sb_payload.directory_index.start, sb_payload.directory_index.pages, page_size)?;
            let attr_pages = read_extent(&mut engine, sb_payload.attribute_table.start, sb_payload.attribute_table.pages, page_size)?;

            let decoded = persistence::decode(
                &sb_payload,
                &file_pages,
                &dir_pages,
                &attr_pages,
                page_size,
                ATTRIBUTE_TABLE_CAPACITY,
            )?;
            allocator.rebuild(decoded.used_spans);

            let spans = [
                PageSpan::new(PageId(sb_payload.file_table.start), sb_payload.file_table.pages),
                PageSpan::new(PageId(sb_payload.directory_index.start), sb_payload.directory_index.pages),
                PageSpan::new(PageId(sb_payload.attribute_table.start), sb_payload.attribute_table.pages),
            ];
            (decoded.file_table, decoded.directory_index, decoded.attribute_table, Some(spans))
        };

        Ok(Self {
            engine: Mutex::new(engine),
            allocator,
            file_table,
            directory_index,
            attribute_table,
            lock_manager: LockManager::new(),
            page_size,
            current_metadata_spans: Mutex::new(current_spans),
            compaction,
            disposed: AtomicBool::new(false),
        })
    }

    fn check_live(&self) -> VfsResult<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(VfsError::Disposed("Vfs"));
        }
        Ok(())
    }

    /// Re-serialize the File Table, Directory Index, and Attribute Table
    /// and commit a new superblock payload. The three fresh extents are
    /// held as `Reservation`s until the superblock commit itself
    /// succeeds, so a failed write or commit frees them back to the
    /// allocator via `Drop` instead of leaking pages.
    pub(crate) fn commit_metadata(&self) -> VfsResult<()> {
        self.check_live()?;
        let mut engine = self.engine.lock();
        let mut encoded = persistence::encode(
            &self.file_table,
            &self.directory_index,
            &self.attribute_table,
            FileId::ROOT,
            &self.allocator,
            self.page_size,
        )?;

        let spans = [
            encoded.reservations[0].span(),
            encoded.reservations[1].span(),
            encoded.reservations[2].span(),
        ];
        engine.write_pages(spans[0], &encoded.file_table_pages)?;
        engine.write_pages(spans[1], &encoded.directory_index_pages)?;
        engine.write_pages(spans[2], &encoded.attribute_table_pages)?;

        let payload_bytes = bincode::serialize(&encoded.payload)
            .map_err(|e| VfsError::Corruption(format!("superblock payload encode failed: {e}")))?;
        engine.commit(&payload_bytes)?;
        drop(engine);

        // only now is it safe to finalize the reservations; any `?` above
        // would have dropped `encoded` and freed the spans automatically.
        let attr_reservation = encoded.reservations.pop().unwrap();
        let dir_reservation = encoded.reservations.pop().unwrap();
        let file_reservation = encoded.reservations.pop().unwrap();
        let spans = [
            file_reservation.commit(),
            dir_reservation.commit(),
            attr_reservation.commit(),
        ];

        let mut current = self.current_metadata_spans.lock();
        if let Some(old_spans) = current.take() {
            for span in old_spans {
                self.allocator.free(ExtentOwner::Metadata, span);
            }
        }
        *current = Some(spans);
        drop(current);
        self.allocator.release_staged_data();
        Ok(())
    }

    pub(crate) fn notify_file_changed(&self, id: FileId) {
        if let Some(sink) = &self.compaction {
            sink.notify_file_changed(id);
        }
    }

    /// Dispose the VFS: flush metadata once more and fsync both
    /// containers. Consumes `self` by value, so the borrow checker
    /// rejects any call site where a `FileStream` borrowing this `Vfs`
    /// is still alive — see `stream.rs`.
    pub fn dispose(self) -> VfsResult<()> {
        self.commit_metadata()?;
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(sink) = &self.compaction {
            sink.run_once();
        }
        let mut engine = self.engine.lock();
        engine.flush_to_disk()?;
        Ok(())
    }

    pub(crate) fn file_length(&self, id: FileId) -> VfsResult<u64> {
        self.file_table
            .try_get(id)
            .map(|m| m.length)
            .ok_or_else(|| VfsError::NotFound(format!("{id}")))
    }

    pub(crate) fn read_file_at(&self, id: FileId, pos: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let meta = self
            .file_table
            .try_get(id)
            .ok_or_else(|| VfsError::NotFound(format!("{id}")))?;
        if pos >= meta.length {
            return Ok(0);
        }
        let to_read = (meta.length - pos).min(buf.len() as u64) as usize;
        let backed_bytes = meta.extents.iter().map(|s| s.length as u64 * self.page_size as u64).sum::<u64>();

        let mut engine = self.engine.lock();
        let mut done = 0usize;
        while done < to_read {
            let byte_pos = pos + done as u64;
            let remaining = to_read - done;
            if byte_pos >= backed_bytes {
                // sparse tail created by setLength growth: zero-fill.
                buf[done..done + remaining].fill(0);
                done += remaining;
                continue;
            }
            let page_index = byte_pos / self.page_size as u64;
            let in_page_offset = (byte_pos % self.page_size as u64) as usize;
            let page_id = extent_page_at(&meta.extents, page_index)
                .ok_or_else(|| VfsError::Corruption("extent list shorter than backed length".into()))?;
            let chunk = remaining.min(self.page_size - in_page_offset);
            let mut page_buf = vec![0u8; self.page_size];
            engine.read_page(page_id, &mut page_buf)?;
            buf[done..done + chunk].copy_from_slice(&page_buf[in_page_offset..in_page_offset + chunk]);
            done += chunk;
        }
        drop(engine);
        self.file_table.mutate(id, |m| m.accessed_at = chrono::Utc::now());
        Ok(to_read)
    }

    pub(crate) fn write_file_at(&self, id: FileId, pos: u64, buf: &[u8]) -> VfsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = pos + buf.len() as u64;
        self.grow_file_to(id, end)?;

        let meta = self
            .file_table
            .try_get(id)
            .ok_or_else(|| VfsError::NotFound(format!("{id}")))?;

        let mut engine = self.engine.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let byte_pos = pos + done as u64;
            let page_index = byte_pos / self.page_size as u64;
            let in_page_offset = (byte_pos % self.page_size as u64) as usize;
            let page_id = extent_page_at(&meta.extents, page_index)
                .ok_or_else(|| VfsError::Corruption("extent list does not cover write range".into()))?;
            let chunk = (buf.len() - done).min(self.page_size - in_page_offset);

            let mut page_buf = vec![0u8; self.page_size];
            if in_page_offset != 0 || chunk != self.page_size {
                engine.read_page(page_id, &mut page_buf)?;
            }
            page_buf[in_page_offset..in_page_offset + chunk].copy_from_slice(&buf[done..done + chunk]);
            engine.write_page(page_id, &page_buf)?;
            done += chunk;
        }
        drop(engine);

        self.file_table.mutate(id, |m| {
            m.length = m.length.max(end);
            m.modified_at = chrono::Utc::now();
        });
        Ok(())
    }

    fn grow_file_to(&self, id: FileId, required_bytes: u64) -> VfsResult<()> {
        let meta = self
            .file_table
            .try_get(id)
            .ok_or_else(|| VfsError::NotFound(format!("{id}")))?;
        let backed_bytes = meta.extents.iter().map(|s| s.length as u64 * self.page_size as u64).sum::<u64>();
        if required_bytes <= backed_bytes {
            return Ok(());
        }
        let additional_bytes = required_bytes - backed_bytes;
        let additional_pages = additional_bytes.div_ceil(self.page_size as u64) as u32;
        let (span, _) = self.allocator.reserve(ExtentOwner::FileData, additional_pages);
        self.file_table.mutate(id, |m| m.extents.push(span));
        Ok(())
    }

    pub(crate) fn truncate_file_locked(&self, id: FileId, n: u64) -> VfsResult<()> {
        let meta = self
            .file_table
            .try_get(id)
            .ok_or_else(|| VfsError::NotFound(format!("{id}")))?;
        if n >= meta.length {
            self.file_table.mutate(id, |m| {
                m.length = n;
                m.modified_at = chrono::Utc::now();
            });
            return Ok(());
        }

        let pages_kept = n.div_ceil(self.page_size as u64);
        let mut kept = Vec::new();
        let mut cursor = 0u64;
        for extent in &meta.extents {
            let extent_end = cursor + extent.length as u64;
            if cursor >= pages_kept {
                self.allocator.free(ExtentOwner::FileData, *extent);
            } else {
                // still (at least partially) within the kept range; a
                // straddling extent is kept whole, its tail bytes undefined.
                kept.push(*extent);
            }
            cursor = extent_end;
        }

        self.file_table.mutate(id, |m| {
            m.length = n;
            m.extents = kept.clone();
            m.modified_at = chrono::Utc::now();
        });
        Ok(())
    }
}

/// Map a zero-based page index within the backed extent list to its
/// absolute `PageId`.
fn extent_page_at(extents: &[PageSpan], mut page_index: u64) -> Option<PageId> {
    for extent in extents {
        if page_index < extent.length as u64 {
            return Some(PageId(extent.start.0 + page_index));
        }
        page_index -= extent.length as u64;
    }
    None
}

fn read_extent<C: BackingContainer + ContainerIdentity + FsyncCapable>(
    engine: &mut Engine<C>,
    start: u64,
    pages: u32,
    page_size: usize,
) -> VfsResult<Vec<u8>> {
    if pages == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; pages as usize * page_size];
    engine.read_pages(PageSpan::new(PageId(start), pages), &mut buf)?;
    Ok(buf)
}

impl Vfs<storage_engine::FileContainer> {
    /// Convenience mount for on-disk use: opens `path` as the primary
    /// container and, if `enable_mirroring` is set, opens (creating if
    /// needed) a `<path>.bak` sibling as the mirror.
    pub fn mount_file(
        path: impl AsRef<std::path::Path>,
        enable_mirroring: bool,
        page_size: Option<usize>,
        compaction: Option<Box<dyn CompactionSink>>,
    ) -> VfsResult<Self> {
        let primary = storage_engine::FileContainer::open(path.as_ref())?;
        let mirror = if enable_mirroring {
            Some(storage_engine::FileContainer::open(mirror_path_for(path.as_ref()))?)
        } else {
            None
        };
        Self::mount(primary, mirror, page_size, compaction)
    }
}

fn mirror_path_for(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    std::path::PathBuf::from(name)
}

impl<C> Drop for Vfs<C> {
    fn drop(&mut self) {
        if !self.disposed.load(Ordering::SeqCst) {
            warn!("Vfs dropped without calling dispose(); the last in-memory mutations since the previous commit may not be durable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{AccessMode, OpenMode};
    use crate::file_table::FileAttributes;
    use rand::RngCore;
    use storage_engine::MemoryContainer;

    fn mount_memory() -> Vfs<MemoryContainer> {
        Vfs::mount(MemoryContainer::new(), None, Some(4096), None).unwrap()
    }

    #[test]
    fn write_read_reopen_round_trips_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image.vfs");

        let vfs = Vfs::mount_file(&path, false, Some(4096), None).unwrap();
        vfs.create_file("/a.txt", FileAttributes::empty()).unwrap();
        {
            let mut stream = vfs.open_file("/a.txt", OpenMode::Open, AccessMode::ReadWrite).unwrap();
            stream.write(b"hello, world").unwrap();
            stream.dispose().unwrap();
        }
        vfs.dispose().unwrap();

        let vfs = Vfs::mount_file(&path, false, Some(4096), None).unwrap();
        let mut stream = vfs.open_file("/a.txt", OpenMode::Open, AccessMode::Read).unwrap();
        let mut buf = [0u8; 12];
        stream.read(&mut buf).unwrap();
        assert_eq!(&buf, b"hello, world");
        stream.dispose().unwrap();
        vfs.dispose().unwrap();
    }

    #[test]
    fn commit_advances_generation_and_alternates_slot() {
        let vfs = mount_memory();
        let gen0 = vfs.engine.lock().generation();
        let slot0 = vfs.engine.lock().active_slot();

        vfs.create_directory("/a").unwrap();
        let gen1 = vfs.engine.lock().generation();
        let slot1 = vfs.engine.lock().active_slot();
        assert_eq!(gen1, gen0 + 1);
        assert_ne!(slot1, slot0);

        vfs.create_directory("/b").unwrap();
        let gen2 = vfs.engine.lock().generation();
        let slot2 = vfs.engine.lock().active_slot();
        assert_eq!(gen2, gen1 + 1);
        assert_ne!(slot2, slot1);
    }

    #[test]
    fn mirror_recovers_primary_that_lagged_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let primary_path = tmp.path().join("primary.vfs");
        let mirror_path = tmp.path().join("primary.vfs.bak");

        let vfs = Vfs::mount_file(&primary_path, true, Some(4096), None).unwrap();
        vfs.create_directory("/docs").unwrap();
        vfs.dispose().unwrap();
        assert!(std::fs::metadata(&mirror_path).unwrap().len() > 0);

        // Simulate a primary that fell behind by overwriting it with a
        // stale (empty) image while leaving the mirror intact.
        std::fs::write(&primary_path, []).unwrap();

        let vfs = Vfs::mount_file(&primary_path, true, Some(4096), None).unwrap();
        assert!(vfs.directory_exists("/docs"));
        vfs.dispose().unwrap();
    }

    #[test]
    fn remounting_with_a_different_page_size_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("image.vfs");

        let vfs = Vfs::mount_file(&path, false, Some(4096), None).unwrap();
        vfs.dispose().unwrap();

        let err = Vfs::mount_file(&path, false, Some(8192), None).unwrap_err();
        assert!(matches!(err, VfsError::PageSizeMismatch { on_disk: 4096, requested: 8192 }));
    }

    #[test]
    fn randomized_writes_read_back_exactly() {
        let vfs = mount_memory();
        vfs.create_file("/blob.bin", FileAttributes::empty()).unwrap();
        let mut stream = vfs.open_file("/blob.bin", OpenMode::Open, AccessMode::ReadWrite).unwrap();

        let mut rng = rand::thread_rng();
        let mut expected = Vec::new();
        for _ in 0..8 {
            let mut chunk = vec![0u8; 200 + (rng.next_u32() % 4000) as usize];
            rng.fill_bytes(&mut chunk);
            stream.write(&chunk).unwrap();
            expected.extend_from_slice(&chunk);
        }

        stream.seek(crate::stream::SeekFrom::Start(0)).unwrap();
        let mut actual = vec![0u8; expected.len()];
        let mut read_so_far = 0;
        while read_so_far < actual.len() {
            let n = stream.read(&mut actual[read_so_far..]).unwrap();
            assert!(n > 0, "short read before reaching end of written data");
            read_so_far += n;
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn set_length_grows_with_zero_fill_and_shrinks_in_place() {
        let vfs = mount_memory();
        vfs.create_file("/grown.bin", FileAttributes::empty()).unwrap();
        let mut stream = vfs.open_file("/grown.bin", OpenMode::Open, AccessMode::ReadWrite).unwrap();
        stream.write(b"abc").unwrap();
        stream.set_length(10).unwrap();
        assert_eq!(stream.length().unwrap(), 10);

        stream.seek(crate::stream::SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 10];
        stream.read(&mut buf).unwrap();
        assert_eq!(&buf, b"abc\0\0\0\0\0\0\0");

        stream.set_length(1).unwrap();
        assert_eq!(stream.length().unwrap(), 1);
    }
}
