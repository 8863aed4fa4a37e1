//! Storage engine: page geometry, the double-buffered checksummed
//! superblock, and optional byte-mirrored replica. Generalizes the
//! disk-block read/write/seek loop in `rfs_lib::mod::RFS`
//! (`read_disk_block`/`write_disk_block`/`seek_block`) from one fixed
//! ioctl device to any `BackingContainer`.

use std::io;

use log::{debug, info, warn};
use thiserror::Error;

use crate::container::{BackingContainer, ContainerIdentity, FsyncCapable};
use crate::ids::{PageId, PageSpan};
use crate::io_gate::{self, IoGate};
use crate::superblock::{self, ParsedSlot, SuperblockHeader, HEADER_LEN};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("page size mismatch: image declares {on_disk}, requested {requested}")]
    PageSizeMismatch { on_disk: i32, requested: i32 },
    #[error("superblock payload of {len} bytes exceeds capacity of {capacity} bytes")]
    CommitOverflow { len: usize, capacity: usize },
    #[error("both superblock slots are invalid and the container is non-empty")]
    Corruption,
}

/// Outcome of a successful mount: the engine plus the payload that was
/// live at mount time (empty on a freshly initialized container).
pub struct MountResult<C> {
    pub engine: Engine<C>,
    pub payload: Vec<u8>,
}

pub struct Engine<C> {
    primary: C,
    mirror: Option<C>,
    page_size: usize,
    slot_size: usize,
    generation: i64,
    active_slot: u8,
    /// The other slot's last-known-good bytes, kept so a crash mid-commit
    /// can still recover the prior durable image.
    fallback_payload: Vec<u8>,
    io_gate: IoGate,
}

impl<C: BackingContainer + ContainerIdentity> Engine<C> {
    /// Mount procedure. `requested_page_size` of `None` accepts whatever
    /// the image declares; `Some(n)` fails with `PageSizeMismatch` if an
    /// existing image disagrees.
    pub fn mount(
        mut primary: C,
        mirror: Option<C>,
        requested_page_size: Option<usize>,
    ) -> Result<MountResult<C>, EngineError> {
        let identity = primary.identity();
        let io_gate = io_gate::gate_for(identity);
        let _guard = io_gate.lock();

        let probe_page_size = requested_page_size.unwrap_or(4096);
        let slot_size = superblock::slot_size_for(probe_page_size, HEADER_LEN);
        let container_len = primary.len()?;

        if container_len < 2 * slot_size as u64 {
            info!("initializing empty container, slot_size={}", slot_size);
            primary.set_len(2 * slot_size as u64)?;
            let header = SuperblockHeader::empty(probe_page_size as i32);
            let empty_slot = superblock::serialize_slot(&header, &[], slot_size);
            primary.write_at(0, &empty_slot)?;
            primary.write_at(slot_size as u64, &empty_slot)?;
            primary.flush()?;
            drop(_guard);
            let engine = Engine {
                primary,
                mirror,
                page_size: probe_page_size,
                slot_size,
                generation: 0,
                active_slot: 0,
                fallback_payload: Vec::new(),
                io_gate,
            };
            return Ok(MountResult {
                engine,
                payload: Vec::new(),
            });
        }

        let mut slot0 = vec![0u8; slot_size];
        let mut slot1 = vec![0u8; slot_size];
        primary.read_at(0, &mut slot0)?;
        primary.read_at(slot_size as u64, &mut slot1)?;
        let parsed0 = superblock::parse_slot(&slot0, slot_size);
        let parsed1 = superblock::parse_slot(&slot1, slot_size);

        let (winner, fallback): (ParsedSlot, ParsedSlot) = match (parsed0.valid, parsed1.valid) {
            (false, false) => {
                if container_len == 0 {
                    // handled above; unreachable here but kept defensive.
                    return Err(EngineError::Corruption);
                }
                warn!("both superblock slots invalid; re-initializing");
                let header = SuperblockHeader::empty(probe_page_size as i32);
                let empty_slot = superblock::serialize_slot(&header, &[], slot_size);
                primary.write_at(0, &empty_slot)?;
                primary.write_at(slot_size as u64, &empty_slot)?;
                primary.flush()?;
                (superblock::parse_slot(&empty_slot, slot_size), ParsedSlot {
                    header: SuperblockHeader::empty(probe_page_size as i32),
                    payload: Vec::new(),
                    valid: true,
                })
            }
            (true, false) => (parsed0, parsed1),
            (false, true) => (parsed1, parsed0),
            (true, true) => {
                if parsed0.header.generation >= parsed1.header.generation {
                    (parsed0, parsed1)
                } else {
                    (parsed1, parsed0)
                }
            }
        };

        if let Some(requested) = requested_page_size {
            if winner.header.page_size != requested as i32 && winner.header.generation > 0 {
                return Err(EngineError::PageSizeMismatch {
                    on_disk: winner.header.page_size,
                    requested: requested as i32,
                });
            }
        }

        let page_size = if winner.header.generation > 0 || winner.header.page_size > 0 {
            winner.header.page_size.max(1) as usize
        } else {
            probe_page_size
        };
        let slot_size = superblock::slot_size_for(page_size, HEADER_LEN);

        debug!(
            "mounted at generation={} active_slot={} page_size={}",
            winner.header.generation, winner.header.active_slot, page_size
        );

        let engine = Engine {
            primary,
            mirror,
            page_size,
            slot_size,
            generation: winner.header.generation,
            active_slot: winner.header.active_slot,
            fallback_payload: fallback.payload,
            io_gate,
        };
        Ok(MountResult {
            engine,
            payload: winner.payload,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn active_slot(&self) -> u8 {
        self.active_slot
    }

    pub fn superblock_capacity(&self) -> usize {
        self.slot_size - HEADER_LEN
    }

    fn page_offset(&self, page: PageId) -> u64 {
        assert!(page.0 >= 2, "page ids < 2 are reserved for superblock slots");
        2 * self.slot_size as u64 + (page.0 - 2) * self.page_size as u64
    }

    /// Commit procedure: rotate to the other slot, bump the generation,
    /// write header+payload, only then update in-memory state.
    pub fn commit(&mut self, payload: &[u8]) -> Result<(), EngineError> {
        let capacity = self.superblock_capacity();
        if payload.len() > capacity {
            return Err(EngineError::CommitOverflow {
                len: payload.len(),
                capacity,
            });
        }

        let _guard = self.io_gate.lock();

        let next_slot = 1 - self.active_slot;
        let next_generation = self.generation + 1;

        // Preserve the currently-live image as the new fallback before
        // overwriting the other slot; a crash mid-write still leaves a
        // recoverable fallback.
        let current_offset = self.active_slot as u64 * self.slot_size as u64;
        let mut current_bytes = vec![0u8; self.slot_size];
        self.primary.read_at(current_offset, &mut current_bytes)?;
        self.fallback_payload = current_bytes[HEADER_LEN..].to_vec();

        let header = SuperblockHeader {
            version: superblock::VERSION,
            page_size: self.page_size as i32,
            generation: next_generation,
            active_slot: next_slot,
        };
        let slot_bytes = superblock::serialize_slot(&header, payload, self.slot_size);
        let next_offset = next_slot as u64 * self.slot_size as u64;

        self.primary.write_at(next_offset, &slot_bytes)?;
        self.primary.flush()?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.write_at(next_offset, &slot_bytes)?;
            mirror.flush()?;
        }

        // Commit point: only now does in-memory state move forward.
        self.active_slot = next_slot;
        self.generation = next_generation;
        debug!("committed generation {}", self.generation);
        Ok(())
    }

    /// Read a data/metadata page (`p >= 2`), zero-filling on short reads.
    pub fn read_page(&mut self, page: PageId, buf: &mut [u8]) -> Result<(), EngineError> {
        assert_eq!(buf.len(), self.page_size);
        let _guard = self.io_gate.lock();
        let offset = self.page_offset(page);
        self.primary.read_at(offset, buf)?;
        Ok(())
    }

    pub fn read_pages(&mut self, span: PageSpan, buf: &mut [u8]) -> Result<(), EngineError> {
        assert_eq!(buf.len(), span.length as usize * self.page_size);
        let _guard = self.io_gate.lock();
        let offset = self.page_offset(span.start);
        self.primary.read_at(offset, buf)?;
        Ok(())
    }

    /// Write a data/metadata page, extending the container (and mirror) if
    /// the write grows it, then performing the write.
    pub fn write_page(&mut self, page: PageId, buf: &[u8]) -> Result<(), EngineError> {
        assert_eq!(buf.len(), self.page_size);
        let _guard = self.io_gate.lock();
        self.write_locked(page, buf)
    }

    pub fn write_pages(&mut self, span: PageSpan, buf: &[u8]) -> Result<(), EngineError> {
        assert_eq!(buf.len(), span.length as usize * self.page_size);
        let _guard = self.io_gate.lock();
        let offset = self.page_offset(span.start);
        self.ensure_len(offset + buf.len() as u64)?;
        self.primary.write_at(offset, buf)?;
        if let Some(mirror) = self.mirror.as_mut() {
            let mirror_len = mirror.len()?;
            if mirror_len < offset + buf.len() as u64 {
                mirror.set_len(offset + buf.len() as u64)?;
            }
            mirror.write_at(offset, buf)?;
        }
        Ok(())
    }

    fn write_locked(&mut self, page: PageId, buf: &[u8]) -> Result<(), EngineError> {
        let offset = self.page_offset(page);
        self.ensure_len(offset + buf.len() as u64)?;
        self.primary.write_at(offset, buf)?;
        if let Some(mirror) = self.mirror.as_mut() {
            let mirror_len = mirror.len()?;
            if mirror_len < offset + buf.len() as u64 {
                mirror.set_len(offset + buf.len() as u64)?;
            }
            mirror.write_at(offset, buf)?;
        }
        Ok(())
    }

    fn ensure_len(&mut self, min_len: u64) -> Result<(), EngineError> {
        if self.primary.len()? < min_len {
            self.primary.set_len(min_len)?;
        }
        Ok(())
    }

    /// Guarantee the container's length reaches `page * pageSize` worth of
    /// room for the given high-water page (allocator growth hook).
    pub fn ensure_capacity_for_page(&mut self, end_page: PageId) -> Result<(), EngineError> {
        let _guard = self.io_gate.lock();
        let needed = self.page_offset(end_page);
        self.ensure_len(needed)
    }

    pub fn flush(&mut self) -> Result<(), EngineError> {
        let _guard = self.io_gate.lock();
        self.primary.flush()?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush()?;
        }
        Ok(())
    }

    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn primary_mut(&mut self) -> &mut C {
        &mut self.primary
    }

    pub fn mirror_mut(&mut self) -> Option<&mut C> {
        self.mirror.as_mut()
    }
}

impl<C: FsyncCapable> Engine<C> {
    pub fn flush_to_disk(&mut self) -> Result<(), EngineError> {
        let _guard = self.io_gate.lock();
        self.primary.flush_to_disk()?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush_to_disk()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContainer;

    #[test]
    fn mount_empty_initializes_generation_zero() {
        let MountResult { engine, payload } =
            Engine::mount(MemoryContainer::new(), None, Some(4096)).unwrap();
        assert_eq!(engine.generation(), 0);
        assert_eq!(engine.active_slot(), 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn commit_rotates_slot_and_bumps_generation() {
        let MountResult { mut engine, .. } =
            Engine::mount(MemoryContainer::new(), None, Some(4096)).unwrap();
        engine.commit(b"first").unwrap();
        assert_eq!(engine.generation(), 1);
        assert_eq!(engine.active_slot(), 1);
        engine.commit(b"second").unwrap();
        assert_eq!(engine.generation(), 2);
        assert_eq!(engine.active_slot(), 0);
    }

    #[test]
    fn remount_recovers_latest_generation() {
        let container = MemoryContainer::new();
        let MountResult { mut engine, .. } = Engine::mount(container, None, Some(4096)).unwrap();
        engine.commit(b"payload-a").unwrap();
        engine.commit(b"payload-b").unwrap();
        let snapshot = engine.primary_mut().snapshot();

        let remounted = MemoryContainer::new();
        let mut remounted = remounted;
        remounted.write_at(0, &snapshot).unwrap();
        let MountResult { engine: engine2, payload } =
            Engine::mount(remounted, None, Some(4096)).unwrap();
        assert_eq!(engine2.generation(), 2);
        assert_eq!(&payload[..9], b"payload-b");
    }

    #[test]
    fn page_geometry_places_page_two_after_two_slots() {
        let MountResult { mut engine, .. } =
            Engine::mount(MemoryContainer::new(), None, Some(4096)).unwrap();
        let buf = vec![7u8; 4096];
        engine.write_page(PageId(2), &buf).unwrap();
        let mut readback = vec![0u8; 4096];
        engine.read_page(PageId(2), &mut readback).unwrap();
        assert_eq!(buf, readback);
        assert_eq!(engine.page_offset(PageId(2)), 2 * engine.slot_size() as u64);
    }

    #[test]
    fn mirror_receives_every_write() {
        let MountResult { mut engine, .. } = Engine::mount(
            MemoryContainer::new(),
            Some(MemoryContainer::new()),
            Some(4096),
        )
        .unwrap();
        engine.commit(b"abc").unwrap();
        let buf = vec![9u8; 4096];
        engine.write_page(PageId(2), &buf).unwrap();
        let primary_snapshot = engine.primary_mut().snapshot();
        let mirror_snapshot = engine.mirror_mut().unwrap().snapshot();
        assert_eq!(primary_snapshot, mirror_snapshot);
    }

    #[test]
    fn page_size_mismatch_on_remount() {
        let container = MemoryContainer::new();
        let MountResult { mut engine, .. } = Engine::mount(container, None, Some(4096)).unwrap();
        engine.commit(b"x").unwrap();
        let snapshot = engine.primary_mut().snapshot();

        let mut remounted = MemoryContainer::new();
        remounted.write_at(0, &snapshot).unwrap();
        let err = Engine::mount(remounted, None, Some(8192)).unwrap_err();
        assert!(matches!(err, EngineError::PageSizeMismatch { .. }));
    }
}
