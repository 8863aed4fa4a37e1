//! Mirror synchronizer. Runs once at mount time, before the `Engine`
//! picks its winning superblock slot, so that by the time `Engine::mount`
//! reads the primary, primary and mirror already agree.

use std::io;

use log::{info, warn};

use crate::container::{BackingContainer, FsyncCapable};
use crate::superblock;

const COPY_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    CopyPrimaryToMirror,
    CopyMirrorToPrimary,
    TruncateMirrorToPrimaryLength,
}

/// Reconcile `mirror` against `primary` by comparing superblock
/// generations on each side. `slot_size` is the probed slot size
/// (page-size dependent); if both sides
/// are uninitialized this is only used to read superblock slots, the
/// engine mount that follows will initialize both from scratch.
pub fn synchronize<C: BackingContainer + FsyncCapable>(
    primary: &mut C,
    mirror: &mut C,
    slot_size: usize,
) -> io::Result<()> {
    primary.flush_to_disk()?;
    mirror.flush_to_disk()?;

    let primary_len = primary.len()?;
    let mirror_len = mirror.len()?;

    let (primary_valid, primary_generation) = if primary_len >= 2 * slot_size as u64 {
        read_best_slot(primary, slot_size)?
    } else {
        (false, 0)
    };
    let (mirror_valid, mirror_generation) = if mirror_len >= 2 * slot_size as u64 {
        read_best_slot(mirror, slot_size)?
    } else {
        (false, 0)
    };

    let action = match (primary_valid, mirror_valid) {
        (false, false) => Action::None,
        (true, false) => Action::CopyPrimaryToMirror,
        (false, true) => Action::CopyMirrorToPrimary,
        (true, true) => {
            if primary_generation > mirror_generation {
                Action::CopyPrimaryToMirror
            } else if mirror_generation > primary_generation {
                Action::CopyMirrorToPrimary
            } else if primary_len != mirror_len {
                Action::TruncateMirrorToPrimaryLength
            } else {
                compare_equal_generation(primary, mirror, primary_len)?
            }
        }
    };

    match action {
        Action::None => {}
        Action::CopyPrimaryToMirror => {
            info!("mirror out of date, resyncing primary -> mirror");
            copy_all(primary, mirror)?;
        }
        Action::CopyMirrorToPrimary => {
            warn!("primary out of date, resyncing mirror -> primary");
            copy_all(mirror, primary)?;
        }
        Action::TruncateMirrorToPrimaryLength => {
            mirror.set_len(primary_len)?;
            mirror.flush_to_disk()?;
        }
    }
    Ok(())
}

fn read_best_slot<C: BackingContainer>(c: &mut C, slot_size: usize) -> io::Result<(bool, i64)> {
    let mut slot0 = vec![0u8; slot_size];
    let mut slot1 = vec![0u8; slot_size];
    c.read_at(0, &mut slot0)?;
    c.read_at(slot_size as u64, &mut slot1)?;
    let p0 = superblock::parse_slot(&slot0, slot_size);
    let p1 = superblock::parse_slot(&slot1, slot_size);
    Ok(match (p0.valid, p1.valid) {
        (false, false) => (false, 0),
        (true, false) => (true, p0.header.generation),
        (false, true) => (true, p1.header.generation),
        (true, true) => (true, p0.header.generation.max(p1.header.generation)),
    })
}

/// Same generation, same length, byte content differs: prefer the side
/// whose first mismatching block does *not* look like a cleared region
/// (all-zero or all-0xFF); ambiguous cases prefer primary.
fn compare_equal_generation<C: BackingContainer>(
    primary: &mut C,
    mirror: &mut C,
    len: u64,
) -> io::Result<Action> {
    let mut offset = 0u64;
    let mut buf_p = vec![0u8; COPY_BUFFER];
    let mut buf_m = vec![0u8; COPY_BUFFER];
    while offset < len {
        let chunk = (len - offset).min(COPY_BUFFER as u64) as usize;
        primary.read_at(offset, &mut buf_p[..chunk])?;
        mirror.read_at(offset, &mut buf_m[..chunk])?;
        if buf_p[..chunk] != buf_m[..chunk] {
            let primary_cleared = looks_cleared(&buf_p[..chunk]);
            let mirror_cleared = looks_cleared(&buf_m[..chunk]);
            return Ok(if mirror_cleared && !primary_cleared {
                Action::CopyPrimaryToMirror
            } else if primary_cleared && !mirror_cleared {
                Action::CopyMirrorToPrimary
            } else {
                Action::CopyPrimaryToMirror
            });
        }
        offset += chunk as u64;
    }
    Ok(Action::None)
}

fn looks_cleared(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0x00) || buf.iter().all(|&b| b == 0xFF)
}

fn copy_all<C: BackingContainer + FsyncCapable>(src: &mut C, dst: &mut C) -> io::Result<()> {
    let len = src.len()?;
    dst.set_len(len)?;
    let mut offset = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];
    while offset < len {
        let chunk = (len - offset).min(COPY_BUFFER as u64) as usize;
        src.read_at(offset, &mut buf[..chunk])?;
        dst.write_at(offset, &buf[..chunk])?;
        offset += chunk as u64;
    }
    dst.flush_to_disk()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContainer;

    #[test]
    fn both_empty_is_noop() {
        let mut p = MemoryContainer::new();
        let mut m = MemoryContainer::new();
        synchronize(&mut p, &mut m, 4096).unwrap();
        assert_eq!(p.len().unwrap(), 0);
        assert_eq!(m.len().unwrap(), 0);
    }

    #[test]
    fn mirror_truncated_gets_repopulated() {
        use crate::engine::{Engine, MountResult};
        let primary = MemoryContainer::new();
        let mirror = MemoryContainer::new();
        let MountResult { mut engine, .. } =
            Engine::mount(primary, Some(mirror), Some(4096)).unwrap();
        engine.commit(b"hello").unwrap();
        let primary_snapshot = engine.primary_mut().snapshot();

        let mut fresh_primary = MemoryContainer::new();
        fresh_primary.write_at(0, &primary_snapshot).unwrap();
        let mut truncated_mirror = MemoryContainer::new();

        synchronize(&mut fresh_primary, &mut truncated_mirror, 4096).unwrap();
        assert_eq!(
            fresh_primary.snapshot(),
            truncated_mirror.snapshot()
        );
    }
}
