//! In-memory backing container, for tests and embedders that don't need
//! persistence across process lifetimes. Mirrors `MemoryDiskDriver` in
//! `examples/chiro2001-rfs/disk_driver`, generalized from a fixed-size
//! disk image to a growable byte buffer.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::container::{BackingContainer, ContainerIdentity, FsyncCapable};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

pub struct MemoryContainer {
    buf: Vec<u8>,
    identity: u64,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.clone()
    }
}

impl Default for MemoryContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingContainer for MemoryContainer {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let offset = offset as usize;
        if offset >= self.buf.len() {
            buf.fill(0);
            return Ok(0);
        }
        let available = self.buf.len() - offset;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.buf[offset..offset + n]);
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FsyncCapable for MemoryContainer {
    fn flush_to_disk(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ContainerIdentity for MemoryContainer {
    fn identity(&self) -> u64 {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_on_write_past_end() {
        let mut c = MemoryContainer::new();
        c.write_at(10, &[1, 2, 3]).unwrap();
        assert_eq!(c.len().unwrap(), 13);
        let mut buf = [0u8; 3];
        c.read_at(10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn read_past_end_zero_fills() {
        let mut c = MemoryContainer::new();
        c.set_len(4).unwrap();
        let mut buf = [0xFFu8; 8];
        let n = c.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
