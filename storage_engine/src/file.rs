//! File-backed container, for on-disk persistence. Mirrors
//! `FileDiskDriver` in `examples/chiro2001-rfs/disk_driver`, generalized
//! from a fixed-size simulated disk to a real growable file opened
//! read-write.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::container::{BackingContainer, ContainerIdentity, FsyncCapable};

pub struct FileContainer {
    file: File,
    identity: u64,
}

impl FileContainer {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        let identity = identity_of(path.as_ref());
        Ok(Self { file, identity })
    }
}

/// A stable identity derived from the canonical path. Two `FileContainer`s
/// opened against the same path share an `ioGate`.
fn identity_of(path: &Path) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let canon = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = DefaultHasher::new();
    canon.hash(&mut hasher);
    hasher.finish()
}

impl BackingContainer for FileContainer {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let len = self.file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(0);
        }
        let available = (len - offset) as usize;
        let n = available.min(buf.len());
        self.file.read_exact(&mut buf[..n])?;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let end = offset + buf.len() as u64;
        if self.file.metadata()?.len() < end {
            self.file.set_len(end)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl FsyncCapable for FileContainer {
    fn flush_to_disk(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl ContainerIdentity for FileContainer {
    fn identity(&self) -> u64 {
        self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_bytes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut c = FileContainer::open(tmp.path()).unwrap();
        c.write_at(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        c.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn same_path_same_identity() {
        let tmp = NamedTempFile::new().unwrap();
        let a = FileContainer::open(tmp.path()).unwrap();
        let b = FileContainer::open(tmp.path()).unwrap();
        assert_eq!(a.identity(), b.identity());
    }
}
