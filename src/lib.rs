//! Single-file virtual file system: a hierarchical, crash-tolerant file
//! system whose entire state lives in one seekable byte container (plus an
//! optional mirror), exposing POSIX-style operations with crash consistency
//! guaranteed by a double-buffered checksummed superblock. Built on top of
//! the `storage_engine` crate, which owns page geometry and the superblock;
//! this crate owns everything above it: files, directories, attributes,
//! locking, and the path-addressed facade.
//!
//! Generalized from `examples/chiro2001-rfs`, a FUSE-backed ext2-like file
//! system built on a fixed ioctl block device — the dependency stack
//! (`thiserror`, `log`, `chrono`, `dashmap`, `parking_lot`) and the overall
//! shape (engine owns the container, a facade owns paths, streams own
//! cursors) both carry over; see `DESIGN.md` for the full grounding ledger.

mod allocator;
mod attributes;
mod directory;
mod error;
mod facade;
mod file_table;
mod ids;
mod lock_manager;
mod path;
mod persistence;
mod stream;
mod vfs;

pub use error::{VfsError, VfsResult};
pub use facade::{AccessMode, CompactionSink, OpenMode};
pub use file_table::FileAttributes;
pub use ids::{FileId, FileKind, PageId, PageSpan};
pub use stream::{FileStream, SeekFrom};
pub use vfs::{Vfs, ATTRIBUTE_TABLE_CAPACITY};

pub use storage_engine::{BackingContainer, ContainerIdentity, FileContainer, FsyncCapable, MemoryContainer};
