//! Page-oriented storage engine for the single-file virtual file system.
//!
//! This crate owns the backing container handles exclusively: page
//! geometry, the double-buffered checksummed superblock, and mirror
//! fan-out. It knows nothing about files, directories, or paths — that's
//! the `vfs` crate, which depends on this one the way
//! `examples/chiro2001-rfs`'s `rfs` binary depends on `disk_driver`.

pub mod container;
pub mod crc;
pub mod engine;
pub mod file;
pub mod ids;
pub mod io_gate;
pub mod memory;
pub mod mirror;
pub mod superblock;

pub use container::{BackingContainer, ContainerIdentity, FsyncCapable, SeekFrom};
pub use crc::crc32;
pub use engine::{Engine, EngineError, MountResult};
pub use file::FileContainer;
pub use ids::{PageId, PageSpan};
pub use memory::MemoryContainer;
