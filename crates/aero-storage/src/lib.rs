//! Block layer (spec.md §4.3): drive-info handles exposing read/write/prefetch
//! with sync-or-async completion, grounded on
//! `original_source/include/drive.h`'s `drive_read_func`/`drive_write_func`/
//! `drive_prefetch_func` contract and on the teacher's `aero_storage::{
//! DiskError, Result, VirtualDisk, SECTOR_SIZE, BlockCachedDisk,
//! StdFileBackend, StorageBackend}` surface.

mod backend;
mod cache;
mod drive;

pub use backend::{MemBackend, StdFileBackend};
pub use cache::BlockCachedDisk;
pub use drive::{
    Completion, DeferredBackend, Drive, DriveBackend, ReadCallback, SyncDiskBackend, WriteCallback,
};

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("disk offset overflowed")]
    OffsetOverflow,
    #[error("access out of bounds: offset {offset} len {len} capacity {capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    #[error("disk is write protected")]
    WriteProtected,
    #[error("no media present")]
    MediaMissing,
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// A random-access byte store backing one drive. Implementations need not be
/// thread-safe: the whole core runs single-threaded (spec.md §5).
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn is_writable(&self) -> bool {
        true
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
}

/// Bounds-check a transfer against a disk's capacity. Shared by every
/// `VirtualDisk` implementation so the error shape is consistent.
pub(crate) fn check_bounds(capacity: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Capability a storage backend implements, per REDESIGN FLAGS §9: this
/// replaces the source's function-pointer `drive_info` record with a trait
/// object the machine harness holds per drive.
pub trait StorageBackend: VirtualDisk {
    /// Advisory readahead; completion is indistinguishable from an async
    /// no-op (spec.md §4.3).
    fn prefetch(&mut self, _offset: u64, _len: usize) {}
}

impl<T: VirtualDisk> StorageBackend for T {}
