use crate::{check_bounds, DiskError, Result, VirtualDisk};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

/// An in-memory disk image. Grounded on the teacher's `SharedDisk` test
/// fixture (`aero-devices-storage/tests/snapshot_roundtrip.rs`).
pub struct MemBackend {
    data: Vec<u8>,
    writable: bool,
}

impl MemBackend {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            writable: true,
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: true,
        }
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl VirtualDisk for MemBackend {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.capacity_bytes(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskError::WriteProtected);
        }
        check_bounds(self.capacity_bytes(), offset, buf.len())?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// A disk image backed by a regular host file, read/written synchronously.
/// Grounded on the teacher's `StdFileBackend` (`aero-storage/tests/
/// std_file_backend.rs`).
pub struct StdFileBackend {
    file: File,
    capacity: u64,
    writable: bool,
}

impl StdFileBackend {
    pub fn open(file: File, writable: bool) -> std::io::Result<Self> {
        let capacity = file.metadata()?.len();
        Ok(Self {
            file,
            capacity,
            writable,
        })
    }
}

impl VirtualDisk for StdFileBackend {
    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.capacity, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(DiskError::WriteProtected);
        }
        check_bounds(self.capacity, offset, buf.len())?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}
