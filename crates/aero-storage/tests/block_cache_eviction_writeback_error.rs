use aero_storage::{BlockCachedDisk, DiskError, Result, VirtualDisk};

/// A disk that accepts reads but fails every write from a chosen offset
/// onward, used to force an eviction-time writeback failure.
struct FlakyDisk {
    data: Vec<u8>,
    fail_writes_from: u64,
}

impl VirtualDisk for FlakyDisk {
    fn capacity_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset >= self.fail_writes_from {
            return Err(DiskError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated writeback failure",
            )));
        }
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[test]
fn eviction_writeback_failure_surfaces_from_the_triggering_call() {
    const BLOCK: u64 = 4096;
    let disk = FlakyDisk {
        data: vec![0u8; (BLOCK * 4) as usize],
        fail_writes_from: BLOCK, // block 0 writes fine, block >=1 fails
    };
    // Capacity of exactly 1 block forces every new block touched to evict
    // the previous one.
    let mut cache = BlockCachedDisk::new(disk, 1);

    cache.write_at(0, &[0xAAu8; 4096]).unwrap();
    // Touching block 1 evicts the dirty block 0, whose writeback succeeds
    // (offset 0 < fail_writes_from).
    cache.read_at(BLOCK, &mut [0u8; 4096]).unwrap();

    // Dirty block 1, then evict it by touching block 2: offset BLOCK fails.
    cache.write_at(BLOCK, &[0xBBu8; 4096]).unwrap();
    let err = cache.read_at(BLOCK * 2, &mut [0u8; 4096]).unwrap_err();
    assert!(matches!(err, DiskError::Io(_)));
}
