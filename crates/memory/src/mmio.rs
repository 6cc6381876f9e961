//! Page-granular MMIO dispatch table (spec.md §4.1, §3 "MMIO-space map").

/// Handlers for one MMIO range, page-aligned. Byte/word accesses over a
/// register that is only exposed as 32-bit are expected to be synthesized
/// by the device itself using the byte-accumulation pattern from
/// `original_source/src/hardware/ioapic.c` (`ioapic_readb`/`ioapic_writeb`):
/// this bus only guarantees dispatch by address, not width coercion, since
/// unlike port I/O, MMIO devices in this core are all 32-bit-register-only.
#[derive(Default)]
pub struct MmioHandlers {
    pub read: Option<Box<dyn FnMut(u64) -> u32>>,
    pub write: Option<Box<dyn FnMut(u64, u32)>>,
}

struct Range {
    base: u64,
    len: u64,
    handlers: MmioHandlers,
}

impl Range {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.len
    }
}

/// Sparse dispatch table over 4KB-aligned guest-physical pages. Unmapped
/// pages read as all-ones and drop writes, matching the port bus default.
#[derive(Default)]
pub struct MmioBus {
    ranges: Vec<Range>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_range(&mut self, base: u64, len: u64, handlers: MmioHandlers) {
        assert_eq!(base % 4096, 0, "mmio ranges must be page-aligned");
        self.ranges.push(Range {
            base,
            len,
            handlers,
        });
    }

    fn find_mut(&mut self, addr: u64) -> Option<&mut Range> {
        self.ranges.iter_mut().find(|r| r.contains(addr))
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        match self.find_mut(addr) {
            Some(r) => match &mut r.handlers.read {
                Some(f) => f(addr),
                None => 0xFFFF_FFFF,
            },
            None => 0xFFFF_FFFF,
        }
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        match self.find_mut(addr) {
            Some(r) => match &mut r.handlers.write {
                Some(f) => f(addr, value),
                None => log::warn!("mmio: dword write to {:#010x} dropped (no handler)", addr),
            },
            None => log::warn!("mmio: dword write to {:#010x} dropped (unmapped)", addr),
        }
    }
}
