//! I/O APIC (spec.md §4.2), resolved against
//! `original_source/src/hardware/ioapic.c` and cross-checked for idiomatic
//! register-bit accessor style against
//! `examples/other_examples/fb9b9148_intel-cloud-hypervisor__devices-src-ioapic.rs.rs`.

use aero_io_snapshot::io::state::{
    get_u32, put_u32, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource,
};

pub const NUM_PINS: usize = 24;
const IOAPICID: u32 = 0;
const IOAPICVER: u32 = 1;
const IOAPICARB: u32 = 2;
const REDTBL_BASE: u32 = 0x10;

const MASKED: u64 = 1 << 16;
const TRIGGER_MODE: u64 = 1 << 15; // 1 = level, 0 = edge
const REMOTE_IRR: u64 = 1 << 14;
const PIN_POLARITY: u64 = 1 << 13;

pub const DELIVERY_FIXED: u8 = 0;
pub const DELIVERY_LOWEST_PRIORITY: u8 = 1;
pub const DELIVERY_SMI: u8 = 2;
pub const DELIVERY_NMI: u8 = 4;
pub const DELIVERY_INIT: u8 = 5;
pub const DELIVERY_EXTINT: u8 = 7;

fn vector(entry: u64) -> u8 {
    (entry & 0xFF) as u8
}
fn delivery_mode(entry: u64) -> u8 {
    ((entry >> 8) & 0x7) as u8
}

/// Receives a delivered interrupt, matching `apic_receive_bus_message` in
/// the source. The local APIC / CPU IRQ-line implementation is out of
/// scope; this is the seam a machine harness plugs its CPU stub into.
pub trait InterruptSink {
    fn receive_bus_message(&mut self, vector: u8, delivery_mode: u8, level_triggered: bool);
}

/// A minimal sink that just remembers every message it was handed, for use
/// by tests and by a machine harness that has not wired a real local APIC.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Vec<(u8, u8, bool)>,
}

impl InterruptSink for RecordingSink {
    fn receive_bus_message(&mut self, vector: u8, delivery_mode: u8, level_triggered: bool) {
        self.messages.push((vector, delivery_mode, level_triggered));
    }
}

/// Supplies the PIC's next vector for `ExtINT` delivery-mode substitution.
pub trait ExtIntSource {
    fn next_vector(&mut self) -> u8;
}

pub struct IoApic {
    base: u64,
    register_selected: u32,
    id: u32,
    arbitration_id: u32,
    pin_state: u32,
    irr: u32,
    redtbl: [u64; NUM_PINS],
    enabled: bool,
    /// Scratch accumulator for byte-granular MMIO access, per
    /// `ioapic_readb`/`ioapic_writeb`.
    temp_data: u32,
}

impl IoApic {
    pub fn new(base: u64) -> Self {
        let mut apic = Self {
            base,
            register_selected: 0,
            id: 0,
            arbitration_id: 0,
            pin_state: 0,
            irr: 0,
            redtbl: [0; NUM_PINS],
            enabled: true,
            temp_data: 0,
        };
        apic.reset();
        apic
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn reset(&mut self) {
        self.id = 0;
        self.arbitration_id = 0;
        self.pin_state = 0;
        self.irr = 0;
        for entry in &mut self.redtbl {
            *entry = MASKED;
        }
    }

    fn update(&mut self, sink: &mut dyn InterruptSink, ext_int: &mut dyn ExtIntSource) {
        let mut bit = 1u32;
        for i in 0..NUM_PINS {
            let entry = self.redtbl[i];
            let mut irq_number = vector(entry);

            if entry & MASKED == 0 && self.irr & bit != 0 {
                if entry & TRIGGER_MODE == 0 {
                    self.irr &= !bit;
                }

                let mut mode = delivery_mode(entry);
                if mode == DELIVERY_LOWEST_PRIORITY {
                    mode = 3; // matches the local APIC's LVT lowest-priority encoding
                } else if mode == DELIVERY_EXTINT {
                    irq_number = ext_int.next_vector();
                }
                sink.receive_bus_message(irq_number, mode, entry & TRIGGER_MODE != 0);
            }
            bit <<= 1;
        }
    }

    /// Raises `line` (0-23; IRQ0 is remapped to pin 2, matching the ISA
    /// wiring quirk the source comments on).
    pub fn raise_irq(&mut self, mut line: u8, sink: &mut dyn InterruptSink, ext_int: &mut dyn ExtIntSource) {
        if !self.enabled {
            return;
        }
        if line == 0 {
            line = 2;
        }
        let idx = line as usize;
        let pin = 1u32 << line;
        self.redtbl[idx] |= PIN_POLARITY;

        if self.redtbl[idx] & TRIGGER_MODE != 0 {
            if self.redtbl[idx] & REMOTE_IRR != 0 {
                log::debug!("ioapic: remote IRR set on line {line}, discarding interrupt");
                return;
            }
            self.redtbl[idx] |= REMOTE_IRR;
            self.pin_state |= pin;
            self.irr |= pin;
            self.update(sink, ext_int);
        } else if self.pin_state & pin == 0 {
            self.irr |= pin;
            self.pin_state |= pin;
            self.update(sink, ext_int);
        }
    }

    pub fn lower_irq(&mut self, mut line: u8) {
        if !self.enabled {
            return;
        }
        if line == 0 {
            line = 2;
        }
        let idx = line as usize;
        let pin = 1u32 << line;
        self.pin_state &= !pin;
        self.redtbl[idx] &= !PIN_POLARITY;
        if self.redtbl[idx] & TRIGGER_MODE != 0 {
            self.irr &= !pin;
        }
    }

    pub fn remote_eoi(&mut self, irq_vector: u8) {
        for entry in &mut self.redtbl {
            if vector(*entry) == irq_vector && *entry & REMOTE_IRR != 0 {
                *entry &= !REMOTE_IRR;
            }
        }
    }

    fn read_reg(&self) -> u32 {
        match self.register_selected {
            IOAPICID => self.id << 24,
            IOAPICVER => 0x11 | (0x17 << 16),
            IOAPICARB => self.arbitration_id,
            sel if (REDTBL_BASE..REDTBL_BASE + 0x30).contains(&sel) => {
                let idx = (sel - REDTBL_BASE) as usize;
                if idx % 2 == 0 {
                    (self.redtbl[idx / 2] & 0xFFFF_FFFF) as u32
                } else {
                    (self.redtbl[idx / 2] >> 32) as u32
                }
            }
            other => {
                log::warn!("ioapic: unknown register read {other:#04x}");
                0
            }
        }
    }

    fn write_reg(&mut self, value: u32) {
        match self.register_selected {
            IOAPICID => self.id = (value >> 24) & 0xF,
            sel if (REDTBL_BASE..REDTBL_BASE + 0x30).contains(&sel) => {
                let idx = (sel - REDTBL_BASE) as usize;
                let entry_idx = idx / 2;
                let mut entry = self.redtbl[entry_idx];
                if idx % 2 == 0 {
                    entry = (entry & 0xFFFF_FFFF_0000_0000) | value as u64;
                } else {
                    entry = (entry & 0xFFFF_FFFF) | (value as u64) << 32;
                }
                self.redtbl[entry_idx] = entry;
            }
            other => log::warn!("ioapic: unknown register write {other:#04x}"),
        }
    }

    /// 32-bit MMIO read, dispatched by page offset: `0x00` is IOREGSEL,
    /// `0x10` is IOWIN.
    pub fn mmio_read32(&mut self, page_offset: u64) -> u32 {
        match page_offset {
            0x00 => self.register_selected,
            0x10 => self.read_reg(),
            _ => {
                log::warn!("ioapic: read from unknown offset {page_offset:#x}");
                0
            }
        }
    }

    pub fn mmio_write32(&mut self, page_offset: u64, value: u32) {
        match page_offset {
            0x00 => self.register_selected = value,
            0x10 => self.write_reg(value),
            _ => log::warn!("ioapic: write to unknown offset {page_offset:#x} value {value:#x}"),
        }
    }

    /// Byte-granular MMIO read: accumulate via the same scratch-register
    /// trick the source uses for writes, applied symmetrically for reads.
    pub fn mmio_readb(&mut self, addr: u64) -> u8 {
        let page_offset = addr & !3 & 0xFFF;
        let byte = (addr & 3) as u32;
        (self.mmio_read32(page_offset) >> (byte * 8)) as u8
    }

    pub fn mmio_writeb(&mut self, addr: u64, data: u8) {
        let page_offset = addr & !3 & 0xFFF;
        let byte = addr & 3;
        let shift = byte * 8;
        self.temp_data &= !(0xFFu32 << shift);
        self.temp_data |= (data as u32) << shift;
        if byte == 3 {
            self.mmio_write32(page_offset, self.temp_data);
        }
    }
}

impl IoSnapshot for IoApic {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u32(sink, "ioapic", "register_selected", self.register_selected);
        put_u32(sink, "ioapic", "id", self.id);
        put_u32(sink, "ioapic", "arbitration_id", self.arbitration_id);
        put_u32(sink, "ioapic", "pin_state", self.pin_state);
        put_u32(sink, "ioapic", "irr", self.irr);
        for (i, entry) in self.redtbl.iter().enumerate() {
            put_u32(sink, "ioapic", &format!("redtbl_lo_{i}"), (*entry & 0xFFFF_FFFF) as u32);
            put_u32(sink, "ioapic", &format!("redtbl_hi_{i}"), (*entry >> 32) as u32);
        }
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        self.register_selected = get_u32(src, "ioapic", "register_selected")?;
        self.id = get_u32(src, "ioapic", "id")?;
        self.arbitration_id = get_u32(src, "ioapic", "arbitration_id")?;
        self.pin_state = get_u32(src, "ioapic", "pin_state")?;
        self.irr = get_u32(src, "ioapic", "irr")?;
        for i in 0..NUM_PINS {
            let lo = get_u32(src, "ioapic", &format!("redtbl_lo_{i}"))?;
            let hi = get_u32(src, "ioapic", &format!("redtbl_hi_{i}"))?;
            self.redtbl[i] = (hi as u64) << 32 | lo as u64;
        }
        Ok(())
    }
}
