//! CMOS/RTC register file (spec.md §6): a 128-byte indexed RAM plus the
//! boot-time seeding algorithm from `original_source/src/pc.c`'s
//! `pc_init_cmos`/`pc_init_cmos_disk` and `original_source/src/hardware/
//! fdc.c`'s floppy type/equipment seeding.
//!
//! Periodic/alarm RTC interrupt behavior is out of scope (spec.md's
//! component table has no CMOS/RTC row); this module only seeds and
//! exposes the register file the BIOS/guest reads at boot.

use aero_devices::FloppyGeometry;
use aero_io_snapshot::io::state::{get_u8, put_u8, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource};
use aero_pc_constants::{cmos, ports};
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::Rc;

use crate::config::{AtaDriveConfig, BootDevice, MachineConfig};

const CMOS_SIZE: usize = 128;

/// The indexed 128-byte CMOS RAM behind ports `0x70`/`0x71`.
pub struct CmosRam {
    bytes: [u8; CMOS_SIZE],
    index: u8,
}

impl Default for CmosRam {
    fn default() -> Self {
        Self::new()
    }
}

impl CmosRam {
    pub fn new() -> Self {
        Self {
            bytes: [0; CMOS_SIZE],
            index: 0,
        }
    }

    pub fn get(&self, reg: u8) -> u8 {
        self.bytes[reg as usize & (CMOS_SIZE - 1)]
    }

    pub fn set(&mut self, reg: u8, value: u8) {
        self.bytes[reg as usize & (CMOS_SIZE - 1)] = value;
    }

    fn read_index(&self) -> u8 {
        self.index
    }

    fn write_index(&mut self, value: u8) {
        // Bit 7 (NMI-disable) is not modeled; only the register index matters.
        self.index = value & 0x7F;
    }

    fn read_data(&self) -> u8 {
        self.get(self.index)
    }

    fn write_data(&mut self, value: u8) {
        let reg = self.index;
        self.set(reg, value);
    }

    pub fn register_ports(cmos: Rc<RefCell<CmosRam>>, bus: &mut IoPortBus) {
        let writer = cmos.clone();
        let reader = cmos.clone();
        let mut handlers = PortHandlers::default();
        handlers.write8 = Some(Box::new(move |_p, v| writer.borrow_mut().write_index(v)));
        handlers.read8 = Some(Box::new(move |_p| reader.borrow().read_index()));
        bus.register_range(ports::CMOS_INDEX, 1, handlers);

        let writer = cmos.clone();
        let reader = cmos;
        let mut handlers = PortHandlers::default();
        handlers.write8 = Some(Box::new(move |_p, v| writer.borrow_mut().write_data(v)));
        handlers.read8 = Some(Box::new(move |_p| reader.borrow().read_data()));
        bus.register_range(ports::CMOS_DATA, 1, handlers);
    }
}

impl IoSnapshot for CmosRam {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u8(sink, "cmos", "index", self.index);
        aero_io_snapshot::io::state::put_bytes(sink, "cmos", "bytes", &self.bytes);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        self.index = get_u8(src, "cmos", "index")?;
        let mut bytes = [0u8; CMOS_SIZE];
        aero_io_snapshot::io::state::get_bytes(src, "cmos", "bytes", &mut bytes)?;
        self.bytes = bytes;
        Ok(())
    }
}

fn lowhi(cmos: &mut CmosRam, idx: u8, data: u32) {
    let data = data.min(0xFFFF);
    cmos.set(idx, data as u8);
    cmos.set(idx + 1, (data >> 8) as u8);
}

/// Matches `pc_init_cmos_disk`: only called for the two master IDE drives
/// (index 0/1 of `MachineConfig::ata`); slaves have no CMOS representation
/// in the source, so this core doesn't seed them either.
fn seed_disk(cmos: &mut CmosRam, id: u8, drive: &AtaDriveConfig) {
    let shift = id << 2; // 0 or 4
    let mut bitmap = cmos.get(cmos::DRIVE_TYPE_BITMAP);
    bitmap |= 15 << (shift ^ 4);
    cmos.set(cmos::DRIVE_TYPE_BITMAP, bitmap);
    cmos.set(
        cmos::DISK_TYPE_EXTENDED_BASE + (shift >> 1),
        cmos::DISK_TYPE_EXTENDED_VALUE,
    );

    let base = cmos::DRIVE_BLOCK_BASE + id * cmos::DRIVE_BLOCK_STRIDE;
    let geo = drive.geometry;
    cmos.set(base, (geo.cylinders & 0xFF) as u8);
    cmos.set(base + 1, (geo.cylinders >> 8 & 0xFF) as u8);
    cmos.set(base + 2, geo.heads);
    cmos.set(base + 3, 0xFF);
    cmos.set(base + 4, 0xFF);
    if id == 0 {
        cmos.set(base + 5, 0xC0 | ((geo.heads > 8) as u8) << 3);
    } else {
        cmos.set(base + 5, ((geo.heads > 8) as u8) << 7);
    }
    cmos.set(base + 6, (geo.cylinders & 0xFF) as u8); // mirrors base+0/+1
    cmos.set(base + 7, (geo.cylinders >> 8 & 0xFF) as u8);
    cmos.set(base + 8, geo.sectors_per_track);

    let translation_id = cmos::TRANSLATION_NIBBLE_BASE + (id >> 1);
    let translation_type: u8 = if drive.total_sectors >= cmos::LARGE_TRANSLATION_SECTOR_THRESHOLD {
        2
    } else {
        0
    };
    let current = cmos.get(translation_id);
    if id & 1 != 0 {
        cmos.set(translation_id, (current & 0x0F) | (translation_type << 4));
    } else {
        cmos.set(translation_id, (current & 0xF0) | translation_type);
    }
}

/// Floppy type nibble per `fdc_init`'s `MAKE_DISK_TYPE` table, keyed by the
/// exact sector counts the four supported [`FloppyGeometry`] presets produce.
fn floppy_type_nibble(geo: FloppyGeometry) -> u8 {
    let sectors = geo.cylinders as u32 * geo.heads as u32 * geo.sectors_per_track as u32;
    match sectors {
        720 => 1,   // 360K
        1440 => 3,  // 720K
        2400 => 2,  // 1220K
        2880 => 4,  // 1440K
        5760 => 5,  // 2880K
        _ => 0,
    }
}

/// Seed register 0x10 (floppy type nibbles) and the floppy-count bits of
/// register 0x14, matching `fdc_init`'s `fdc_types`/`fdc_equipment`
/// computation. `fdc_types` packs drive 0 into the high nibble and drive 1
/// into the low nibble (`type << ((i ^ 1) * 4)`).
fn seed_floppies(cmos: &mut CmosRam, config: &MachineConfig) {
    let mut types = 0u8;
    let mut equipment = 0u8;
    for (i, slot) in config.floppy.iter().enumerate() {
        if let Some(floppy) = slot {
            equipment |= 1 << (i as u8 + 6);
            let nibble = floppy_type_nibble(floppy.geometry);
            types |= nibble << ((i as u8 ^ 1) * 4);
        }
    }
    cmos.set(cmos::FLOPPY_TYPES, types);
    let equipment_base = cmos.get(cmos::EQUIPMENT);
    cmos.set(cmos::EQUIPMENT, equipment_base | equipment);
}

/// Seed every boot-time CMOS register, matching `pc_init_cmos` byte for
/// byte. Must run before the floppy controller is wired up, since register
/// `0x14`'s low bits are set here and its high bits are OR'ed in afterward
/// by [`seed_floppies`].
pub fn seed(cmos: &mut CmosRam, config: &MachineConfig) {
    cmos.set(cmos::SHUTDOWN_STATUS, 0);
    cmos.set(0x11, 0x80);
    cmos.set(0x13, 0x80);
    cmos.set(cmos::EQUIPMENT, 0b0000_0110);
    lowhi(cmos, cmos::BASE_MEM_LO, 640);

    let memory_size = config.memory_bytes as u32;
    let extended_kb = memory_size.saturating_sub(1 << 20) / 1024;
    lowhi(cmos, cmos::EXT_MEM_LO, extended_kb);
    lowhi(cmos, cmos::EXT_MEM_LO_DUP, extended_kb);

    let above_16m = if memory_size > (16 << 20) {
        (memory_size / 65536) - ((16 << 20) / 65536)
    } else {
        0
    };
    lowhi(cmos, cmos::EXT_MEM_64K_ABOVE_16M_LO, above_16m);

    cmos.set(
        cmos::BOOT_FLAGS_1,
        ((config.boot_sequence[0] == BootDevice::Floppy) as u8) << 5,
    );

    cmos.set(cmos::CENTURY, cmos::CENTURY_BCD);
    cmos.set(cmos::CENTURY_DUP, cmos::CENTURY_BCD);

    cmos.set(cmos::BOOT_SEQ_2, (config.boot_sequence[2] as u8) << 4);
    cmos.set(
        cmos::BOOT_SEQ_01,
        (config.boot_sequence[1] as u8) << 4 | config.boot_sequence[0] as u8,
    );

    lowhi(cmos, 0x5B, 0);
    cmos.set(0x5D, 0);

    if let Some(drive) = &config.ata[0] {
        seed_disk(cmos, 0, drive);
    }
    if let Some(drive) = &config.ata[2] {
        seed_disk(cmos, 1, drive);
    }

    seed_floppies(cmos, config);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriveImage;
    use aero_devices::AtaGeometry;

    fn drive(total_sectors: u64) -> AtaDriveConfig {
        AtaDriveConfig {
            image: DriveImage::Blank {
                size: total_sectors * 512,
            },
            geometry: AtaGeometry {
                cylinders: 1024,
                heads: 16,
                sectors_per_track: 63,
            },
            total_sectors,
            model: "test".into(),
            serial: "0".into(),
        }
    }

    #[test]
    fn shutdown_status_is_always_ok() {
        let mut cmos = CmosRam::new();
        let config = MachineConfig::default();
        seed(&mut cmos, &config);
        assert_eq!(cmos.get(cmos::SHUTDOWN_STATUS), 0);
    }

    #[test]
    fn extended_memory_is_split_lowhi() {
        let mut cmos = CmosRam::new();
        let mut config = MachineConfig::default();
        config.memory_bytes = 32 * 1024 * 1024;
        seed(&mut cmos, &config);
        let expected_kb = (32 * 1024 * 1024 - (1 << 20)) / 1024;
        let lo = cmos.get(cmos::EXT_MEM_LO) as u32;
        let hi = cmos.get(cmos::EXT_MEM_HI) as u32;
        assert_eq!(lo | (hi << 8), expected_kb);
    }

    #[test]
    fn first_master_disk_seeds_drive_block_zero() {
        let mut cmos = CmosRam::new();
        let mut config = MachineConfig::default();
        config.ata[0] = Some(drive(2_000_000));
        seed(&mut cmos, &config);
        assert_eq!(cmos.get(cmos::DRIVE_BLOCK_BASE), 1024 & 0xFF);
        assert_eq!(cmos.get(cmos::DRIVE_BLOCK_BASE + 2), 16);
        assert_eq!(cmos.get(cmos::DRIVE_BLOCK_BASE + 5), 0xC0);
        assert_eq!(cmos.get(cmos::DISK_TYPE_EXTENDED_BASE), cmos::DISK_TYPE_EXTENDED_VALUE);
    }

    #[test]
    fn large_disk_selects_translation_mode_two() {
        let mut cmos = CmosRam::new();
        let mut config = MachineConfig::default();
        config.ata[0] = Some(drive(2_000_000));
        seed(&mut cmos, &config);
        assert_eq!(cmos.get(cmos::TRANSLATION_NIBBLE_BASE) & 0x0F, 2);
    }

    #[test]
    fn second_master_disk_uses_high_translation_nibble() {
        let mut cmos = CmosRam::new();
        let mut config = MachineConfig::default();
        config.ata[2] = Some(drive(100_000));
        seed(&mut cmos, &config);
        assert_eq!(cmos.get(cmos::TRANSLATION_NIBBLE_BASE) >> 4, 0);
        assert_eq!(cmos.get(cmos::DISK_TYPE_EXTENDED_BASE + 1), cmos::DISK_TYPE_EXTENDED_VALUE);
    }

    #[test]
    fn single_floppy_sets_equipment_bit_and_type_high_nibble() {
        let mut cmos = CmosRam::new();
        let mut config = MachineConfig::default();
        config.floppy[0] = Some(crate::config::FloppyDriveConfig {
            image: DriveImage::Blank { size: 1_474_560 },
            geometry: FloppyGeometry::FLOPPY_1_44MB,
            write_protected: false,
        });
        seed(&mut cmos, &config);
        assert_eq!(cmos.get(cmos::EQUIPMENT) & 0b1100_0000, 0b0100_0000);
        assert_eq!(cmos.get(cmos::FLOPPY_TYPES) >> 4, 4);
    }
}
