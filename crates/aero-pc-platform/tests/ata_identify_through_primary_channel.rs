use aero_devices::AtaGeometry;
use aero_pc_constants::ports;
use aero_pc_platform::config::{AtaDriveConfig, DriveImage};
use aero_pc_platform::{MachineConfig, PcPlatform};

fn platform_with_primary_master() -> PcPlatform {
    let sectors = 16 * 63 * 16u64;
    let mut cfg = MachineConfig::default();
    cfg.ata[0] = Some(AtaDriveConfig {
        image: DriveImage::Blank { size: sectors * 512 },
        geometry: AtaGeometry {
            cylinders: 16,
            heads: 16,
            sectors_per_track: 63,
        },
        total_sectors: sectors,
        model: "AERO VIRTUAL HD".to_string(),
        serial: "AERO0001".to_string(),
    });
    PcPlatform::new(cfg).unwrap()
}

#[test]
fn identify_raises_drq_and_returns_signature_word() {
    let mut pc = platform_with_primary_master();
    let io = pc.io_bus();

    io.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEC);
    let status = io.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7);
    assert_eq!(status & 0x08, 0x08, "DRQ should be set after IDENTIFY");

    let lo = io.read_u8(ports::ATA_PRIMARY_CMD_BASE);
    let hi = io.read_u8(ports::ATA_PRIMARY_CMD_BASE);
    assert_eq!(u16::from_le_bytes([lo, hi]), 0x0040, "word 0 general config");
}

#[test]
fn secondary_channel_has_no_drive_attached() {
    let mut pc = platform_with_primary_master();
    let io = pc.io_bus();

    io.write_u8(ports::ATA_SECONDARY_CMD_BASE + 7, 0xEC);
    let status = io.read_u8(ports::ATA_SECONDARY_CMD_BASE + 7);
    assert_eq!(status & 0x08, 0, "no drive present on the secondary channel");
}
