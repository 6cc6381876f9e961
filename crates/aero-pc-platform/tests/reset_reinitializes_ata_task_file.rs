use aero_pc_constants::ports;
use aero_pc_platform::{MachineConfig, PcPlatform};

#[test]
fn reset_clears_an_in_progress_command_without_touching_cmos() {
    let mut pc = PcPlatform::new(MachineConfig::default()).unwrap();

    {
        let io = pc.io_bus();
        // Select the (absent) secondary drive on the primary channel and
        // leave an aborted command's error code sitting in the register file.
        io.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEC);
        assert_ne!(io.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7) & 0x01, 0, "no drive present, IDENTIFY aborts");

        // Stamp a CMOS byte in the user-data region so we can tell a reset
        // didn't wipe it: real CMOS/RTC contents survive a machine reset.
        io.write_u8(ports::CMOS_INDEX, 0x30);
        io.write_u8(ports::CMOS_DATA, 0x5A);
    }

    pc.reset();

    let io = pc.io_bus();
    let status = io.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7);
    assert_eq!(status & 0x01, 0, "reset should clear the stale error status");

    io.write_u8(ports::CMOS_INDEX, 0x30);
    assert_eq!(io.read_u8(ports::CMOS_DATA), 0x5A, "CMOS contents must survive a reset");
}
