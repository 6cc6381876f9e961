use aero_pc_constants::ports;
use aero_pc_platform::{MachineConfig, PcPlatform};

fn read_pit_count_ch0(pc: &mut PcPlatform) -> u16 {
    let io = pc.io_bus();
    io.write_u8(ports::PIT_CMD, 0x00); // latch channel 0 count
    let lo = io.read_u8(ports::PIT_CH0);
    let hi = io.read_u8(ports::PIT_CH0);
    u16::from_le_bytes([lo, hi])
}

#[test]
fn restoring_a_snapshot_reproduces_the_programmed_pit_reload() {
    let mut pc = PcPlatform::new(MachineConfig::default()).unwrap();

    let reload: u16 = 1234;
    {
        let io = pc.io_bus();
        io.write_u8(ports::PIT_CMD, 0x34); // channel 0, lobyte/hibyte, mode 2
        io.write_u8(ports::PIT_CH0, (reload & 0xFF) as u8);
        io.write_u8(ports::PIT_CH0, (reload >> 8) as u8);
    }

    let blob = pc.save_snapshot();
    let baseline = read_pit_count_ch0(&mut pc);
    assert!(baseline <= reload, "the counter should have started counting down");

    // Reprogram with a different reload so the machine's live state diverges
    // from the snapshot, then restore and confirm it snaps back.
    {
        let io = pc.io_bus();
        io.write_u8(ports::PIT_CMD, 0x34);
        io.write_u8(ports::PIT_CH0, 0x01);
        io.write_u8(ports::PIT_CH0, 0x00);
    }
    assert_ne!(read_pit_count_ch0(&mut pc), baseline);

    pc.restore_snapshot(&blob).unwrap();
    assert_eq!(read_pit_count_ch0(&mut pc), baseline);
}
