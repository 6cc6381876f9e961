use aero_pc_constants::ports;
use aero_pc_platform::{MachineConfig, PcPlatform};

const SHUTDOWN_STRING: &[u8] = b"Shutdown";

#[test]
fn writing_the_full_shutdown_string_sets_halted() {
    let mut pc = PcPlatform::new(MachineConfig::default()).unwrap();
    assert!(!pc.is_halted());

    let io = pc.io_bus();
    for &byte in SHUTDOWN_STRING {
        io.write_u8(ports::SHUTDOWN_STRING, byte);
    }

    assert!(pc.is_halted(), "full \"Shutdown\" sequence should halt the machine");
}

#[test]
fn a_mismatched_byte_does_not_halt() {
    let mut pc = PcPlatform::new(MachineConfig::default()).unwrap();
    let io = pc.io_bus();

    io.write_u8(ports::SHUTDOWN_STRING, b'S');
    io.write_u8(ports::SHUTDOWN_STRING, b'h');
    io.write_u8(ports::SHUTDOWN_STRING, b'X'); // breaks the sequence
    for &byte in &SHUTDOWN_STRING[..SHUTDOWN_STRING.len() - 1] {
        io.write_u8(ports::SHUTDOWN_STRING, byte);
    }

    assert!(!pc.is_halted(), "a broken sequence must not halt the machine early");
}
