use aero_pc_constants::ports;
use aero_pc_platform::{MachineConfig, PcPlatform};
use memory::MemoryBus;

#[test]
fn disabling_a20_aliases_the_second_megabyte_onto_the_first() {
    let cfg = MachineConfig {
        memory_bytes: 4 * 1024 * 1024,
        ..Default::default()
    };
    let mut pc = PcPlatform::new(cfg).unwrap();

    // Disable the A20 line (bit 1 of port 0x92 low).
    pc.io_bus().write_u8(ports::A20_GATE, 0x00);

    {
        let mem = pc.memory();
        let mut mem = mem.borrow_mut();
        mem.write_bytes(0x0010_0042, &[0xAB]);
        let mut low = [0u8; 1];
        mem.read_bytes(0x0000_0042, &mut low);
        assert_eq!(low[0], 0xAB, "with A20 masked, bit 20 is dropped from every address");
    }

    // Re-enable A20: the alias must disappear.
    pc.io_bus().write_u8(ports::A20_GATE, 0x02);
    {
        let mem = pc.memory();
        let mut mem = mem.borrow_mut();
        mem.write_bytes(0x0000_0042, &[0x00]);
        let mut high = [0u8; 1];
        mem.read_bytes(0x0010_0042, &mut high);
        assert_eq!(high[0], 0xAB, "with A20 enabled, the two addresses are independent");
    }
}
