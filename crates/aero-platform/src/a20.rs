//! The A20 gate (spec.md §4.2), grounded on `original_source/src/pc.c`'s
//! `bios_writeb`/`bios_readb`/`pc_set_a20` handling of port `0x92`.
//!
//! The gate's enable state lives in bit 1 of the port's raw byte value;
//! `original_source/src/pc.c` stores that raw byte directly (`a20 = data`)
//! and derives the boolean line state as `a20 >> 1 & 1` on write, defaulting
//! to `a20 = 2` (gate enabled) at boot.

use aero_io_snapshot::io::state::{get_u8, put_u8, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource};
use aero_pc_constants::ports;
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::Rc;

/// Callback invoked whenever the A20 line's enabled/disabled state changes.
pub type A20LineCallback = Box<dyn FnMut(bool)>;

/// Port `0x92`'s register, plus the address-line state it drives.
pub struct A20Gate {
    raw: u8,
    on_line_change: Option<A20LineCallback>,
}

impl Default for A20Gate {
    fn default() -> Self {
        Self::new()
    }
}

impl A20Gate {
    pub fn new() -> Self {
        Self {
            raw: 2,
            on_line_change: None,
        }
    }

    pub fn reset(&mut self) {
        let callback = self.on_line_change.take();
        *self = Self::new();
        self.on_line_change = callback;
    }

    /// Register a callback fired with the new line state on every write that
    /// changes it (the memory bus is expected to mask address bit 20
    /// accordingly; wiring that mask is the caller's responsibility since
    /// this gate has no `MemoryBus` reference of its own).
    pub fn set_on_line_change(&mut self, callback: A20LineCallback) {
        self.on_line_change = Some(callback);
    }

    pub fn line_enabled(&self) -> bool {
        self.raw >> 1 & 1 != 0
    }

    fn write(&mut self, data: u8) {
        let was_enabled = self.line_enabled();
        self.raw = data;
        let now_enabled = self.line_enabled();
        if now_enabled != was_enabled {
            if let Some(cb) = self.on_line_change.as_mut() {
                cb(now_enabled);
            }
        }
    }

    fn read(&self) -> u8 {
        self.raw
    }

    pub fn register_ports(gate: Rc<RefCell<A20Gate>>, bus: &mut IoPortBus) {
        let reader = gate.clone();
        let writer = gate;
        let mut handlers = PortHandlers::default();
        handlers.read8 = Some(Box::new(move |_p| reader.borrow().read()));
        handlers.write8 = Some(Box::new(move |_p, v| writer.borrow_mut().write(v)));
        bus.register_range(ports::A20_GATE, 1, handlers);
    }
}

impl IoSnapshot for A20Gate {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u8(sink, "a20", "raw", self.raw);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        self.raw = get_u8(src, "a20", "raw")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_enabled_on_reset() {
        let gate = A20Gate::new();
        assert!(gate.line_enabled());
        assert_eq!(gate.read(), 2);
    }

    #[test]
    fn write_derives_line_from_bit_one() {
        let mut gate = A20Gate::new();
        gate.write(0x00);
        assert!(!gate.line_enabled());
        gate.write(0x02);
        assert!(gate.line_enabled());
    }

    #[test]
    fn callback_fires_only_on_actual_transition() {
        let gate = Rc::new(RefCell::new(A20Gate::new()));
        let transitions = Rc::new(RefCell::new(Vec::new()));
        let sink = transitions.clone();
        gate.borrow_mut()
            .set_on_line_change(Box::new(move |on| sink.borrow_mut().push(on)));

        let mut bus = IoPortBus::new();
        A20Gate::register_ports(gate.clone(), &mut bus);

        bus.write_u8(0x92, 0x02); // already enabled, no transition
        bus.write_u8(0x92, 0x00); // disables
        bus.write_u8(0x92, 0x00); // no change
        bus.write_u8(0x92, 0x02); // re-enables

        assert_eq!(*transitions.borrow(), vec![false, true]);
    }

    #[test]
    fn raw_byte_roundtrips_through_port() {
        let gate = Rc::new(RefCell::new(A20Gate::new()));
        let mut bus = IoPortBus::new();
        A20Gate::register_ports(gate.clone(), &mut bus);

        bus.write_u8(0x92, 0xFE);
        assert_eq!(bus.read_u8(0x92), 0xFE);
    }
}
