//! The "Shutdown" string watcher on port `0x8900` (spec.md §4.2), grounded
//! on `original_source/src/pc.c`'s `bios_writeb` case `0x8900`: a firmware
//! convention where writing the ASCII bytes of `"Shutdown"` one at a time
//! signals the core to halt, used by BIOSes that have no ACPI to request a
//! clean power-off.

use aero_io_snapshot::io::state::{get_u8, put_u8, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource};
use aero_pc_constants::ports;
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::Rc;

const SHUTDOWN_STRING: &[u8; 8] = b"Shutdown";

/// Callback invoked once the full `"Shutdown"` sequence has been written.
pub type ShutdownCallback = Box<dyn FnMut()>;

pub struct ShutdownWatcher {
    idx: usize,
    on_shutdown: Option<ShutdownCallback>,
}

impl Default for ShutdownWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownWatcher {
    pub fn new() -> Self {
        Self {
            idx: 0,
            on_shutdown: None,
        }
    }

    pub fn reset(&mut self) {
        self.idx = 0;
    }

    pub fn set_on_shutdown(&mut self, callback: ShutdownCallback) {
        self.on_shutdown = Some(callback);
    }

    /// Feed one byte of the watched sequence. Matches
    /// `original_source/src/pc.c`: on a match, advance; on full match, fire
    /// and leave `idx` at 8 (the original never resets `idx` after firing,
    /// so subsequent writes keep failing to match until the caller resets).
    fn write(&mut self, data: u8) {
        if self.idx >= SHUTDOWN_STRING.len() {
            return;
        }
        if data == SHUTDOWN_STRING[self.idx] {
            self.idx += 1;
            if self.idx == SHUTDOWN_STRING.len() {
                if let Some(cb) = self.on_shutdown.as_mut() {
                    cb();
                }
            }
        } else {
            self.idx = 0;
        }
    }

    pub fn register_ports(watcher: Rc<RefCell<ShutdownWatcher>>, bus: &mut IoPortBus) {
        let writer = watcher;
        let mut handlers = PortHandlers::default();
        handlers.write8 = Some(Box::new(move |_p, v| writer.borrow_mut().write(v)));
        bus.register_range(ports::SHUTDOWN_STRING, 1, handlers);
    }
}

impl IoSnapshot for ShutdownWatcher {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u8(sink, "shutdown_watcher", "idx", self.idx as u8);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        self.idx = get_u8(src, "shutdown_watcher", "idx")? as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sequence_fires_callback() {
        let watcher = Rc::new(RefCell::new(ShutdownWatcher::new()));
        let fired = Rc::new(RefCell::new(false));
        let sink = fired.clone();
        watcher
            .borrow_mut()
            .set_on_shutdown(Box::new(move || *sink.borrow_mut() = true));

        let mut bus = IoPortBus::new();
        ShutdownWatcher::register_ports(watcher.clone(), &mut bus);

        for &b in SHUTDOWN_STRING {
            bus.write_u8(0x8900, b);
        }
        assert!(*fired.borrow());
    }

    #[test]
    fn mismatch_resets_progress() {
        let watcher = Rc::new(RefCell::new(ShutdownWatcher::new()));
        let fired = Rc::new(RefCell::new(false));
        let sink = fired.clone();
        watcher
            .borrow_mut()
            .set_on_shutdown(Box::new(move || *sink.borrow_mut() = true));

        let mut bus = IoPortBus::new();
        ShutdownWatcher::register_ports(watcher.clone(), &mut bus);

        bus.write_u8(0x8900, b'S');
        bus.write_u8(0x8900, b'h');
        bus.write_u8(0x8900, b'x'); // mismatch, resets to idx 0
        for &b in SHUTDOWN_STRING {
            bus.write_u8(0x8900, b);
        }
        assert!(*fired.borrow());
    }

    #[test]
    fn partial_sequence_does_not_fire() {
        let watcher = Rc::new(RefCell::new(ShutdownWatcher::new()));
        let fired = Rc::new(RefCell::new(false));
        let sink = fired.clone();
        watcher
            .borrow_mut()
            .set_on_shutdown(Box::new(move || *sink.borrow_mut() = true));

        let mut bus = IoPortBus::new();
        ShutdownWatcher::register_ports(watcher.clone(), &mut bus);

        for &b in &SHUTDOWN_STRING[..4] {
            bus.write_u8(0x8900, b);
        }
        assert!(!*fired.borrow());
    }
}
