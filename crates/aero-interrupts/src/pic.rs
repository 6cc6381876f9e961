//! Legacy 8259 PIC pair (spec.md §4.2): two cascaded controllers covering
//! IRQs 0-15, with IRQ2 reserved for the cascade and not user-visible.

use aero_io_snapshot::io::state::{
    get_u8, put_u8, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum InitState {
    Ready,
    WaitIcw2,
    WaitIcw3,
    WaitIcw4,
}

/// One 8259 controller. IRQ lines are numbered 0-7 local to this chip; the
/// [`Pic`] pair translates guest-visible IRQ 0-15 into (chip, local line).
struct Chip8259 {
    irr: u8,
    isr: u8,
    imr: u8,
    vector_base: u8,
    init_state: InitState,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    read_isr: bool,
    is_slave: bool,
    /// Bitmap (master) or cascade id (slave) recorded from ICW3; unused for
    /// routing since this core always wires line 2 to the slave, but kept
    /// so a savestate round-trip preserves it.
    icw3: u8,
}

impl Chip8259 {
    fn new(is_slave: bool) -> Self {
        Self {
            irr: 0,
            isr: 0,
            imr: 0xFF,
            vector_base: 0,
            init_state: InitState::Ready,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            read_isr: false,
            is_slave,
            icw3: 0,
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.is_slave);
    }

    fn raise(&mut self, line: u8) {
        self.irr |= 1 << line;
    }

    fn lower(&mut self, line: u8) {
        self.irr &= !(1 << line);
    }

    /// Highest-priority unmasked, asserted-and-not-already-in-service line,
    /// if any (IRQ0 is highest priority; no rotation modeled).
    fn highest_pending(&self) -> Option<u8> {
        let pending = self.irr & !self.imr;
        for line in 0..8 {
            if pending & (1 << line) != 0 {
                return Some(line);
            }
        }
        None
    }

    fn has_interrupt(&self) -> bool {
        self.highest_pending().is_some()
    }

    /// Acknowledge the highest-priority pending line: set its ISR bit
    /// (unless auto-EOI), clear IRR, and return its vector.
    fn acknowledge(&mut self) -> Option<u8> {
        let line = self.highest_pending()?;
        self.irr &= !(1 << line);
        if !self.auto_eoi {
            self.isr |= 1 << line;
        }
        Some(self.vector_base.wrapping_add(line))
    }

    fn write_cmd(&mut self, value: u8) {
        if value & 0x10 != 0 {
            // ICW1.
            self.init_state = InitState::WaitIcw2;
            self.icw3 = 0;
            self.irr = 0;
            self.isr = 0;
            self.imr = 0;
            self.auto_eoi = false;
            // bit0 set => ICW4 will follow; bit1 set => single (no cascade),
            // neither changes this core's routing since line 2 is always
            // the cascade in this chipset.
            return;
        }
        if value & 0x08 != 0 {
            // OCW3: read-register select / poll command.
            self.read_isr = value & 0x03 == 0x03;
            return;
        }
        // OCW2: EOI variants. Only non-specific and specific EOI are
        // modeled; rotating priority is accepted and ignored beyond the
        // auto-eoi-rotate flag, since this core never observes rotation.
        let eoi_level = value & 0x07;
        match value & 0xE0 {
            0x20 => {
                // Non-specific EOI: clear the highest set ISR bit.
                for line in 0..8 {
                    if self.isr & (1 << line) != 0 {
                        self.isr &= !(1 << line);
                        break;
                    }
                }
            }
            0x60 => {
                // Specific EOI.
                self.isr &= !(1 << eoi_level);
            }
            0x80 => {
                self.auto_eoi = true;
                self.rotate_on_auto_eoi = true;
            }
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        match self.init_state {
            InitState::WaitIcw2 => {
                self.vector_base = value & 0xF8;
                self.init_state = InitState::WaitIcw3;
            }
            InitState::WaitIcw3 => {
                self.icw3 = value;
                self.init_state = InitState::WaitIcw4;
            }
            InitState::WaitIcw4 => {
                self.auto_eoi = value & 0x02 != 0;
                self.init_state = InitState::Ready;
            }
            InitState::Ready => {
                self.imr = value;
            }
        }
    }

    fn read_cmd(&self) -> u8 {
        if self.read_isr {
            self.isr
        } else {
            self.irr
        }
    }

    fn read_data(&self) -> u8 {
        self.imr
    }
}

/// The cascaded master/slave pair. `raise_irq`/`lower_irq` take a
/// guest-visible line 0-15; line 2 is reserved for the slave cascade and
/// silently ignored if driven directly (spec.md §4.2: "IRQ2 is not
/// user-visible").
pub struct Pic {
    master: Chip8259,
    slave: Chip8259,
    /// When both PIC and I/O APIC are enabled, `raise_irq` also forwards to
    /// this sink (spec.md §4.2).
    ioapic_forward: bool,
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic {
    pub fn new() -> Self {
        Self {
            master: Chip8259::new(false),
            slave: Chip8259::new(true),
            ioapic_forward: false,
        }
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    pub fn set_ioapic_forwarding(&mut self, enabled: bool) {
        self.ioapic_forward = enabled;
    }

    pub fn ioapic_forwarding(&self) -> bool {
        self.ioapic_forward
    }

    fn split(line: u8) -> Option<(bool, u8)> {
        match line {
            0..=1 | 3..=7 => Some((false, line)),
            8..=15 => Some((true, line - 8)),
            // Line 2 is the cascade input; not individually addressable.
            2 => None,
            _ => None,
        }
    }

    /// Raises `line` (0-15, excluding 2). Updates the master's cascade input
    /// (bit 2) to reflect whether the slave has anything pending.
    pub fn raise_irq(&mut self, line: u8) {
        if let Some((slave, local)) = Self::split(line) {
            if slave {
                self.slave.raise(local);
            } else {
                self.master.raise(local);
            }
            self.sync_cascade();
        }
    }

    pub fn lower_irq(&mut self, line: u8) {
        if let Some((slave, local)) = Self::split(line) {
            if slave {
                self.slave.lower(local);
            } else {
                self.master.lower(local);
            }
            self.sync_cascade();
        }
    }

    fn sync_cascade(&mut self) {
        if self.slave.has_interrupt() {
            self.master.raise(2);
        } else {
            self.master.lower(2);
        }
    }

    pub fn has_interrupt(&self) -> bool {
        self.master.has_interrupt()
    }

    /// Returns the vector of the highest-priority unmasked asserted line,
    /// transparently descending into the slave when the pending master line
    /// is the cascade input.
    pub fn get_interrupt(&mut self) -> Option<u8> {
        let master_line = self.master.highest_pending()?;
        if master_line == 2 && self.slave.has_interrupt() {
            self.master.acknowledge(); // consumes the cascade line itself
            return self.slave.acknowledge();
        }
        self.master.acknowledge()
    }

    pub fn io_write(&mut self, port: u16, value: u8) {
        match port {
            0x20 => self.master.write_cmd(value),
            0x21 => self.master.write_data(value),
            0xA0 => self.slave.write_cmd(value),
            0xA1 => self.slave.write_data(value),
            _ => log::warn!("pic: write to unexpected port {:#06x}", port),
        }
    }

    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            0x20 => self.master.read_cmd(),
            0x21 => self.master.read_data(),
            0xA0 => self.slave.read_cmd(),
            0xA1 => self.slave.read_data(),
            _ => {
                log::warn!("pic: read from unexpected port {:#06x}", port);
                0xFF
            }
        }
    }
}

fn save_chip(sink: &mut dyn SnapshotSink, name: &str, chip: &Chip8259) {
    put_u8(sink, name, "irr", chip.irr);
    put_u8(sink, name, "isr", chip.isr);
    put_u8(sink, name, "imr", chip.imr);
    put_u8(sink, name, "vector_base", chip.vector_base);
    put_u8(sink, name, "icw3", chip.icw3);
    put_u8(sink, name, "auto_eoi", chip.auto_eoi as u8);
}

fn load_chip(src: &mut dyn SnapshotSource, name: &str, chip: &mut Chip8259) -> Result<(), SnapshotError> {
    chip.irr = get_u8(src, name, "irr")?;
    chip.isr = get_u8(src, name, "isr")?;
    chip.imr = get_u8(src, name, "imr")?;
    chip.vector_base = get_u8(src, name, "vector_base")?;
    chip.icw3 = get_u8(src, name, "icw3")?;
    chip.auto_eoi = get_u8(src, name, "auto_eoi")? != 0;
    chip.init_state = InitState::Ready;
    Ok(())
}

impl IoSnapshot for Pic {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        save_chip(sink, "pic.master", &self.master);
        save_chip(sink, "pic.slave", &self.slave);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        load_chip(src, "pic.master", &mut self.master)?;
        load_chip(src, "pic.slave", &mut self.slave)?;
        Ok(())
    }
}
