//! The 8237-style DMA engine (spec.md §4.3).
//!
//! Two cascaded controllers: an 8-bit group (channels 0-3, ports
//! `0x00-0x0F`) and a 16-bit group (channels 4-7, ports `0xC0-0xDF`), with
//! page registers at `0x80-0x8F`. This core only actually drives channel 2
//! (floppy); per SPEC_FULL.md §4.3 the other seven channels are present as
//! addressable register stubs only, matching the teacher's
//! `aero-pc-platform/tests/dma8237.rs` ("DMA controller ports should be
//! registered and default to 0 (register file stub)").

use aero_io_snapshot::io::state::{
    get_u16, get_u8, put_u16, put_u8, IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource,
};
use aero_pc_constants::ports;
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    /// Device reads from memory (e.g. a disk write, memory -> device).
    MemoryToDevice,
    /// Device writes into memory (e.g. a disk read, device -> memory).
    DeviceToMemory,
}

#[derive(Default, Clone, Copy)]
struct DmaChannel {
    page: u8,
    base_address: u16,
    base_count: u16,
    current_address: u16,
    current_count: u16,
    mode: u8,
    masked: bool,
    request: bool,
    terminal_count: bool,
}

/// The DMA register file plus real transfer arithmetic for channel 2.
pub struct Dma8237 {
    channels: [DmaChannel; 8],
    /// Per-controller command byte (group 0 = channels 0-3, group 1 = 4-7).
    command: [u8; 2],
    /// Per-controller address/count byte-pointer flip-flop.
    flipflop: [bool; 2],
}

impl Default for Dma8237 {
    fn default() -> Self {
        Self::new()
    }
}

impl Dma8237 {
    pub fn new() -> Self {
        Self {
            channels: [DmaChannel::default(); 8],
            command: [0; 2],
            flipflop: [false; 2],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn group(channel: usize) -> usize {
        if channel < 4 {
            0
        } else {
            1
        }
    }

    /// Device-facing DREQ assertion: marks the channel ready to transfer.
    /// The actual byte movement happens when the caller (the device itself,
    /// since this core has no separate "safe point" scheduler for DMA)
    /// invokes [`Dma8237::transfer`].
    pub fn raise_dreq(&mut self, channel: usize) {
        self.channels[channel].request = true;
    }

    pub fn lower_dreq(&mut self, channel: usize) {
        self.channels[channel].request = false;
    }

    pub fn is_masked(&self, channel: usize) -> bool {
        self.channels[channel].masked
    }

    /// Current 24-bit physical address a channel's next byte would move to
    /// or from (page register high byte, current_address low 16 bits).
    pub fn current_physical_address(&self, channel: usize) -> u32 {
        let ch = &self.channels[channel];
        (ch.page as u32) << 16 | ch.current_address as u32
    }

    pub fn terminal_count(&self, channel: usize) -> bool {
        self.channels[channel].terminal_count
    }

    /// Transfer up to `buf.len()` bytes for `channel`, advancing its current
    /// address/count registers and reporting terminal count when the
    /// channel's programmed count is exhausted. `buf` is the device's own
    /// scratch (e.g. the FDC's `dmabuf`); the caller is responsible for
    /// copying `buf` to/from guest memory at [`Dma8237::current_physical_address`]
    /// before/after calling this, since this engine does not itself own a
    /// `MemoryBus` reference (kept decoupled per REDESIGN FLAGS §9's
    /// "lend by exclusive reference during dispatch").
    pub fn transfer(&mut self, channel: usize, direction: TransferDirection, len: usize) -> usize {
        let ch = &mut self.channels[channel];
        let _ = direction;
        let remaining = ch.current_count as usize + 1;
        let n = len.min(remaining);
        ch.current_address = ch.current_address.wrapping_add(n as u16);
        if n as u16 > ch.current_count {
            ch.current_count = 0;
            ch.terminal_count = true;
        } else {
            ch.current_count -= n as u16;
            ch.terminal_count = ch.current_count == 0 && n > 0;
        }
        self.lower_dreq(channel);
        n
    }

    fn addr_port_read(&mut self, channel: usize) -> u8 {
        let group = Self::group(channel);
        let ch = &self.channels[channel];
        // Flip-flop clear (false) selects the low byte first, matching the
        // real 8237's state after a "clear byte pointer" or master reset.
        let low_first = !self.flipflop[group];
        self.flipflop[group] = !self.flipflop[group];
        if low_first {
            (ch.current_address & 0xFF) as u8
        } else {
            (ch.current_address >> 8) as u8
        }
    }

    fn addr_port_write(&mut self, channel: usize, value: u8) {
        let group = Self::group(channel);
        let low_first = !self.flipflop[group];
        self.flipflop[group] = !self.flipflop[group];
        let ch = &mut self.channels[channel];
        if low_first {
            ch.base_address = (ch.base_address & 0xFF00) | value as u16;
            ch.current_address = (ch.current_address & 0xFF00) | value as u16;
        } else {
            ch.base_address = (ch.base_address & 0x00FF) | (value as u16) << 8;
            ch.current_address = (ch.current_address & 0x00FF) | (value as u16) << 8;
        }
    }

    fn count_port_read(&mut self, channel: usize) -> u8 {
        let group = Self::group(channel);
        let ch = &self.channels[channel];
        let low_first = !self.flipflop[group];
        self.flipflop[group] = !self.flipflop[group];
        if low_first {
            (ch.current_count & 0xFF) as u8
        } else {
            (ch.current_count >> 8) as u8
        }
    }

    fn count_port_write(&mut self, channel: usize, value: u8) {
        let group = Self::group(channel);
        let low_first = !self.flipflop[group];
        self.flipflop[group] = !self.flipflop[group];
        let ch = &mut self.channels[channel];
        if low_first {
            ch.base_count = (ch.base_count & 0xFF00) | value as u16;
            ch.current_count = (ch.current_count & 0xFF00) | value as u16;
        } else {
            ch.base_count = (ch.base_count & 0x00FF) | (value as u16) << 8;
            ch.current_count = (ch.current_count & 0x00FF) | (value as u16) << 8;
            ch.terminal_count = false;
        }
    }

    fn page_read(&self, channel: usize) -> u8 {
        self.channels[channel].page
    }

    fn page_write(&mut self, channel: usize, value: u8) {
        self.channels[channel].page = value;
    }

    /// `reg` is the control register's logical index within its group (0 =
    /// status/command, 1 = request, 2 = single mask, 3 = mode, 4 = clear
    /// flip-flop, 5 = master clear, 6 = clear mask, 7 = write all mask),
    /// independent of whether the group is byte- or word-spaced on the bus.
    fn control_read(&mut self, group: usize, reg: u16) -> u8 {
        match reg {
            0 => self.channels[group * 4..group * 4 + 4]
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, ch)| acc | ((ch.terminal_count as u8) << i)),
            _ => 0,
        }
    }

    fn control_write(&mut self, group: usize, reg: u16, value: u8) {
        let base = group * 4;
        match reg {
            0 => self.command[group] = value,
            1 => {
                let channel = base + (value & 0x03) as usize;
                self.channels[channel].request = value & 0x04 != 0;
            }
            2 => {
                let channel = base + (value & 0x03) as usize;
                self.channels[channel].masked = value & 0x04 != 0;
            }
            3 => {
                let channel = base + (value & 0x03) as usize;
                self.channels[channel].mode = value;
            }
            4 => self.flipflop[group] = false,
            5 => {
                self.flipflop[group] = false;
                for ch in &mut self.channels[base..base + 4] {
                    ch.masked = true;
                }
            }
            6 => {
                for ch in &mut self.channels[base..base + 4] {
                    ch.masked = false;
                }
            }
            7 => {
                for (i, ch) in self.channels[base..base + 4].iter_mut().enumerate() {
                    ch.masked = value & (1 << i) != 0;
                }
            }
            _ => {}
        }
    }

    /// Register every DMA-related port on `bus`: channel 0-3 addr/count at
    /// `0x00-0x07`, controller-1 command block at `0x08-0x0F`, channel 4-7
    /// addr/count at `0xC0-0xCF`, controller-2 command block at
    /// `0xD0-0xDF`, and page registers at `0x80-0x8F`.
    pub fn register_ports(dma: Rc<RefCell<Dma8237>>, bus: &mut IoPortBus) {
        for channel in 0..4usize {
            Self::register_channel(dma.clone(), bus, channel, 0, ports::DMA1_BASE + channel as u16 * 2);
        }
        for channel in 4..8usize {
            Self::register_channel(
                dma.clone(),
                bus,
                channel,
                1,
                ports::DMA2_BASE + (channel as u16 - 4) * 4,
            );
        }
        for group in 0..2usize {
            // Group 0's 8-bit controller packs its 8 command-block registers
            // into consecutive ports (0x08-0x0F); group 1's 16-bit
            // controller is word-spaced, so the same 8 logical registers
            // occupy every other port across 0xD0-0xDF.
            let (ctl_base, stride) = if group == 0 {
                (ports::DMA1_BASE + 0x08, 1u16)
            } else {
                (ports::DMA2_BASE + 0x10, 2)
            };
            for reg in 0u16..8 {
                let port = ctl_base + reg * stride;
                let dma_r = dma.clone();
                let dma_w = dma.clone();
                let mut handlers = PortHandlers::default();
                handlers.read8 = Some(Box::new(move |_p| dma_r.borrow_mut().control_read(group, reg)));
                handlers.write8 =
                    Some(Box::new(move |_p, v| dma_w.borrow_mut().control_write(group, reg, v)));
                bus.register_range(port, 1, handlers);
            }
        }
        for (offset, channel) in [
            (0x87u16, 0usize),
            (0x83, 1),
            (0x81, 2),
            (0x82, 3),
            (0x8F, 0), // refresh; aliased to channel 0's page per 8237 convention
            (0x8B, 5),
            (0x89, 6),
            (0x8A, 7),
        ] {
            let dma_r = dma.clone();
            let dma_w = dma.clone();
            let mut handlers = PortHandlers::default();
            handlers.read8 = Some(Box::new(move |_p| dma_r.borrow().page_read(channel)));
            handlers.write8 = Some(Box::new(move |_p, v| dma_w.borrow_mut().page_write(channel, v)));
            bus.register_range(ports::DMA_PAGE_BASE + (offset - 0x80), 1, handlers);
        }
    }

    fn register_channel(
        dma: Rc<RefCell<Dma8237>>,
        bus: &mut IoPortBus,
        channel: usize,
        _group: usize,
        addr_port: u16,
    ) {
        let dma_ar = dma.clone();
        let dma_aw = dma.clone();
        let mut addr_handlers = PortHandlers::default();
        addr_handlers.read8 = Some(Box::new(move |_p| dma_ar.borrow_mut().addr_port_read(channel)));
        addr_handlers.write8 =
            Some(Box::new(move |_p, v| dma_aw.borrow_mut().addr_port_write(channel, v)));
        bus.register_range(addr_port, 1, addr_handlers);

        let dma_cr = dma.clone();
        let dma_cw = dma.clone();
        let mut count_handlers = PortHandlers::default();
        count_handlers.read8 = Some(Box::new(move |_p| dma_cr.borrow_mut().count_port_read(channel)));
        count_handlers.write8 =
            Some(Box::new(move |_p, v| dma_cw.borrow_mut().count_port_write(channel, v)));
        bus.register_range(addr_port + 1, 1, count_handlers);
    }
}

impl IoSnapshot for Dma8237 {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        for (i, ch) in self.channels.iter().enumerate() {
            let name = format!("dma.channel{i}");
            put_u8(sink, &name, "page", ch.page);
            put_u16(sink, &name, "base_address", ch.base_address);
            put_u16(sink, &name, "base_count", ch.base_count);
            put_u16(sink, &name, "current_address", ch.current_address);
            put_u16(sink, &name, "current_count", ch.current_count);
            put_u8(sink, &name, "mode", ch.mode);
            put_u8(sink, &name, "masked", ch.masked as u8);
            put_u8(sink, &name, "request", ch.request as u8);
            put_u8(sink, &name, "terminal_count", ch.terminal_count as u8);
        }
        put_u8(sink, "dma", "command0", self.command[0]);
        put_u8(sink, "dma", "command1", self.command[1]);
        put_u8(sink, "dma", "flipflop0", self.flipflop[0] as u8);
        put_u8(sink, "dma", "flipflop1", self.flipflop[1] as u8);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            let name = format!("dma.channel{i}");
            ch.page = get_u8(src, &name, "page")?;
            ch.base_address = get_u16(src, &name, "base_address")?;
            ch.base_count = get_u16(src, &name, "base_count")?;
            ch.current_address = get_u16(src, &name, "current_address")?;
            ch.current_count = get_u16(src, &name, "current_count")?;
            ch.mode = get_u8(src, &name, "mode")?;
            ch.masked = get_u8(src, &name, "masked")? != 0;
            ch.request = get_u8(src, &name, "request")? != 0;
            ch.terminal_count = get_u8(src, &name, "terminal_count")? != 0;
        }
        self.command[0] = get_u8(src, "dma", "command0")?;
        self.command[1] = get_u8(src, "dma", "command1")?;
        self.flipflop[0] = get_u8(src, "dma", "flipflop0")? != 0;
        self.flipflop[1] = get_u8(src, "dma", "flipflop1")? != 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel2_address_count_roundtrip_via_flipflop() {
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        let mut bus = IoPortBus::new();
        Dma8237::register_ports(dma.clone(), &mut bus);

        bus.write_u8(0x04, 0x00); // addr lo
        bus.write_u8(0x04, 0x10); // addr hi -> 0x1000
        bus.write_u8(0x05, 0xFF); // count lo
        bus.write_u8(0x05, 0x01); // count hi -> 0x01FF (= 512 bytes)

        assert_eq!(dma.borrow().channels[2].current_address, 0x1000);
        assert_eq!(dma.borrow().channels[2].current_count, 0x01FF);
    }

    #[test]
    fn transfer_advances_address_and_reports_terminal_count() {
        let mut dma = Dma8237::new();
        dma.channels[2].current_count = 511; // 512-byte transfer
        dma.raise_dreq(2);
        let moved = dma.transfer(2, TransferDirection::DeviceToMemory, 512);
        assert_eq!(moved, 512);
        assert!(dma.terminal_count(2));
        assert!(!dma.channels[2].request);
    }

    #[test]
    fn unused_channels_default_to_zero_and_are_independently_addressable() {
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        let mut bus = IoPortBus::new();
        Dma8237::register_ports(dma.clone(), &mut bus);

        assert_eq!(bus.read_u8(0x00), 0);
        assert_eq!(bus.read_u8(0x08), 0);
        assert_eq!(bus.read_u8(0x80), 0);
        assert_eq!(bus.read_u8(0xC0), 0);

        // Programming channel 0's page register must not disturb channel 2.
        bus.write_u8(0x87, 0x55);
        assert_eq!(bus.read_u8(0x87), 0x55);
        assert_eq!(dma.borrow().page_read(2), 0);
    }

    #[test]
    fn single_mask_register_masks_only_the_selected_channel() {
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        let mut bus = IoPortBus::new();
        Dma8237::register_ports(dma.clone(), &mut bus);

        bus.write_u8(0x0A, 0x02 | 0x04); // mask channel 2
        assert!(dma.borrow().is_masked(2));
        assert!(!dma.borrow().is_masked(0));
    }

    #[test]
    fn group1_single_mask_register_is_word_spaced() {
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        let mut bus = IoPortBus::new();
        Dma8237::register_ports(dma.clone(), &mut bus);

        // Single mask register is logical register 2 in the command block,
        // so it lands on 0xD0 + 2*2 = 0xD4 for the word-spaced group.
        bus.write_u8(0xD4, 0x02 | 0x04); // mask channel 4+2 = 6
        assert!(dma.borrow().is_masked(6));
        assert!(!dma.borrow().is_masked(4));
    }

    #[test]
    fn group1_status_register_reports_its_own_channels() {
        let dma = Rc::new(RefCell::new(Dma8237::new()));
        let mut bus = IoPortBus::new();
        Dma8237::register_ports(dma.clone(), &mut bus);

        dma.borrow_mut().channels[5].terminal_count = true;
        assert_eq!(bus.read_u8(0xD0), 0x02);
        assert_eq!(bus.read_u8(0x08), 0x00);
    }
}
