//! The 8253/8254 Programmable Interval Timer plus the PC speaker gate it
//! drives (spec.md §4.6), grounded on `original_source/src/hardware/pit.c`.

use aero_io_snapshot::io::state::{
    get_u32, get_u64, get_u8, put_u32, put_u64, put_u8, IoSnapshot, SnapshotError, SnapshotSink,
    SnapshotSource,
};
use aero_pc_constants::ports;
use aero_timers::Tickable;
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::Rc;

/// `PIT_CLOCK_SPEED` in `pit.c`: the crystal the 8254 counts down from,
/// independent of the machine's own `ticks_per_second`.
pub const PIT_CLOCK_SPEED: u64 = 1_193_182;

const STATUS_LATCHED: u8 = 1;
const COUNTER_LATCHED: u8 = 2;

fn counter_to_ticks(c: u32, ticks_per_second: u64) -> u64 {
    ((c as f64) * (ticks_per_second as f64) / (PIT_CLOCK_SPEED as f64)) as u64
}

fn ticks_to_counter(t: u64, ticks_per_second: u64) -> u32 {
    ((t as f64) * (PIT_CLOCK_SPEED as f64) / (ticks_per_second as f64)) as u32
}

/// Per-channel state (`struct pit_channel` in the source).
#[derive(Default)]
struct Channel {
    count: u32,
    interim_count: u32,
    mode: u8,
    bcd: bool,
    gate: bool,
    rw_mode: u8,
    rmode: u8,
    wmode: u8,
    status_latch: u8,
    whats_latched: u8,
    counter_latch: u16,
    last_load_time: u64,
    pit_last_count: u32,
    timer_flipflop: u8,
    timer_running: bool,
}

impl Channel {
    fn get_count(&self, now: u64, ticks_per_second: u64) -> u32 {
        if self.count == 0 {
            return 0;
        }
        let elapsed = now.wrapping_sub(self.last_load_time);
        let diff_in_ticks = ticks_to_counter(elapsed, ticks_per_second);
        let current = self.count.wrapping_sub(diff_in_ticks);
        current % self.count
    }

    fn get_out(&self, now: u64, ticks_per_second: u64) -> bool {
        if self.count == 0 {
            return false;
        }
        let elapsed = ticks_to_counter(now.wrapping_sub(self.last_load_time), ticks_per_second);
        let current_counter = elapsed % self.count;
        match self.mode {
            0 | 1 => {
                let base = self.count >= current_counter;
                if self.mode == 1 {
                    !base
                } else {
                    base
                }
            }
            2 => current_counter != 1,
            3 => {
                if self.count & 1 != 0 {
                    current_counter >= ((self.count + 1) >> 1)
                } else {
                    current_counter < ((self.count.wrapping_sub(1)) >> 1)
                }
            }
            4 | 5 => current_counter != 0,
            _ => false,
        }
    }

    fn set_count(&mut self, v: u32, now: u64, ticks_per_second: u64) {
        self.last_load_time = now;
        self.count = if v == 0 { 0x10000 } else { v };
        self.timer_running = true;
        self.pit_last_count = self.get_count(now, ticks_per_second);
    }

    fn latch_counter(&mut self, now: u64, ticks_per_second: u64) {
        if self.whats_latched & COUNTER_LATCHED != 0 {
            return;
        }
        let ct = self.get_count(now, ticks_per_second) as u16;
        let mode = self.rw_mode;
        self.whats_latched = (mode << 2) | COUNTER_LATCHED;
        match mode {
            1 | 2 => self.counter_latch = (ct >> ((mode - 1) << 3)) & 0xFF,
            3 => self.counter_latch = ct,
            _ => {}
        }
    }

    fn reset(&mut self, gate: bool) {
        *self = Channel {
            gate,
            ..Channel::default()
        };
    }
}

/// Raises or lowers IRQ0 (`true` = raise, `false` = lower); owned by the
/// caller that wires the PIT into an [`aero_interrupts::InterruptRouter`].
pub type PitIrqCallback = Box<dyn FnMut(bool)>;

/// The three-channel PIT plus the port-0x61 PC speaker gate register.
pub struct Pit {
    chan: [Channel; 3],
    speaker_gate: u8,
    ticks_per_second: u64,
    on_irq0: Option<PitIrqCallback>,
}

impl Pit {
    pub fn new(ticks_per_second: u64) -> Self {
        let mut pit = Self {
            chan: Default::default(),
            speaker_gate: 0,
            ticks_per_second,
            on_irq0: None,
        };
        pit.reset();
        pit
    }

    pub fn set_on_irq0(&mut self, callback: PitIrqCallback) {
        self.on_irq0 = Some(callback);
    }

    pub fn reset(&mut self) {
        for (i, chan) in self.chan.iter_mut().enumerate() {
            chan.reset(i != 2);
        }
        self.speaker_gate = 0;
    }

    fn pulse_irq0(&mut self) {
        if let Some(cb) = self.on_irq0.as_mut() {
            cb(false);
            cb(true);
        }
    }

    fn write_control(&mut self, value: u8, now: u64) {
        let channel = value >> 6;
        let opmode = (value >> 1) & 7;
        let bcd = value & 1 != 0;
        let access = (value >> 4) & 3;
        match channel {
            3 => {
                // Read-back command: opmode bits 0-2 select which channels,
                // access bit1 = !latch-count, bit0 = !latch-status.
                for (i, chan) in self.chan.iter_mut().enumerate() {
                    if (opmode >> i) & 1 == 0 {
                        continue;
                    }
                    if access & 2 == 0 {
                        chan.latch_counter(now, self.ticks_per_second);
                    }
                    if access & 1 == 0 && chan.whats_latched & STATUS_LATCHED == 0 {
                        let out = chan.get_out(now, self.ticks_per_second) as u8;
                        chan.status_latch =
                            (out << 7) | (chan.rw_mode << 4) | (chan.mode << 1) | (chan.bcd as u8);
                        chan.whats_latched |= STATUS_LATCHED;
                    }
                }
            }
            0..=2 => {
                let mut raise_irq0_now = false;
                {
                    let chan = &mut self.chan[channel as usize];
                    if access == 0 {
                        chan.latch_counter(now, self.ticks_per_second);
                    } else {
                        chan.rw_mode = access;
                        chan.wmode = access - 1;
                        chan.rmode = access - 1;
                        chan.mode = opmode;
                        if opmode == 2 && channel == 0 {
                            raise_irq0_now = true;
                        }
                        chan.bcd = bcd;
                        if bcd {
                            log::warn!("pit: BCD mode not supported");
                        }
                    }
                }
                if raise_irq0_now {
                    if let Some(cb) = self.on_irq0.as_mut() {
                        cb(true);
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    fn write_data(&mut self, channel: usize, value: u8, now: u64) {
        let tps = self.ticks_per_second;
        let chan = &mut self.chan[channel];
        match chan.wmode {
            0 => chan.set_count(value as u32, now, tps),
            1 => chan.set_count((value as u32) << 8, now, tps),
            2 => {
                chan.interim_count = value as u32;
                chan.wmode ^= 1;
            }
            3 => {
                let v = (value as u32) << 8 | chan.interim_count;
                chan.set_count(v, now, tps);
                chan.wmode ^= 1;
            }
            _ => unreachable!(),
        }
    }

    fn read_data(&mut self, channel: usize, now: u64) -> u8 {
        let tps = self.ticks_per_second;
        let chan = &mut self.chan[channel];
        if chan.whats_latched & STATUS_LATCHED != 0 {
            chan.whats_latched &= !STATUS_LATCHED;
            return chan.status_latch;
        }
        if chan.whats_latched & COUNTER_LATCHED != 0 {
            let what = chan.whats_latched >> 2;
            return match what {
                1 | 2 => {
                    chan.whats_latched = 0;
                    chan.counter_latch as u8
                }
                3 => {
                    chan.whats_latched = (2 << 2) | COUNTER_LATCHED;
                    let retv = chan.counter_latch as u8;
                    chan.counter_latch >>= 8;
                    retv
                }
                _ => 0xFF,
            };
        }
        let count = chan.get_count(now, tps);
        match chan.rmode {
            0 => count as u8,
            1 => (count >> 8) as u8,
            2 | 3 => {
                let retv = (count >> ((chan.rmode & 1) << 3)) as u8;
                chan.rmode ^= 1;
                retv
            }
            _ => 0xFF,
        }
    }

    fn speaker_read(&mut self, now: u64) -> u8 {
        self.chan[2].timer_flipflop ^= 1;
        (self.chan[2].timer_flipflop << 4) | ((self.chan[2].get_out(now, self.ticks_per_second) as u8) << 5)
    }

    fn speaker_write(&mut self, data: u8) {
        self.speaker_gate = data;
        log::debug!(
            "pit: {}abled the pc speaker",
            if data & 1 != 0 { "En" } else { "Dis" }
        );
    }

    pub fn register_ports(pit: Rc<RefCell<Pit>>, bus: &mut IoPortBus, now: impl Fn() -> u64 + Clone + 'static) {
        {
            let pit = pit.clone();
            let now = now.clone();
            let mut handlers = PortHandlers::default();
            handlers.read8 = Some(Box::new(move |port| {
                pit.borrow_mut().read_data((port & 3) as usize, now())
            }));
            let pit = pit.clone();
            let now2 = now.clone();
            handlers.write8 = Some(Box::new(move |port, value| {
                let channel = port & 3;
                let t = now2();
                if channel == 3 {
                    pit.borrow_mut().write_control(value, t);
                } else {
                    pit.borrow_mut().write_data(channel as usize, value, t);
                }
            }));
            bus.register_range(ports::PIT_CH0, 4, handlers);
        }
        {
            let pit = pit.clone();
            let now = now.clone();
            let mut handlers = PortHandlers::default();
            handlers.read8 = Some(Box::new(move |_p| pit.borrow_mut().speaker_read(now())));
            let pit = pit.clone();
            handlers.write8 = Some(Box::new(move |_p, v| pit.borrow_mut().speaker_write(v)));
            bus.register_range(ports::PC_SPEAKER, 1, handlers);
        }
        let reset_pit = pit;
        bus.register_reset(Box::new(move || reset_pit.borrow_mut().reset()));
    }
}

impl Tickable for Pit {
    /// `pit_next` in the source, split across the `Tickable` seam: this half
    /// is the pure `refill_count - count` deadline the source computes;
    /// [`Pit::run`] performs the IRQ pulse and `pit_last_count` bookkeeping
    /// that the source interleaves into the same call.
    fn next_deadline(&self, now: u64) -> Option<u64> {
        let chan0 = &self.chan[0];
        if !chan0.timer_running {
            return None;
        }
        let count = chan0.get_count(now, self.ticks_per_second);
        let refill = chan0.count;
        Some(counter_to_ticks(refill.wrapping_sub(count), self.ticks_per_second))
    }

    fn run(&mut self, now: u64) {
        let tps = self.ticks_per_second;
        let count = self.chan[0].get_count(now, tps);
        let rolled_over = count > self.chan[0].pit_last_count;
        if !self.chan[0].timer_running {
            return;
        }
        if rolled_over {
            self.pulse_irq0();
            let chan0 = &mut self.chan[0];
            if chan0.mode != 2 && chan0.mode != 3 {
                chan0.timer_running = false;
                return;
            }
        }
        self.chan[0].pit_last_count = count;
    }
}

impl IoSnapshot for Pit {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        for (i, chan) in self.chan.iter().enumerate() {
            let obj = format!("pit.chan[{i}]");
            put_u32(sink, &obj, "count", chan.count);
            put_u32(sink, &obj, "interim_count", chan.interim_count);
            put_u8(sink, &obj, "mode", chan.mode);
            put_u8(sink, &obj, "bcd", chan.bcd as u8);
            put_u8(sink, &obj, "gate", chan.gate as u8);
            put_u8(sink, &obj, "rw_mode", chan.rw_mode);
            put_u8(sink, &obj, "rmode", chan.rmode);
            put_u8(sink, &obj, "wmode", chan.wmode);
            put_u8(sink, &obj, "status_latch", chan.status_latch);
            put_u8(sink, &obj, "whats_latched", chan.whats_latched);
            put_u32(sink, &obj, "counter_latch", chan.counter_latch as u32);
            put_u64(sink, &obj, "last_load_time", chan.last_load_time);
            put_u32(sink, &obj, "pit_last_count", chan.pit_last_count);
            put_u8(sink, &obj, "timer_flipflop", chan.timer_flipflop);
            put_u8(sink, &obj, "timer_running", chan.timer_running as u8);
        }
        put_u8(sink, "pit", "speaker_gate", self.speaker_gate);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
        for (i, chan) in self.chan.iter_mut().enumerate() {
            let obj = format!("pit.chan[{i}]");
            chan.count = get_u32(src, &obj, "count")?;
            chan.interim_count = get_u32(src, &obj, "interim_count")?;
            chan.mode = get_u8(src, &obj, "mode")?;
            chan.bcd = get_u8(src, &obj, "bcd")? != 0;
            chan.gate = get_u8(src, &obj, "gate")? != 0;
            chan.rw_mode = get_u8(src, &obj, "rw_mode")?;
            chan.rmode = get_u8(src, &obj, "rmode")?;
            chan.wmode = get_u8(src, &obj, "wmode")?;
            chan.status_latch = get_u8(src, &obj, "status_latch")?;
            chan.whats_latched = get_u8(src, &obj, "whats_latched")?;
            chan.counter_latch = get_u32(src, &obj, "counter_latch")? as u16;
            chan.last_load_time = get_u64(src, &obj, "last_load_time")?;
            chan.pit_last_count = get_u32(src, &obj, "pit_last_count")?;
            chan.timer_flipflop = get_u8(src, &obj, "timer_flipflop")?;
            chan.timer_running = get_u8(src, &obj, "timer_running")? != 0;
        }
        self.speaker_gate = get_u8(src, "pit", "speaker_gate")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode2_write_raises_irq0_immediately() {
        let pit = Rc::new(RefCell::new(Pit::new(1_000_000)));
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = fired.clone();
        pit.borrow_mut()
            .set_on_irq0(Box::new(move |raise| sink.borrow_mut().push(raise)));

        let mut bus = IoPortBus::new();
        let now_cell = Rc::new(RefCell::new(0u64));
        let now_for_reg = now_cell.clone();
        Pit::register_ports(pit.clone(), &mut bus, move || *now_for_reg.borrow());

        // channel 0, access=word(3), mode=2 (rate generator): 00 11 010 0
        bus.write_u8(ports::PIT_CMD, 0b00_11_010_0);
        assert_eq!(*fired.borrow(), vec![true]);
    }

    #[test]
    fn lsb_only_write_reads_back_truncated_count() {
        let pit = Rc::new(RefCell::new(Pit::new(1_193_182)));
        let mut bus = IoPortBus::new();
        let now_cell = Rc::new(RefCell::new(0u64));
        let now_for_reg = now_cell.clone();
        Pit::register_ports(pit.clone(), &mut bus, move || *now_for_reg.borrow());

        // channel 0, access=lobyte(1), mode=0: 00 01 000 0
        bus.write_u8(ports::PIT_CMD, 0b00_01_000_0);
        bus.write_u8(ports::PIT_CH0, 100);
        let readback = bus.read_u8(ports::PIT_CH0);
        assert_eq!(readback, 100);
    }

    #[test]
    fn latch_then_read_freezes_counter_value() {
        let pit = Rc::new(RefCell::new(Pit::new(1_193_182)));
        let mut bus = IoPortBus::new();
        let now_cell = Rc::new(RefCell::new(0u64));
        let now_for_reg = now_cell.clone();
        Pit::register_ports(pit.clone(), &mut bus, move || *now_for_reg.borrow());

        bus.write_u8(ports::PIT_CMD, 0b00_11_000_0); // word mode, mode 0
        bus.write_u8(ports::PIT_CH0, 0x34);
        bus.write_u8(ports::PIT_CH0, 0x12);
        // Latch channel 0's counter.
        bus.write_u8(ports::PIT_CMD, 0b00_00_000_0);
        *now_cell.borrow_mut() = 50_000;
        let lo = bus.read_u8(ports::PIT_CH0);
        let hi = bus.read_u8(ports::PIT_CH0);
        assert_eq!(u16::from_le_bytes([lo, hi]), 0x1234);
    }
}
