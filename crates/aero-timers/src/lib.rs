//! The timer scheduler (spec.md §4.7): polls every timed device for its
//! next-deadline in ticks and returns the minimum, clamped to a ceiling so a
//! device that claims to sleep forever cannot stall the execution loop.
//!
//! REDESIGN FLAGS §9 asks for "a uniform `Tickable { next_deadline(now) ->
//! Option<ticks>, run(now) }` and a min-heap" in place of the source's
//! `device_next_N` function family (`original_source/src/pc.c`:
//! `devices_get_next_raw`/`devices_get_next`); this crate is that seam.

/// The ceiling a single scheduling quantum is clamped to (spec.md §4.7).
/// Anything beyond this becomes `devices_need_servicing` for the caller.
pub const MAX_QUANTUM_TICKS: u64 = 200_000;

/// A device that can be asked, in tick units, how long until it next needs
/// attention, and then be driven forward to that point.
pub trait Tickable {
    /// Ticks from `now` until this device's next deadline, or `None` if it
    /// is not currently running (e.g. a PIT channel with `count == 0` in a
    /// non-counting mode).
    fn next_deadline(&self, now: u64) -> Option<u64>;

    /// Run the device's time-driven state transition at `now`. Called by the
    /// owner once its deadline has been reached.
    fn run(&mut self, now: u64);
}

/// Polls a fixed set of [`Tickable`] devices and reports the minimum
/// next-deadline, clamped to [`MAX_QUANTUM_TICKS`].
#[derive(Default)]
pub struct Scheduler;

/// Result of polling every registered device for its next deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantum {
    /// Ticks the CPU may run before a device needs servicing, already
    /// clamped to [`MAX_QUANTUM_TICKS`].
    pub cycles_to_run: u64,
    /// The portion of the true minimum deadline that the clamp cut off;
    /// zero unless the real minimum exceeded the ceiling.
    pub devices_need_servicing: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Poll `devices` (each paired with its current `now`, since every
    /// device shares the same wall clock) and compute the next quantum.
    /// Devices with no deadline are skipped; if none has one, the quantum is
    /// the full ceiling.
    pub fn next_quantum(&self, now: u64, devices: &[&dyn Tickable]) -> Quantum {
        let min_deadline = devices
            .iter()
            .filter_map(|d| d.next_deadline(now))
            .min()
            .unwrap_or(MAX_QUANTUM_TICKS);

        if min_deadline > MAX_QUANTUM_TICKS {
            Quantum {
                cycles_to_run: MAX_QUANTUM_TICKS,
                devices_need_servicing: min_deadline - MAX_QUANTUM_TICKS,
            }
        } else {
            Quantum {
                cycles_to_run: min_deadline,
                devices_need_servicing: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeDevice {
        deadline: Option<u64>,
        ran_at: Cell<Option<u64>>,
    }

    impl Tickable for FakeDevice {
        fn next_deadline(&self, _now: u64) -> Option<u64> {
            self.deadline
        }

        fn run(&mut self, now: u64) {
            self.ran_at.set(Some(now));
        }
    }

    #[test]
    fn returns_minimum_deadline_across_devices() {
        let a = FakeDevice {
            deadline: Some(500),
            ran_at: Cell::new(None),
        };
        let b = FakeDevice {
            deadline: Some(120),
            ran_at: Cell::new(None),
        };
        let c = FakeDevice {
            deadline: None,
            ran_at: Cell::new(None),
        };
        let scheduler = Scheduler::new();
        let q = scheduler.next_quantum(0, &[&a, &b, &c]);
        assert_eq!(q.cycles_to_run, 120);
        assert_eq!(q.devices_need_servicing, 0);
    }

    #[test]
    fn clamps_to_ceiling_and_reports_remainder() {
        let a = FakeDevice {
            deadline: Some(MAX_QUANTUM_TICKS + 12_345),
            ran_at: Cell::new(None),
        };
        let scheduler = Scheduler::new();
        let q = scheduler.next_quantum(0, &[&a]);
        assert_eq!(q.cycles_to_run, MAX_QUANTUM_TICKS);
        assert_eq!(q.devices_need_servicing, 12_345);
    }

    #[test]
    fn no_deadline_device_yields_full_ceiling() {
        let a = FakeDevice {
            deadline: None,
            ran_at: Cell::new(None),
        };
        let scheduler = Scheduler::new();
        let q = scheduler.next_quantum(0, &[&a]);
        assert_eq!(q.cycles_to_run, MAX_QUANTUM_TICKS);
        assert_eq!(q.devices_need_servicing, 0);
    }
}
