//! Interrupt routing: the 8259 PIC pair and the I/O APIC, plus the fan-out
//! between them (spec.md §4.2).

mod ioapic;
mod pic;
mod router;

pub use ioapic::{
    ExtIntSource, InterruptSink, IoApic, RecordingSink, DELIVERY_EXTINT, DELIVERY_FIXED,
    DELIVERY_INIT, DELIVERY_LOWEST_PRIORITY, DELIVERY_NMI, DELIVERY_SMI, NUM_PINS,
};
pub use pic::Pic;
pub use router::InterruptRouter;
