//! Device models built on top of `memory`'s I/O bus, `aero-interrupts`'
//! router, and `aero-storage`'s block layer: the PIT, the floppy disk
//! controller, and the two IDE/ATA channels (spec.md §4.4-4.6).

mod ata;
mod fdc;
mod pit;

pub use ata::{AtaController, AtaGeometry, AtaIrqCallback};
pub use fdc::{Fdc, FdcError, FdcIrqCallback, FloppyGeometry};
pub use pit::{Pit, PitIrqCallback, PIT_CLOCK_SPEED};
