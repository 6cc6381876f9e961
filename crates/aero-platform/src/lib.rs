//! The platform-level glue devices that sit directly on the I/O bus rather
//! than behind a higher-level controller: the DMA engine, the A20 gate, and
//! the BIOS "Shutdown" string watcher (spec.md §4.2, §4.3).

mod a20;
mod dma;
mod shutdown;

pub use a20::{A20Gate, A20LineCallback};
pub use dma::{Dma8237, TransferDirection};
pub use shutdown::{ShutdownCallback, ShutdownWatcher};
