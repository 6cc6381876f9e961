//! Fan-out between the PIC and the I/O APIC (spec.md §4.2): "When both PIC
//! and I/O APIC are enabled, `pic_raise_irq(n)` also calls
//! `ioapic_raise_irq(n)`."

use crate::ioapic::{ExtIntSource, InterruptSink, IoApic};
use crate::pic::Pic;

/// Feeds the PIC's next vector to the I/O APIC's ExtINT delivery-mode
/// substitution, so a line that two programmable controllers both claim is
/// still resolved to a single vector.
struct PicExtIntSource<'a> {
    pic: &'a mut Pic,
}

impl ExtIntSource for PicExtIntSource<'_> {
    fn next_vector(&mut self) -> u8 {
        self.pic.get_interrupt().unwrap_or(0)
    }
}

/// Owns the PIC and an optional I/O APIC, and presents the single
/// `raise_irq`/`lower_irq` surface devices drive.
pub struct InterruptRouter {
    pic: Pic,
    ioapic: Option<IoApic>,
}

impl InterruptRouter {
    pub fn new() -> Self {
        Self {
            pic: Pic::new(),
            ioapic: None,
        }
    }

    pub fn with_ioapic(base: u64) -> Self {
        Self {
            pic: Pic::new(),
            ioapic: Some(IoApic::new(base)),
        }
    }

    pub fn pic(&self) -> &Pic {
        &self.pic
    }

    pub fn pic_mut(&mut self) -> &mut Pic {
        &mut self.pic
    }

    pub fn ioapic(&self) -> Option<&IoApic> {
        self.ioapic.as_ref()
    }

    pub fn ioapic_mut(&mut self) -> Option<&mut IoApic> {
        self.ioapic.as_mut()
    }

    pub fn reset(&mut self) {
        self.pic.reset();
        if let Some(ioapic) = &mut self.ioapic {
            ioapic.reset();
        }
    }

    /// Raises guest-visible IRQ `line` (0-15) on the PIC, and additionally
    /// on the I/O APIC if one is present and forwarding is enabled.
    pub fn raise_irq(&mut self, line: u8, sink: &mut dyn InterruptSink) {
        self.pic.raise_irq(line);
        if self.pic.ioapic_forwarding() {
            if let Some(ioapic) = &mut self.ioapic {
                let mut ext_int = PicExtIntSource { pic: &mut self.pic };
                ioapic.raise_irq(line, sink, &mut ext_int);
            }
        }
    }

    pub fn lower_irq(&mut self, line: u8) {
        self.pic.lower_irq(line);
        if self.pic.ioapic_forwarding() {
            if let Some(ioapic) = &mut self.ioapic {
                ioapic.lower_irq(line);
            }
        }
    }

    /// Disjoint mutable borrows of both controllers at once, for callers
    /// (savestate) that need `&mut Pic` and `Option<&mut IoApic>`
    /// simultaneously and can't get there through two sequential
    /// `pic_mut()`/`ioapic_mut()` calls.
    pub fn as_snapshot_parts(&mut self) -> (&mut Pic, Option<&mut IoApic>) {
        (&mut self.pic, self.ioapic.as_mut())
    }
}

impl Default for InterruptRouter {
    fn default() -> Self {
        Self::new()
    }
}
