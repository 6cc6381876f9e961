//! The machine harness (spec.md §1-§2, §4.7, §6): wires every other crate in
//! the workspace into one guest-addressable machine, owns the wall clock,
//! and implements the `pc_execute` cooperative scheduling loop described in
//! `original_source/src/pc.c`.
//!
//! Non-goal per spec.md §1: the CPU instruction decoder. [`CpuExecutor`] is
//! the seam a real decoder plugs into; [`PcPlatform::run_slice`] is written
//! and tested entirely against a scripted fake.

pub mod cmos;
pub mod config;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use aero_devices::{AtaController, AtaGeometry, Fdc, FloppyGeometry, Pit};
use aero_interrupts::{InterruptRouter, RecordingSink};
use aero_io_snapshot::io::state::IoSnapshot;
use aero_pc_constants::{irq, mmio, ports};
use aero_platform::{A20Gate, Dma8237, ShutdownWatcher};
use aero_time::{Clock, DEFAULT_TICKS_PER_SECOND};
use aero_timers::{Scheduler, Tickable};
use memory::{FlatMemory, IoPortBus, MemoryBus, MmioBus, MmioHandlers, PortHandlers};

pub use config::{AtaDriveConfig, BootDevice, ConfigError, DriveImage, FloppyDriveConfig, MachineConfig};

/// How `cpu_run` left off, per spec.md §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Ran every requested cycle; the loop should keep going.
    Normal,
    /// Stopped on `HLT`; the harness should skip wall-clock time forward.
    Halt,
    /// Stopped to let an async drive completion or similar event resolve.
    Async,
}

/// The out-of-scope CPU instruction decoder's seam into the execution loop
/// (spec.md §4.7, §9's "cooperative `Result` returned from the CPU loop").
/// A real implementation decodes and retires up to `cycles` worth of
/// instructions against the harness's [`IoPortBus`]/[`MmioBus`]/guest
/// memory, consulting [`PcPlatform::pic_has_interrupt`] for interrupt
/// injection between instructions.
pub trait CpuExecutor {
    fn run(&mut self, cycles: u64) -> (u64, ExitReason);
}

/// Guest-physical RAM, with the A20 gate's address-line-20 mask applied on
/// every access (spec.md §4.2: "the memory bus is expected to mask address
/// bit 20"). Matches real hardware: the gate physically disconnects line 20
/// for every access while disabled, not just ones that would wrap past 1MB.
pub struct GuestMemory {
    flat: FlatMemory,
    a20_enabled: Rc<Cell<bool>>,
}

impl GuestMemory {
    fn new(size: usize, a20_enabled: Rc<Cell<bool>>) -> Self {
        Self {
            flat: FlatMemory::new(size),
            a20_enabled,
        }
    }

    fn mask(&self, addr: u64) -> u64 {
        if self.a20_enabled.get() {
            addr
        } else {
            addr & !(1u64 << 20)
        }
    }
}

impl MemoryBus for GuestMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        self.flat.read_bytes(self.mask(addr), buf);
    }

    fn write_bytes(&mut self, addr: u64, buf: &[u8]) {
        let addr = self.mask(addr);
        self.flat.write_bytes(addr, buf);
    }
}

/// Outcome of one [`PcPlatform::run_slice`] call.
pub struct RunSliceOutcome {
    /// Wall-clock milliseconds the host should sleep before calling again;
    /// zero means "call again immediately" (spec.md §4.7 step 6).
    pub sleep_ms: u64,
    /// A just-produced savestate blob, present every
    /// [`PcPlatform::CHECKPOINT_INTERVAL`]th call (spec.md §4.7 step 1;
    /// `original_source/src/pc.c`'s `SYNC_POINTS_PER_SECOND`).
    pub checkpoint: Option<Vec<u8>>,
}

/// The whole machine: one owning value per REDESIGN FLAGS §9's "keep the
/// whole machine in a single owning value." Devices reachable both from
/// port dispatch and from DMA/async-drive completion callbacks are held in
/// `Rc<RefCell<_>>`, grounded on
/// `other_examples/d3fbff7e_dbalsom-martypc__src-machine.rs.rs`.
pub struct PcPlatform {
    io: IoPortBus,
    mmio: MmioBus,
    mem: Rc<RefCell<GuestMemory>>,
    router: Rc<RefCell<InterruptRouter>>,
    cpu_sink: Rc<RefCell<RecordingSink>>,
    a20: Rc<RefCell<A20Gate>>,
    dma: Rc<RefCell<Dma8237>>,
    shutdown: Rc<RefCell<ShutdownWatcher>>,
    cmos: Rc<RefCell<cmos::CmosRam>>,
    pit: Rc<RefCell<Pit>>,
    fdc: Rc<RefCell<Fdc>>,
    ata: [Rc<RefCell<AtaController>>; 2],
    clock: Rc<Cell<Clock>>,
    cycles_executed: Rc<Cell<u64>>,
    scheduler: Scheduler,
    halted: Rc<Cell<bool>>,
    checkpoint_counter: u32,
}

impl PcPlatform {
    /// `original_source/src/pc.c`'s `SYNC_POINTS_PER_SECOND`: the machine is
    /// checkpointed once every this-many `run_slice` calls.
    pub const CHECKPOINT_INTERVAL: u32 = 8;
    /// `pc_execute`'s `frames = 10`: how many quantums run back-to-back
    /// before returning control to the host unconditionally.
    const MAX_ITERATIONS_PER_SLICE: u32 = 10;

    pub fn new(config: MachineConfig) -> Result<Self, ConfigError> {
        let a20_enabled = Rc::new(Cell::new(true));
        let mem = Rc::new(RefCell::new(GuestMemory::new(config.memory_bytes, a20_enabled.clone())));

        let a20 = Rc::new(RefCell::new(A20Gate::new()));
        {
            let flag = a20_enabled;
            a20.borrow_mut().set_on_line_change(Box::new(move |enabled| flag.set(enabled)));
        }

        let dma = Rc::new(RefCell::new(Dma8237::new()));

        let halted = Rc::new(Cell::new(false));
        let shutdown = Rc::new(RefCell::new(ShutdownWatcher::new()));
        {
            let halted = halted.clone();
            shutdown.borrow_mut().set_on_shutdown(Box::new(move || halted.set(true)));
        }

        let router = Rc::new(RefCell::new(if config.apic_enabled {
            InterruptRouter::with_ioapic(mmio::IOAPIC_BASE)
        } else {
            InterruptRouter::new()
        }));
        router.borrow_mut().pic_mut().set_ioapic_forwarding(config.apic_enabled);
        let cpu_sink = Rc::new(RefCell::new(RecordingSink::default()));

        let cmos_ram = Rc::new(RefCell::new(cmos::CmosRam::new()));
        cmos::seed(&mut cmos_ram.borrow_mut(), &config);

        let mut platform_clock = Clock::new(DEFAULT_TICKS_PER_SECOND);
        platform_clock.seed_from_seconds(config.now_seconds);
        let clock = Rc::new(Cell::new(platform_clock));
        let cycles_executed = Rc::new(Cell::new(0u64));

        let pit = Rc::new(RefCell::new(Pit::new(platform_clock.ticks_per_second())));

        Self::wire_irq_pit(&pit, &router, &cpu_sink);

        let fdc = Fdc::new_shared();
        fdc.borrow_mut().set_dma(dma.clone());
        Self::wire_irq_fdc(&fdc, &router, &cpu_sink);

        let ata_primary = AtaController::new_shared();
        Self::wire_irq_ata(&ata_primary, &router, &cpu_sink, irq::ATA_PRIMARY);
        let ata_secondary = AtaController::new_shared();
        Self::wire_irq_ata(&ata_secondary, &router, &cpu_sink, irq::ATA_SECONDARY);

        let MachineConfig { ata, floppy, .. } = config;
        let mut ata_slots = ata.into_iter();
        let pri_master = ata_slots.next().flatten();
        let pri_slave = ata_slots.next().flatten();
        let sec_master = ata_slots.next().flatten();
        let sec_slave = ata_slots.next().flatten();
        Self::attach_ata(&ata_primary, 0, pri_master)?;
        Self::attach_ata(&ata_primary, 1, pri_slave)?;
        Self::attach_ata(&ata_secondary, 0, sec_master)?;
        Self::attach_ata(&ata_secondary, 1, sec_slave)?;

        let mut floppy_slots = floppy.into_iter();
        let fda = floppy_slots.next().flatten();
        let fdb = floppy_slots.next().flatten();
        Self::attach_floppy(&fdc, 0, fda)?;
        Self::attach_floppy(&fdc, 1, fdb)?;

        let mut io = IoPortBus::new();
        let mut mmio_bus = MmioBus::new();

        {
            let clock = clock.clone();
            let cycles_executed = cycles_executed.clone();
            let now = move || clock.get().now(cycles_executed.get());
            Pit::register_ports(pit.clone(), &mut io, now);
        }
        Self::wire_fdc_data_port(&fdc, &dma, &mem, &mut io);
        Fdc::register_ports(fdc.clone(), &mut io);
        AtaController::register_ports(
            ata_primary.clone(),
            &mut io,
            ports::ATA_PRIMARY_CMD_BASE,
            ports::ATA_PRIMARY_CTRL,
        );
        AtaController::register_ports(
            ata_secondary.clone(),
            &mut io,
            ports::ATA_SECONDARY_CMD_BASE,
            ports::ATA_SECONDARY_CTRL,
        );
        cmos::CmosRam::register_ports(cmos_ram.clone(), &mut io);
        A20Gate::register_ports(a20.clone(), &mut io);
        ShutdownWatcher::register_ports(shutdown.clone(), &mut io);
        Dma8237::register_ports(dma.clone(), &mut io);
        Self::wire_pic_ports(&router, &mut io);
        Self::wire_ioapic_mmio(&router, &mut mmio_bus);

        {
            let a20 = a20.clone();
            io.register_reset(Box::new(move || a20.borrow_mut().reset()));
        }
        {
            let shutdown = shutdown.clone();
            io.register_reset(Box::new(move || shutdown.borrow_mut().reset()));
        }
        {
            let router = router.clone();
            io.register_reset(Box::new(move || router.borrow_mut().reset()));
        }
        {
            let dma = dma.clone();
            io.register_reset(Box::new(move || dma.borrow_mut().reset()));
        }

        let platform = Self {
            io,
            mmio: mmio_bus,
            mem,
            router,
            cpu_sink,
            a20,
            dma,
            shutdown,
            cmos: cmos_ram,
            pit,
            fdc,
            ata: [ata_primary, ata_secondary],
            clock,
            cycles_executed,
            scheduler: Scheduler::new(),
            halted,
            checkpoint_counter: 0,
        };

        Ok(platform)
    }

    fn wire_irq_pit(pit: &Rc<RefCell<Pit>>, router: &Rc<RefCell<InterruptRouter>>, sink: &Rc<RefCell<RecordingSink>>) {
        let router = router.clone();
        let sink = sink.clone();
        pit.borrow_mut().set_on_irq0(Box::new(move |level| {
            let mut router = router.borrow_mut();
            if level {
                router.raise_irq(irq::PIT, &mut *sink.borrow_mut());
            } else {
                router.lower_irq(irq::PIT);
            }
        }));
    }

    fn wire_irq_fdc(fdc: &Rc<RefCell<Fdc>>, router: &Rc<RefCell<InterruptRouter>>, sink: &Rc<RefCell<RecordingSink>>) {
        let router = router.clone();
        let sink = sink.clone();
        fdc.borrow_mut().set_on_irq6(Box::new(move |level| {
            let mut router = router.borrow_mut();
            if level {
                router.raise_irq(irq::FLOPPY, &mut *sink.borrow_mut());
            } else {
                router.lower_irq(irq::FLOPPY);
            }
        }));
    }

    fn wire_irq_ata(
        ata: &Rc<RefCell<AtaController>>,
        router: &Rc<RefCell<InterruptRouter>>,
        sink: &Rc<RefCell<RecordingSink>>,
        line: u8,
    ) {
        let router = router.clone();
        let sink = sink.clone();
        ata.borrow_mut().set_on_irq(Box::new(move |level| {
            let mut router = router.borrow_mut();
            if level {
                router.raise_irq(line, &mut *sink.borrow_mut());
            } else {
                router.lower_irq(line);
            }
        }));
    }

    fn attach_ata(
        ata: &Rc<RefCell<AtaController>>,
        index: usize,
        slot: Option<AtaDriveConfig>,
    ) -> Result<(), ConfigError> {
        let Some(drive_cfg) = slot else { return Ok(()) };
        let geometry: AtaGeometry = drive_cfg.geometry;
        let total_sectors = drive_cfg.total_sectors;
        let model = drive_cfg.model;
        let serial = drive_cfg.serial;
        let drive = drive_cfg.image.into_drive()?;
        ata.borrow_mut().attach_drive(index, drive, geometry, total_sectors, model, serial);
        Ok(())
    }

    fn attach_floppy(
        fdc: &Rc<RefCell<Fdc>>,
        index: usize,
        slot: Option<FloppyDriveConfig>,
    ) -> Result<(), ConfigError> {
        let Some(drive_cfg) = slot else { return Ok(()) };
        let geometry: FloppyGeometry = drive_cfg.geometry;
        let write_protected = drive_cfg.write_protected;
        let drive = drive_cfg.image.into_drive()?;
        fdc.borrow_mut().insert_drive(index, drive, geometry, write_protected);
        Ok(())
    }

    /// Registers the FDC's data/command port (`0x3F5`) ourselves, ahead of
    /// [`Fdc::register_ports`], so every write is wrapped with guest-memory
    /// staging around [`Fdc::write_data_fifo_port`]. [`IoPortBus::write_u8`]
    /// dispatches to the first registered range that contains a port, so
    /// this registration shadows (and makes unreachable) the data-port
    /// handler `Fdc::register_ports` installs afterward for the same port;
    /// its DOR/MSR/DIR handlers and reset callback are unaffected since they
    /// occupy different ports.
    ///
    /// `Fdc::pump_dma`'s doc comment is explicit that "the actual `dmabuf`
    /// <-> guest memory copy ... is the caller's responsibility". A
    /// write-type command consumes `dmabuf` synchronously at the start of
    /// `do_transfer`, before `pump_dma` ever runs, so the guest's source
    /// bytes must already be staged into `dmabuf` before this port write is
    /// dispatched; a read-type command leaves fresh disk data in `dmabuf`
    /// with the DMA engine's address already advanced by the time this call
    /// returns, so copying `[addr_before, addr_after)` out afterward is
    /// sufficient. Async drive completions are handled the same way by
    /// [`PcPlatform::service_pending_io`].
    fn wire_fdc_data_port(
        fdc: &Rc<RefCell<Fdc>>,
        dma: &Rc<RefCell<Dma8237>>,
        mem: &Rc<RefCell<GuestMemory>>,
        bus: &mut IoPortBus,
    ) {
        let mut handlers = PortHandlers::default();
        {
            let fdc = fdc.clone();
            handlers.read8 = Some(Box::new(move |_p| fdc.borrow_mut().read_data_fifo_port()));
        }
        {
            let fdc = fdc.clone();
            let dma = dma.clone();
            let mem = mem.clone();
            handlers.write8 = Some(Box::new(move |_p, value| {
                let addr_before = dma.borrow().current_physical_address(2) as u64;
                let mut staging = [0u8; 512];
                mem.borrow().read_bytes(addr_before, &mut staging);
                fdc.borrow_mut().dma_buffer_mut()[..512].copy_from_slice(&staging);

                fdc.borrow_mut().write_data_fifo_port(value);

                let addr_after = dma.borrow().current_physical_address(2) as u64;
                if addr_after != addr_before {
                    let n = addr_after.wrapping_sub(addr_before) as usize;
                    let data = fdc.borrow().dma_buffer()[..n].to_vec();
                    mem.borrow_mut().write_bytes(addr_before, &data);
                }
            }));
        }
        bus.register_range(ports::FDC_DATA, 1, handlers);
    }

    fn wire_pic_ports(router: &Rc<RefCell<InterruptRouter>>, bus: &mut IoPortBus) {
        for &port in &[ports::PIC1_CMD, ports::PIC1_DATA, ports::PIC2_CMD, ports::PIC2_DATA] {
            let mut handlers = PortHandlers::default();
            {
                let router = router.clone();
                handlers.read8 = Some(Box::new(move |p| router.borrow_mut().pic_mut().io_read(p)));
            }
            {
                let router = router.clone();
                handlers.write8 = Some(Box::new(move |p, v| router.borrow_mut().pic_mut().io_write(p, v)));
            }
            bus.register_range(port, 1, handlers);
        }
    }

    fn wire_ioapic_mmio(router: &Rc<RefCell<InterruptRouter>>, bus: &mut MmioBus) {
        let mut handlers = MmioHandlers::default();
        {
            let router = router.clone();
            handlers.read = Some(Box::new(move |addr| {
                let offset = addr - mmio::IOAPIC_BASE;
                router
                    .borrow_mut()
                    .ioapic_mut()
                    .map(|a| a.mmio_read32(offset))
                    .unwrap_or(0xFFFF_FFFF)
            }));
        }
        {
            let router = router.clone();
            handlers.write = Some(Box::new(move |addr, value| {
                let offset = addr - mmio::IOAPIC_BASE;
                if let Some(apic) = router.borrow_mut().ioapic_mut() {
                    apic.mmio_write32(offset, value);
                }
            }));
        }
        bus.register_range(mmio::IOAPIC_BASE, mmio::IOAPIC_LEN, handlers);
        // Local APIC: address-space reservation only (spec.md §6); no local
        // APIC device is modeled, so this page reads all-ones/drops writes
        // exactly like an unmapped page would, registered only to make the
        // reservation explicit in the dispatch table.
        bus.register_range(mmio::LOCAL_APIC_BASE, mmio::LOCAL_APIC_LEN, MmioHandlers::default());
    }

    /// Guest-physical memory, shared so a [`CpuExecutor`] can perform its
    /// own loads/stores and DMA-adjacent code can stage transfers.
    pub fn memory(&self) -> Rc<RefCell<GuestMemory>> {
        self.mem.clone()
    }

    pub fn io_bus(&mut self) -> &mut IoPortBus {
        &mut self.io
    }

    pub fn mmio_bus(&mut self) -> &mut MmioBus {
        &mut self.mmio
    }

    /// Whether the `"Shutdown"` string watcher has fired (spec.md §6).
    pub fn is_halted(&self) -> bool {
        self.halted.get()
    }

    /// spec.md §4.2's `pic_has_interrupt()`, exposed for a [`CpuExecutor`]
    /// deciding whether to inject an interrupt at the next boundary.
    pub fn pic_has_interrupt(&self) -> bool {
        self.router.borrow().pic().has_interrupt()
    }

    /// spec.md §4.2's `pic_get_interrupt()`.
    pub fn pic_acknowledge(&mut self) -> Option<u8> {
        self.router.borrow_mut().pic_mut().get_interrupt()
    }

    /// Drains every local-APIC bus message (vector, delivery mode,
    /// level-triggered) raised since the last call, for a [`CpuExecutor`]
    /// modeling a local APIC to consume (spec.md §2: "a single IRQ-pending
    /// line visible to the CPU").
    pub fn take_pending_apic_messages(&self) -> Vec<(u8, u8, bool)> {
        std::mem::take(&mut self.cpu_sink.borrow_mut().messages)
    }

    /// spec.md §4.7 `drive_check_complete()`: drains both IDE channels and
    /// the FDC, mirroring any floppy DMA transfer that completed
    /// asynchronously into guest memory (see [`Self::wire_fdc_data_port`]).
    fn service_pending_io(&self) {
        self.ata[0].borrow_mut().drive_check_complete();
        self.ata[1].borrow_mut().drive_check_complete();

        let addr_before = self.dma.borrow().current_physical_address(2) as u64;
        self.fdc.borrow_mut().drive_check_complete();
        let addr_after = self.dma.borrow().current_physical_address(2) as u64;
        if addr_after != addr_before {
            let n = addr_after.wrapping_sub(addr_before) as usize;
            let data = self.fdc.borrow().dma_buffer()[..n].to_vec();
            self.mem.borrow_mut().write_bytes(addr_before, &data);
        }
    }

    /// spec.md §4.7's `pc_execute`, run against a [`CpuExecutor`]. Returns
    /// the wall-clock sleep the host owes once control is handed back.
    pub fn run_slice(&mut self, cpu: &mut dyn CpuExecutor) -> RunSliceOutcome {
        let checkpoint = if self.checkpoint_counter + 1 >= Self::CHECKPOINT_INTERVAL {
            self.checkpoint_counter = 0;
            Some(self.save_snapshot())
        } else {
            self.checkpoint_counter += 1;
            None
        };

        self.service_pending_io();

        for iteration in 0..Self::MAX_ITERATIONS_PER_SLICE {
            let now = self.clock.get().now(self.cycles_executed.get());
            let quantum = {
                let pit = self.pit.borrow();
                let devices: [&dyn Tickable; 1] = [&*pit];
                self.scheduler.next_quantum(now, &devices)
            };

            let (cycles_run, exit_reason) = cpu.run(quantum.cycles_to_run);
            self.cycles_executed.set(self.cycles_executed.get() + cycles_run);

            match exit_reason {
                ExitReason::Normal => {
                    let now = self.clock.get().now(self.cycles_executed.get());
                    self.pit.borrow_mut().run(now);
                    if iteration + 1 == Self::MAX_ITERATIONS_PER_SLICE {
                        return RunSliceOutcome { sleep_ms: 0, checkpoint };
                    }
                }
                ExitReason::Halt | ExitReason::Async => {
                    let mut skip = quantum.cycles_to_run.saturating_sub(cycles_run);
                    if exit_reason == ExitReason::Halt {
                        skip += quantum.devices_need_servicing;
                    }
                    let mut clock = self.clock.get();
                    clock.advance(skip);
                    self.clock.set(clock);
                    let now = clock.now(self.cycles_executed.get());
                    self.pit.borrow_mut().run(now);
                    let sleep_ms = skip * 1000 / clock.ticks_per_second();
                    return RunSliceOutcome { sleep_ms, checkpoint };
                }
            }
        }

        RunSliceOutcome { sleep_ms: 0, checkpoint }
    }

    /// `io_trigger_reset()` (spec.md §3): resets every registered device.
    /// PIT/FDC/ATA register their own reset callback as part of their own
    /// `register_ports`; A20, the shutdown watcher, the interrupt router,
    /// and the DMA controller have no port uniquely theirs to hang one off,
    /// so [`PcPlatform::new`] registers those four itself. CMOS is
    /// deliberately untouched: real CMOS/RTC contents survive a reset.
    pub fn reset(&mut self) {
        self.io.io_trigger_reset();
    }

    /// Serializes every device into one labelled blob (spec.md §6
    /// savestate). The machine must be quiesced (between `run_slice`
    /// calls) for the result to be meaningful, per spec.md §5.
    pub fn save_snapshot(&self) -> Vec<u8> {
        let router = self.router.borrow();
        let cmos = self.cmos.borrow();
        let pit = self.pit.borrow();
        let fdc = self.fdc.borrow();
        let ata0 = self.ata[0].borrow();
        let ata1 = self.ata[1].borrow();
        let a20 = self.a20.borrow();
        let dma = self.dma.borrow();
        let shutdown = self.shutdown.borrow();

        let mut devices: Vec<(&str, &dyn IoSnapshot)> = vec![
            ("cmos", &*cmos),
            ("pit", &*pit),
            ("fdc", &*fdc),
            ("ata.primary", &*ata0),
            ("ata.secondary", &*ata1),
            ("a20", &*a20),
            ("dma", &*dma),
            ("shutdown_watcher", &*shutdown),
            ("pic", router.pic()),
        ];
        if let Some(ioapic) = router.ioapic() {
            devices.push(("ioapic", ioapic));
        }
        aero_snapshot::io_snapshot::save_all(&devices)
    }

    /// Restores a blob produced by [`Self::save_snapshot`]. Bit-exact
    /// restore is an all-or-nothing contract (spec.md §6); any mismatch
    /// aborts without partially applying state.
    pub fn restore_snapshot(&mut self, blob: &[u8]) -> Result<(), aero_snapshot::SnapshotCodecError> {
        let mut router = self.router.borrow_mut();
        let mut cmos = self.cmos.borrow_mut();
        let mut pit = self.pit.borrow_mut();
        let mut fdc = self.fdc.borrow_mut();
        let mut ata0 = self.ata[0].borrow_mut();
        let mut ata1 = self.ata[1].borrow_mut();
        let mut a20 = self.a20.borrow_mut();
        let mut dma = self.dma.borrow_mut();
        let mut shutdown = self.shutdown.borrow_mut();

        let (pic, ioapic) = router.as_snapshot_parts();
        let mut devices: Vec<(&str, &mut dyn IoSnapshot)> = vec![
            ("cmos", &mut *cmos),
            ("pit", &mut *pit),
            ("fdc", &mut *fdc),
            ("ata.primary", &mut *ata0),
            ("ata.secondary", &mut *ata1),
            ("a20", &mut *a20),
            ("dma", &mut *dma),
            ("shutdown_watcher", &mut *shutdown),
            ("pic", pic),
        ];
        if let Some(ioapic) = ioapic {
            devices.push(("ioapic", ioapic));
        }
        aero_snapshot::io_snapshot::restore_all(blob, &mut devices)
    }
}
