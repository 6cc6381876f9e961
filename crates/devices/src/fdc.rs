//! Floppy disk controller (spec.md §4.5), grounded on
//! `original_source/src/hardware/fdc.c`. Command FIFO, response FIFO, and
//! DMA-coupled read/write/format via channel 2.

use aero_io_snapshot::io::state::{
    get_u16, get_u32, get_u8, put_u16, put_u32, put_u8, IoSnapshot, SnapshotError, SnapshotSink,
    SnapshotSource,
};
use aero_io_snapshot::io::storage::state::MAX_FDC_DMA_BUFFER_BYTES;
use aero_pc_constants::ports;
use aero_platform::{Dma8237, TransferDirection};
use aero_storage::{DiskError, Drive};
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use thiserror::Error;

const MSR_RQM: u8 = 0x80;
const MSR_DIO: u8 = 0x40;
const MSR_NDMA: u8 = 0x20;
const MSR_CB: u8 = 0x10;
/// Per-drive "seek active" bits. Only drives 0/1 have motor state tracked
/// (matches `fdc_write`'s DOR handling, which only checks `DOR_MOTA`/`DOR_MOTB`),
/// so ACTC/ACTD are defined for completeness but never asserted, same as the
/// source.
#[allow(dead_code)]
const MSR_ACTD: u8 = 0x08;
#[allow(dead_code)]
const MSR_ACTC: u8 = 0x04;
const MSR_ACTB: u8 = 0x02;
const MSR_ACTA: u8 = 0x01;

const DOR_MOTB: u8 = 0x20;
const DOR_MOTA: u8 = 0x10;
const DOR_RESET: u8 = 0x04;
const DOR_DMA_ENABLE: u8 = 0x08;
const DOR_DSEL0: u8 = 0x01;

const SRB_MTR0: u8 = 0x01;
const SRB_MTR1: u8 = 0x02;
const SRB_DR0: u8 = 0x20;

const DMABUF_LEN: usize = MAX_FDC_DMA_BUFFER_BYTES;

#[derive(Debug, Error)]
pub enum FdcError {
    #[error("fdc: invalid geometry for requested access")]
    GeometryInvalid,
    #[error("fdc: no medium inserted")]
    MediaMissing,
    #[error("fdc: medium is write protected")]
    WriteProtected,
    #[error("fdc: unsupported command {0:#04x}")]
    CommandUnsupported(u8),
    #[error("fdc: drive I/O error: {0}")]
    DriveIo(#[from] aero_storage::DiskError),
}

pub type Result<T> = std::result::Result<T, FdcError>;

#[derive(Clone, Copy, Debug)]
pub struct FloppyGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

impl FloppyGeometry {
    pub const FLOPPY_1_44MB: Self = Self {
        cylinders: 80,
        heads: 2,
        sectors_per_track: 18,
    };
    pub const FLOPPY_1_2MB: Self = Self {
        cylinders: 80,
        heads: 2,
        sectors_per_track: 15,
    };
    pub const FLOPPY_720KB: Self = Self {
        cylinders: 80,
        heads: 2,
        sectors_per_track: 9,
    };
    pub const FLOPPY_360KB: Self = Self {
        cylinders: 40,
        heads: 2,
        sectors_per_track: 9,
    };
}

#[derive(Default)]
struct DriveSlot {
    drive: Option<Drive>,
    geometry: Option<FloppyGeometry>,
    write_protected: bool,
    cyl: u16,
    head: u8,
    sector: u8,
}

impl DriveSlot {
    fn present(&self) -> bool {
        self.drive.is_some()
    }

    fn offset_of(&self, cyl: u16, head: u8, sector: u8) -> Result<u64> {
        let geo = self.geometry.ok_or(FdcError::GeometryInvalid)?;
        if cyl >= geo.cylinders || head >= geo.heads || sector == 0 || sector > geo.sectors_per_track
        {
            return Err(FdcError::GeometryInvalid);
        }
        let lba = (cyl as u64 * geo.heads as u64 + head as u64) * geo.sectors_per_track as u64
            + (sector as u64 - 1);
        Ok(lba * 512)
    }

    fn advance(&mut self) {
        let Some(geo) = self.geometry else { return };
        self.sector += 1;
        if self.sector > geo.sectors_per_track {
            self.sector = 1;
            self.head += 1;
            if self.head >= geo.heads {
                self.head = 0;
                self.cyl += 1;
                if self.cyl >= geo.cylinders {
                    self.cyl = 0;
                }
            }
        }
    }
}

#[derive(Default)]
#[allow(dead_code)]
struct FormatState {
    bytes_to_read: usize,
    fill_byte: u8,
    dma_pos: usize,
    sector_size_code: u8,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Command,
    Result,
}

pub type FdcIrqCallback = Box<dyn FnMut(bool)>;

/// Matches §3's `FDC` data model: two FIFOs, per-drive seek state, the
/// DMA-coupled transfer scratch buffer, and the interrupt-countdown quirk
/// used by the reset sequence.
pub struct Fdc {
    /// Status Registers A/B (0x3F0/0x3F1): mostly a diagnostic mirror of
    /// motor/drive-select state, maintained by [`Fdc::write_dor`].
    status: [u8; 2],
    dor: u8,
    data_rate: u8,
    ccr: u8,
    dir: [u8; 4],
    msr: u8,
    command_buffer: [u8; 16],
    command_size: usize,
    command_pos: usize,
    response_buffer: [u8; 16],
    response_size: usize,
    response_pos: usize,
    st: [u8; 4],
    selected_drive: usize,
    drives: [DriveSlot; 4],
    multi_track: bool,
    format_state: FormatState,
    interrupt_countdown: u8,
    perpendicular: u8,
    config: u8,
    precomp: u8,
    locked: bool,
    dmabuf: Vec<u8>,
    phase: Phase,
    pending_write: bool,
    pending_format: bool,
    irq_asserted: bool,
    on_irq6: Option<FdcIrqCallback>,
    dma: Option<Rc<RefCell<Dma8237>>>,
    /// See `AtaController::self_weak`: lets an async read/write completion
    /// borrow `self` back from inside its `'static` callback.
    self_weak: Option<Weak<RefCell<Fdc>>>,
}

impl Fdc {
    pub fn new() -> Self {
        Self {
            status: [0, 0],
            dor: 0,
            data_rate: 0,
            ccr: 0,
            dir: [0; 4],
            msr: MSR_RQM,
            command_buffer: [0; 16],
            command_size: 0,
            command_pos: 0,
            response_buffer: [0; 16],
            response_size: 0,
            response_pos: 0,
            st: [0; 4],
            selected_drive: 0,
            drives: Default::default(),
            multi_track: false,
            format_state: FormatState::default(),
            interrupt_countdown: 0,
            perpendicular: 0,
            config: 0,
            precomp: 0,
            locked: false,
            dmabuf: vec![0u8; DMABUF_LEN],
            phase: Phase::Idle,
            pending_write: false,
            pending_format: false,
            irq_asserted: false,
            on_irq6: None,
            dma: None,
            self_weak: None,
        }
    }

    /// Construct an already-`Rc`-wrapped controller with its self-reference
    /// bound; use whenever an attached drive's backend might return
    /// `Completion::Async` (spec.md §4.3, §8 scenario 6).
    pub fn new_shared() -> Rc<RefCell<Self>> {
        let fdc = Rc::new(RefCell::new(Self::new()));
        fdc.borrow_mut().self_weak = Some(Rc::downgrade(&fdc));
        fdc
    }

    pub fn set_on_irq6(&mut self, callback: FdcIrqCallback) {
        self.on_irq6 = Some(callback);
    }

    /// Drains any ready async completion on an inserted drive (spec.md §4.7
    /// `drive_check_complete`). A no-op for sync backends.
    pub fn drive_check_complete(&mut self) {
        for slot in &mut self.drives {
            if let Some(d) = slot.drive.as_mut() {
                d.check_complete();
            }
        }
    }

    /// Wire this controller's channel-2 DMA coupling to a shared DMA engine
    /// (spec.md §4.5 "read/write/format"). Once set, every completed
    /// read/write/format transfer pumps the engine's address/count
    /// bookkeeping via [`Fdc::pump_dma`] so its register file reflects the
    /// transfer, matching the real chip's DREQ2/TC handshake.
    pub fn set_dma(&mut self, dma: Rc<RefCell<Dma8237>>) {
        self.dma = Some(dma);
    }

    fn pump_dma_if_wired(&mut self) {
        if let Some(dma) = self.dma.clone() {
            let mut dma = dma.borrow_mut();
            self.pump_dma(&mut dma);
        }
    }

    pub fn insert_drive(
        &mut self,
        index: usize,
        drive: Drive,
        geometry: FloppyGeometry,
        write_protected: bool,
    ) {
        self.drives[index] = DriveSlot {
            drive: Some(drive),
            geometry: Some(geometry),
            write_protected,
            cyl: 0,
            head: 0,
            sector: 1,
        };
    }

    pub fn dma_buffer(&self) -> &[u8] {
        &self.dmabuf
    }

    /// Drive one byte into the command FIFO. A harness that owns both the
    /// DMA engine and guest memory should call this (rather than relying on
    /// a port-bus handler wired straight to the private command logic) so it
    /// can stage `dma_buffer` to/from guest RAM around the call, since a
    /// write-type command consumes `dmabuf` synchronously from inside this
    /// call and a read-type command's [`Fdc::pump_dma`] bookkeeping runs
    /// before it returns (spec.md §4.5).
    pub fn write_data_fifo_port(&mut self, value: u8) {
        self.write_data_fifo(value);
    }

    /// Pull one byte out of the result FIFO. Response bytes never drive a
    /// DMA transfer, so this needs no staging; exposed alongside
    /// [`Fdc::write_data_fifo_port`] so a harness can route both directions
    /// of the data port through its own wrapper without reaching into
    /// private state.
    pub fn read_data_fifo_port(&mut self) -> u8 {
        self.read_data_fifo()
    }

    pub fn dma_buffer_mut(&mut self) -> &mut [u8] {
        &mut self.dmabuf
    }

    fn raise_irq(&mut self) {
        self.irq_asserted = true;
        if let Some(cb) = self.on_irq6.as_mut() {
            cb(true);
        }
    }

    fn lower_irq(&mut self) {
        if self.irq_asserted {
            self.irq_asserted = false;
            if let Some(cb) = self.on_irq6.as_mut() {
                cb(false);
            }
        }
    }

    pub fn reset(&mut self) {
        // `fdc_reset`'s fixed post-reset Status Register B value (`fdc.c:183`).
        self.status[1] = 0xC0;
        self.msr = MSR_RQM;
        self.command_pos = 0;
        self.command_size = 0;
        self.response_pos = 0;
        self.response_size = 0;
        self.phase = Phase::Idle;
        self.st = [0; 4];
        for drive in &mut self.drives {
            if drive.present() {
                drive.head = 0;
                drive.sector = 1;
            }
        }
        self.raise_irq();
        self.interrupt_countdown = 4;
    }

    /// `fdc_write`'s `0x3F2` handler (`fdc.c:352-388`): besides the
    /// reset/drive-select bookkeeping already here, motor and drive-select
    /// transitions are mirrored into Status Register B (live, guest-visible
    /// via `0x3F1`).
    fn write_dor(&mut self, value: u8) {
        let diffxor = self.dor ^ value;
        if diffxor & DOR_MOTA != 0 {
            if value & DOR_MOTA != 0 {
                self.status[1] |= SRB_MTR0;
            } else {
                self.status[1] &= !SRB_MTR0;
            }
        }
        if diffxor & DOR_MOTB != 0 {
            if value & DOR_MOTB != 0 {
                self.status[1] |= SRB_MTR1;
            } else {
                self.status[1] &= !SRB_MTR1;
            }
        }
        if diffxor & value & DOR_DSEL0 != 0 {
            self.status[1] |= SRB_DR0;
        } else {
            self.status[1] &= !SRB_DR0;
        }

        let was_reset = self.dor & DOR_RESET == 0;
        let now_normal = value & DOR_RESET != 0;
        self.dor = value;
        self.selected_drive = (value & 0x03) as usize;
        if was_reset && now_normal {
            self.reset();
        }
    }

    /// Tape Drive Register (0x3F3): no tape drive is ever modeled, so this
    /// mirrors `fdc_read`'s `!fdc.drive_inserted` fallback for the selected
    /// drive; writes are ignored, matching the source.
    fn read_tape_drive(&self) -> u8 {
        if self.drives[self.selected_drive].present() {
            0
        } else {
            0x20
        }
    }

    /// Open Question #3: bit7 of the Digital Input Register is the
    /// disk-change latch for the currently selected drive, OR'd with the
    /// "motor for drive 0 off" bias condition `(dor & 0x08) == 0`.
    fn read_dir(&self) -> u8 {
        let disk_change = self.dir[self.selected_drive] & 0x80;
        let motor0_off_bias = if self.dor & 0x08 == 0 { 0x80 } else { 0 };
        disk_change | motor0_off_bias
    }

    /// Composes the advertised MSR bits (spec.md §4.5) on top of the raw
    /// RQM/DIO/CB state `self.msr` tracks: NDMA reflects whether DOR's
    /// DMA/IRQ-enable bit is clear, and the ACTA/ACTB bits mirror the
    /// per-drive motor state `write_dor` maintains in Status Register B.
    fn read_msr(&self) -> u8 {
        let mut msr = self.msr;
        if self.dor & DOR_DMA_ENABLE == 0 {
            msr |= MSR_NDMA;
        }
        if self.status[1] & SRB_MTR0 != 0 {
            msr |= MSR_ACTA;
        }
        if self.status[1] & SRB_MTR1 != 0 {
            msr |= MSR_ACTB;
        }
        msr
    }

    fn begin_command(&mut self, opcode: u8) {
        let size = Self::command_size(opcode);
        self.command_buffer[0] = opcode;
        self.command_size = size;
        self.command_pos = 1;
        if size == 1 {
            self.execute_command();
        } else {
            self.phase = Phase::Command;
            self.msr |= MSR_CB;
            self.msr &= !MSR_DIO;
        }
    }

    fn command_size(opcode: u8) -> usize {
        match opcode & 0x1F {
            0x03 => 3,
            0x04 => 2,
            0x07 => 2,
            0x08 => 1,
            0x0E => 1,
            0x0F => 3,
            0x10 => 1,
            0x12 => 2,
            0x13 => 4,
            0x14 => 1,
            0x18 => 1,
            0x02 => 9,
            0x06 => 9,
            0x05 => 9,
            0x0D => 6,
            _ => 1,
        }
    }

    fn write_data_fifo(&mut self, value: u8) {
        match self.phase {
            Phase::Idle => self.begin_command(value),
            Phase::Command => {
                self.command_buffer[self.command_pos] = value;
                self.command_pos += 1;
                if self.command_pos >= self.command_size {
                    self.execute_command();
                }
            }
            Phase::Result => {
                log::warn!("fdc: data write dropped during result phase");
            }
        }
    }

    fn read_data_fifo(&mut self) -> u8 {
        match self.phase {
            Phase::Result => {
                let v = self.response_buffer[self.response_pos];
                self.response_pos += 1;
                if self.response_pos >= self.response_size {
                    self.phase = Phase::Idle;
                    self.msr &= !(MSR_CB | MSR_DIO);
                }
                v
            }
            _ => 0xFF,
        }
    }

    fn set_response(&mut self, bytes: &[u8]) {
        self.response_buffer[..bytes.len()].copy_from_slice(bytes);
        self.response_size = bytes.len();
        self.response_pos = 0;
        if bytes.is_empty() {
            self.phase = Phase::Idle;
            self.msr &= !(MSR_CB | MSR_DIO);
        } else {
            self.phase = Phase::Result;
            self.msr |= MSR_DIO;
        }
    }

    fn selected(&self) -> usize {
        self.selected_drive & 0x03
    }

    fn abnormal_termination(&mut self, st1: u8, st2: u8) {
        self.st[0] = 0x40 | (self.selected() as u8);
        self.st[1] = st1;
        self.st[2] = st2;
    }

    fn execute_command(&mut self) {
        let opcode = self.command_buffer[0];
        match opcode & 0x1F {
            0x03 => self.cmd_specify(),
            0x04 => self.cmd_sense_drive(),
            0x07 => self.cmd_recalibrate(),
            0x08 => self.cmd_sense_interrupt(),
            0x0E => self.cmd_dump_registers(),
            0x0F => self.cmd_seek(),
            0x10 => self.set_response(&[0x90]),
            0x12 => self.cmd_perpendicular(),
            0x13 => self.cmd_configure(),
            0x14 => self.cmd_lock(opcode),
            0x18 => self.set_response(&[0x80]),
            0x02 => self.cmd_read_track(),
            0x06 => self.cmd_read(),
            0x05 => self.cmd_write(),
            0x0D => self.cmd_format(),
            other => {
                log::warn!("fdc: unsupported command {other:#04x}");
                self.set_response(&[0x80]);
            }
        }
        self.command_pos = 0;
        self.command_size = 0;
        if self.phase == Phase::Command {
            self.phase = Phase::Idle;
        }
    }

    fn cmd_specify(&mut self) {
        // Head-load/unload/step-rate timings are recorded but not timed.
        self.set_response(&[]);
    }

    fn cmd_sense_drive(&mut self) {
        let drive_head = self.command_buffer[1];
        let drive = (drive_head & 0x03) as usize;
        let head = (drive_head >> 2) & 1;
        let slot = &self.drives[drive];
        let mut st3 = (drive as u8) | (head << 2);
        if slot.cyl == 0 {
            st3 |= 0x10;
        }
        if slot.present() {
            st3 |= 0x20;
        }
        if slot.write_protected {
            st3 |= 0x40;
        }
        self.set_response(&[st3]);
    }

    fn cmd_recalibrate(&mut self) {
        let drive = (self.command_buffer[1] & 0x03) as usize;
        self.drives[drive].cyl = 0;
        self.drives[drive].head = 0;
        self.drives[drive].sector = 1;
        self.raise_irq();
        self.set_response(&[]);
    }

    fn cmd_seek(&mut self) {
        let drive_head = self.command_buffer[1];
        let drive = (drive_head & 0x03) as usize;
        let head = (drive_head >> 2) & 1;
        let cyl = self.command_buffer[2] as u16;
        if let Some(geo) = self.drives[drive].geometry {
            if cyl >= geo.cylinders {
                self.abnormal_termination(0, 0);
                self.raise_irq();
                self.set_response(&[]);
                return;
            }
        }
        self.drives[drive].cyl = cyl;
        self.drives[drive].head = head;
        self.raise_irq();
        self.set_response(&[]);
    }

    /// Open Question #2: drive id is `3 ^ { countdown -= 1; countdown }`,
    /// predecrement-then-xor, kept verbatim from the source.
    fn sense_interrupt_drive_id(countdown: &mut u8) -> u8 {
        *countdown -= 1;
        3 ^ *countdown
    }

    fn cmd_sense_interrupt(&mut self) {
        self.lower_irq();
        if self.interrupt_countdown > 0 {
            let drive = Self::sense_interrupt_drive_id(&mut self.interrupt_countdown) as usize;
            let slot = &self.drives[drive];
            let byte0 = 0xC0 | ((slot.head as u8) << 2) | drive as u8;
            let cyl = slot.cyl as u8;
            self.set_response(&[byte0, cyl]);
        } else {
            let slot = &self.drives[self.selected()];
            self.set_response(&[self.st[0], slot.cyl as u8]);
        }
    }

    /// Open Question #1: `response_buffer[1]` is always drive 1's cylinder
    /// regardless of which drive's bytes occupy the other slots (observed,
    /// not re-derived).
    fn cmd_dump_registers(&mut self) {
        let mut response = [0u8; 10];
        for i in 0..4 {
            response[i] = if i == 1 {
                self.drives[1].cyl as u8
            } else {
                self.drives[i].cyl as u8
            };
        }
        response[4] = 0;
        response[5] = 0;
        response[6] = 0;
        response[7] = (self.locked as u8) << 7;
        response[8] = self.perpendicular;
        response[9] = self.config;
        self.set_response(&response);
    }

    fn cmd_perpendicular(&mut self) {
        self.perpendicular = self.command_buffer[1] & 0x7F;
        self.set_response(&[]);
    }

    fn cmd_configure(&mut self) {
        self.config = self.command_buffer[2];
        self.precomp = self.command_buffer[3];
        self.set_response(&[]);
    }

    fn cmd_lock(&mut self, opcode: u8) {
        self.locked = opcode & 0x80 != 0;
        self.set_response(&[(self.locked as u8) << 4]);
    }

    fn parse_chsn(&self) -> (usize, u8, u16, u8, u8, u8) {
        let drive_head = self.command_buffer[1];
        let drive = (drive_head & 0x03) as usize;
        let cyl = self.command_buffer[2] as u16;
        let head = self.command_buffer[3] & 1;
        let sector = self.command_buffer[4];
        let n = self.command_buffer[5];
        (drive, head, cyl, sector, n, drive_head)
    }

    fn cmd_read_track(&mut self) {
        let (drive, head, cyl, _sector, n, _) = self.parse_chsn();
        self.drives[drive].head = head;
        self.drives[drive].cyl = cyl;
        self.drives[drive].sector = 1;
        self.do_transfer(drive, n, false);
    }

    fn cmd_read(&mut self) {
        let opcode = self.command_buffer[0];
        self.multi_track = opcode & 0x80 != 0;
        let (drive, head, cyl, sector, n, _) = self.parse_chsn();
        self.drives[drive].head = head;
        self.drives[drive].cyl = cyl;
        self.drives[drive].sector = sector;
        self.do_transfer(drive, n, false);
    }

    fn cmd_write(&mut self) {
        let opcode = self.command_buffer[0];
        self.multi_track = opcode & 0x80 != 0;
        let (drive, head, cyl, sector, n, _) = self.parse_chsn();
        self.drives[drive].head = head;
        self.drives[drive].cyl = cyl;
        self.drives[drive].sector = sector;
        self.do_transfer(drive, n, true);
    }

    fn do_transfer(&mut self, drive: usize, n: u8, write: bool) {
        let present = self.drives[drive].present();
        let write_protected = self.drives[drive].write_protected;
        if !present {
            self.abnormal_termination(0x04, 0x00);
            self.finish_transfer_response(drive, n);
            return;
        }
        if write && write_protected {
            self.abnormal_termination(0x02, 0x00);
            self.finish_transfer_response(drive, n);
            return;
        }
        let slot = &self.drives[drive];
        let offset = match slot.offset_of(slot.cyl, slot.head, slot.sector) {
            Ok(o) => o,
            Err(_) => {
                self.abnormal_termination(0x04, 0x00);
                self.finish_transfer_response(drive, n);
                return;
            }
        };
        self.pending_write = write;
        if write {
            let data = self.dmabuf[..512].to_vec();
            let cb: aero_storage::WriteCallback = Box::new({
                let self_weak = self.self_weak.clone();
                move |result| {
                    let Some(fdc) = self_weak.as_ref().and_then(Weak::upgrade) else {
                        return;
                    };
                    let mut fdc = fdc.borrow_mut();
                    fdc.finish_write_transfer(drive, n, result);
                    if let Some(d) = fdc.drives[drive].drive.as_mut() {
                        d.mark_completed();
                    }
                }
            });
            let slot = self.drives[drive].drive.as_mut().unwrap();
            match slot.write(data, offset, cb) {
                aero_storage::Completion::Sync(result) => self.finish_write_transfer(drive, n, result),
                aero_storage::Completion::Async => {}
            }
        } else {
            let cb: aero_storage::ReadCallback = Box::new({
                let self_weak = self.self_weak.clone();
                move |result| {
                    let Some(fdc) = self_weak.as_ref().and_then(Weak::upgrade) else {
                        return;
                    };
                    let mut fdc = fdc.borrow_mut();
                    fdc.finish_read_transfer(drive, n, result);
                    if let Some(d) = fdc.drives[drive].drive.as_mut() {
                        d.mark_completed();
                    }
                }
            });
            let slot = self.drives[drive].drive.as_mut().unwrap();
            match slot.read(512, offset, cb) {
                aero_storage::Completion::Sync(result) => self.finish_read_transfer(drive, n, result),
                aero_storage::Completion::Async => {}
            }
        }
    }

    /// Shared tail of a sector write, reached either inline (sync backend)
    /// or from the async completion callback (spec.md §8 scenario 6).
    fn finish_write_transfer(&mut self, drive: usize, n: u8, result: std::result::Result<(), DiskError>) {
        if let Err(e) = result {
            log::warn!("fdc: write failed: {e}");
            self.abnormal_termination(0x04, 0x00);
        }
        self.drives[drive].advance();
        self.pump_dma_if_wired();
        self.finish_transfer_response(drive, n);
    }

    /// Shared tail of a sector read, reached either inline (sync backend) or
    /// from the async completion callback (spec.md §8 scenario 6).
    fn finish_read_transfer(&mut self, drive: usize, n: u8, result: std::result::Result<Vec<u8>, DiskError>) {
        match result {
            Ok(buf) => self.dmabuf[..buf.len()].copy_from_slice(&buf),
            Err(e) => {
                log::warn!("fdc: read failed: {e}");
                self.abnormal_termination(0x04, 0x00);
            }
        }
        self.drives[drive].advance();
        self.pump_dma_if_wired();
        self.finish_transfer_response(drive, n);
    }

    fn finish_transfer_response(&mut self, drive: usize, n: u8) {
        self.raise_irq();
        let slot = &self.drives[drive];
        self.set_response(&[
            self.st[0],
            self.st[1],
            self.st[2],
            slot.cyl as u8,
            slot.head,
            slot.sector,
            n,
        ]);
    }

    fn cmd_format(&mut self) {
        let drive_head = self.command_buffer[1];
        let drive = (drive_head & 0x03) as usize;
        let n = self.command_buffer[2];
        let sectors_per_track = self.command_buffer[3];
        let fill_byte = self.command_buffer[5];
        if n != 2 {
            self.abnormal_termination(0x27, 0x31);
            self.finish_transfer_response(drive, n);
            return;
        }
        self.format_state = FormatState {
            bytes_to_read: sectors_per_track as usize * 4,
            fill_byte,
            dma_pos: 0,
            sector_size_code: n,
        };
        self.pending_format = true;
        if !self.drives[drive].present() {
            self.abnormal_termination(0x04, 0x00);
            self.finish_transfer_response(drive, n);
            return;
        }
        let sectors = sectors_per_track;
        for s in 1..=sectors {
            self.drives[drive].sector = s;
            let offset = match self.drives[drive].offset_of(
                self.drives[drive].cyl,
                self.drives[drive].head,
                s,
            ) {
                Ok(o) => o,
                Err(_) => {
                    self.abnormal_termination(0x04, 0x00);
                    self.finish_transfer_response(drive, n);
                    return;
                }
            };
            let data = vec![fill_byte; 512];
            let slot = self.drives[drive].drive.as_mut().unwrap();
            match slot.write(data, offset, Box::new(|_| {})) {
                aero_storage::Completion::Sync(Ok(())) => {}
                aero_storage::Completion::Sync(Err(e)) => {
                    log::warn!("fdc: format write failed: {e}");
                    self.abnormal_termination(0x27, 0x31);
                    self.finish_transfer_response(drive, n);
                    return;
                }
                aero_storage::Completion::Async => {
                    // FORMAT TRACK writes every sector in one synchronous loop;
                    // chaining per-sector async completions would need a small
                    // state machine this controller doesn't have. Only sync
                    // backends are supported for this command.
                    log::warn!("fdc: format track requires a synchronous drive backend");
                    self.abnormal_termination(0x27, 0x31);
                    self.finish_transfer_response(drive, n);
                    return;
                }
            }
        }
        self.pending_format = false;
        self.pump_dma_if_wired();
        self.finish_transfer_response(drive, n);
    }

    /// Service DREQ2 against the DMA engine's bookkeeping (address/count
    /// advance and terminal-count detection); the actual `dmabuf`<->guest
    /// memory copy at `dma.current_physical_address(2)` is the caller's
    /// responsibility, matching [`Dma8237::transfer`]'s documented contract.
    pub fn pump_dma(&mut self, dma: &mut Dma8237) -> usize {
        let direction = if self.pending_write {
            TransferDirection::MemoryToDevice
        } else {
            TransferDirection::DeviceToMemory
        };
        dma.raise_dreq(2);
        dma.transfer(2, direction, 512.min(self.dmabuf.len()))
    }

    pub fn register_ports(fdc: Rc<RefCell<Fdc>>, bus: &mut IoPortBus) {
        macro_rules! port_rw {
            ($port:expr, $read:expr, $write:expr) => {{
                let mut handlers = PortHandlers::default();
                if let Some(r) = $read {
                    let fdc = fdc.clone();
                    handlers.read8 = Some(Box::new(move |_p| r(&mut fdc.borrow_mut())));
                }
                if let Some(w) = $write {
                    let fdc = fdc.clone();
                    handlers.write8 = Some(Box::new(move |_p, v| w(&mut fdc.borrow_mut(), v)));
                }
                bus.register_range($port, 1, handlers);
            }};
        }

        port_rw!(
            ports::FDC_SRA,
            Some(|f: &mut Fdc| f.status[0]),
            Some(|_f: &mut Fdc, _v: u8| {})
        );
        port_rw!(
            ports::FDC_SRB,
            Some(|f: &mut Fdc| f.status[1]),
            Some(|_f: &mut Fdc, _v: u8| {})
        );
        port_rw!(
            ports::FDC_DOR,
            None::<fn(&mut Fdc) -> u8>,
            Some(|f: &mut Fdc, v| f.write_dor(v))
        );
        port_rw!(
            ports::FDC_TDR,
            Some(|f: &mut Fdc| f.read_tape_drive()),
            Some(|_f: &mut Fdc, _v: u8| {})
        );
        port_rw!(
            ports::FDC_MSR,
            Some(|f: &mut Fdc| f.read_msr()),
            None::<fn(&mut Fdc, u8)>
        );
        port_rw!(
            ports::FDC_DATA,
            Some(|f: &mut Fdc| f.read_data_fifo()),
            Some(|f: &mut Fdc, v| f.write_data_fifo(v))
        );
        port_rw!(
            ports::FDC_DIR,
            Some(|f: &mut Fdc| f.read_dir()),
            Some(|f: &mut Fdc, v| f.ccr = v)
        );

        let reset_fdc = fdc;
        bus.register_reset(Box::new(move || reset_fdc.borrow_mut().reset()));
    }
}

impl Default for Fdc {
    fn default() -> Self {
        Self::new()
    }
}

impl IoSnapshot for Fdc {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u8(sink, "fdc", "status[0]", self.status[0]);
        put_u8(sink, "fdc", "status[1]", self.status[1]);
        put_u8(sink, "fdc", "dor", self.dor);
        put_u8(sink, "fdc", "data_rate", self.data_rate);
        put_u8(sink, "fdc", "ccr", self.ccr);
        put_u8(sink, "fdc", "msr", self.msr);
        put_u8(sink, "fdc", "selected_drive", self.selected_drive as u8);
        put_u8(sink, "fdc", "interrupt_countdown", self.interrupt_countdown);
        put_u8(sink, "fdc", "perpendicular", self.perpendicular);
        put_u8(sink, "fdc", "config", self.config);
        put_u8(sink, "fdc", "precomp", self.precomp);
        put_u8(sink, "fdc", "locked", self.locked as u8);
        for i in 0..4 {
            put_u8(sink, "fdc", &format!("st[{i}]"), self.st[i]);
            put_u8(sink, "fdc", &format!("dir[{i}]"), self.dir[i]);
            put_u16(sink, "fdc", &format!("drive[{i}].cyl"), self.drives[i].cyl);
            put_u8(sink, "fdc", &format!("drive[{i}].head"), self.drives[i].head);
            put_u8(sink, "fdc", &format!("drive[{i}].sector"), self.drives[i].sector);
        }
        put_u32(sink, "fdc", "dmabuf_len", self.dmabuf.len() as u32);
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> std::result::Result<(), SnapshotError> {
        self.status[0] = get_u8(src, "fdc", "status[0]")?;
        self.status[1] = get_u8(src, "fdc", "status[1]")?;
        self.dor = get_u8(src, "fdc", "dor")?;
        self.data_rate = get_u8(src, "fdc", "data_rate")?;
        self.ccr = get_u8(src, "fdc", "ccr")?;
        self.msr = get_u8(src, "fdc", "msr")?;
        self.selected_drive = get_u8(src, "fdc", "selected_drive")? as usize;
        self.interrupt_countdown = get_u8(src, "fdc", "interrupt_countdown")?;
        self.perpendicular = get_u8(src, "fdc", "perpendicular")?;
        self.config = get_u8(src, "fdc", "config")?;
        self.precomp = get_u8(src, "fdc", "precomp")?;
        self.locked = get_u8(src, "fdc", "locked")? != 0;
        for i in 0..4 {
            self.st[i] = get_u8(src, "fdc", &format!("st[{i}]"))?;
            self.dir[i] = get_u8(src, "fdc", &format!("dir[{i}]"))?;
            self.drives[i].cyl = get_u16(src, "fdc", &format!("drive[{i}].cyl"))?;
            self.drives[i].head = get_u8(src, "fdc", &format!("drive[{i}].head"))?;
            self.drives[i].sector = get_u8(src, "fdc", &format!("drive[{i}].sector"))?;
        }
        let _ = get_u32(src, "fdc", "dmabuf_len")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_storage::{Drive, SyncDiskBackend};

    fn fdc_with_one_drive() -> Rc<RefCell<Fdc>> {
        let fdc = Fdc::new_shared();
        let backend = SyncDiskBackend::new(aero_storage::MemBackend::new(80 * 2 * 18 * 512));
        fdc.borrow_mut()
            .insert_drive(0, Drive::new(Box::new(backend)), FloppyGeometry::FLOPPY_1_44MB, false);
        fdc
    }

    #[test]
    fn reset_sequence_raises_irq_and_loads_countdown() {
        let fdc = fdc_with_one_drive();
        let irqs = Rc::new(RefCell::new(Vec::new()));
        let sink = irqs.clone();
        fdc.borrow_mut()
            .set_on_irq6(Box::new(move |raise| sink.borrow_mut().push(raise)));
        let mut bus = IoPortBus::new();
        Fdc::register_ports(fdc.clone(), &mut bus);

        bus.write_u8(ports::FDC_DOR, 0x00);
        bus.write_u8(ports::FDC_DOR, 0x0C);

        assert!(irqs.borrow().contains(&true));
        assert_eq!(fdc.borrow().interrupt_countdown, 4);
    }

    #[test]
    fn sense_interrupt_reports_four_drives_then_normal_status() {
        let fdc = fdc_with_one_drive();
        let mut bus = IoPortBus::new();
        Fdc::register_ports(fdc.clone(), &mut bus);
        bus.write_u8(ports::FDC_DOR, 0x00);
        bus.write_u8(ports::FDC_DOR, 0x0C);

        for _ in 0..4 {
            bus.write_u8(ports::FDC_DATA, 0x08);
            let b0 = bus.read_u8(ports::FDC_DATA);
            let _cyl = bus.read_u8(ports::FDC_DATA);
            assert_eq!(b0 & 0xC0, 0xC0);
        }
        assert_eq!(fdc.borrow().interrupt_countdown, 0);
    }

    #[test]
    fn seek_then_read_advances_sector_and_responds_seven_bytes() {
        let fdc = fdc_with_one_drive();
        let mut bus = IoPortBus::new();
        Fdc::register_ports(fdc.clone(), &mut bus);
        bus.write_u8(ports::FDC_DOR, 0x00);
        bus.write_u8(ports::FDC_DOR, 0x0C);
        for _ in 0..4 {
            bus.write_u8(ports::FDC_DATA, 0x08);
            bus.read_u8(ports::FDC_DATA);
            bus.read_u8(ports::FDC_DATA);
        }

        // Read sector: drive 0, head 0, cyl 0, sector 1, n=2, eot=18, gpl, dtl
        for b in [0x06u8, 0x00, 0x00, 0x00, 0x01, 0x02, 18, 0x1B, 0xFF] {
            bus.write_u8(ports::FDC_DATA, b);
        }
        let mut resp = [0u8; 7];
        for r in resp.iter_mut() {
            *r = bus.read_u8(ports::FDC_DATA);
        }
        assert_eq!(resp[4], 0, "head stays 0");
        assert_eq!(resp[5], 2, "sector advanced past the one just read");
    }
}
