//! IDE/ATA controller (spec.md §4.4), grounded on
//! `original_source/src/hardware/ide.c`. Two instances exist (primary at
//! `0x1F0-0x1F7`/`0x3F6`, secondary at `0x170-0x177`/`0x376`), each with a
//! master and a slave drive.

use aero_io_snapshot::io::state::{
    get_bytes, get_u16, get_u32, get_u64, get_u8, put_bytes, put_u16, put_u32, put_u64, put_u8,
    IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource,
};
use aero_io_snapshot::io::storage::state::MAX_IDE_DATA_BUFFER_BYTES;
use aero_storage::{Completion, DiskError, Drive};
use memory::io::PortHandlers;
use memory::IoPortBus;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use thiserror::Error;

const STATUS_ERR: u8 = 0x01;
const STATUS_DRQ: u8 = 0x08;
const STATUS_DSC: u8 = 0x10;
const STATUS_DRDY: u8 = 0x40;
const STATUS_BSY: u8 = 0x80;

const ERROR_ABRT: u8 = 0x04;

const CANARY_FRONT: u32 = 0xDEAD_BEEF;
const CANARY_BACK: u32 = 0xBEEF_DEAD;

/// Mirrors `FdcError`'s domain-error set (spec.md §7); no `WriteProtected`
/// variant since no attached ATA drive carries write-protect state (unlike
/// floppies, `AtaDriveConfig` has no such field) — real IDE disks don't
/// expose a write-protect line at the register level either.
#[derive(Debug, Error)]
pub enum AtaError {
    #[error("ata: invalid geometry for requested access")]
    GeometryInvalid,
    #[error("ata: no medium inserted")]
    MediaMissing,
    #[error("ata: unsupported command {0:#04x}")]
    CommandUnsupported(u8),
    #[error("ata: drive I/O error: {0}")]
    DriveIo(#[from] aero_storage::DiskError),
}

pub type Result<T> = std::result::Result<T, AtaError>;

#[derive(Clone, Copy, Debug, Default)]
pub struct AtaGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// One master/slave drive attached to a controller.
struct AtaDrive {
    backend: Option<Drive>,
    native: AtaGeometry,
    translated: AtaGeometry,
    total_sectors: u64,
    model: String,
    serial: String,
    multiple_sectors_count: u8,
    udma_mode: Option<u8>,
    mwdma_mode: Option<u8>,
}

impl AtaDrive {
    fn empty() -> Self {
        Self {
            backend: None,
            native: AtaGeometry::default(),
            translated: AtaGeometry::default(),
            total_sectors: 0,
            model: String::new(),
            serial: String::new(),
            multiple_sectors_count: 1,
            udma_mode: None,
            mwdma_mode: None,
        }
    }

    fn present(&self) -> bool {
        self.backend.is_some()
    }
}

/// The PIO data window (spec.md §3): a 16x512-byte buffer guarded on both
/// sides by a sentinel word, checked after every buffer-driven callback.
struct PioBuffer {
    front_canary: u32,
    data: Vec<u8>,
    back_canary: u32,
    len: usize,
    pos: usize,
}

impl PioBuffer {
    fn new() -> Self {
        Self {
            front_canary: CANARY_FRONT,
            data: vec![0u8; MAX_IDE_DATA_BUFFER_BYTES],
            back_canary: CANARY_BACK,
            len: 0,
            pos: 0,
        }
    }

    fn check_canaries(&self) {
        if self.front_canary != CANARY_FRONT || self.back_canary != CANARY_BACK {
            log::error!("ata: PIO buffer canary overrun detected");
            panic!("ata: PIO buffer canary overrun");
        }
    }

    fn reset_window(&mut self, len: usize) {
        assert!(len <= self.data.len(), "ata: PIO chunk exceeds buffer capacity");
        self.len = len;
        self.pos = 0;
    }

    fn read_u8(&mut self) -> u8 {
        self.check_canaries();
        if self.pos >= self.len {
            return 0xFF;
        }
        let v = self.data[self.pos];
        self.pos += 1;
        v
    }

    fn write_u8(&mut self, v: u8) {
        self.check_canaries();
        if self.pos < self.data.len() {
            self.data[self.pos] = v;
        }
        self.pos += 1;
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.len
    }
}

/// A 16-bit shift register: each write makes the new byte the low half and
/// the previous low half the high half, which is how `1F2-1F5` pack LBA48's
/// extra three bytes (spec.md §4.4).
#[derive(Clone, Copy, Default)]
struct ShiftReg(u16);

impl ShiftReg {
    fn write(&mut self, value: u8) {
        self.0 = (self.0 << 8) | value as u16;
    }
    fn low(&self) -> u8 {
        self.0 as u8
    }
    fn high(&self) -> u8 {
        (self.0 >> 8) as u8
    }
}

pub type AtaIrqCallback = Box<dyn FnMut(bool)>;

/// One IDE channel: two drives, the task-file registers, and the PIO buffer
/// shared between whichever drive is selected.
pub struct AtaController {
    drives: [AtaDrive; 2],
    selected: usize,
    error: u8,
    features: u8,
    sector_count: ShiftReg,
    sector_number: ShiftReg,
    cyl_low: ShiftReg,
    cyl_high: ShiftReg,
    drive_head: u8,
    status: u8,
    dev_control: u8,
    command: u8,
    lba48: bool,
    multi_chunk_remaining: u32,
    pio: PioBuffer,
    write_pending: bool,
    on_irq: Option<AtaIrqCallback>,
    /// Lets an async drive completion borrow `self` back from inside the
    /// `'static` callback handed to [`Drive::read`]/[`Drive::write`], since
    /// that closure cannot hold a borrow of the controller that issued it.
    /// Populated by [`AtaController::new_shared`]; `None` for a controller
    /// built with `new()` directly (which must therefore never see a
    /// `Completion::Async` backend).
    self_weak: Option<Weak<RefCell<AtaController>>>,
}

impl AtaController {
    pub fn new() -> Self {
        let mut ctl = Self {
            drives: [AtaDrive::empty(), AtaDrive::empty()],
            selected: 0,
            error: 0,
            features: 0,
            sector_count: ShiftReg::default(),
            sector_number: ShiftReg::default(),
            cyl_low: ShiftReg::default(),
            cyl_high: ShiftReg::default(),
            drive_head: 0,
            status: STATUS_DRDY | STATUS_DSC,
            dev_control: 0,
            command: 0,
            lba48: false,
            multi_chunk_remaining: 0,
            pio: PioBuffer::new(),
            write_pending: false,
            on_irq: None,
            self_weak: None,
        };
        ctl.reset_task_file();
        ctl
    }

    /// Construct an already-`Rc`-wrapped controller with its self-reference
    /// bound, so async drive completions can be delivered back into it.
    /// Use this (rather than `Rc::new(RefCell::new(AtaController::new()))`)
    /// whenever an attached drive's backend might ever return
    /// `Completion::Async` (spec.md §4.3, §8 scenario 6).
    pub fn new_shared() -> Rc<RefCell<Self>> {
        let ctl = Rc::new(RefCell::new(Self::new()));
        ctl.borrow_mut().self_weak = Some(Rc::downgrade(&ctl));
        ctl
    }

    pub fn set_on_irq(&mut self, callback: AtaIrqCallback) {
        self.on_irq = Some(callback);
    }

    /// Drains any ready async completion on either drive (spec.md §4.7
    /// `drive_check_complete`). A no-op for sync backends.
    pub fn drive_check_complete(&mut self) {
        for drive in &mut self.drives {
            if let Some(d) = drive.backend.as_mut() {
                d.check_complete();
            }
        }
    }

    pub fn attach_drive(
        &mut self,
        index: usize,
        backend: Drive,
        native: AtaGeometry,
        total_sectors: u64,
        model: impl Into<String>,
        serial: impl Into<String>,
    ) {
        self.drives[index] = AtaDrive {
            backend: Some(backend),
            native,
            translated: native,
            total_sectors,
            model: model.into(),
            serial: serial.into(),
            multiple_sectors_count: 1,
            udma_mode: None,
            mwdma_mode: None,
        };
    }

    fn raise_irq(&mut self) {
        if let Some(cb) = self.on_irq.as_mut() {
            cb(true);
        }
    }

    fn lower_irq(&mut self) {
        if let Some(cb) = self.on_irq.as_mut() {
            cb(false);
        }
    }

    fn reset_task_file(&mut self) {
        self.error = 1;
        self.status = STATUS_DRDY | STATUS_DSC;
        self.selected = 0;
        self.sector_count = ShiftReg::default();
        self.sector_number = ShiftReg(1);
        self.cyl_low = ShiftReg::default();
        self.cyl_high = ShiftReg::default();
        self.drive_head = 0;
        self.pio = PioBuffer::new();
        self.write_pending = false;
    }

    pub fn reset(&mut self) {
        self.reset_task_file();
        for drive in &mut self.drives {
            if let Some(d) = drive.backend.as_mut() {
                d.cancel_transfers();
            }
        }
    }

    fn selected_mut(&mut self) -> &mut AtaDrive {
        &mut self.drives[self.selected]
    }

    fn lba_mode(&self) -> bool {
        self.drive_head & 0x40 != 0
    }

    /// CHS/LBA24/LBA48 sector-offset arithmetic (spec.md §4.4), using
    /// translated geometry for CHS.
    fn sector_offset(&self) -> u64 {
        let drive = &self.drives[self.selected];
        if self.lba48 {
            let low = (self.sector_number.low() as u64)
                | ((self.cyl_low.low() as u64) << 8)
                | ((self.cyl_high.low() as u64) << 16);
            let high = (self.sector_number.high() as u64)
                | ((self.cyl_low.high() as u64) << 8)
                | ((self.cyl_high.high() as u64) << 16);
            low | (high << 24)
        } else if self.lba_mode() {
            let lba = (self.sector_number.low() as u64)
                | ((self.cyl_low.low() as u64) << 8)
                | ((self.cyl_high.low() as u64) << 16)
                | (((self.drive_head & 0x0F) as u64) << 24);
            lba
        } else {
            let geo = drive.translated;
            let cyl = (self.cyl_low.low() as u32) | ((self.cyl_high.low() as u32) << 8);
            let head = (self.drive_head & 0x0F) as u32;
            let sector = self.sector_number.low() as u32;
            (((cyl * geo.heads as u32 + head) * geo.sectors_per_track as u32)
                + sector.saturating_sub(1)) as u64
        }
    }

    /// Validates the selected drive is present and the requested chunk
    /// doesn't run past `total_sectors`, mirroring `DriveSlot::offset_of`'s
    /// bounds check on the FDC side.
    fn validate_access(&self, chunk_sectors: u32) -> Result<u64> {
        let drive = &self.drives[self.selected];
        if !drive.present() {
            return Err(AtaError::MediaMissing);
        }
        let offset = self.sector_offset();
        if offset.saturating_add(chunk_sectors as u64) > drive.total_sectors {
            return Err(AtaError::GeometryInvalid);
        }
        Ok(offset * 512)
    }

    fn advance_sectors(&mut self, n: u32) {
        if self.lba48 {
            let cur = (self.sector_number.low() as u64)
                | ((self.cyl_low.low() as u64) << 8)
                | ((self.cyl_high.low() as u64) << 16)
                | (((self.sector_number.high() as u64)
                    | ((self.cyl_low.high() as u64) << 8)
                    | ((self.cyl_high.high() as u64) << 16))
                    << 24);
            let next = cur + n as u64;
            self.sector_number = ShiftReg(((next >> 24 & 0xFF) as u16) << 8 | (next & 0xFF) as u16);
            self.cyl_low =
                ShiftReg(((next >> 32 & 0xFF) as u16) << 8 | ((next >> 8) & 0xFF) as u16);
            self.cyl_high =
                ShiftReg(((next >> 40 & 0xFF) as u16) << 8 | ((next >> 16) & 0xFF) as u16);
        } else if self.lba_mode() {
            let cur = (self.sector_number.low() as u32)
                | ((self.cyl_low.low() as u32) << 8)
                | ((self.cyl_high.low() as u32) << 16)
                | (((self.drive_head & 0x0F) as u32) << 24);
            let next = cur + n;
            self.sector_number.write(next as u8);
            self.cyl_low.write((next >> 8) as u8);
            self.cyl_high.write((next >> 16) as u8);
            self.drive_head = (self.drive_head & 0xF0) | ((next >> 24) as u8 & 0x0F);
        } else {
            let geo = self.drives[self.selected].translated;
            let mut sector = self.sector_number.low() as u32 + n;
            let mut head = (self.drive_head & 0x0F) as u32;
            let mut cyl =
                (self.cyl_low.low() as u32) | ((self.cyl_high.low() as u32) << 8);
            let spt = geo.sectors_per_track.max(1) as u32;
            while sector > spt {
                sector -= spt;
                head += 1;
                if head >= geo.heads.max(1) as u32 {
                    head = 0;
                    cyl += 1;
                }
            }
            self.sector_number.write(sector as u8);
            self.cyl_low.write(cyl as u8);
            self.cyl_high.write((cyl >> 8) as u8);
            self.drive_head = (self.drive_head & 0xF0) | (head as u8 & 0x0F);
        }
    }

    fn abort(&mut self) {
        self.status = STATUS_DRDY | STATUS_ERR;
        self.error = ERROR_ABRT;
        self.pio.pos = 0;
        self.pio.len = 0;
        self.raise_irq();
    }

    fn write_drive_head(&mut self, value: u8) {
        self.drive_head = value;
        self.selected = ((value >> 4) & 1) as usize;
    }

    fn write_command(&mut self, value: u8) {
        self.lower_irq();
        if self.status & STATUS_BSY != 0 {
            log::warn!("ata: command written while BSY, ignoring");
            return;
        }
        self.error = 0;
        self.command = value;
        match value {
            0xEC => self.cmd_identify(),
            0x20 | 0x21 => self.cmd_read(false, 1),
            0x24 => self.cmd_read(true, 1),
            0x29 => self.cmd_read(true, self.selected_drive_multiple()),
            0xC4 => self.cmd_read(false, self.selected_drive_multiple()),
            0x30 | 0x31 => self.cmd_write(false, 1),
            0x34 => self.cmd_write(true, 1),
            0x39 => self.cmd_write(true, self.selected_drive_multiple()),
            0xC5 => self.cmd_write(false, self.selected_drive_multiple()),
            0x40 | 0x41 | 0x42 => self.cmd_verify(),
            0x91 => self.cmd_initialize_drive_parameters(),
            0xC6 => self.cmd_set_multiple(),
            0xEF => self.cmd_set_features(),
            0xA1 => self.abort(),
            0x10..=0x1F | 0xE0..=0xEA => {
                self.status = STATUS_DRDY | STATUS_DSC;
                self.raise_irq();
            }
            _ => {
                log::warn!("{}", AtaError::CommandUnsupported(value));
                self.abort();
            }
        }
    }

    fn selected_drive_multiple(&self) -> u32 {
        self.drives[self.selected].multiple_sectors_count.max(1) as u32
    }

    fn cmd_identify(&mut self) {
        if !self.drives[self.selected].present() {
            self.abort();
            return;
        }
        let drive = &self.drives[self.selected];
        let mut words = [0u16; 256];
        words[0] = 0x0040;
        words[1] = drive.native.cylinders;
        words[3] = drive.native.heads as u16;
        words[6] = drive.native.sectors_per_track as u16;
        write_ata_string(&mut words[10..20], &drive.serial, false);
        write_ata_string(&mut words[27..47], &drive.model, true);
        words[49] = 1 << 9;
        words[54] = drive.translated.cylinders;
        words[55] = drive.translated.heads as u16;
        words[56] = drive.translated.sectors_per_track as u16;
        words[58] = (drive.total_sectors & 0xFFFF) as u16;
        words[57] = ((drive.total_sectors >> 16) & 0xFFFF) as u16;
        words[60] = (drive.total_sectors & 0xFFFF) as u16;
        words[61] = ((drive.total_sectors >> 16) & 0xFFFF) as u16;
        // Resolved Open Question #4: bit 10 (ATA-6 documented position), not
        // the source's literal bit 14.
        words[83] = 1 << 10;
        if let Some(mode) = drive.mwdma_mode {
            words[63] = 1 << mode;
        }
        if let Some(mode) = drive.udma_mode {
            words[88] = 1 << mode;
        }

        let mut bytes = vec![0u8; 512];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 2] = (*w & 0xFF) as u8;
            bytes[i * 2 + 1] = (*w >> 8) as u8;
        }
        self.pio.data[..512].copy_from_slice(&bytes);
        self.pio.reset_window(512);
        self.status = STATUS_DRDY | STATUS_DRQ | STATUS_DSC;
        self.raise_irq();
    }

    fn cmd_read(&mut self, lba48: bool, chunk_sectors: u32) {
        self.lba48 = lba48;
        let total = self.total_count();
        let chunk = chunk_sectors.min(total).max(1);
        let offset = match self.validate_access(chunk) {
            Ok(offset) => offset,
            Err(e) => {
                log::warn!("ata: read rejected: {e}");
                self.abort();
                return;
            }
        };
        let len = chunk as usize * 512;
        self.multi_chunk_remaining = total;

        let selected = self.selected;
        let cb: aero_storage::ReadCallback = Box::new({
            let self_weak = self.self_weak.clone();
            move |result| {
                let Some(ctl) = self_weak.as_ref().and_then(Weak::upgrade) else {
                    return;
                };
                let mut ctl = ctl.borrow_mut();
                ctl.finish_read(selected, chunk, result);
                if let Some(d) = ctl.drives[selected].backend.as_mut() {
                    d.mark_completed();
                }
            }
        });

        let drive = self.selected_mut();
        let result = drive.backend.as_mut().map(|d| d.read(len, offset, cb));
        match result {
            Some(Completion::Sync(result)) => self.finish_read(selected, chunk, result),
            Some(Completion::Async) => {}
            None => self.abort(),
        }
    }

    /// Shared tail of a sector read, reached either inline (sync backend) or
    /// from the async completion callback (spec.md §8 scenario 6).
    fn finish_read(
        &mut self,
        drive_index: usize,
        chunk: u32,
        result: std::result::Result<Vec<u8>, DiskError>,
    ) {
        if drive_index != self.selected {
            log::warn!("ata: dropping completion for drive {drive_index}, selection changed");
            return;
        }
        match result {
            Ok(buf) => {
                self.pio.data[..buf.len()].copy_from_slice(&buf);
                self.pio.reset_window(buf.len());
                self.advance_sectors(chunk);
                self.decrement_remaining(chunk);
                self.status = STATUS_DRDY | STATUS_DSC | STATUS_DRQ;
                self.raise_irq();
            }
            Err(e) => {
                log::warn!("ata: read failed: {e}");
                self.abort();
            }
        }
    }

    fn cmd_write(&mut self, lba48: bool, chunk_sectors: u32) {
        self.lba48 = lba48;
        let total = self.total_count();
        let chunk = chunk_sectors.min(total).max(1);
        if let Err(e) = self.validate_access(chunk) {
            log::warn!("ata: write rejected: {e}");
            self.abort();
            return;
        }
        self.multi_chunk_remaining = total;
        self.pio.reset_window(chunk as usize * 512);
        self.write_pending = true;
        self.status = STATUS_DRDY | STATUS_DSC | STATUS_DRQ;
        // Per spec.md §4.4, IRQ is raised before the host fills the buffer.
        self.raise_irq();
    }

    /// Called once the host has filled the PIO buffer for a pending write;
    /// commits the chunk via `drive_write` and either requests the next
    /// chunk or completes.
    fn commit_write_chunk(&mut self) {
        let chunk = (self.pio.len / 512) as u32;
        let offset = self.sector_offset() * 512;
        let data = self.pio.data[..self.pio.len].to_vec();
        let selected = self.selected;
        let cb: aero_storage::WriteCallback = Box::new({
            let self_weak = self.self_weak.clone();
            move |result| {
                let Some(ctl) = self_weak.as_ref().and_then(Weak::upgrade) else {
                    return;
                };
                let mut ctl = ctl.borrow_mut();
                ctl.finish_write(selected, chunk, result);
                if let Some(d) = ctl.drives[selected].backend.as_mut() {
                    d.mark_completed();
                }
            }
        });

        let drive = self.selected_mut();
        let result = drive.backend.as_mut().map(|d| d.write(data, offset, cb));
        match result {
            Some(Completion::Sync(result)) => self.finish_write(selected, chunk, result),
            Some(Completion::Async) => {}
            None => {
                self.write_pending = false;
                self.abort();
            }
        }
    }

    /// Shared tail of a sector write, reached either inline (sync backend)
    /// or from the async completion callback (spec.md §8 scenario 6).
    fn finish_write(
        &mut self,
        drive_index: usize,
        chunk: u32,
        result: std::result::Result<(), DiskError>,
    ) {
        if drive_index != self.selected {
            log::warn!("ata: dropping completion for drive {drive_index}, selection changed");
            return;
        }
        match result {
            Ok(()) => {
                self.advance_sectors(chunk);
                self.decrement_remaining(chunk);
                if self.multi_chunk_remaining > 0 {
                    let next_chunk = self.multi_chunk_remaining.min(chunk.max(1));
                    self.pio.reset_window(next_chunk as usize * 512);
                    self.status = STATUS_DRDY | STATUS_DSC | STATUS_DRQ;
                    self.raise_irq();
                } else {
                    self.write_pending = false;
                    self.status = STATUS_DRDY | STATUS_DSC;
                    self.raise_irq();
                }
            }
            Err(e) => {
                log::warn!("ata: write failed: {e}");
                self.write_pending = false;
                self.abort();
            }
        }
    }

    fn total_count(&self) -> u32 {
        let raw = if self.lba48 {
            self.sector_count.0 as u32
        } else {
            self.sector_count.low() as u32
        };
        if raw == 0 {
            if self.lba48 {
                65536
            } else {
                256
            }
        } else {
            raw
        }
    }

    fn decrement_remaining(&mut self, n: u32) {
        self.multi_chunk_remaining = self.multi_chunk_remaining.saturating_sub(n);
        let remaining = self.multi_chunk_remaining;
        self.sector_count = if self.lba48 {
            ShiftReg(remaining as u16)
        } else {
            ShiftReg(remaining as u8 as u16)
        };
    }

    fn cmd_verify(&mut self) {
        let total = self.total_count();
        self.advance_sectors(total.saturating_sub(1));
        self.status = STATUS_DRDY | STATUS_DSC;
        self.raise_irq();
    }

    fn cmd_initialize_drive_parameters(&mut self) {
        let heads = ((self.drive_head & 0x0F) + 1) as u8;
        let spt = self.sector_count.low();
        let total_sectors = self.drives[self.selected].total_sectors;
        let drive = &mut self.drives[self.selected];
        if heads != 0 {
            drive.translated.heads = heads;
        }
        if spt != 0 {
            drive.translated.sectors_per_track = spt;
        }
        let denom = (drive.translated.heads as u64 * drive.translated.sectors_per_track as u64).max(1);
        drive.translated.cylinders = (total_sectors / denom).min(u16::MAX as u64) as u16;
        // Resolved Open Question #5: `ctrl->selected = 1` in the source is
        // not reproduced here (treated as a source bug); only geometry is
        // updated.
        self.status = STATUS_DRDY | STATUS_DSC;
        self.raise_irq();
    }

    fn cmd_set_multiple(&mut self) {
        let n = self.sector_count.low();
        if n > 16 || (n != 0 && !n.is_power_of_two()) {
            self.abort();
            return;
        }
        self.drives[self.selected].multiple_sectors_count = n.max(1);
        self.status = STATUS_DRDY | STATUS_DSC;
        self.raise_irq();
    }

    fn cmd_set_features(&mut self) {
        match self.features {
            2 | 0x66 | 0x82 | 0x95 => {
                self.status = STATUS_DRDY | STATUS_DSC;
                self.raise_irq();
            }
            0x03 => self.cmd_set_transfer_mode(),
            _ => self.abort(),
        }
    }

    /// Supplemented per SPEC_FULL.md §4.4, grounded in the teacher's
    /// `tests/ata_transfer_mode.rs`: sector_count encodes `0x40|n` (UDMA n)
    /// or `0x20|n` (MWDMA n), capped at UDMA2/MWDMA2.
    fn cmd_set_transfer_mode(&mut self) {
        let sc = self.sector_count.low();
        let drive = &mut self.drives[self.selected];
        if sc & 0x40 != 0 {
            let mode = sc & 0x07;
            if mode > 2 {
                drop(drive);
                self.abort();
                return;
            }
            drive.udma_mode = Some(mode);
            drive.mwdma_mode = None;
        } else if sc & 0x20 != 0 {
            let mode = sc & 0x07;
            if mode > 2 {
                drop(drive);
                self.abort();
                return;
            }
            drive.mwdma_mode = Some(mode);
            drive.udma_mode = None;
        } else {
            drop(drive);
            self.abort();
            return;
        }
        self.status = STATUS_DRDY | STATUS_DSC;
        self.raise_irq();
    }

    fn write_dev_control(&mut self, value: u8) {
        let was_set = self.dev_control & 0x04 != 0;
        let now_set = value & 0x04 != 0;
        self.dev_control = value;
        if !was_set && now_set {
            self.status |= STATUS_BSY;
        } else if was_set && !now_set {
            self.status = (self.status & !STATUS_BSY) | STATUS_DRDY;
            self.error = 1;
            self.selected = 0;
            self.sector_number = ShiftReg(1);
            self.cyl_low = ShiftReg::default();
            self.cyl_high = ShiftReg::default();
            self.write_pending = false;
            for drive in &mut self.drives {
                if let Some(d) = drive.backend.as_mut() {
                    d.cancel_transfers();
                }
            }
        }
    }

    fn read_alt_status(&self) -> u8 {
        self.status
    }

    fn read_data_u8(&mut self) -> u8 {
        let v = self.pio.read_u8();
        if self.pio.exhausted() {
            self.on_pio_window_drained();
        }
        v
    }

    fn write_data_u8(&mut self, value: u8) {
        self.pio.write_u8(value);
        if self.pio.exhausted() && self.write_pending {
            self.commit_write_chunk();
        }
    }

    fn on_pio_window_drained(&mut self) {
        if self.multi_chunk_remaining == 0 {
            self.status = STATUS_DRDY | STATUS_DSC;
        }
    }

    pub fn register_ports(ctl: Rc<RefCell<AtaController>>, bus: &mut IoPortBus, cmd_base: u16, ctrl_port: u16) {
        {
            let r = ctl.clone();
            let w = ctl.clone();
            let mut handlers = PortHandlers::default();
            handlers.read8 = Some(Box::new(move |_p| r.borrow_mut().read_data_u8()));
            handlers.write8 = Some(Box::new(move |_p, v| w.borrow_mut().write_data_u8(v)));
            bus.register_range(cmd_base, 1, handlers);
        }
        macro_rules! reg8 {
            ($offset:expr, $read:expr, $write:expr) => {{
                let mut handlers = PortHandlers::default();
                if let Some(r) = $read {
                    let ctl = ctl.clone();
                    handlers.read8 = Some(Box::new(move |_p| r(&mut ctl.borrow_mut())));
                }
                if let Some(w) = $write {
                    let ctl = ctl.clone();
                    handlers.write8 = Some(Box::new(move |_p, v| w(&mut ctl.borrow_mut(), v)));
                }
                bus.register_range(cmd_base + $offset, 1, handlers);
            }};
        }
        reg8!(
            1,
            Some(|c: &mut AtaController| c.error),
            Some(|c: &mut AtaController, v| c.features = v)
        );
        reg8!(
            2,
            Some(|c: &mut AtaController| c.sector_count.low()),
            Some(|c: &mut AtaController, v| c.sector_count.write(v))
        );
        reg8!(
            3,
            Some(|c: &mut AtaController| c.sector_number.low()),
            Some(|c: &mut AtaController, v| c.sector_number.write(v))
        );
        reg8!(
            4,
            Some(|c: &mut AtaController| c.cyl_low.low()),
            Some(|c: &mut AtaController, v| c.cyl_low.write(v))
        );
        reg8!(
            5,
            Some(|c: &mut AtaController| c.cyl_high.low()),
            Some(|c: &mut AtaController, v| c.cyl_high.write(v))
        );
        reg8!(
            6,
            Some(|c: &mut AtaController| c.drive_head),
            Some(|c: &mut AtaController, v| c.write_drive_head(v))
        );
        reg8!(
            7,
            Some(|c: &mut AtaController| c.status),
            Some(|c: &mut AtaController, v| c.write_command(v))
        );

        {
            let r = ctl.clone();
            let w = ctl.clone();
            let mut handlers = PortHandlers::default();
            handlers.read8 = Some(Box::new(move |_p| r.borrow().read_alt_status()));
            handlers.write8 = Some(Box::new(move |_p, v| w.borrow_mut().write_dev_control(v)));
            bus.register_range(ctrl_port, 1, handlers);
        }

        let reset_ctl = ctl;
        bus.register_reset(Box::new(move || reset_ctl.borrow_mut().reset()));
    }
}

impl Default for AtaController {
    fn default() -> Self {
        Self::new()
    }
}

/// `ide_pio_store_string` (ide.c:495-496): `justify_left` true left-justifies
/// with trailing spaces (model), false right-justifies with leading spaces
/// (serial number).
fn write_ata_string(words: &mut [u16], s: &str, justify_left: bool) {
    let width = words.len() * 2;
    let mut bytes: Vec<u8> = s.bytes().collect();
    bytes.truncate(width);
    if justify_left {
        bytes.resize(width, b' ');
    } else {
        let mut padded = vec![b' '; width - bytes.len()];
        padded.extend(bytes);
        bytes = padded;
    }
    for (i, w) in words.iter_mut().enumerate() {
        // IDENTIFY strings are byte-swapped: each word's high byte is the
        // earlier character.
        *w = (bytes[i * 2] as u16) << 8 | bytes[i * 2 + 1] as u16;
    }
}

impl IoSnapshot for AtaController {
    fn save_state(&self, sink: &mut dyn SnapshotSink) {
        put_u8(sink, "ata", "selected", self.selected as u8);
        put_u8(sink, "ata", "error", self.error);
        put_u8(sink, "ata", "features", self.features);
        put_u16(sink, "ata", "sector_count", self.sector_count.0);
        put_u16(sink, "ata", "sector_number", self.sector_number.0);
        put_u16(sink, "ata", "cyl_low", self.cyl_low.0);
        put_u16(sink, "ata", "cyl_high", self.cyl_high.0);
        put_u8(sink, "ata", "drive_head", self.drive_head);
        put_u8(sink, "ata", "status", self.status);
        put_u8(sink, "ata", "dev_control", self.dev_control);
        put_u8(sink, "ata", "command", self.command);
        put_u8(sink, "ata", "lba48", self.lba48 as u8);
        put_u32(sink, "ata", "multi_chunk_remaining", self.multi_chunk_remaining);
        put_u8(sink, "ata", "write_pending", self.write_pending as u8);
        put_u32(sink, "ata", "pio_len", self.pio.len as u32);
        put_u32(sink, "ata", "pio_pos", self.pio.pos as u32);
        put_bytes(sink, "ata", "pio_data", &self.pio.data);
        put_u64(sink, "ata", "pio_canary_front", self.pio.front_canary as u64);
        put_u64(sink, "ata", "pio_canary_back", self.pio.back_canary as u64);
        for (i, drive) in self.drives.iter().enumerate() {
            let obj = format!("ata.drive[{i}]");
            put_u8(sink, &obj, "multiple_sectors_count", drive.multiple_sectors_count);
            put_u16(sink, &obj, "translated_cylinders", drive.translated.cylinders);
            put_u8(sink, &obj, "translated_heads", drive.translated.heads);
            put_u8(sink, &obj, "translated_spt", drive.translated.sectors_per_track);
        }
    }

    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> std::result::Result<(), SnapshotError> {
        self.selected = get_u8(src, "ata", "selected")? as usize;
        self.error = get_u8(src, "ata", "error")?;
        self.features = get_u8(src, "ata", "features")?;
        self.sector_count = ShiftReg(get_u16(src, "ata", "sector_count")?);
        self.sector_number = ShiftReg(get_u16(src, "ata", "sector_number")?);
        self.cyl_low = ShiftReg(get_u16(src, "ata", "cyl_low")?);
        self.cyl_high = ShiftReg(get_u16(src, "ata", "cyl_high")?);
        self.drive_head = get_u8(src, "ata", "drive_head")?;
        self.status = get_u8(src, "ata", "status")?;
        self.dev_control = get_u8(src, "ata", "dev_control")?;
        self.command = get_u8(src, "ata", "command")?;
        self.lba48 = get_u8(src, "ata", "lba48")? != 0;
        self.multi_chunk_remaining = get_u32(src, "ata", "multi_chunk_remaining")?;
        self.write_pending = get_u8(src, "ata", "write_pending")? != 0;
        self.pio.len = get_u32(src, "ata", "pio_len")? as usize;
        self.pio.pos = get_u32(src, "ata", "pio_pos")? as usize;
        get_bytes(src, "ata", "pio_data", &mut self.pio.data)?;
        self.pio.front_canary = get_u64(src, "ata", "pio_canary_front")? as u32;
        self.pio.back_canary = get_u64(src, "ata", "pio_canary_back")? as u32;
        for (i, drive) in self.drives.iter_mut().enumerate() {
            let obj = format!("ata.drive[{i}]");
            drive.multiple_sectors_count = get_u8(src, &obj, "multiple_sectors_count")?;
            drive.translated.cylinders = get_u16(src, &obj, "translated_cylinders")?;
            drive.translated.heads = get_u8(src, &obj, "translated_heads")?;
            drive.translated.sectors_per_track = get_u8(src, &obj, "translated_spt")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_pc_constants::ports;
    use aero_storage::{DeferredBackend, MemBackend, SyncDiskBackend};

    fn controller_with_disk() -> Rc<RefCell<AtaController>> {
        let ctl = AtaController::new_shared();
        let sectors = 16 * 63 * 16u64; // arbitrary small geometry
        let backend = SyncDiskBackend::new(MemBackend::new((sectors * 512) as usize));
        ctl.borrow_mut().attach_drive(
            0,
            Drive::new(Box::new(backend)),
            AtaGeometry {
                cylinders: 16,
                heads: 16,
                sectors_per_track: 63,
            },
            sectors,
            "AERO VIRTUAL HD",
            "AERO0001",
        );
        ctl
    }

    #[test]
    fn identify_sets_drdy_drq_and_raises_irq() {
        let ctl = controller_with_disk();
        let irqs = Rc::new(RefCell::new(Vec::new()));
        let sink = irqs.clone();
        ctl.borrow_mut()
            .set_on_irq(Box::new(move |r| sink.borrow_mut().push(r)));
        let mut bus = IoPortBus::new();
        AtaController::register_ports(ctl.clone(), &mut bus, ports::ATA_PRIMARY_CMD_BASE, ports::ATA_PRIMARY_CTRL);

        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEC);
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7) & 0x08, 0x08);
        assert_eq!(*irqs.borrow(), vec![true]);
        let lo = bus.read_u8(ports::ATA_PRIMARY_CMD_BASE);
        let hi = bus.read_u8(ports::ATA_PRIMARY_CMD_BASE);
        assert_eq!(u16::from_le_bytes([lo, hi]), 0x0040);
    }

    #[test]
    fn set_features_unsupported_subcommand_aborts() {
        let ctl = controller_with_disk();
        let mut bus = IoPortBus::new();
        AtaController::register_ports(ctl.clone(), &mut bus, ports::ATA_PRIMARY_CMD_BASE, ports::ATA_PRIMARY_CTRL);

        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 1, 0x01); // unsupported
        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEF);
        let status = bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7);
        assert_eq!(status & 0x01, 0x01, "ERR set");
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 1), ERROR_ABRT);
    }

    #[test]
    fn set_transfer_mode_records_udma_and_reflects_in_identify() {
        let ctl = controller_with_disk();
        let mut bus = IoPortBus::new();
        AtaController::register_ports(ctl.clone(), &mut bus, ports::ATA_PRIMARY_CMD_BASE, ports::ATA_PRIMARY_CTRL);

        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 1, 0x03); // set transfer mode
        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 2, 0x42); // UDMA2
        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEF);
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7) & 0x01, 0);

        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0xEC);
        for _ in 0..88 {
            bus.read_u8(ports::ATA_PRIMARY_CMD_BASE);
            bus.read_u8(ports::ATA_PRIMARY_CMD_BASE);
        }
    }

    #[test]
    fn soft_reset_cancels_transfers_and_reloads_signature() {
        let ctl = controller_with_disk();
        let mut bus = IoPortBus::new();
        AtaController::register_ports(ctl.clone(), &mut bus, ports::ATA_PRIMARY_CMD_BASE, ports::ATA_PRIMARY_CTRL);

        bus.write_u8(ports::ATA_PRIMARY_CTRL, 0x04);
        bus.write_u8(ports::ATA_PRIMARY_CTRL, 0x00);
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 3), 1);
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 4), 0);
    }

    #[test]
    fn async_read_completes_after_drive_check_complete() {
        let ctl = AtaController::new_shared();
        let sectors = 16 * 63 * 16u64;
        let backend = DeferredBackend::new(MemBackend::new((sectors * 512) as usize));
        ctl.borrow_mut().attach_drive(
            0,
            Drive::new(Box::new(backend)),
            AtaGeometry {
                cylinders: 16,
                heads: 16,
                sectors_per_track: 63,
            },
            sectors,
            "AERO VIRTUAL HD",
            "AERO0001",
        );
        let irqs = Rc::new(RefCell::new(Vec::new()));
        let sink = irqs.clone();
        ctl.borrow_mut()
            .set_on_irq(Box::new(move |r| sink.borrow_mut().push(r)));
        let mut bus = IoPortBus::new();
        AtaController::register_ports(ctl.clone(), &mut bus, ports::ATA_PRIMARY_CMD_BASE, ports::ATA_PRIMARY_CTRL);

        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 2, 1); // sector count
        bus.write_u8(ports::ATA_PRIMARY_CMD_BASE + 7, 0x20); // READ SECTORS

        // The backend has not resolved yet: no IRQ, DRQ not yet set.
        assert!(irqs.borrow().is_empty());
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7) & 0x08, 0);

        ctl.borrow_mut().drive_check_complete();

        assert_eq!(*irqs.borrow(), vec![true]);
        assert_eq!(bus.read_u8(ports::ATA_PRIMARY_CMD_BASE + 7) & 0x08, 0x08);
    }
}
