//! Typed configuration surface (spec.md §6). `MachineConfig` is the shape
//! an (out-of-scope) INI loader would populate and the sole input to
//! [`crate::PcPlatform::new`]; its keys mirror `original_source/src/pc.c`'s
//! `struct pc_settings` field-for-field, trimmed to the components this
//! core actually models.

use aero_devices::{AtaGeometry, FloppyGeometry};
use aero_storage::{Drive, DriveBackend, MemBackend, StdFileBackend, SyncDiskBackend};
use std::fs::OpenOptions;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open drive image {path}: {source}")]
    OpenImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where the BIOS boot sequence looks first/second/third. Discriminants
/// match `original_source/include/pc.h`'s `BOOT_*` enum exactly, since they
/// are packed directly into CMOS nibbles by [`crate::cmos::seed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootDevice {
    #[default]
    None = 0,
    Floppy = 1,
    HardDisk = 2,
    Cdrom = 3,
}

/// A drive's backing store, resolved into a boxed [`DriveBackend`] by
/// [`DriveImage::into_backend`] once `PcPlatform::new` is ready to attach it.
pub enum DriveImage {
    /// An image already loaded into memory (e.g. embedded in a test or
    /// fetched by the host ahead of time).
    Memory(Vec<u8>),
    /// A regular host file, opened read-write or read-only.
    File { path: PathBuf, writable: bool },
    /// A freshly zeroed image of the given size, for scratch disks.
    Blank { size: u64 },
}

impl DriveImage {
    fn into_backend(self) -> Result<Box<dyn DriveBackend>, ConfigError> {
        match self {
            DriveImage::Memory(bytes) => {
                Ok(Box::new(SyncDiskBackend::new(MemBackend::from_bytes(bytes))))
            }
            DriveImage::Blank { size } => {
                Ok(Box::new(SyncDiskBackend::new(MemBackend::new(size as usize))))
            }
            DriveImage::File { path, writable } => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(writable)
                    .open(&path)
                    .map_err(|source| ConfigError::OpenImage {
                        path: path.clone(),
                        source,
                    })?;
                let backend = StdFileBackend::open(file, writable).map_err(|source| {
                    ConfigError::OpenImage {
                        path: path.clone(),
                        source,
                    }
                })?;
                Ok(Box::new(SyncDiskBackend::new(backend)))
            }
        }
    }

    pub(crate) fn into_drive(self) -> Result<Drive, ConfigError> {
        Ok(Drive::new(self.into_backend()?))
    }
}

/// One IDE/ATA drive slot (primary/secondary master or slave).
pub struct AtaDriveConfig {
    pub image: DriveImage,
    pub geometry: AtaGeometry,
    pub total_sectors: u64,
    pub model: String,
    pub serial: String,
}

/// One floppy drive slot.
pub struct FloppyDriveConfig {
    pub image: DriveImage,
    pub geometry: FloppyGeometry,
    pub write_protected: bool,
}

/// The machine's full typed configuration (spec.md §6's "memory size,
/// drive images and geometry, boot order, apic/floppy toggles, the host's
/// wall-clock seconds at boot").
pub struct MachineConfig {
    pub memory_bytes: usize,
    /// Host wall-clock seconds at boot, seeded into the [`aero_time::Clock`]
    /// and CMOS/RTC (CMOS/RTC periodic behavior itself is out of scope;
    /// only this seed value is carried).
    pub now_seconds: u64,
    /// Whether an I/O APIC is constructed alongside the PIC
    /// (`original_source/src/pc.c`'s `ioapic_init` early-return gate).
    pub apic_enabled: bool,
    /// Index 0 = primary master, 1 = primary slave, 2 = secondary master,
    /// 3 = secondary slave. Only master slots are seeded into CMOS, matching
    /// `pc_init_cmos_disk`'s two-drive table.
    pub ata: [Option<AtaDriveConfig>; 4],
    /// Index 0/1 = floppy drive A/B.
    pub floppy: [Option<FloppyDriveConfig>; 2],
    pub boot_sequence: [BootDevice; 3],
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 128 * 1024 * 1024,
            now_seconds: 0,
            apic_enabled: false,
            ata: [None, None, None, None],
            floppy: [None, None],
            boot_sequence: [BootDevice::HardDisk, BootDevice::None, BootDevice::None],
        }
    }
}
