use std::fmt;

/// A destination for labelled savestate fields, written in the order a
/// device chooses to emit them. Bit-exact restore is the only requirement
/// (spec.md §6): re-loading and continuing must be indistinguishable from
/// having never stopped.
pub trait SnapshotSink {
    fn field(&mut self, object: &str, field: &str, bytes: &[u8]);
}

/// The matching source half. `field` is given the exact byte length the
/// writer used; a mismatch is a restore-time error, not a panic, since it
/// usually means the savestate came from an incompatible build.
pub trait SnapshotSource {
    fn field(&mut self, object: &str, field: &str, buf: &mut [u8]) -> Result<(), SnapshotError>;
}

#[derive(Debug)]
pub enum SnapshotError {
    MissingField { object: String, field: String },
    LengthMismatch { object: String, field: String, expected: usize, found: usize },
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::MissingField { object, field } => {
                write!(f, "missing savestate field {object}.{field}")
            }
            SnapshotError::LengthMismatch {
                object,
                field,
                expected,
                found,
            } => write!(
                f,
                "savestate field {object}.{field} length mismatch: expected {expected}, found {found}"
            ),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Implemented by every stateful device: PIC, I/O APIC, PIT, IDE
/// controllers, the FDC, the DMA engine, and the machine harness itself.
pub trait IoSnapshot {
    fn save_state(&self, sink: &mut dyn SnapshotSink);
    fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError>;
}

/// Helper used by implementors to round-trip a scalar integer field.
pub fn put_u8(sink: &mut dyn SnapshotSink, object: &str, field: &str, v: u8) {
    sink.field(object, field, &[v]);
}
pub fn put_u16(sink: &mut dyn SnapshotSink, object: &str, field: &str, v: u16) {
    sink.field(object, field, &v.to_le_bytes());
}
pub fn put_u32(sink: &mut dyn SnapshotSink, object: &str, field: &str, v: u32) {
    sink.field(object, field, &v.to_le_bytes());
}
pub fn put_u64(sink: &mut dyn SnapshotSink, object: &str, field: &str, v: u64) {
    sink.field(object, field, &v.to_le_bytes());
}
pub fn put_bytes(sink: &mut dyn SnapshotSink, object: &str, field: &str, v: &[u8]) {
    sink.field(object, field, v);
}

pub fn get_u8(src: &mut dyn SnapshotSource, object: &str, field: &str) -> Result<u8, SnapshotError> {
    let mut buf = [0u8; 1];
    src.field(object, field, &mut buf)?;
    Ok(buf[0])
}
pub fn get_u16(src: &mut dyn SnapshotSource, object: &str, field: &str) -> Result<u16, SnapshotError> {
    let mut buf = [0u8; 2];
    src.field(object, field, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}
pub fn get_u32(src: &mut dyn SnapshotSource, object: &str, field: &str) -> Result<u32, SnapshotError> {
    let mut buf = [0u8; 4];
    src.field(object, field, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
pub fn get_u64(src: &mut dyn SnapshotSource, object: &str, field: &str) -> Result<u64, SnapshotError> {
    let mut buf = [0u8; 8];
    src.field(object, field, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
pub fn get_bytes(
    src: &mut dyn SnapshotSource,
    object: &str,
    field: &str,
    buf: &mut [u8],
) -> Result<(), SnapshotError> {
    src.field(object, field, buf)
}

/// An in-memory [`SnapshotSink`]/[`SnapshotSource`] pair, used by tests and by
/// `aero-snapshot` as the intermediate form before compression/encoding.
#[derive(Default)]
pub struct MemorySnapshot {
    fields: Vec<(String, String, Vec<u8>)>,
    cursor: usize,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn into_fields(self) -> Vec<(String, String, Vec<u8>)> {
        self.fields
    }
}

impl SnapshotSink for MemorySnapshot {
    fn field(&mut self, object: &str, field: &str, bytes: &[u8]) {
        self.fields
            .push((object.to_string(), field.to_string(), bytes.to_vec()));
    }
}

impl SnapshotSource for MemorySnapshot {
    fn field(&mut self, object: &str, field: &str, buf: &mut [u8]) -> Result<(), SnapshotError> {
        let Some((_, _, bytes)) = self.fields.get(self.cursor) else {
            return Err(SnapshotError::MissingField {
                object: object.to_string(),
                field: field.to_string(),
            });
        };
        if bytes.len() != buf.len() {
            return Err(SnapshotError::LengthMismatch {
                object: object.to_string(),
                field: field.to_string(),
                expected: buf.len(),
                found: bytes.len(),
            });
        }
        buf.copy_from_slice(bytes);
        self.cursor += 1;
        Ok(())
    }
}
