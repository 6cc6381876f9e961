//! Savestate wire format (spec.md §6, §9): a concrete encoder over the
//! `aero-io-snapshot` field-emission contract.
//!
//! spec.md is explicit that "savestate serialization is described as an
//! interface contract, not a format" — this crate is the format a real
//! machine harness needs in order to actually write bytes to disk, built
//! the way the teacher builds its own `aero-snapshot` crate: `lz4_flex`
//! compression over a flat, labelled field stream, `thiserror` for the
//! handful of ways a blob can fail to round-trip.
//!
//! The base encoding (this module) never depends on any particular device;
//! it only knows how to serialize/deserialize `(object, field, bytes)`
//! triples. The `io_snapshot` feature (default-on, matching the teacher's
//! `default = ["io-snapshot"]`) adds thin helpers that drive a machine's
//! `IoSnapshot` devices through that encoding.

use thiserror::Error;

#[cfg(feature = "io-snapshot")]
pub mod io_snapshot;

#[derive(Debug, Error)]
pub enum SnapshotCodecError {
    #[error("savestate blob is truncated or corrupt")]
    Truncated,
    #[error("savestate decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("savestate field name is not valid UTF-8")]
    InvalidUtf8,
}

type Result<T> = std::result::Result<T, SnapshotCodecError>;

/// One labelled field as written to the wire, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub object: String,
    pub field: String,
    pub bytes: Vec<u8>,
}

/// Accumulates fields in emission order; the in-memory form the codec
/// compresses to/from. `aero_io_snapshot::io::state::SnapshotSink`/
/// `SnapshotSource` are implemented directly on this type by the
/// `io_snapshot` submodule so devices can write straight into it.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    fields: Vec<Field>,
    cursor: usize,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn push(&mut self, object: &str, field: &str, bytes: &[u8]) {
        self.fields.push(Field {
            object: object.to_string(),
            field: field.to_string(),
            bytes: bytes.to_vec(),
        });
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Serialize to the uncompressed wire layout: a `u32` field count
    /// followed by, per field, `u32` lengths and bytes for `object`,
    /// `field`, and the payload.
    fn write_plain(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for f in &self.fields {
            write_len_prefixed(out, f.object.as_bytes());
            write_len_prefixed(out, f.field.as_bytes());
            write_len_prefixed(out, &f.bytes);
        }
    }

    fn read_plain(buf: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        let count = read_u32(buf, &mut pos)? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let object = read_string(buf, &mut pos)?;
            let field = read_string(buf, &mut pos)?;
            let bytes = read_bytes(buf, &mut pos)?.to_vec();
            fields.push(Field {
                object,
                field,
                bytes,
            });
        }
        Ok(Self { fields, cursor: 0 })
    }

    /// Compress this snapshot into a self-describing blob (size-prefixed
    /// `lz4_flex` frame), ready to be written to a file or sent over a pipe.
    pub fn encode(&self) -> Vec<u8> {
        let mut plain = Vec::new();
        self.write_plain(&mut plain);
        lz4_flex::compress_prepend_size(&plain)
    }

    /// Inverse of [`Snapshot::encode`].
    pub fn decode(blob: &[u8]) -> Result<Self> {
        let plain = lz4_flex::decompress_size_prepended(blob)?;
        Self::read_plain(&plain)
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let slice = buf.get(*pos..end).ok_or(SnapshotCodecError::Truncated)?;
    *pos = end;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

fn read_bytes<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32(buf, pos)? as usize;
    let end = *pos + len;
    let slice = buf.get(*pos..end).ok_or(SnapshotCodecError::Truncated)?;
    *pos = end;
    Ok(slice)
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let bytes = read_bytes(buf, pos)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| SnapshotCodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_snapshot_round_trips() {
        let snap = Snapshot::new();
        let blob = snap.encode();
        let back = Snapshot::decode(&blob).unwrap();
        assert!(back.fields().is_empty());
    }

    #[test]
    fn fields_round_trip_in_order() {
        let mut snap = Snapshot::new();
        snap.push("pit.chan[0]", "count", &[0x34, 0x12]);
        snap.push("pit.chan[0]", "mode", &[3]);
        snap.push("ata", "pio_data", &vec![0xAAu8; 8192]);

        let blob = snap.encode();
        let back = Snapshot::decode(&blob).unwrap();

        assert_eq!(back.fields().len(), 3);
        assert_eq!(back.fields()[0].object, "pit.chan[0]");
        assert_eq!(back.fields()[0].field, "count");
        assert_eq!(back.fields()[0].bytes, vec![0x34, 0x12]);
        assert_eq!(back.fields()[2].bytes, vec![0xAAu8; 8192]);
    }

    #[test]
    fn truncated_blob_errors_instead_of_panicking() {
        let mut snap = Snapshot::new();
        snap.push("a", "b", &[1, 2, 3]);
        let blob = snap.encode();
        let err = Snapshot::decode(&blob[..blob.len() / 2]);
        assert!(err.is_err());
    }

    #[test]
    fn corrupt_blob_does_not_panic() {
        let mut snap = Snapshot::new();
        snap.push("a", "b", &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut blob = snap.encode();
        for b in blob.iter_mut().skip(4) {
            *b ^= 0xFF;
        }
        let _ = Snapshot::decode(&blob);
    }
}
