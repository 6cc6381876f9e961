//! Bridges [`crate::Snapshot`] to `aero_io_snapshot::io::state`'s
//! `SnapshotSink`/`SnapshotSource` traits, so any device that implements
//! `IoSnapshot` can be saved into, and restored from, a compressible blob
//! without the device crate depending on `lz4_flex` itself.

use aero_io_snapshot::io::state::{IoSnapshot, SnapshotError, SnapshotSink, SnapshotSource};

use crate::Snapshot;

impl SnapshotSink for Snapshot {
    fn field(&mut self, object: &str, field: &str, bytes: &[u8]) {
        self.push(object, field, bytes);
    }
}

impl SnapshotSource for Snapshot {
    fn field(&mut self, object: &str, field: &str, buf: &mut [u8]) -> Result<(), SnapshotError> {
        let Some(f) = self.fields().get(self.cursor_pos()) else {
            return Err(SnapshotError::MissingField {
                object: object.to_string(),
                field: field.to_string(),
            });
        };
        if f.bytes.len() != buf.len() {
            return Err(SnapshotError::LengthMismatch {
                object: object.to_string(),
                field: field.to_string(),
                expected: buf.len(),
                found: f.bytes.len(),
            });
        }
        buf.copy_from_slice(&f.bytes);
        self.advance_cursor();
        Ok(())
    }
}

/// Save every device in `devices` (in order) into one blob, each under its
/// own top-level object name. Devices whose `IoSnapshot` impl already
/// namespaces its fields (e.g. the FDC's `fdc.drive[0]` entries) simply
/// nest as their own flat object strings; the `name` passed here becomes a
/// prefix only for disambiguating two controllers of the same device type
/// (e.g. the two IDE channels).
pub fn save_all(devices: &[(&str, &dyn IoSnapshot)]) -> Vec<u8> {
    let mut snap = Snapshot::new();
    for (name, device) in devices {
        let mut scoped = Snapshot::new();
        device.save_state(&mut scoped);
        for f in scoped.fields() {
            snap.push(&format!("{name}.{}", f.object), &f.field, &f.bytes);
        }
    }
    snap.encode()
}

/// Restore every device in `devices` from a blob produced by [`save_all`].
/// Devices are restored in the same order they were saved; a length or
/// presence mismatch for any field aborts the whole restore (bit-exact
/// restore is an all-or-nothing contract per spec.md §6).
pub fn restore_all(
    blob: &[u8],
    devices: &mut [(&str, &mut dyn IoSnapshot)],
) -> Result<(), crate::SnapshotCodecError> {
    let snap = Snapshot::decode(blob)?;
    let mut cursor = 0usize;
    for (name, device) in devices.iter_mut() {
        let mut scoped = Snapshot::new();
        while let Some(f) = snap.fields().get(cursor) {
            let prefix = format!("{name}.");
            let Some(rest) = f.object.strip_prefix(&prefix) else {
                break;
            };
            scoped.push(rest, &f.field, &f.bytes);
            cursor += 1;
        }
        device
            .load_state(&mut scoped)
            .map_err(|_| crate::SnapshotCodecError::Truncated)?;
    }
    Ok(())
}

impl Snapshot {
    pub(crate) fn cursor_pos(&self) -> usize {
        self.cursor
    }

    pub(crate) fn advance_cursor(&mut self) {
        self.cursor += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_io_snapshot::io::state::{get_u16, get_u8, put_u16, put_u8};

    struct Counter {
        value: u16,
        mode: u8,
    }

    impl IoSnapshot for Counter {
        fn save_state(&self, sink: &mut dyn SnapshotSink) {
            put_u16(sink, "counter", "value", self.value);
            put_u8(sink, "counter", "mode", self.mode);
        }

        fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
            self.value = get_u16(src, "counter", "value")?;
            self.mode = get_u8(src, "counter", "mode")?;
            Ok(())
        }
    }

    #[test]
    fn snapshot_round_trips_as_a_sink_and_source() {
        let counter = Counter { value: 0x1234, mode: 3 };
        let mut snap = Snapshot::new();
        counter.save_state(&mut snap);

        let blob = snap.encode();
        let mut restored = Snapshot::decode(&blob).unwrap();
        let mut target = Counter { value: 0, mode: 0 };
        target.load_state(&mut restored).unwrap();

        assert_eq!(target.value, 0x1234);
        assert_eq!(target.mode, 3);
    }

    #[test]
    fn save_all_and_restore_all_round_trip_two_devices() {
        let a = Counter { value: 111, mode: 1 };
        let b = Counter { value: 222, mode: 2 };
        let blob = save_all(&[("a", &a), ("b", &b)]);

        let mut ra = Counter { value: 0, mode: 0 };
        let mut rb = Counter { value: 0, mode: 0 };
        restore_all(&blob, &mut [("a", &mut ra), ("b", &mut rb)]).unwrap();

        assert_eq!(ra.value, 111);
        assert_eq!(ra.mode, 1);
        assert_eq!(rb.value, 222);
        assert_eq!(rb.mode, 2);
    }

    #[test]
    fn mismatched_field_length_errors_without_panicking() {
        struct Bad;
        impl IoSnapshot for Bad {
            fn save_state(&self, sink: &mut dyn SnapshotSink) {
                put_u8(sink, "bad", "x", 1);
            }
            fn load_state(&mut self, src: &mut dyn SnapshotSource) -> Result<(), SnapshotError> {
                get_u16(src, "bad", "x")?; // reads 2 bytes where 1 was written
                Ok(())
            }
        }

        let bad = Bad;
        let blob = save_all(&[("bad", &bad)]);
        let mut target = Bad;
        let err = restore_all(&blob, &mut [("bad", &mut target)]);
        assert!(err.is_err());
    }
}
