use aero_storage::{DiskError, StdFileBackend, VirtualDisk};
use std::io::Write;

#[test]
fn reads_back_what_was_written_through_the_file() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&vec![0u8; 4096]).unwrap();
    tmp.flush().unwrap();

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let mut backend = StdFileBackend::open(file, true).unwrap();

    backend.write_at(512, &[0xAAu8; 512]).unwrap();
    let mut out = [0u8; 512];
    backend.read_at(512, &mut out).unwrap();
    assert_eq!(out, [0xAAu8; 512]);
}

#[test]
fn out_of_bounds_access_is_rejected() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(1024).unwrap();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let mut backend = StdFileBackend::open(file, true).unwrap();
    let mut out = [0u8; 512];
    let err = backend.read_at(900, &mut out).unwrap_err();
    assert!(matches!(err, DiskError::OutOfBounds { .. }));
}

#[test]
fn write_protected_backend_rejects_writes() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(1024).unwrap();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let mut backend = StdFileBackend::open(file, false).unwrap();
    let err = backend.write_at(0, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, DiskError::WriteProtected));
}
