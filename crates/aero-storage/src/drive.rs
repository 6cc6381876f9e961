use crate::{Result, VirtualDisk};

/// Outcome of a block-layer request, per spec.md §4.3. `T` is `Vec<u8>` for
/// reads and `()` for writes: a completion hands back data rather than
/// filling a borrowed buffer, since an async completion must be able to
/// outlive the call that started it.
pub enum Completion<T> {
    Sync(Result<T>),
    Async,
}

pub type ReadCallback = Box<dyn FnOnce(Result<Vec<u8>>)>;
pub type WriteCallback = Box<dyn FnOnce(Result<()>)>;

/// Capability a storage backend implements to participate in the block
/// layer's sync-or-async protocol. Grounded on
/// `original_source/include/drive.h`'s `drive_read_func`/`drive_write_func`/
/// `drive_prefetch_func` signatures, replacing the C source's tagged
/// `void*` callback with an owned closure, per REDESIGN FLAGS §9.
pub trait DriveBackend {
    fn read(&mut self, len: usize, offset: u64, cb: ReadCallback) -> Completion<Vec<u8>>;
    fn write(&mut self, data: Vec<u8>, offset: u64, cb: WriteCallback) -> Completion<()>;
    fn prefetch(&mut self, size: usize, offset: u64, cb: WriteCallback) -> Completion<()>;

    /// Cancel every in-flight request; their callbacks must never fire.
    fn cancel_all(&mut self);

    /// Drain callbacks whose completion is ready, invoking each exactly once.
    fn check_complete(&mut self);
}

/// Adapts any synchronous [`VirtualDisk`] into a [`DriveBackend`] that always
/// completes before returning — the common case for this core, since the
/// network backend the teacher also ships is out of scope (no network
/// adapter emulation).
pub struct SyncDiskBackend<D: VirtualDisk> {
    disk: D,
}

impl<D: VirtualDisk> SyncDiskBackend<D> {
    pub fn new(disk: D) -> Self {
        Self { disk }
    }

    pub fn into_inner(self) -> D {
        self.disk
    }

    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }
}

impl<D: VirtualDisk> DriveBackend for SyncDiskBackend<D> {
    fn read(&mut self, len: usize, offset: u64, _cb: ReadCallback) -> Completion<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let result = self.disk.read_at(offset, &mut buf).map(|()| buf);
        Completion::Sync(result)
    }

    fn write(&mut self, data: Vec<u8>, offset: u64, _cb: WriteCallback) -> Completion<()> {
        Completion::Sync(self.disk.write_at(offset, &data))
    }

    fn prefetch(&mut self, _size: usize, _offset: u64, _cb: WriteCallback) -> Completion<()> {
        // Hint only; this backend has no readahead, so it completes
        // immediately as a no-op (spec.md §4.3: "indistinguishable from
        // async noop").
        Completion::Sync(Ok(()))
    }

    fn cancel_all(&mut self) {}

    fn check_complete(&mut self) {}
}

/// One drive handle: enforces the "at most one in-flight request" contract
/// (spec.md §4.3, §8) on top of any [`DriveBackend`].
pub struct Drive {
    backend: Box<dyn DriveBackend>,
    in_flight: bool,
}

impl Drive {
    pub fn new(backend: Box<dyn DriveBackend>) -> Self {
        Self {
            backend,
            in_flight: false,
        }
    }

    pub fn backend_mut(&mut self) -> &mut dyn DriveBackend {
        self.backend.as_mut()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    pub fn read(&mut self, len: usize, offset: u64, cb: ReadCallback) -> Completion<Vec<u8>> {
        debug_assert!(!self.in_flight, "at most one in-flight request per drive");
        let completion = self.backend.read(len, offset, cb);
        if matches!(completion, Completion::Async) {
            self.in_flight = true;
        }
        completion
    }

    pub fn write(&mut self, data: Vec<u8>, offset: u64, cb: WriteCallback) -> Completion<()> {
        debug_assert!(!self.in_flight, "at most one in-flight request per drive");
        let completion = self.backend.write(data, offset, cb);
        if matches!(completion, Completion::Async) {
            self.in_flight = true;
        }
        completion
    }

    pub fn prefetch(&mut self, size: usize, offset: u64, cb: WriteCallback) -> Completion<()> {
        self.backend.prefetch(size, offset, cb)
    }

    /// Cancel transfers in progress; per spec.md §4.3, called on ATA
    /// soft-reset. Guarantees no future callback fires for them.
    pub fn cancel_transfers(&mut self) {
        self.backend.cancel_all();
        self.in_flight = false;
    }

    /// Polled from the machine loop to drain ready async completions.
    pub fn check_complete(&mut self) {
        self.backend.check_complete();
    }

    /// Called by a backend's own completion machinery once its one
    /// in-flight request has actually resolved (sync backends never need
    /// this; deferred/test backends call it from their `check_complete`).
    pub fn mark_completed(&mut self) {
        self.in_flight = false;
    }
}

/// A backend that always defers: it stashes the request and only resolves
/// it when the test (or, in production, a host I/O completion thread this
/// core does not itself model) calls [`DeferredBackend::complete_pending`].
/// Used to exercise the HLT/async-completion scenario (spec.md §8, end-to-end
/// scenario 6) without a real asynchronous I/O stack.
pub struct DeferredBackend<D: VirtualDisk> {
    disk: D,
    pending: Option<PendingOp>,
}

enum PendingOp {
    Read {
        offset: u64,
        len: usize,
        cb: ReadCallback,
    },
    Write {
        offset: u64,
        data: Vec<u8>,
        cb: WriteCallback,
    },
}

impl<D: VirtualDisk> DeferredBackend<D> {
    pub fn new(disk: D) -> Self {
        Self {
            disk,
            pending: None,
        }
    }

    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve the one outstanding request, reading/writing through to the
    /// backing disk and invoking its callback. No-op if nothing is pending.
    pub fn complete_pending(&mut self) {
        let Some(op) = self.pending.take() else {
            return;
        };
        match op {
            PendingOp::Read { offset, len, cb } => {
                let mut buf = vec![0u8; len];
                let result = self.disk.read_at(offset, &mut buf).map(|()| buf);
                cb(result);
            }
            PendingOp::Write { offset, data, cb } => {
                let result = self.disk.write_at(offset, &data);
                cb(result);
            }
        }
    }
}

impl<D: VirtualDisk> DriveBackend for DeferredBackend<D> {
    fn read(&mut self, len: usize, offset: u64, cb: ReadCallback) -> Completion<Vec<u8>> {
        self.pending = Some(PendingOp::Read { offset, len, cb });
        Completion::Async
    }

    fn write(&mut self, data: Vec<u8>, offset: u64, cb: WriteCallback) -> Completion<()> {
        self.pending = Some(PendingOp::Write { offset, data, cb });
        Completion::Async
    }

    fn prefetch(&mut self, _size: usize, _offset: u64, _cb: WriteCallback) -> Completion<()> {
        Completion::Async
    }

    fn cancel_all(&mut self) {
        self.pending = None;
    }

    fn check_complete(&mut self) {
        self.complete_pending();
    }
}
