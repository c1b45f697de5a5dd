//! I/O descriptors, completion chaining, and clone submission.
//!
//! An [`IoRequest`] is what the host shell hands the engine; the engine
//! derives one or more [`CloneIo`] descriptors targeting the backing device
//! and hands them to the device's [`CloneSink`]. Each clone carries a unit of
//! the original's [`IoCompletion`]; the original completes exactly when its
//! last outstanding unit completes, with the first error (if any) winning.

use std::sync::{Arc, Condvar, Mutex};

use crate::{Result, StorageBackend, VbdError, SECTOR_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    /// Anything that is neither read nor write (flush, discard, ...). The
    /// engine logs these and passes them through unredirected.
    Other(u8),
}

/// Payload buffer shared between the original request and its clones. Each
/// clone addresses a disjoint `payload_offset..+len_bytes` window of it.
pub type IoPayload = Arc<Mutex<Vec<u8>>>;

type Callback = Box<dyn FnOnce(&std::result::Result<(), VbdError>) + Send>;

struct CompletionState {
    outstanding: usize,
    error: Option<VbdError>,
    done: bool,
    callback: Option<Callback>,
}

/// Completion handle for one original request. Created with one outstanding
/// unit (the original itself, which the engine assigns to the tail clone);
/// every split child adds a unit before submission.
#[derive(Clone)]
pub struct IoCompletion {
    state: Arc<(Mutex<CompletionState>, Condvar)>,
}

impl IoCompletion {
    pub fn new() -> Self {
        Self {
            state: Arc::new((
                Mutex::new(CompletionState {
                    outstanding: 1,
                    error: None,
                    done: false,
                    callback: None,
                }),
                Condvar::new(),
            )),
        }
    }

    pub fn with_callback(callback: Callback) -> Self {
        let done = Self::new();
        done.state
            .0
            .lock()
            .expect("completion state poisoned")
            .callback = Some(callback);
        done
    }

    /// Chains one more child onto this completion.
    pub fn add_unit(&self) {
        let mut state = self.state.0.lock().expect("completion state poisoned");
        debug_assert!(!state.done, "unit added to a completed request");
        state.outstanding += 1;
    }

    /// Retires one unit. The last unit to retire fires the callback and
    /// wakes waiters.
    pub fn complete_unit(&self, result: Result<()>) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().expect("completion state poisoned");
        if let Err(e) = result {
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        debug_assert!(state.outstanding > 0, "completion underflow");
        state.outstanding -= 1;
        if state.outstanding == 0 {
            state.done = true;
            if let Some(cb) = state.callback.take() {
                let outcome = match state.error.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
                cb(&outcome);
                if let Err(e) = outcome {
                    state.error = Some(e);
                }
            }
            cvar.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.0.lock().expect("completion state poisoned").done
    }

    /// Blocks until every unit has completed; returns the first error.
    pub fn wait(&self) -> Result<()> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().expect("completion state poisoned");
        while !state.done {
            state = cvar.wait(state).expect("completion state poisoned");
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for IoCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// The original descriptor as issued against a virtual device.
pub struct IoRequest {
    pub device: String,
    pub op: IoOp,
    /// Starting LBA.
    pub sector: u64,
    pub payload: IoPayload,
    pub completion: IoCompletion,
}

impl IoRequest {
    /// `payload.len()` must be a positive multiple of the sector size.
    pub fn new(device: impl Into<String>, op: IoOp, sector: u64, payload: Vec<u8>) -> Self {
        debug_assert!(!payload.is_empty() && payload.len() % SECTOR_SIZE as usize == 0);
        Self {
            device: device.into(),
            op,
            sector,
            payload: Arc::new(Mutex::new(payload)),
            completion: IoCompletion::new(),
        }
    }

    pub fn size_bytes(&self) -> u32 {
        self.payload.lock().expect("payload poisoned").len() as u32
    }
}

/// A derived descriptor targeting the backing device.
pub struct CloneIo {
    pub op: IoOp,
    /// Target sector on the backing device (PBA, or the unchanged LBA for
    /// system I/O and unknown opcodes).
    pub target_sector: u64,
    pub len_bytes: u32,
    /// Byte offset of this clone's window inside the original payload.
    pub payload_offset: u32,
    pub payload: IoPayload,
    completion: IoCompletion,
}

impl CloneIo {
    pub(crate) fn new(
        op: IoOp,
        target_sector: u64,
        len_bytes: u32,
        payload_offset: u32,
        payload: IoPayload,
        completion: IoCompletion,
    ) -> Self {
        Self {
            op,
            target_sector,
            len_bytes,
            payload_offset,
            payload,
            completion,
        }
    }

    /// Signals this clone's unit of the original request.
    pub fn complete(self, result: Result<()>) {
        self.completion.complete_unit(result);
    }
}

/// Non-blocking hand-off point for clones: the backing-device submission
/// queue. Implementations must eventually call [`CloneIo::complete`].
pub trait CloneSink: Send + Sync {
    fn submit(&self, clone: CloneIo);
}

/// Test sink: records every submitted clone and completes it successfully.
#[derive(Default)]
pub struct RecordingSink {
    clones: Mutex<Vec<CloneRecord>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneRecord {
    pub op: IoOp,
    pub target_sector: u64,
    pub len_bytes: u32,
    pub payload_offset: u32,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<CloneRecord> {
        std::mem::take(&mut *self.clones.lock().expect("clone log poisoned"))
    }

    pub fn records(&self) -> Vec<CloneRecord> {
        self.clones.lock().expect("clone log poisoned").clone()
    }
}

impl CloneSink for RecordingSink {
    fn submit(&self, clone: CloneIo) {
        self.clones.lock().expect("clone log poisoned").push(CloneRecord {
            op: clone.op,
            target_sector: clone.target_sector,
            len_bytes: clone.len_bytes,
            payload_offset: clone.payload_offset,
        });
        clone.complete(Ok(()));
    }
}

/// Executes clones synchronously against a [`StorageBackend`] and completes
/// them with the outcome. Reads fill the clone's payload window; writes
/// drain it.
pub struct BackendSink<B: StorageBackend> {
    backend: Mutex<B>,
}

impl<B: StorageBackend> BackendSink<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Mutex::new(backend),
        }
    }

    pub fn into_inner(self) -> B {
        self.backend.into_inner().expect("backend poisoned")
    }

    fn execute(&self, clone: &CloneIo) -> Result<()> {
        let offset = clone
            .target_sector
            .checked_mul(u64::from(SECTOR_SIZE))
            .ok_or(VbdError::OffsetOverflow)?;
        let start = clone.payload_offset as usize;
        let end = start + clone.len_bytes as usize;
        let mut backend = self.backend.lock().expect("backend poisoned");
        match clone.op {
            IoOp::Read => {
                let mut payload = clone.payload.lock().expect("payload poisoned");
                backend.read_at(offset, &mut payload[start..end])
            }
            IoOp::Write => {
                let payload = clone.payload.lock().expect("payload poisoned");
                backend.write_at(offset, &payload[start..end])
            }
            // Passed through without touching data.
            IoOp::Other(_) => Ok(()),
        }
    }
}

impl<B: StorageBackend> CloneSink for BackendSink<B> {
    fn submit(&self, clone: CloneIo) {
        let result = self.execute(&clone);
        clone.complete(result);
    }
}
