//! The in-memory disk image this server exports, plus the recording log
//! layered over it.
//!
//! Grounded on the teacher family's `Export`/`Blocks` abstraction (see
//! `euugenechou-rust-nbd`'s `server.rs`, which generalizes a file-backed
//! export to an in-memory `RefCell<Vec<u8>>`): this keeps that same
//! read/write/trim/size surface, but behind a `Mutex` instead of a
//! `RefCell`, since the buffer is now shared across one thread per session
//! rather than confined to a single connection.
//!
//! The buffer and the recording state share a single mutex rather than one
//! each: a Session's write and a control-plane `begin`/`end` must be
//! mutually atomic, and the only way to get that in safe Rust without a
//! second, separately-ordered lock is to guard both under the same one.
#![deny(missing_docs)]

use std::sync::Mutex;

use color_eyre::Result;

use crate::recorder::{Recording, TraceEntry};

enum RecorderState {
    Idle,
    Recording {
        snapshot: Vec<u8>,
        trace: Vec<TraceEntry>,
    },
}

struct Inner {
    buf: Vec<u8>,
    recorder: RecorderState,
}

/// A fixed-size byte array plus its recording log, guarded by a single
/// mutex. `size` never changes after construction.
#[derive(Debug)]
pub struct Backend {
    inner: Mutex<InnerDebug>,
    size: u64,
}

// `Mutex<Inner>` can't derive `Debug` without `Inner: Debug`, and deriving
// that for `Vec<u8>`-sized buffers is noisy; wrap with a thin shim instead.
struct InnerDebug(Inner);

impl std::fmt::Debug for InnerDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("buf_len", &self.0.buf.len())
            .field(
                "recording",
                &matches!(self.0.recorder, RecorderState::Recording { .. }),
            )
            .finish()
    }
}

impl Backend {
    /// Create a backend of `size` zero bytes.
    pub fn zeroed(size: u64) -> Self {
        Self::from_bytes(vec![0u8; size as usize])
    }

    /// Create a backend initialized from `data` verbatim; `size` becomes
    /// `data.len()`.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let size = data.len() as u64;
        Self {
            inner: Mutex::new(InnerDebug(Inner {
                buf: data,
                recorder: RecorderState::Idle,
            })),
            size,
        }
    }

    /// The fixed size of this backend, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy out `len` bytes starting at `off`. Caller must have already
    /// checked `off + len <= size`.
    pub fn read(&self, off: u64, len: u32) -> Vec<u8> {
        let off = off as usize;
        let len = len as usize;
        let inner = self.inner.lock().unwrap();
        inner.0.buf[off..off + len].to_vec()
    }

    /// Copy `data` into `buf[off..off+data.len()]` and, if Recording, append
    /// a `write` trace entry. Caller must have already checked
    /// `off + data.len() <= size`.
    pub fn write(&self, off: u64, data: &[u8], fua: bool) {
        let off_usize = off as usize;
        let mut inner = self.inner.lock().unwrap();
        inner.0.buf[off_usize..off_usize + data.len()].copy_from_slice(data);
        if let RecorderState::Recording { trace, .. } = &mut inner.0.recorder {
            trace.push(TraceEntry::Write {
                data: data.to_vec(),
                offset: off,
                fua: fua as u32,
            });
        }
    }

    /// Zero-fill `len` bytes starting at `off`. Never appended to the
    /// trace. Caller must have already checked `off + len <= size`.
    pub fn trim(&self, off: u64, len: u32) {
        let off = off as usize;
        let len = len as usize;
        let mut inner = self.inner.lock().unwrap();
        inner.0.buf[off..off + len].fill(0);
    }

    /// Record a flush barrier, if Recording. No-op otherwise. The in-memory
    /// store itself has nothing to flush.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let RecorderState::Recording { trace, .. } = &mut inner.0.recorder {
            trace.push(TraceEntry::Flush);
        }
    }

    /// A full copy of the current contents. Valid in any recording state.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().unwrap().0.buf.clone()
    }

    /// Alias for [`Backend::snapshot`], named for the control-plane `dump`
    /// operation.
    pub fn dump(&self) -> Vec<u8> {
        self.snapshot()
    }

    /// Whether the recorder is currently in the `Recording` state.
    pub fn is_recording(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().0.recorder,
            RecorderState::Recording { .. }
        )
    }

    /// Begin a recording window: snapshot the current buffer and start an
    /// empty trace. Fails if already recording.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.0.recorder, RecorderState::Recording { .. }) {
            color_eyre::eyre::bail!("recorder is already recording");
        }
        let snapshot = inner.0.buf.clone();
        inner.0.recorder = RecorderState::Recording {
            snapshot,
            trace: Vec::new(),
        };
        Ok(())
    }

    /// End the recording window, returning the encoded `(snapshot, trace)`
    /// pair. Fails if not currently recording.
    pub fn end(&self) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let prev = std::mem::replace(&mut inner.0.recorder, RecorderState::Idle);
        match prev {
            RecorderState::Recording { snapshot, trace } => {
                Ok(Recording { snapshot, trace }.encode())
            }
            RecorderState::Idle => {
                inner.0.recorder = RecorderState::Idle;
                color_eyre::eyre::bail!("recorder is not recording")
            }
        }
    }

    /// Append an echo marker to the trace, if Recording. No-op otherwise.
    pub fn echo(&self, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        if let RecorderState::Recording { trace, .. } = &mut inner.0.recorder {
            trace.push(TraceEntry::Echo { payload });
        }
    }
}

/// Whether `off + len` (widened so it cannot wrap) falls within `[0, size]`.
pub fn in_range(off: u64, len: u32, size: u64) -> bool {
    (off as u128) + (len as u128) <= size as u128
}
