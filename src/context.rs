//! The process-wide state shared by both listeners.
//!
//! Per `SPEC_FULL.md` §9's "Global singletons" note: rather than reaching
//! for ambient globals (`static` + `OnceLock`, or similar), the Backend
//! (which also owns the recording log; see `backend.rs`) is built once in
//! `main` and handed to both the NBD listener and the control-plane
//! listener as a single `Context`.
#![deny(missing_docs)]

use std::sync::Arc;

use crate::backend::Backend;

/// Shared state: the backend buffer and its recording log, reference-counted
/// so the NBD and control listeners can each hold a handle.
#[derive(Clone)]
pub struct Context {
    /// The exported disk image and its recorder.
    pub backend: Arc<Backend>,
}

impl Context {
    /// Build a fresh context around `backend`.
    pub fn new(backend: Backend) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }
}
