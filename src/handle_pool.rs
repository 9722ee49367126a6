//! Per-worker handle pool (C4).
//!
//! reqwest does not expose a raw "transfer handle" to reset and re-arm —
//! hyper's own connection pool already handles socket-level reuse beneath
//! the client. What this pool reuses instead is the per-transfer scratch
//! state ([`TransferHandle`]: header/body accumulators, timing buffer)
//! that would otherwise be allocated fresh for every request. Not
//! thread-safe by construction: each pool is addressed only by its owning
//! worker.

use crate::transfer::TransferState;

/// Reusable per-transfer scratch state, reset to defaults on acquire.
#[derive(Debug, Default)]
pub struct TransferHandle {
    pub state: TransferState,
}

impl TransferHandle {
    fn reset(&mut self) {
        self.state = TransferState::default();
    }
}

/// Free list of [`TransferHandle`]s, addressed only by its owning worker.
/// Grows on demand up to the worker's concurrency share; never shrinks
/// within a run.
pub struct HandlePool {
    free: Vec<TransferHandle>,
    total_created: u64,
    total_reused: u64,
}

impl HandlePool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            total_created: 0,
            total_reused: 0,
        }
    }

    /// Returns a handle reset to defaults: either a freed one (reused) or
    /// a freshly allocated one (created).
    pub fn acquire(&mut self) -> TransferHandle {
        match self.free.pop() {
            Some(mut handle) => {
                handle.reset();
                self.total_reused += 1;
                handle
            }
            None => {
                self.total_created += 1;
                TransferHandle::default()
            }
        }
    }

    /// Returns a handle for reuse.
    pub fn release(&mut self, handle: TransferHandle) {
        self.free.push(handle);
    }

    pub fn total_created(&self) -> u64 {
        self.total_created
    }

    pub fn total_reused(&self) -> u64 {
        self.total_reused
    }

    /// `total_created - total_reused` should equal the observed active
    /// peak for a cancelled run: no handles leaked.
    pub fn net_allocated(&self) -> u64 {
        self.total_created.saturating_sub(self.total_reused)
    }
}

impl Default for HandlePool {
    fn default() -> Self {
        Self::new()
    }
}
