//! Cooperative cancellation token
//!
//! A single token is watched by all workers at well-defined suspension
//! points: between turns, at data-store I/O boundaries, and between rules
//! when a per-rule yield is configured. Cancellation is not an error;
//! batches finalize as cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been signalled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error-typed check for use at suspension points
    pub fn check(&self) -> retrodict_core::Result<()> {
        if self.is_cancelled() {
            Err(retrodict_core::RetrodictError::Cancelled)
        } else {
            Ok(())
        }
    }
}
