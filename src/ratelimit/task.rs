//! Bookkeeping for the limiters' background loops.

use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a background loop as running for as long as it is held.
///
/// The flag is cleared on drop, so a loop that exits (or whose future is
/// dropped) frees the slot for a later start.
pub(crate) struct LoopGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> LoopGuard<'a> {
    /// Claim the slot, or `None` if another loop already holds it.
    pub(crate) fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}
