//! One-shot fatal-error latch.
//!
//! The source guards against reentrant fatal-error delivery with a single
//! static boolean. Here each [`DisplayBackend`](crate::backend::DisplayBackend)
//! and [`ControlSession`](crate::control::ControlSession) carries its own
//! [`FatalLatch`], a per-object atomic compare-and-swap instead, so two
//! unrelated sessions never block on each other's latch.

use std::sync::atomic::{AtomicBool, Ordering};

/// Handler invoked at most once per owning object.
pub type FatalErrorHandler = std::sync::Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FatalLatch {
    fired: AtomicBool,
}

impl FatalLatch {
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// Attempts to claim the latch. Returns `true` exactly once across the
    /// lifetime of this object; every subsequent call (including reentrant
    /// ones from within the handler itself) returns `false`.
    pub fn try_claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
