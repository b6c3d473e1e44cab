//! Pipeline-wide cooperative cancellation flag.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TokenState {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// A shared, monotonic stop flag.
///
/// Every stage and queue of a pipeline holds a clone of the same token. Once
/// cancelled it is never cleared; only the first cancellation reason is kept.
/// Workers never wait on the token directly, they check it whenever a queue
/// wait times out.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent; returns `true` for the call that
    /// actually flipped the flag.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        // The reason is in place before the flag becomes visible.
        let mut slot = self.state.reason.write();
        if self.state.cancelled.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Some(reason.into());
        self.state.cancelled.store(true, Ordering::SeqCst);
        true
    }

    /// Whether any clone of this token has been cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// The reason passed to the first `cancel` call, if any
    pub fn reason(&self) -> Option<String> {
        self.state.reason.read().clone()
    }
}
