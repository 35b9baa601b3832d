//! Execution-context identity.
//!
//! A logical caller (an editor session, a scheduled job, a deployment flow)
//! carries one `CallerContext` through every task it hops onto. Lock
//! reentrancy and cancellation are keyed to it rather than to a thread.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    id: ContextId,
    cancellation: CancellationToken,
}

impl Default for CallerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerContext {
    /// A new, independent execution context.
    pub fn new() -> Self {
        Self {
            id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Same logical caller on another task: shares the id, and is cancelled
    /// with the parent (but can be cancelled on its own).
    pub fn child(&self) -> Self {
        Self {
            id: self.id,
            cancellation: self.cancellation.child_token(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
