//! Lock that is inert until shared, then reentrant per caller context.
//!
//! A project is built privately by the call path that opens it; while
//! unshared, locking is a no-op. Once [`ShareableLock::share`] is called the
//! lock serializes callers: a context already holding it may re-enter, any
//! other context waits for the holder to release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use projhub_core::{CallerContext, ContextId, ProjectError};
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct HoldState {
    holder: Option<ContextId>,
    depth: usize,
}

#[derive(Debug, Default)]
pub struct ShareableLock {
    shared: AtomicBool,
    state: Mutex<HoldState>,
    released: Notify,
}

/// Releases one level of the lock when dropped.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ShareableLockGuard<'a> {
    lock: &'a ShareableLock,
    held: bool,
}

impl ShareableLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to shared mode. Later calls have no effect.
    pub fn share(&self) {
        self.shared.store(true, Ordering::Release);
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    fn hold_state(&self) -> MutexGuard<'_, HoldState> {
        // The state is a plain counter: a panic while holding it cannot leave it half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_acquire(&self, id: ContextId) -> bool {
        let mut state = self.hold_state();
        match state.holder {
            None => {
                state.holder = Some(id);
                state.depth = 1;
                true
            }
            Some(holder) if holder == id => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn release(&self) {
        let mut state = self.hold_state();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.holder = None;
            drop(state);
            self.released.notify_waiters();
        }
    }

    /// Acquire the lock for `ctx`, waiting while another context holds it.
    ///
    /// Fails with `Cancelled` if `ctx` is cancelled while waiting.
    pub async fn lock(&self, ctx: &CallerContext) -> Result<ShareableLockGuard<'_>, ProjectError> {
        self.acquire(ctx, true).await
    }

    /// Like [`ShareableLock::lock`] but keeps waiting when `ctx` is cancelled.
    pub async fn lock_uncancellable(&self, ctx: &CallerContext) -> ShareableLockGuard<'_> {
        match self.acquire(ctx, false).await {
            Ok(guard) => guard,
            Err(_) => unreachable!("uncancellable acquisition cannot fail"),
        }
    }

    async fn acquire(
        &self,
        ctx: &CallerContext,
        cancellable: bool,
    ) -> Result<ShareableLockGuard<'_>, ProjectError> {
        if !self.is_shared() {
            return Ok(ShareableLockGuard {
                lock: self,
                held: false,
            });
        }

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release in between is not missed.
            released.as_mut().enable();

            if self.try_acquire(ctx.id()) {
                trace!("{} acquired project lock", ctx.id());
                return Ok(ShareableLockGuard {
                    lock: self,
                    held: true,
                });
            }

            tokio::select! {
                _ = &mut released => {}
                _ = ctx.cancelled(), if cancellable => return Err(ProjectError::Cancelled),
            }
        }
    }

    /// Context currently holding the lock, if any.
    pub fn holder(&self) -> Option<ContextId> {
        self.hold_state().holder
    }
}

impl Drop for ShareableLockGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_unshared_lock_is_inert() {
        let lock = ShareableLock::new();
        let a = CallerContext::new();
        let b = CallerContext::new();

        let _ga = lock.lock(&a).await.unwrap();
        let _gb = lock.lock(&b).await.unwrap();
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_reentrant_for_same_context() {
        let lock = ShareableLock::new();
        lock.share();
        let ctx = CallerContext::new();

        let outer = lock.lock(&ctx).await.unwrap();
        let inner = lock.lock(&ctx).await.unwrap();
        let child = lock.lock(&ctx.child()).await.unwrap();
        assert_eq!(lock.holder(), Some(ctx.id()));

        drop(child);
        drop(inner);
        assert_eq!(lock.holder(), Some(ctx.id()));
        drop(outer);
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_other_context_waits_for_release() {
        let lock = Arc::new(ShareableLock::new());
        lock.share();
        let a = CallerContext::new();
        let b = CallerContext::new();

        let guard = lock.lock(&a).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            let b = b.clone();
            tokio::spawn(async move {
                let _g = lock.lock(&b).await.unwrap();
                lock.holder()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let holder = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder, Some(b.id()));
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_waiting_is_cancellable() {
        let lock = ShareableLock::new();
        lock.share();
        let a = CallerContext::new();
        let b = CallerContext::new();

        let _guard = lock.lock(&a).await.unwrap();
        b.cancel();
        let err = lock.lock(&b).await.unwrap_err();
        assert_eq!(err, ProjectError::Cancelled);
        assert_eq!(lock.holder(), Some(a.id()));
    }

    #[tokio::test]
    async fn test_uncancellable_ignores_cancellation() {
        let lock = Arc::new(ShareableLock::new());
        lock.share();
        let a = CallerContext::new();
        let b = CallerContext::new();
        b.cancel();

        let guard = lock.lock(&a).await.unwrap();
        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _g = lock.lock_uncancellable(&b).await;
                lock.holder()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let holder = waiter.await.unwrap();
        assert!(holder.is_some());
    }

    #[tokio::test]
    async fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(ShareableLock::new());
        lock.share();
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let ctx = CallerContext::new();
                for _ in 0..10 {
                    let _g = lock.lock(&ctx).await.unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
