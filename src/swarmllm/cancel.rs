//! Cooperative cancellation tokens.
//!
//! A [`CancelToken`] is a cheaply cloneable flag that tasks poll or await.
//! The engine creates one child token per task; tripping the parent trips
//! every child, while a child can be tripped individually (e.g. on task
//! timeout) without affecting siblings.
//!
//! # Example
//!
//! ```rust
//! use swarmllm::cancel::CancelToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let root = CancelToken::new();
//! let child = root.child();
//!
//! assert!(!child.is_cancelled());
//! root.cancel();
//! assert!(child.is_cancelled());
//! child.cancelled().await; // resolves immediately once tripped
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner {
    flag: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Inner>>,
}

impl Inner {
    fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }
}

/// A clonable cancellation flag with parent/child propagation.
///
/// Cloning shares the same flag; [`CancelToken::child`] creates a new flag
/// that also observes the parent's state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a fresh, untripped token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Create a child token: cancelled when either the child itself or any
    /// ancestor is cancelled.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    /// Trip the token. Idempotent; wakes every waiter on this token.
    ///
    /// Children are not woken synchronously — they observe the parent flag on
    /// their next poll, which is why [`CancelToken::cancelled`] re-checks the
    /// chain on a timer-free notify loop.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether this token or any ancestor has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolve once the token (or an ancestor) is tripped.
    pub async fn cancelled(&self) {
        // Register interest on every level of the chain before re-checking
        // the flags; `enable` closes the check-then-wait race with cancel().
        let mut chain = Vec::new();
        let mut node = Some(self.inner.clone());
        while let Some(inner) = node {
            node = inner.parent.clone();
            chain.push(inner);
        }

        loop {
            let mut waits: Vec<std::pin::Pin<Box<tokio::sync::futures::Notified<'_>>>> = chain
                .iter()
                .map(|inner| Box::pin(inner.notify.notified()))
                .collect();
            for wait in &mut waits {
                wait.as_mut().enable();
            }
            if self.is_cancelled() {
                return;
            }
            futures_util::future::select_all(waits).await;
            if self.is_cancelled() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn parent_cancel_propagates_to_child() {
        let root = CancelToken::new();
        let child = root.child();
        root.cancel();
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child waiter must observe parent cancel");
    }

    #[tokio::test]
    async fn child_cancel_does_not_affect_parent_or_sibling() {
        let root = CancelToken::new();
        let a = root.child();
        let b = root.child();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
