//! Pipeline composition primitive: a middleware is a unary higher-order
//! operator over `(envelope, cancel signal) -> InvocationResult`.

pub mod middleware;

use crate::envelope::InvocationEnvelope;
use crate::error::Code;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A cooperative cancellation signal. Composable by logical OR via
/// [`CancelSignal::with_deadline`], which derives a child signal that fires
/// when either the parent fires or the deadline elapses.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    reason: std::sync::Mutex<Option<Code>>,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        CancelSignal {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: std::sync::Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self, reason: Code) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            *self.inner.reason.lock().unwrap() = Some(reason);
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<Code> {
        *self.inner.reason.lock().unwrap()
    }

    /// Resolves once this signal is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Returns a fresh signal that cancels when either `self` cancels or
    /// `timeout` elapses, whichever comes first. If `timeout` has already
    /// elapsed (a non-positive duration), the returned signal is cancelled
    /// immediately with `Code::Timeout`.
    pub fn with_deadline(&self, timeout: Duration) -> CancelSignal {
        let child = CancelSignal::new();
        if timeout.is_zero() {
            child.cancel(Code::Timeout);
            return child;
        }

        let parent = self.clone();
        let child_for_parent = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_for_parent.cancel(parent.reason().unwrap_or(Code::Cancelled));
        });

        let child_for_timer = child.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            child_for_timer.cancel(Code::Timeout);
        });

        child
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The terminal handler a pipeline wraps around: takes an envelope and cancel
/// signal, returns a result. Both the transport core and every middleware
/// share this shape.
pub type Handler = Arc<
    dyn Fn(InvocationEnvelope, CancelSignal) -> BoxFuture<'static, crate::envelope::InvocationResult>
        + Send
        + Sync,
>;

/// A pipeline stage: given `next`, returns a new handler of the same shape.
/// Implementors may pre-mutate the envelope, short-circuit without calling
/// `next`, post-process the result, or observe/propagate cancellation.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Handler) -> Handler;
}

/// Composes `middleware` around `core` via right-fold, so index 0 is
/// outermost (runs first on entry, last on return).
pub fn build_pipeline(middleware: &[Arc<dyn Middleware>], core: Handler) -> Handler {
    middleware.iter().rev().fold(core, |next, mw| mw.wrap(next))
}
