//! Hierarchical cancellation scopes for calls.
//!
//! Every client owns a root scope, every logical execution gets a child of
//! it, and every physical exchange gets a child of the execution. Cancelling
//! a scope cascades to all of its descendants. The first recorded
//! [`CancelCause`] wins, and descendants without a cause of their own report
//! the nearest ancestor's cause, so a body reader deep inside a call learns
//! that the request timeout fired rather than seeing an anonymous
//! cancellation.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{Error, Result};

/// Why a scope was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelCause {
    /// The call finished and released its resources
    Completed,
    /// A send interceptor replaced the call with a newer one
    Superseded,
    /// The owning client was closed
    ClientClosed,
    /// The request timeout expired
    RequestTimeout { url: String, timeout: Duration },
    /// Cancelled explicitly, or because the call failed
    Cancelled(String),
}

impl CancelCause {
    /// Map this cause to the error surfaced to readers of the scope
    pub fn to_error(&self) -> Error {
        match self {
            CancelCause::Completed => Error::cancelled("call has already completed"),
            CancelCause::Superseded => Error::cancelled("call was superseded by a newer send"),
            CancelCause::ClientClosed => Error::EngineClosed,
            CancelCause::RequestTimeout { url, timeout } => Error::request_timeout(url.clone(), *timeout),
            CancelCause::Cancelled(message) => Error::cancelled(message.clone()),
        }
    }
}

struct ScopeInner {
    token: CancellationToken,
    cause: Mutex<Option<CancelCause>>,
    parent: Option<CallScope>,
}

/// Cancellation scope with a recorded cause
#[derive(Clone)]
pub struct CallScope {
    inner: Arc<ScopeInner>,
}

impl CallScope {
    /// Create a scope without a parent
    pub fn root() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: CancellationToken::new(),
                cause: Mutex::new(None),
                parent: None,
            }),
        }
    }

    /// Create a child scope that is cancelled whenever this one is
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                token: self.inner.token.child_token(),
                cause: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this scope and all of its descendants
    ///
    /// Returns `false` when the scope was already cancelled, in which case the
    /// original cause is kept.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        let recorded = match self.inner.cause.lock() {
            Ok(mut slot) if slot.is_none() && !self.inner.token.is_cancelled() => {
                *slot = Some(cause);
                true
            }
            _ => false,
        };
        self.inner.token.cancel();
        recorded
    }

    /// Mark the scope as completed, releasing every resource bound to it
    pub fn complete(&self) {
        self.cancel(CancelCause::Completed);
    }

    /// Check whether the scope was cancelled or completed
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Check whether the scope ended through [`CallScope::complete`]
    pub fn is_completed(&self) -> bool {
        matches!(self.cause(), Some(CancelCause::Completed))
    }

    /// The cause recorded on this scope or the nearest cancelled ancestor
    pub fn cause(&self) -> Option<CancelCause> {
        if let Ok(slot) = self.inner.cause.lock() {
            if let Some(cause) = slot.as_ref() {
                return Some(cause.clone());
            }
        }
        match &self.inner.parent {
            Some(parent) if parent.is_cancelled() => parent.cause(),
            _ => None,
        }
    }

    /// The error readers of this scope should observe after cancellation
    pub fn error(&self) -> Error {
        self.cause()
            .map(|cause| cause.to_error())
            .unwrap_or_else(|| Error::cancelled("call scope was cancelled"))
    }

    /// Fail with the scope's error if it is already cancelled
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(self.error())
        } else {
            Ok(())
        }
    }

    /// Wait until the scope is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Owned future resolving when the scope is cancelled
    pub fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    /// Run `future` until it finishes or the scope is cancelled
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => Err(self.error()),
            result = future => result,
        }
    }

    /// Get the underlying cancellation token
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl fmt::Debug for CallScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallScope")
            .field("cancelled", &self.is_cancelled())
            .field("cause", &self.cause())
            .finish()
    }
}
