//! Future returned by the history scheduler
//!
//! All bookkeeping happens when the scheduler method is called; the
//! `Completion` only reports how the queued work ended. Dropping it does not
//! cancel anything.

use crate::errors::HistoryError;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub(crate) type Responder = oneshot::Sender<Result<(), HistoryError>>;

enum Inner {
    Ready(Option<Result<(), HistoryError>>),
    Waiting(oneshot::Receiver<Result<(), HistoryError>>),
}

/// Resolves once the scheduled work settles
#[must_use = "a Completion reports whether the scheduled work succeeded"]
pub struct Completion {
    inner: Inner,
}

impl Completion {
    /// Already settled
    pub fn ready(result: Result<(), HistoryError>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    pub(crate) fn channel() -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                inner: Inner::Waiting(rx),
            },
        )
    }

    /// Settled without waiting, if the result is already known
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, Inner::Ready(_))
    }
}

impl Future for Completion {
    type Output = Result<(), HistoryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Ready(result) => Poll::Ready(result.take().unwrap_or(Err(HistoryError::SchedulerClosed))),
            Inner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender dropped: the scheduler went away before settling
                Poll::Ready(Err(_)) => Poll::Ready(Err(HistoryError::SchedulerClosed)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            Inner::Ready(_) => "ready",
            Inner::Waiting(_) => "waiting",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}
