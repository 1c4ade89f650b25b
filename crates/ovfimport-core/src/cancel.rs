//! Operator cancellation.
//!
//! A [`CancelToken`] is shared between the pipeline and whoever may want to
//! stop it (a signal handler, a server shutting down). Cancelling drops the
//! only sender of an internal channel, so every waiter blocked in
//! [`CancelToken::sleep`] wakes immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{after, bounded, select, Receiver, Sender};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

/// Cloneable cancellation signal scoped to one pipeline invocation.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if the token has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with `Err(Error::Cancelled)` if the
    /// token is cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        select! {
            recv(self.inner.receiver) -> _ => Err(Error::Cancelled),
            recv(after(duration)) -> _ => self.check(),
        }
    }
}
