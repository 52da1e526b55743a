//! One-shot signals built on channel disconnection
//!
//! Raising a signal drops the only sender, which disconnects every receiver at
//! once. Observers can therefore test it without blocking (`try_recv`), wait
//! on it with a timeout, or include it in a `crossbeam_channel::select!`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// One-shot broadcast signal
pub struct Signal {
    trigger: Mutex<Option<Sender<()>>>,
    observer: Receiver<()>,
}

impl Signal {
    pub fn new() -> Self {
        let (trigger, observer) = bounded(0);
        Self {
            trigger: Mutex::new(Some(trigger)),
            observer,
        }
    }

    /// Raise the signal; returns `true` only for the call that raised it
    pub fn raise(&self) -> bool {
        let trigger = self.trigger.lock().take();
        trigger.is_some()
    }

    /// Non-blocking check
    pub fn is_raised(&self) -> bool {
        matches!(self.observer.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Block for at most `timeout`; returns whether the signal was raised
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.observer.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Receiver that becomes ready (with `Err`) once the signal is raised
    pub fn receiver(&self) -> &Receiver<()> {
        &self.observer
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation context handed to task bodies
///
/// Bodies are expected to check it at their I/O boundaries; nothing preempts
/// a body that ignores it.
#[derive(Clone)]
pub struct CancelToken {
    signal: Arc<Signal>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            signal: Arc::new(Signal::new()),
        }
    }

    pub fn cancel(&self) -> bool {
        self.signal.raise()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_raised()
    }

    /// Sleep for up to `timeout`, waking early on cancellation
    ///
    /// Returns `true` if the token was cancelled.
    pub fn sleep(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        self.signal.receiver()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
