use std::{
    sync::Mutex,
    task::{Context, Waker},
    thread::{self, Thread},
    time::{Duration, Instant},
};

/// Per-request completion signal.
///
/// Pass an `Arc<Notify>` to [`submit`][crate::DeviceTransfer::submit] to be
/// woken when that request has been reaped. A `Notify` wakes one subscriber:
/// the thread that last called [`wait`][Self::wait] /
/// [`wait_timeout`][Self::wait_timeout], or the task that last called
/// [`subscribe`][Self::subscribe].
pub struct Notify {
    state: Mutex<NotifyState>,
}

enum NotifyState {
    None,
    Waker(Waker),
    Thread(Thread),
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}

impl Notify {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotifyState::None),
        }
    }

    /// Register the task in `cx` to be woken on the next notification.
    pub fn subscribe(&self, cx: &mut Context) {
        *self.state.lock().unwrap() = NotifyState::Waker(cx.waker().clone());
    }

    /// Block the current thread until `check` returns `Some`.
    ///
    /// `check` is called once before blocking and again after every wakeup.
    pub fn wait<T>(&self, mut check: impl FnMut() -> Option<T>) -> T {
        *self.state.lock().unwrap() = NotifyState::Thread(thread::current());
        loop {
            if let Some(result) = check() {
                return result;
            }
            thread::park();
        }
    }

    /// Like [`wait`][Self::wait], but gives up and returns `None` once
    /// `timeout` has elapsed.
    pub fn wait_timeout<T>(
        &self,
        timeout: Duration,
        mut check: impl FnMut() -> Option<T>,
    ) -> Option<T> {
        *self.state.lock().unwrap() = NotifyState::Thread(thread::current());
        let start = Instant::now();
        loop {
            if let Some(result) = check() {
                return Some(result);
            }
            let remaining = timeout.checked_sub(start.elapsed())?;
            thread::park_timeout(remaining);
        }
    }

    pub fn notify(&self) {
        match &mut *self.state.lock().unwrap() {
            NotifyState::None => {}
            NotifyState::Waker(waker) => waker.wake_by_ref(),
            NotifyState::Thread(thread) => thread.unpark(),
        }
    }
}
