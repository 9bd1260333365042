//! The transfer engine for one open device.
//!
//! An [`Engine`] owns the device node and two helper threads: the reaper,
//! which collects URBs the kernel has finished with, and the watchdog, which
//! notices when the device goes away. All request state lives in one
//! [`Registry`] behind one mutex; the condition variable next to it is the
//! shared completion signal `reap_any` waits on.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use rustix::io::Errno;

use crate::{
    platform::{errno_to_error, fragment_urb, LinuxUsbFs, UsbFs, DEFAULT_MAX_FRAGMENT_LEN},
    transfer::{Notify, Urb, UrbHandle, UrbKind},
    DeviceTransfer, Error, ErrorKind,
};

mod registry;
use registry::{Completion, Pinned, Registry, SubmissionId, SubmissionKind};

mod reaper;
mod shim;
mod watchdog;

#[cfg(test)]
mod mock;

/// Largest data stage the kernel accepts for a synchronous control transfer.
pub const MAX_SYNC_CONTROL_LEN: usize = 4096;

/// Tuning knobs of an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Largest buffer of a single kernel URB. Larger requests are split.
    pub max_fragment_len: usize,

    /// How long the reaper blocks waiting for a completion before it checks
    /// for shutdown.
    pub reap_interval: Duration,

    /// Interval at which the watchdog checks whether the device is gone.
    pub watchdog_interval: Duration,

    /// Interval at which an unbounded [`reap_any`][DeviceTransfer::reap_any]
    /// re-checks for shutdown.
    pub recheck_interval: Duration,

    /// Timeout of [`process_control`][DeviceTransfer::process_control],
    /// [`process_bulk`][DeviceTransfer::process_bulk] and of default endpoint
    /// requests.
    pub sync_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
            reap_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_millis(100),
            recheck_interval: Duration::from_millis(50),
            sync_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineOptions {
    pub fn with_max_fragment_len(mut self, len: usize) -> Self {
        self.max_fragment_len = len.max(1);
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

/// What revealed that the device is gone.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The device node reported an error or hangup condition.
    Hangup,

    /// Reaping completions failed.
    Reap,

    /// A submission or synchronous transfer failed.
    Transfer,
}

/// Sent once to every [`Engine::watch_disconnect`] receiver.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    pub cause: DisconnectCause,
}

pub(crate) struct Shared<F> {
    // Dropped first: closing the device makes the kernel give up every URB
    // before the fragment memory in the registry is freed.
    fs: F,
    registry: Mutex<Registry>,
    completed: Condvar,
    options: EngineOptions,
    shutdown: AtomicBool,
    disconnected: OnceCell<DisconnectCause>,
    subscribers: Mutex<Vec<mpsc::Sender<DisconnectEvent>>>,
}

impl<F: UsbFs> Shared<F> {
    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.get().is_some()
    }

    fn check_connected(&self) -> Result<(), Error> {
        if self.is_disconnected() {
            Err(Error::new(ErrorKind::Disconnected, "device disconnected"))
        } else {
            Ok(())
        }
    }

    /// Record the disconnect and tell subscribers. Only the first call has
    /// any effect.
    fn mark_disconnected(&self, cause: DisconnectCause) {
        if self.disconnected.set(cause).is_err() {
            return;
        }
        warn!("Device disconnected ({cause:?})");
        let event = DisconnectEvent { cause };
        for tx in self.subscribers.lock().unwrap().drain(..) {
            let _ = tx.send(event);
        }
        self.completed.notify_all();
    }

    fn dispatch(&self, completion: Completion) {
        if completion.notify() {
            self.completed.notify_all();
        }
    }

    /// Split `urb` into fragments, register them and hand them to the kernel.
    fn submit_native(
        &self,
        urb: Urb,
        kind: SubmissionKind,
        signal: Option<Arc<Notify>>,
    ) -> Result<SubmissionId, Error> {
        let handle = urb.handle;
        let endpoint = urb.endpoint;
        let fragments = fragment_urb(&urb, self.options.max_fragment_len)?;
        let (id, urbs) = self
            .registry
            .lock()
            .unwrap()
            .insert_native(urb, kind, fragments, signal)?;

        debug!(
            "Submitting {handle} on endpoint {endpoint:02x} as {} URB(s)",
            urbs.len()
        );

        for (i, &(_, ptr)) in urbs.iter().enumerate() {
            // SAFETY: the fragment is owned by the pending index and is only
            // freed after the kernel returns it or the device is closed.
            let Err(e) = (unsafe { self.fs.submit_urb(ptr) }) else {
                continue;
            };
            debug!("Submitting fragment {i} of {handle} failed: {e}");

            let pinned = self
                .registry
                .lock()
                .unwrap()
                .unwind_submit(id, &urbs[..i], &urbs[i..]);
            let unwound = self.discard(&pinned);

            if matches!(e, Errno::NODEV | Errno::SHUTDOWN) || unwound.is_err() {
                self.mark_disconnected(DisconnectCause::Transfer);
                return Err(errno_to_error(
                    unwound.err().unwrap_or(e),
                    "device disconnected while submitting",
                ));
            }
            return Err(errno_to_error(e, "failed to submit URB").log_error());
        }

        Ok(id)
    }

    /// Discard pinned fragments in the kernel, then unpin them. Only a
    /// disconnect is reported; other failures mean the URB already finished.
    fn discard(&self, pinned: &Pinned) -> Result<(), Errno> {
        let mut result = Ok(());
        for &(_, urb) in pinned {
            // SAFETY: pinned fragments stay allocated until `unpin`.
            match unsafe { self.fs.discard_urb(urb) } {
                Ok(()) => {}
                Err(e @ (Errno::NODEV | Errno::SHUTDOWN)) => result = Err(e),
                Err(e) => debug!("Discarding URB {urb:?} failed: {e}"),
            }
        }
        if !pinned.is_empty() {
            self.registry.lock().unwrap().unpin(pinned);
        }
        result
    }

    fn cancel(&self, handle: UrbHandle) -> Result<(), Error> {
        let (completion, pinned) = self.registry.lock().unwrap().cancel(handle)?;
        debug!("Cancelled {handle}, discarding {} URB(s)", pinned.len());
        self.dispatch(completion);

        self.discard(&pinned).map_err(|e| {
            self.mark_disconnected(DisconnectCause::Transfer);
            errno_to_error(e, "device disconnected while cancelling")
        })
    }

    fn forget(&self, handle: UrbHandle) -> Result<(), Error> {
        self.registry.lock().unwrap().forget(handle)
    }

    fn reap_specific(&self, handle: UrbHandle) -> Option<Urb> {
        let sub = self.registry.lock().unwrap().take(handle)?;
        Some(sub.into_urb())
    }
}

/// Asynchronous transfer engine on top of usbfs.
///
/// Dropping the engine stops its threads and closes the device. Requests
/// still in flight are given up.
pub struct Engine<F: UsbFs = LinuxUsbFs> {
    shared: Arc<Shared<F>>,
    threads: Vec<JoinHandle<()>>,
}

impl<F: UsbFs> Engine<F> {
    /// Start an engine on `fs` with default options.
    pub fn new(fs: F) -> Result<Engine<F>, Error> {
        Self::with_options(fs, EngineOptions::default())
    }

    pub fn with_options(fs: F, options: EngineOptions) -> Result<Engine<F>, Error> {
        if options.max_fragment_len == 0 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "max_fragment_len must not be zero",
            ));
        }
        let shared = Arc::new(Shared {
            fs,
            registry: Mutex::new(Registry::default()),
            completed: Condvar::new(),
            options,
            shutdown: AtomicBool::new(false),
            disconnected: OnceCell::new(),
            subscribers: Mutex::new(Vec::new()),
        });

        let mut engine = Engine {
            shared,
            threads: Vec::with_capacity(2),
        };
        engine.spawn("usbfs-reaper", reaper::run)?;
        engine.spawn("usbfs-watchdog", watchdog::run)?;
        Ok(engine)
    }

    fn spawn(&mut self, name: &str, f: fn(Arc<Shared<F>>)) -> Result<(), Error> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || f(shared))
            .map_err(|e| {
                warn!("Failed to start {name} thread: {e}");
                Error::new(ErrorKind::Other, "failed to start engine thread")
            })?;
        self.threads.push(handle);
        Ok(())
    }

    /// The device the engine operates on.
    pub fn usbfs(&self) -> &F {
        &self.shared.fs
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }

    /// Whether the device is known to be gone.
    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// Get notified when the device goes away.
    ///
    /// Every receiver gets exactly one event, immediately if the device is
    /// already known to be gone.
    pub fn watch_disconnect(&self) -> mpsc::Receiver<DisconnectEvent> {
        let (tx, rx) = mpsc::channel();
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        match self.shared.disconnected.get() {
            Some(&cause) => {
                let _ = tx.send(DisconnectEvent { cause });
            }
            None => subscribers.push(tx),
        }
        rx
    }

    /// Stop the helper threads. Blocked and later calls to
    /// [`reap_any`][DeviceTransfer::reap_any] return `None` once nothing is
    /// left to reap.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!("Shutting down transfer engine");
        }
        self.shared.completed.notify_all();
    }

    fn wait_wrapped(&self, urb: Urb, kind: SubmissionKind) -> Result<Urb, Error> {
        let handle = urb.handle;
        let notify = Arc::new(Notify::new());
        self.shared.submit_native(urb, kind, Some(notify.clone()))?;
        self.wait_private(handle, &notify)
    }

    /// Run a default-endpoint standard request on the worker and block until
    /// it finished.
    fn wait_default_control(&self, urb: Urb) -> Result<Urb, Error> {
        let handle = urb.handle;
        let notify = Arc::new(Notify::new());
        shim::submit_default_control(&self.shared, urb, Some(notify.clone()), true)?;
        self.wait_private(handle, &notify)
    }

    /// Wait for a private submission. On timeout it is cancelled if possible
    /// and forgotten, so nothing is left registered for `handle`.
    fn wait_private(&self, handle: UrbHandle, notify: &Notify) -> Result<Urb, Error> {
        if let Some(urb) =
            notify.wait_timeout(self.shared.options.sync_timeout, || self.shared.reap_specific(handle))
        {
            return Ok(urb);
        }

        if let Err(e) = self.shared.cancel(handle) {
            debug!("Cancelling timed out {handle} failed: {e}");
        }
        self.shared.forget(handle)?;
        Err(Error::new(ErrorKind::TimedOut, "transfer timed out").log_debug())
    }
}

impl<F: UsbFs> DeviceTransfer for Engine<F> {
    fn submit(&self, urb: Urb, signal: Option<Arc<Notify>>) -> Result<(), Error> {
        self.shared.check_connected()?;
        if urb.is_default_standard_request() && urb.requested_len() <= MAX_SYNC_CONTROL_LEN {
            return shim::submit_default_control(&self.shared, urb, signal, false);
        }
        self.shared
            .submit_native(urb, SubmissionKind::Async, signal)
            .map(|_| ())
    }

    fn cancel(&self, handle: UrbHandle) -> Result<(), Error> {
        self.shared.check_connected()?;
        self.shared.cancel(handle)
    }

    fn forget(&self, handle: UrbHandle) -> Result<(), Error> {
        self.shared.check_connected()?;
        self.shared.forget(handle)
    }

    fn reap_any(&self, timeout: Option<Duration>) -> Option<Urb> {
        let shared = &*self.shared;

        if timeout == Some(Duration::ZERO) {
            let sub = shared.registry.try_lock().ok()?.pop_any()?;
            return Some(sub.into_urb());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut registry = shared.registry.lock().unwrap();
        loop {
            if let Some(sub) = registry.pop_any() {
                drop(registry);
                return Some(sub.into_urb());
            }
            if shared.is_shut_down() {
                return None;
            }
            let wait = match deadline {
                None => shared.options.recheck_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    deadline - now
                }
            };
            registry = shared.completed.wait_timeout(registry, wait).unwrap().0;
        }
    }

    fn reap_specific(&self, handle: UrbHandle) -> Option<Urb> {
        self.shared.reap_specific(handle)
    }

    fn process_control(&self, mut urb: Urb) -> Result<Urb, Error> {
        self.shared.check_connected()?;
        let Some(setup) = urb.setup() else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "not a control transfer",
            ));
        };

        if urb.requested_len() > MAX_SYNC_CONTROL_LEN {
            return self.wait_wrapped(urb, SubmissionKind::SyncWrapControl);
        }
        if urb.is_default_standard_request() {
            return self.wait_default_control(urb);
        }

        let result = shim::execute_control(
            &self.shared.fs,
            setup,
            &mut urb.buffer,
            self.shared.options.sync_timeout,
        );
        shim::finish_sync(&self.shared, &mut urb, result);
        Ok(urb)
    }

    fn process_bulk(&self, mut urb: Urb) -> Result<Urb, Error> {
        self.shared.check_connected()?;
        match urb.kind {
            UrbKind::Bulk | UrbKind::Interrupt => {}
            UrbKind::Isochronous(_) => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    "isochronous transfers cannot be processed synchronously",
                ))
            }
            UrbKind::Control(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "control transfers go through process_control",
                ))
            }
        }

        if urb.flags.short_not_ok
            || urb.flags.zero_packet
            || urb.requested_len() > self.shared.options.max_fragment_len
        {
            return self.wait_wrapped(urb, SubmissionKind::SyncWrapBulk);
        }

        let result = self.shared.fs.bulk(
            urb.endpoint,
            &mut urb.buffer,
            self.shared.options.sync_timeout,
        );
        shim::finish_sync(&self.shared, &mut urb, result);
        Ok(urb)
    }
}

impl<F: UsbFs> Drop for Engine<F> {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("Engine thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests;
