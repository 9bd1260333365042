use std::{sync::Arc, time::Duration};

use crate::{
    transfer::{Notify, Urb, UrbHandle},
    Error,
};

/// Transfer operations on an open device.
///
/// Requests are moved in with [`submit`][Self::submit] and handed back,
/// completed or cancelled, by exactly one of [`reap_any`][Self::reap_any] or
/// [`reap_specific`][Self::reap_specific], unless they are
/// [forgotten][Self::forget].
pub trait DeviceTransfer {
    /// Queue a request.
    ///
    /// The request is split into as many kernel URBs as needed. If `signal`
    /// is given it is notified when the request completes.
    ///
    /// On error the request is dropped and nothing of it stays registered.
    /// Fails with [`ErrorKind::Busy`][crate::ErrorKind::Busy] if a request
    /// with the same handle is outstanding.
    fn submit(&self, urb: Urb, signal: Option<Arc<Notify>>) -> Result<(), Error>;

    /// Stop a pending request.
    ///
    /// The request completes immediately with the data the device already
    /// transferred and status [`Cancelled`][crate::UrbStatus::Cancelled]; it
    /// still has to be reaped. Cancelling a request that already completed
    /// does nothing.
    fn cancel(&self, handle: UrbHandle) -> Result<(), Error>;

    /// Drop interest in a request's result.
    ///
    /// A completed result is discarded now; a pending one is discarded when
    /// it completes, and the request is never returned by a reap method.
    fn forget(&self, handle: UrbHandle) -> Result<(), Error>;

    /// Take the oldest completed request.
    ///
    /// `Some(Duration::ZERO)` never blocks, `None` waits until a request
    /// completes.
    fn reap_any(&self, timeout: Option<Duration>) -> Option<Urb>;

    /// Take the request with this handle if it has completed.
    fn reap_specific(&self, handle: UrbHandle) -> Option<Urb>;

    /// Execute a control request and wait for it to finish.
    fn process_control(&self, urb: Urb) -> Result<Urb, Error>;

    /// Execute a bulk or interrupt request and wait for it to finish.
    fn process_bulk(&self, urb: Urb) -> Result<Urb, Error>;
}
