//! Requests that run on the synchronous ioctls instead of URBs.

use std::{sync::Arc, time::Duration};

use log::debug;
use rustix::io::Errno;

use super::{DisconnectCause, Shared};
use crate::{
    platform::{errno_to_status, UsbFs},
    transfer::{
        ControlSetup, Direction, Notify, Recipient, Urb, FEATURE_ENDPOINT_HALT,
        STANDARD_REQUEST_CLEAR_FEATURE, STANDARD_REQUEST_SET_CONFIGURATION,
        STANDARD_REQUEST_SET_INTERFACE,
    },
    Error, ErrorKind, UrbStatus,
};

/// Run a control request, routing the standard requests that change
/// device state through their dedicated ioctls so the kernel's view of the
/// device stays in sync.
pub(super) fn execute_control<F: UsbFs>(
    fs: &F,
    setup: ControlSetup,
    data: &mut [u8],
    timeout: Duration,
) -> Result<usize, Errno> {
    if setup.is_standard() && setup.direction() == Direction::Out {
        match (setup.request, setup.recipient()) {
            (STANDARD_REQUEST_SET_CONFIGURATION, Some(Recipient::Device)) => {
                return fs.set_configuration(setup.value as u8).map(|()| 0);
            }
            (STANDARD_REQUEST_SET_INTERFACE, Some(Recipient::Interface)) => {
                return fs
                    .set_interface(setup.index as u8, setup.value as u8)
                    .map(|()| 0);
            }
            (STANDARD_REQUEST_CLEAR_FEATURE, Some(Recipient::Endpoint))
                if setup.value == FEATURE_ENDPOINT_HALT =>
            {
                return fs.clear_halt(setup.index as u8).map(|()| 0);
            }
            _ => {}
        }
    }
    fs.control(setup, data, timeout)
}

/// Record the outcome of a synchronous ioctl in `urb`.
pub(super) fn finish_sync<F: UsbFs>(
    shared: &Shared<F>,
    urb: &mut Urb,
    result: Result<usize, Errno>,
) {
    let (status, actual_len) = outcome(shared, result);
    urb.status = status;
    urb.actual_len = actual_len.min(urb.buffer.len());
}

fn outcome<F: UsbFs>(shared: &Shared<F>, result: Result<usize, Errno>) -> (UrbStatus, usize) {
    match result {
        Ok(n) => (UrbStatus::Complete, n),
        Err(e) => {
            let status = errno_to_status(e);
            if status == UrbStatus::Disconnected {
                shared.mark_disconnected(DisconnectCause::Transfer);
            }
            (status, 0)
        }
    }
}

/// Queue a standard request on the default endpoint.
///
/// There is no URB for it: the request is registered like any other and
/// executed on the blocking thread pool, and its completion is published the
/// same way as a reaped URB's. A `private` request is only handed to the
/// caller blocked on `signal`.
pub(super) fn submit_default_control<F: UsbFs>(
    shared: &Arc<Shared<F>>,
    urb: Urb,
    signal: Option<Arc<Notify>>,
    private: bool,
) -> Result<(), Error> {
    let Some(setup) = urb.setup() else {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            "not a control transfer",
        ));
    };
    let handle = urb.handle;
    let (id, mut buffer) = shared
        .registry
        .lock()
        .unwrap()
        .insert_wrapped(urb, signal, private)?;
    debug!("Running {handle} (request {:02x}) on a worker", setup.request);

    let shared = shared.clone();
    blocking::unblock(move || {
        let result = execute_control(&shared.fs, setup, &mut buffer, shared.options.sync_timeout);
        if let Err(e) = result {
            debug!("Default control request {handle} failed: {e}");
        }
        let (status, actual_len) = outcome(&shared, result);
        let completion = shared
            .registry
            .lock()
            .unwrap()
            .complete_wrapped(id, buffer, status, actual_len);
        shared.dispatch(completion);
    })
    .detach();

    Ok(())
}
