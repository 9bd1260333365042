use std::{sync::Arc, thread};

use log::{debug, error, warn};
use rustix::io::Errno;

use super::{Completion, DisconnectCause, Shared};
use crate::platform::{urb_status, Fragment, RawUrb, UsbFs};

/// Reaper thread: collect completed URBs until shutdown or disconnect.
pub(super) fn run<F: UsbFs>(shared: Arc<Shared<F>>) {
    debug!("Reaper started");
    while !shared.is_shut_down() {
        match shared.fs.reap_urb(shared.options.reap_interval) {
            Ok(Some(urb)) => handle_reaped(&shared, urb),
            Ok(None) | Err(Errno::INTR | Errno::AGAIN) => {}
            Err(Errno::NODEV | Errno::SHUTDOWN) => {
                shared.mark_disconnected(DisconnectCause::Reap);
                let completions = shared.registry.lock().unwrap().drain_disconnected();
                debug!(
                    "Resolved {} pending request(s) after disconnect",
                    completions.len()
                );
                for completion in completions {
                    shared.dispatch(completion);
                }
                break;
            }
            Err(e) => {
                error!("Unexpected error {e} from REAPURBNDELAY");
                thread::sleep(shared.options.reap_interval);
            }
        }
    }
    debug!("Reaper exited");
}

fn handle_reaped<F: UsbFs>(shared: &Shared<F>, urb: *mut RawUrb) {
    // SAFETY: the kernel only returns URBs we submitted, and their memory is
    // kept alive by the registry until this point.
    let (token, endpoint, status, actual_length) = unsafe {
        let raw = &*urb;
        (
            Fragment::token_of(urb),
            raw.endpoint,
            raw.status,
            raw.actual_length,
        )
    };
    debug!(
        "URB {urb:?} for ep {endpoint:02x} completed, status={status} actual_length={actual_length}"
    );

    let completion = shared.registry.lock().unwrap().complete_fragment(token);
    match &completion {
        Completion::Unknown => {
            warn!("Reaped URB {urb:?} with unknown token {token}");
        }
        Completion::Orphan => {
            debug!("Reaped abandoned URB on ep {endpoint:02x} ({:?})", urb_status(status));
        }
        Completion::Discarded(handle) => {
            debug!("Dropped result of forgotten {handle}");
        }
        Completion::Partial | Completion::Reaped { .. } => {}
    }
    shared.dispatch(completion);
}
