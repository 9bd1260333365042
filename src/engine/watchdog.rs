use std::{sync::Arc, thread};

use log::{debug, warn};

use super::{DisconnectCause, Shared};
use crate::platform::UsbFs;

/// Watchdog thread: poll the device node for the hangup condition.
pub(super) fn run<F: UsbFs>(shared: Arc<Shared<F>>) {
    debug!("Watchdog started");
    while !shared.is_shut_down() && !shared.is_disconnected() {
        match shared.fs.is_hung_up() {
            Ok(true) => {
                shared.mark_disconnected(DisconnectCause::Hangup);
                break;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to poll device: {e}"),
        }
        thread::sleep(shared.options.watchdog_interval);
    }
    debug!("Watchdog exited");
}
