mod usbfs;
pub use usbfs::{IsoPacketDesc, RawUrb};

mod fragment;
pub(crate) use fragment::{fragment_urb, Fragment};
pub use fragment::{DEFAULT_MAX_FRAGMENT_LEN, ISO_MAX_PACKETS};

#[cfg(fuzzing)]
pub use fragment::fuzz_fragment_isochronous;

mod device;
pub use device::LinuxUsbFs;

use std::{ffi::c_int, time::Duration};

use rustix::io::Errno;

use crate::{transfer::ControlSetup, Error, ErrorKind, UrbStatus};

/// The usbfs operations the engine needs from the kernel.
///
/// [`LinuxUsbFs`] implements this on an open `/dev/bus/usb` node. The
/// engine is generic over it so it can be driven by a simulated kernel.
pub trait UsbFs: Send + Sync + 'static {
    /// `USBDEVFS_SUBMITURB`.
    ///
    /// # Safety
    ///
    /// `urb` and its buffer must stay valid and unmoved until the URB is
    /// returned from [`reap_urb`][Self::reap_urb] or the device is closed.
    unsafe fn submit_urb(&self, urb: *mut RawUrb) -> Result<(), Errno>;

    /// `USBDEVFS_DISCARDURB`. A discarded URB is still returned by
    /// [`reap_urb`][Self::reap_urb].
    ///
    /// # Safety
    ///
    /// `urb` must have been passed to [`submit_urb`][Self::submit_urb] on
    /// this device and not freed.
    unsafe fn discard_urb(&self, urb: *mut RawUrb) -> Result<(), Errno>;

    /// Wait up to `timeout` for a completed URB and return the pointer that
    /// was submitted, or `None` if nothing completed in time.
    fn reap_urb(&self, timeout: Duration) -> Result<Option<*mut RawUrb>, Errno>;

    /// Synchronous control transfer (`USBDEVFS_CONTROL`). Returns the number
    /// of bytes transferred in the data stage.
    fn control(&self, setup: ControlSetup, data: &mut [u8], timeout: Duration)
        -> Result<usize, Errno>;

    /// Synchronous bulk or interrupt transfer (`USBDEVFS_BULK`).
    fn bulk(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize, Errno>;

    fn set_configuration(&self, configuration: u8) -> Result<(), Errno>;

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), Errno>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno>;

    /// Non-blocking check for the error / hangup condition the device file
    /// reports once the device is gone.
    fn is_hung_up(&self) -> Result<bool, Errno>;
}

pub(crate) fn format_os_error_code(f: &mut std::fmt::Formatter<'_>, code: u32) -> std::fmt::Result {
    write!(f, "{}", std::io::Error::from_raw_os_error(code as i32))
}

/// Translate a data-path errno into the status reported to the caller.
pub(crate) fn errno_to_status(e: Errno) -> UrbStatus {
    match e {
        Errno::NOENT | Errno::CONNRESET | Errno::TIMEDOUT => UrbStatus::Cancelled,
        Errno::PIPE => UrbStatus::Stall,
        Errno::NODEV | Errno::SHUTDOWN => UrbStatus::Disconnected,
        Errno::PROTO | Errno::ILSEQ | Errno::TIME | Errno::COMM | Errno::NOSR => UrbStatus::Fault,
        Errno::REMOTEIO => UrbStatus::ShortPacket,
        Errno::OVERFLOW => UrbStatus::Overflow,
        _ => UrbStatus::UnknownError,
    }
}

/// Translate the `status` field the kernel wrote into a URB.
pub(crate) fn urb_status(raw: c_int) -> UrbStatus {
    match raw {
        0 => UrbStatus::Complete,
        // It's sometimes positive, sometimes negative.
        s if s.abs() == Errno::INPROGRESS.raw_os_error() => UrbStatus::Pending,
        s => errno_to_status(Errno::from_raw_os_error(s.abs())),
    }
}

/// Translate an errno from a setup or registry path into an [`Error`].
pub(crate) fn errno_to_error(e: Errno, message: &'static str) -> Error {
    let kind = match e {
        Errno::NODEV | Errno::SHUTDOWN => ErrorKind::Disconnected,
        Errno::NOENT => ErrorKind::NotFound,
        Errno::ACCESS | Errno::PERM => ErrorKind::PermissionDenied,
        Errno::BUSY => ErrorKind::Busy,
        Errno::INVAL => ErrorKind::InvalidArgument,
        Errno::NOMEM => ErrorKind::Capacity,
        Errno::TIMEDOUT => ErrorKind::TimedOut,
        _ => ErrorKind::Other,
    };
    Error::new_os(kind, message, e.raw_os_error() as u32)
}

#[test]
fn test_urb_status() {
    assert_eq!(urb_status(0), UrbStatus::Complete);
    assert_eq!(urb_status(-115), UrbStatus::Pending);
    assert_eq!(urb_status(-32), UrbStatus::Stall);
    assert_eq!(urb_status(-2), UrbStatus::Cancelled);
    assert_eq!(urb_status(19), UrbStatus::Disconnected);
    assert_eq!(urb_status(-71), UrbStatus::Fault);
}

#[test]
fn test_errno_to_error() {
    let e = errno_to_error(Errno::NODEV, "failed to submit URB");
    assert_eq!(e.kind(), ErrorKind::Disconnected);
    assert_eq!(e.os_error(), Some(19));
    assert!(e.to_string().starts_with("failed to submit URB ("));
}
