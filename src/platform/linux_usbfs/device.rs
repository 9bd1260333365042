use std::{ffi::c_void, path::Path, time::Duration};

use log::debug;
use rustix::{
    event::{PollFd, PollFlags, Timespec},
    fd::OwnedFd,
    fs::{Mode, OFlags},
    io::Errno,
};

use super::{
    errno_to_error,
    usbfs::{self, RawUrb},
    UsbFs,
};
use crate::{transfer::ControlSetup, Error};

/// An open usbfs device node.
pub struct LinuxUsbFs {
    fd: OwnedFd,
}

impl LinuxUsbFs {
    /// Open `/dev/bus/usb/BBB/DDD`.
    pub fn open(busnum: u8, devnum: u8) -> Result<LinuxUsbFs, Error> {
        Self::open_path(format!("/dev/bus/usb/{busnum:03}/{devnum:03}"))
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<LinuxUsbFs, Error> {
        let path = path.as_ref();
        debug!("Opening usbfs device {}", path.display());
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| errno_to_error(e, "failed to open device").log_error())?;
        Ok(LinuxUsbFs { fd })
    }

    /// Wrap a usbfs file descriptor that is already open, e.g. one handed
    /// out by Android's `UsbManager`.
    pub fn from_fd(fd: OwnedFd) -> LinuxUsbFs {
        LinuxUsbFs { fd }
    }

    /// Claim an interface so transfers can be made on its endpoints.
    pub fn claim_interface(&self, interface: u8) -> Result<(), Error> {
        usbfs::claim_interface(&self.fd, interface)
            .map_err(|e| errno_to_error(e, "failed to claim interface"))?;
        debug!("Claimed interface {interface}");
        Ok(())
    }

    /// Detach any kernel driver other than usbfs and claim the interface.
    pub fn detach_and_claim_interface(&self, interface: u8) -> Result<(), Error> {
        usbfs::detach_and_claim_interface(&self.fd, interface)
            .map_err(|e| errno_to_error(e, "failed to detach and claim interface"))?;
        debug!("Detached and claimed interface {interface}");
        Ok(())
    }

    pub fn release_interface(&self, interface: u8) -> Result<(), Error> {
        let res = usbfs::release_interface(&self.fd, interface);
        debug!("Released interface {interface}: {res:?}");
        res.map_err(|e| errno_to_error(e, "failed to release interface"))
    }

    fn poll(&self, flags: PollFlags, timeout: Duration) -> Result<PollFlags, Errno> {
        let timeout = Timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let mut fds = [PollFd::new(&self.fd, flags)];
        match rustix::event::poll(&mut fds, Some(&timeout)) {
            Ok(_) => Ok(fds[0].revents()),
            Err(Errno::INTR) => Ok(PollFlags::empty()),
            Err(e) => Err(e),
        }
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().try_into().unwrap_or(u32::MAX)
}

impl UsbFs for LinuxUsbFs {
    unsafe fn submit_urb(&self, urb: *mut RawUrb) -> Result<(), Errno> {
        loop {
            match unsafe { usbfs::submit_urb(&self.fd, urb) } {
                Err(Errno::INTR) => continue,
                r => return r,
            }
        }
    }

    unsafe fn discard_urb(&self, urb: *mut RawUrb) -> Result<(), Errno> {
        unsafe { usbfs::discard_urb(&self.fd, urb) }
    }

    fn reap_urb(&self, timeout: Duration) -> Result<Option<*mut RawUrb>, Errno> {
        match usbfs::reap_urb_ndelay(&self.fd) {
            Ok(urb) => return Ok(Some(urb)),
            Err(Errno::AGAIN) => {}
            Err(e) => return Err(e),
        }

        // usbfs reports POLLOUT while a completed URB is waiting to be reaped.
        self.poll(PollFlags::OUT, timeout)?;

        match usbfs::reap_urb_ndelay(&self.fd) {
            Ok(urb) => Ok(Some(urb)),
            Err(Errno::AGAIN | Errno::INTR) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn control(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Errno> {
        let length = data.len().min(setup.length as usize);
        usbfs::control(
            &self.fd,
            usbfs::CtrlTransfer {
                bRequestType: setup.request_type,
                bRequest: setup.request,
                wValue: setup.value,
                wIndex: setup.index,
                wLength: length as u16,
                timeout: timeout_ms(timeout),
                data: data.as_mut_ptr() as *mut c_void,
            },
        )
    }

    fn bulk(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize, Errno> {
        usbfs::bulk(
            &self.fd,
            usbfs::BulkTransfer {
                ep: endpoint.into(),
                len: data.len().try_into().map_err(|_| Errno::INVAL)?,
                timeout: timeout_ms(timeout),
                data: data.as_mut_ptr() as *mut c_void,
            },
        )
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), Errno> {
        debug!("Set configuration {configuration}");
        usbfs::set_configuration(&self.fd, configuration)
    }

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), Errno> {
        debug!("Set interface {interface} alt setting to {alt_setting}");
        usbfs::set_interface(&self.fd, interface, alt_setting)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno> {
        debug!("Clear halt on endpoint {endpoint:02x}");
        usbfs::clear_halt(&self.fd, endpoint)
    }

    fn is_hung_up(&self) -> Result<bool, Errno> {
        let revents = self.poll(PollFlags::OUT, Duration::ZERO)?;
        Ok(revents.intersects(PollFlags::ERR | PollFlags::HUP))
    }
}
