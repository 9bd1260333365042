//! A simulated usbfs device for driving the engine in tests.

use std::{
    collections::VecDeque,
    ffi::c_int,
    sync::{Condvar, Mutex},
    time::Duration,
};

use rustix::io::Errno;

use crate::{
    platform::{IsoPacketDesc, RawUrb, UsbFs},
    transfer::{ControlSetup, Direction, SETUP_PACKET_SIZE},
};

/// Address of a submitted URB. Stored as an integer so the mock is `Send`.
pub(crate) type UrbAddr = usize;

#[derive(Default)]
struct State {
    in_kernel: Vec<UrbAddr>,
    completed: VecDeque<UrbAddr>,
    discarded: Vec<UrbAddr>,
    submit_calls: usize,
    fail_submit: Option<(usize, Errno)>,
    fail_discard: Option<Errno>,
    control_held: bool,
    hung_up: bool,
    gone: bool,
    control_response: Vec<u8>,
    calls: Vec<String>,
}

#[derive(Default)]
pub(crate) struct MockUsbFs {
    state: Mutex<State>,
    changed: Condvar,
}

impl MockUsbFs {
    /// URBs submitted and not yet completed, in submission order.
    pub(crate) fn in_kernel(&self) -> Vec<UrbAddr> {
        self.state.lock().unwrap().in_kernel.clone()
    }

    pub(crate) fn discarded(&self) -> Vec<UrbAddr> {
        self.state.lock().unwrap().discarded.clone()
    }

    /// Non-URB operations, e.g. `"set_configuration 1"`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Fail the `n`th submission (counting from 0) with `errno`.
    pub(crate) fn fail_submit(&self, n: usize, errno: Errno) {
        self.state.lock().unwrap().fail_submit = Some((n, errno));
    }

    /// Fail every discard of a URB still in the kernel with `errno`.
    pub(crate) fn fail_discard(&self, errno: Errno) {
        self.state.lock().unwrap().fail_discard = Some(errno);
    }

    /// While held, synchronous control transfers block.
    pub(crate) fn hold_control(&self, held: bool) {
        self.state.lock().unwrap().control_held = held;
        self.changed.notify_all();
    }

    pub(crate) fn set_control_response(&self, data: &[u8]) {
        self.state.lock().unwrap().control_response = data.to_vec();
    }

    /// Make the device node report hangup.
    pub(crate) fn hang_up(&self) {
        self.state.lock().unwrap().hung_up = true;
    }

    /// Make reaping fail with `ENODEV` once no completions are left.
    pub(crate) fn unplug(&self) {
        let mut state = self.state.lock().unwrap();
        state.gone = true;
        state.hung_up = true;
        self.changed.notify_all();
    }

    fn finish(&self, state: &mut State, addr: UrbAddr) {
        state.in_kernel.retain(|&a| a != addr);
        state.completed.push_back(addr);
        self.changed.notify_all();
    }

    /// Complete a bulk, interrupt or control URB. For IN URBs `data` is
    /// written into the buffer (after the setup packet for control).
    pub(crate) fn complete(&self, addr: UrbAddr, status: c_int, data: &[u8], actual: usize) {
        let mut state = self.state.lock().unwrap();
        assert!(state.in_kernel.contains(&addr), "URB {addr:x} not in kernel");
        // SAFETY: the engine keeps submitted URBs alive until they are reaped.
        unsafe {
            let urb = &mut *(addr as *mut RawUrb);
            let skip = if urb.ep_type == 2 { SETUP_PACKET_SIZE } else { 0 };
            if Direction::from_address(urb.endpoint) == Direction::In {
                let room = (urb.buffer_length as usize).saturating_sub(skip);
                let n = data.len().min(room);
                std::ptr::copy_nonoverlapping(data.as_ptr(), urb.buffer.add(skip), n);
            }
            urb.actual_length = actual as c_int;
            urb.status = status;
        }
        self.finish(&mut state, addr);
    }

    /// Complete an isochronous URB with per-packet `(actual_length, status)`.
    pub(crate) fn complete_iso(&self, addr: UrbAddr, packets: &[(u32, c_int)]) {
        let mut state = self.state.lock().unwrap();
        // SAFETY: as above; the descriptor array follows the header.
        unsafe {
            let urb = &mut *(addr as *mut RawUrb);
            let descs = (addr as *mut RawUrb).add(1) as *mut IsoPacketDesc;
            let n = urb.number_of_packets_or_stream_id as usize;
            let mut errors = 0;
            for (i, &(actual, status)) in packets.iter().enumerate().take(n) {
                let d = &mut *descs.add(i);
                d.actual_length = actual;
                d.status = status as u32;
                if status != 0 {
                    errors += 1;
                }
            }
            urb.error_count = errors;
            urb.status = 0;
        }
        self.finish(&mut state, addr);
    }

    /// Number of bytes the URB's header says it transfers.
    pub(crate) fn buffer_length(&self, addr: UrbAddr) -> usize {
        // SAFETY: as above.
        unsafe { (*(addr as *const RawUrb)).buffer_length as usize }
    }

    pub(crate) fn endpoint(&self, addr: UrbAddr) -> u8 {
        // SAFETY: as above.
        unsafe { (*(addr as *const RawUrb)).endpoint }
    }
}

impl UsbFs for MockUsbFs {
    unsafe fn submit_urb(&self, urb: *mut RawUrb) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        let n = state.submit_calls;
        state.submit_calls += 1;
        if state.gone {
            return Err(Errno::NODEV);
        }
        if let Some((fail, errno)) = state.fail_submit {
            if fail == n {
                return Err(errno);
            }
        }
        state.in_kernel.push(urb as UrbAddr);
        Ok(())
    }

    unsafe fn discard_urb(&self, urb: *mut RawUrb) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        let addr = urb as UrbAddr;
        if !state.in_kernel.contains(&addr) {
            return Err(Errno::INVAL);
        }
        if let Some(errno) = state.fail_discard {
            return Err(errno);
        }
        state.discarded.push(addr);
        unsafe {
            (*urb).status = -Errno::NOENT.raw_os_error();
            (*urb).actual_length = 0;
        }
        self.finish(&mut state, addr);
        Ok(())
    }

    fn reap_urb(&self, timeout: Duration) -> Result<Option<*mut RawUrb>, Errno> {
        let mut state = self.state.lock().unwrap();
        if state.completed.is_empty() && !state.gone {
            state = self.changed.wait_timeout(state, timeout).unwrap().0;
        }
        match state.completed.pop_front() {
            Some(addr) => Ok(Some(addr as *mut RawUrb)),
            None if state.gone => Err(Errno::NODEV),
            None => Ok(None),
        }
    }

    fn control(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Errno> {
        let mut state = self.state.lock().unwrap();
        while state.control_held {
            state = self.changed.wait(state).unwrap();
        }
        if state.gone {
            return Err(Errno::NODEV);
        }
        state.calls.push(format!("control {:02x}", setup.request));
        match setup.direction() {
            Direction::In => {
                let n = data.len().min(state.control_response.len());
                data[..n].copy_from_slice(&state.control_response[..n]);
                Ok(n)
            }
            Direction::Out => Ok(data.len()),
        }
    }

    fn bulk(&self, endpoint: u8, data: &mut [u8], _timeout: Duration) -> Result<usize, Errno> {
        let mut state = self.state.lock().unwrap();
        if state.gone {
            return Err(Errno::NODEV);
        }
        state.calls.push(format!("bulk {endpoint:02x}"));
        if Direction::from_address(endpoint) == Direction::In {
            data.fill(endpoint);
        }
        Ok(data.len())
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("set_configuration {configuration}"));
        Ok(())
    }

    fn set_interface(&self, interface: u8, alt_setting: u8) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("set_interface {interface} {alt_setting}"));
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("clear_halt {endpoint:02x}"));
        Ok(())
    }

    fn is_hung_up(&self) -> Result<bool, Errno> {
        Ok(self.state.lock().unwrap().hung_up)
    }
}
