use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use rustix::io::Errno;

use super::{mock::MockUsbFs, DisconnectCause, Engine, EngineOptions};
use crate::{
    transfer::{ControlSetup, ControlType, Direction, Notify, Recipient, TransferFlags, Urb, UrbHandle},
    DeviceTransfer, ErrorKind, UrbStatus, DEFAULT_MAX_FRAGMENT_LEN,
};

const TIMEOUT: Duration = Duration::from_secs(2);
const C: usize = DEFAULT_MAX_FRAGMENT_LEN;

fn engine_with(options: EngineOptions) -> Engine<MockUsbFs> {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = options
        .with_reap_interval(Duration::from_millis(10))
        .with_watchdog_interval(Duration::from_millis(10))
        .with_recheck_interval(Duration::from_millis(10));
    Engine::with_options(MockUsbFs::default(), options).unwrap()
}

fn engine() -> Engine<MockUsbFs> {
    engine_with(EngineOptions::default())
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn is_idle(engine: &Engine<MockUsbFs>) -> bool {
    let registry = engine.shared.registry.lock().unwrap();
    registry.len() == 0 && registry.in_flight() == 0
}

fn in_flight(engine: &Engine<MockUsbFs>) -> usize {
    engine.shared.registry.lock().unwrap().in_flight()
}

fn get_descriptor(length: u16) -> ControlSetup {
    ControlSetup::new(
        Direction::In,
        ControlType::Standard,
        Recipient::Device,
        0x06,
        0x0100,
        0,
        length,
    )
}

#[test]
fn zero_fragment_len_rejected() {
    let options = EngineOptions {
        max_fragment_len: 0,
        ..Default::default()
    };
    let err = Engine::with_options(MockUsbFs::default(), options).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn bulk_in_reassembled_from_fragments() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_in(UrbHandle(1), 0x81, C + 3616), None)
        .unwrap();

    let urbs = mock.in_kernel();
    assert_eq!(urbs.len(), 2);
    assert_eq!(mock.buffer_length(urbs[0]), C);
    assert_eq!(mock.buffer_length(urbs[1]), 3616);

    // The kernel may complete fragments in any order.
    mock.complete(urbs[1], 0, &[0xbb; 3616], 3616);
    mock.complete(urbs[0], 0, &vec![0xaa; C], C);

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.handle, UrbHandle(1));
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(urb.actual_len, C + 3616);
    assert!(urb.data()[..C].iter().all(|&b| b == 0xaa));
    assert!(urb.data()[C..].iter().all(|&b| b == 0xbb));
    assert!(is_idle(&engine));
}

#[test]
fn bulk_out_reports_sent_bytes() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_out(UrbHandle(2), 0x02, vec![7; 2 * C]), None)
        .unwrap();

    let urbs = mock.in_kernel();
    assert_eq!(urbs.len(), 2);
    mock.complete(urbs[0], 0, &[], C);
    mock.complete(urbs[1], 0, &[], 1000);

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(urb.actual_len, C + 1000);
}

#[test]
fn first_failed_fragment_sets_status() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_in(UrbHandle(5), 0x81, C + 100), None)
        .unwrap();

    let urbs = mock.in_kernel();
    mock.complete(urbs[0], -Errno::PIPE.raw_os_error(), &[1; 100], 100);
    mock.complete(urbs[1], -Errno::PROTO.raw_os_error(), &[], 0);

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.status, UrbStatus::Stall);
    assert_eq!(urb.data(), &[1; 100][..]);
}

#[test]
fn signal_notified_on_completion() {
    let engine = engine();
    let mock = engine.usbfs();
    let notify = Arc::new(Notify::new());
    engine
        .submit(Urb::interrupt(UrbHandle(6), 0x83, vec![0; 8]), Some(notify.clone()))
        .unwrap();

    let urbs = mock.in_kernel();
    mock.complete(urbs[0], 0, &[1, 2, 3], 3);

    let urb = notify
        .wait_timeout(TIMEOUT, || engine.reap_specific(UrbHandle(6)))
        .unwrap();
    assert_eq!(urb.data(), &[1, 2, 3]);
}

#[test]
fn duplicate_handle_rejected() {
    let engine = engine();
    engine
        .submit(Urb::bulk_in(UrbHandle(1), 0x81, 64), None)
        .unwrap();
    let err = engine
        .submit(Urb::bulk_in(UrbHandle(1), 0x82, 64), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert_eq!(engine.usbfs().in_kernel().len(), 1);
}

#[test]
fn reap_any_zero_never_blocks() {
    let engine = engine();
    assert!(engine.reap_any(Some(Duration::ZERO)).is_none());

    let shared = engine.shared.clone();
    let (tx, rx) = mpsc::channel();
    let holder = thread::spawn(move || {
        let _registry = shared.registry.lock().unwrap();
        tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(300));
    });
    rx.recv().unwrap();

    let start = Instant::now();
    assert!(engine.reap_any(Some(Duration::ZERO)).is_none());
    assert!(start.elapsed() < Duration::from_millis(200));
    holder.join().unwrap();
}

#[test]
fn reap_any_times_out() {
    let engine = engine();
    let start = Instant::now();
    assert!(engine.reap_any(Some(Duration::from_millis(50))).is_none());
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn cancel_keeps_completed_fragments() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_in(UrbHandle(7), 0x82, C + 4000), None)
        .unwrap();

    let urbs = mock.in_kernel();
    mock.complete(urbs[0], 0, &vec![1; C], C);
    wait_until("first fragment reaped", || in_flight(&engine) == 1);

    engine.cancel(UrbHandle(7)).unwrap();
    // Already resolved: cancelling again does nothing.
    engine.cancel(UrbHandle(7)).unwrap();
    assert_eq!(mock.discarded(), vec![urbs[1]]);

    let urb = engine.reap_specific(UrbHandle(7)).unwrap();
    assert_eq!(urb.status, UrbStatus::Cancelled);
    assert_eq!(urb.actual_len, C);
    assert!(urb.data().iter().all(|&b| b == 1));

    // The discarded fragment is freed once the kernel hands it back.
    wait_until("engine idle", || is_idle(&engine));
    assert_eq!(
        engine.cancel(UrbHandle(7)).unwrap_err().kind(),
        ErrorKind::NotSubmitted
    );
}

#[test]
fn forget_pending_drops_result() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_out(UrbHandle(3), 0x01, vec![5; 100]), None)
        .unwrap();
    engine.forget(UrbHandle(3)).unwrap();
    engine.forget(UrbHandle(3)).unwrap();

    let urbs = mock.in_kernel();
    mock.complete(urbs[0], 0, &[], 100);
    wait_until("engine idle", || is_idle(&engine));

    assert!(engine.reap_any(Some(Duration::from_millis(50))).is_none());
    assert!(engine.reap_specific(UrbHandle(3)).is_none());
    assert_eq!(
        engine.forget(UrbHandle(3)).unwrap_err().kind(),
        ErrorKind::NotSubmitted
    );
}

#[test]
fn forget_completed_drops_result() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_out(UrbHandle(4), 0x01, vec![5; 100]), None)
        .unwrap();
    let urbs = mock.in_kernel();
    mock.complete(urbs[0], 0, &[], 100);
    wait_until("fragment reaped", || in_flight(&engine) == 0);

    engine.forget(UrbHandle(4)).unwrap();
    assert!(is_idle(&engine));
    assert!(engine.reap_any(Some(Duration::ZERO)).is_none());
}

#[test]
fn failed_submit_unwinds() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.fail_submit(1, Errno::INVAL);

    let err = engine
        .submit(Urb::bulk_out(UrbHandle(4), 0x02, vec![0; 2 * C + 10]), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(mock.in_kernel().is_empty());
    assert_eq!(mock.discarded().len(), 1);

    wait_until("engine idle", || is_idle(&engine));
    assert!(engine.reap_any(Some(Duration::from_millis(50))).is_none());

    // The handle is free again.
    engine
        .submit(Urb::bulk_out(UrbHandle(4), 0x02, vec![0; 10]), None)
        .unwrap();
}

#[test]
fn submit_disconnect_unwinds() {
    let engine = engine();
    let mock = engine.usbfs();
    let events = engine.watch_disconnect();
    mock.fail_submit(1, Errno::NODEV);

    let err = engine
        .submit(Urb::bulk_out(UrbHandle(23), 0x02, vec![0; 2 * C + 10]), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
    assert!(engine.is_disconnected());
    assert_eq!(mock.discarded().len(), 1);
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap().cause,
        DisconnectCause::Transfer
    );

    let err = engine
        .submit(Urb::bulk_in(UrbHandle(24), 0x81, 8), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
    wait_until("engine idle", || is_idle(&engine));
}

#[test]
fn disconnect_while_unwinding_reported() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.fail_submit(1, Errno::INVAL);
    mock.fail_discard(Errno::NODEV);

    let err = engine
        .submit(Urb::bulk_out(UrbHandle(26), 0x02, vec![0; 2 * C + 10]), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
    assert!(engine.is_disconnected());

    // The accepted fragment is never returned; it stays allocated until drop.
    assert_eq!(mock.in_kernel().len(), 1);
    assert_eq!(in_flight(&engine), 1);
    assert_eq!(engine.shared.registry.lock().unwrap().len(), 0);
}

#[test]
fn concurrent_submissions_completed_in_reverse() {
    let engine = engine();
    let mock = engine.usbfs();

    thread::scope(|s| {
        for i in 1..=8u8 {
            let engine = &engine;
            s.spawn(move || {
                engine
                    .submit(Urb::bulk_in(UrbHandle(i.into()), 0x80 | i, C + 500), None)
                    .unwrap();
            });
        }
    });

    let urbs = mock.in_kernel();
    assert_eq!(urbs.len(), 16);
    for &addr in urbs.iter().rev() {
        let len = mock.buffer_length(addr);
        mock.complete(addr, 0, &vec![mock.endpoint(addr); len], len);
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
        assert_eq!(urb.status, UrbStatus::Complete);
        assert_eq!(urb.actual_len, C + 500);
        assert!(urb.data().iter().all(|&b| b == urb.endpoint));
        handles.push(urb.handle.0);
    }
    handles.sort();
    assert_eq!(handles, (1..=8).collect::<Vec<_>>());
    assert!(is_idle(&engine));
}

#[test]
fn isochronous_packets_translated() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::isochronous(UrbHandle(8), 0x83, &[100, 200], Vec::new()), None)
        .unwrap();

    let urbs = mock.in_kernel();
    assert_eq!(urbs.len(), 1);
    mock.complete_iso(urbs[0], &[(100, 0), (150, -Errno::PROTO.raw_os_error())]);

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(urb.actual_len, 300);
    assert_eq!(urb.error_count, 1);
    let crate::UrbKind::Isochronous(packets) = &urb.kind else {
        panic!("not isochronous");
    };
    assert_eq!(packets[0].status, UrbStatus::Complete);
    assert_eq!(packets[0].actual_length, 100);
    assert_eq!(packets[1].status, UrbStatus::Fault);
    assert_eq!(packets[1].actual_length, 150);
}

#[test]
fn default_control_runs_without_urb() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.set_control_response(&[18, 1, 0, 2]);

    let notify = Arc::new(Notify::new());
    engine
        .submit(
            Urb::control(UrbHandle(9), get_descriptor(18), &[]),
            Some(notify.clone()),
        )
        .unwrap();

    let urb = notify
        .wait_timeout(TIMEOUT, || engine.reap_specific(UrbHandle(9)))
        .unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(urb.data(), &[18, 1, 0, 2]);
    assert!(mock.in_kernel().is_empty());
    assert_eq!(mock.calls(), vec!["control 06".to_string()]);
}

#[test]
fn set_configuration_uses_dedicated_ioctl() {
    let engine = engine();
    let setup = ControlSetup::new(
        Direction::Out,
        ControlType::Standard,
        Recipient::Device,
        0x09,
        1,
        0,
        0,
    );
    engine
        .submit(Urb::control(UrbHandle(10), setup, &[]), None)
        .unwrap();

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(engine.usbfs().calls(), vec!["set_configuration 1".to_string()]);
}

#[test]
fn vendor_control_goes_through_urb() {
    let engine = engine();
    let mock = engine.usbfs();
    let setup = ControlSetup::new(
        Direction::In,
        ControlType::Vendor,
        Recipient::Device,
        0x30,
        0,
        0,
        4,
    );
    engine
        .submit(Urb::control(UrbHandle(11), setup, &[]), None)
        .unwrap();

    let urbs = mock.in_kernel();
    assert_eq!(urbs.len(), 1);
    mock.complete(urbs[0], 0, &[9, 8, 7, 6], 4);

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.data(), &[9, 8, 7, 6]);
}

#[test]
fn process_control_standard_request_on_worker() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.set_control_response(&[18, 1]);

    let urb = engine
        .process_control(Urb::control(UrbHandle(12), get_descriptor(18), &[]))
        .unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert_eq!(urb.data(), &[18, 1]);
    assert!(mock.in_kernel().is_empty());
    assert!(is_idle(&engine));
    assert!(engine.reap_any(Some(Duration::ZERO)).is_none());

    let err = engine
        .process_control(Urb::bulk_in(UrbHandle(13), 0x81, 8))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn process_control_vendor_direct() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.set_control_response(&[1, 2, 3, 4]);
    let setup = ControlSetup::new(
        Direction::In,
        ControlType::Vendor,
        Recipient::Device,
        0x30,
        0,
        0,
        4,
    );

    let urb = engine
        .process_control(Urb::control(UrbHandle(25), setup, &[]))
        .unwrap();
    assert_eq!(urb.data(), &[1, 2, 3, 4]);
    assert!(mock.in_kernel().is_empty());
    assert_eq!(mock.calls(), vec!["control 30".to_string()]);
}

#[test]
fn process_control_rejects_outstanding_handle() {
    let engine = engine();
    engine
        .submit(Urb::bulk_in(UrbHandle(20), 0x81, 64), None)
        .unwrap();

    let err = engine
        .process_control(Urb::control(UrbHandle(20), get_descriptor(18), &[]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    assert!(engine.usbfs().calls().is_empty());
}

#[test]
fn process_control_not_cancellable_while_running() {
    let engine = engine();
    let mock = engine.usbfs();
    mock.set_control_response(&[18]);
    mock.hold_control(true);

    thread::scope(|s| {
        let caller = s.spawn(|| {
            engine.process_control(Urb::control(UrbHandle(21), get_descriptor(18), &[]))
        });

        wait_until("request registered", || {
            engine.shared.registry.lock().unwrap().len() == 1
        });
        let err = engine.cancel(UrbHandle(21)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        mock.hold_control(false);
        let urb = caller.join().unwrap().unwrap();
        assert_eq!(urb.status, UrbStatus::Complete);
        assert_eq!(urb.data(), &[18]);
    });
    assert!(is_idle(&engine));
}

#[test]
fn process_bulk_direct() {
    let engine = engine();
    let urb = engine
        .process_bulk(Urb::bulk_in(UrbHandle(14), 0x83, 64))
        .unwrap();
    assert_eq!(urb.status, UrbStatus::Complete);
    assert!(urb.data().iter().all(|&b| b == 0x83));
    assert_eq!(engine.usbfs().calls(), vec!["bulk 83".to_string()]);

    let err = engine
        .process_bulk(Urb::isochronous(UrbHandle(15), 0x83, &[8], Vec::new()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn process_bulk_flagged_waits_privately() {
    let engine = engine();
    let mock = engine.usbfs();
    let flags = TransferFlags {
        short_not_ok: true,
        ..Default::default()
    };

    thread::scope(|s| {
        let worker = s.spawn(|| {
            engine.process_bulk(Urb::bulk_in(UrbHandle(16), 0x81, 64).with_flags(flags))
        });

        wait_until("URB submitted", || mock.in_kernel().len() == 1);
        mock.complete(mock.in_kernel()[0], 0, &[3; 64], 64);
        wait_until("fragment reaped", || in_flight(&engine) == 0);
        assert!(engine.reap_any(Some(Duration::ZERO)).is_none());

        let urb = worker.join().unwrap().unwrap();
        assert_eq!(urb.status, UrbStatus::Complete);
        assert_eq!(urb.data(), &[3; 64][..]);
    });
    assert!(is_idle(&engine));
}

#[test]
fn process_bulk_times_out() {
    let engine = engine_with(EngineOptions::default().with_sync_timeout(Duration::from_millis(50)));
    let mock = engine.usbfs();
    let flags = TransferFlags {
        short_not_ok: true,
        ..Default::default()
    };

    let err = engine
        .process_bulk(Urb::bulk_in(UrbHandle(17), 0x81, 64).with_flags(flags))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert_eq!(mock.discarded().len(), 1);

    wait_until("engine idle", || is_idle(&engine));
    assert!(engine.reap_any(Some(Duration::from_millis(50))).is_none());
}

#[test]
fn hangup_notifies_once() {
    let engine = engine();
    let rx = engine.watch_disconnect();
    engine.usbfs().hang_up();

    let event = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.cause, DisconnectCause::Hangup);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(engine.is_disconnected());

    let err = engine
        .submit(Urb::bulk_in(UrbHandle(1), 0x81, 8), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
    assert_eq!(
        engine.cancel(UrbHandle(1)).unwrap_err().kind(),
        ErrorKind::Disconnected
    );

    // Late subscribers hear about it straight away.
    let late = engine.watch_disconnect();
    assert_eq!(late.try_recv().unwrap().cause, DisconnectCause::Hangup);
}

#[test]
fn unplug_resolves_pending() {
    let engine = engine();
    engine
        .submit(Urb::bulk_in(UrbHandle(18), 0x81, 100), None)
        .unwrap();
    engine.usbfs().unplug();

    let urb = engine.reap_any(Some(TIMEOUT)).unwrap();
    assert_eq!(urb.status, UrbStatus::Disconnected);
    assert_eq!(urb.actual_len, 0);
    assert!(engine.is_disconnected());
}

#[test]
fn reap_any_unbounded_returns_completion() {
    let engine = engine();
    let mock = engine.usbfs();
    engine
        .submit(Urb::bulk_in(UrbHandle(22), 0x81, 64), None)
        .unwrap();

    thread::scope(|s| {
        let waiter = s.spawn(|| engine.reap_any(None));
        thread::sleep(Duration::from_millis(50));
        mock.complete(mock.in_kernel()[0], 0, &[5; 64], 64);

        let urb = waiter.join().unwrap().unwrap();
        assert_eq!(urb.handle, UrbHandle(22));
        assert_eq!(urb.data(), &[5; 64][..]);
    });
}

#[test]
fn shutdown_wakes_reap_any() {
    let engine = engine();
    thread::scope(|s| {
        let waiter = s.spawn(|| engine.reap_any(None));
        thread::sleep(Duration::from_millis(50));
        engine.shutdown();
        assert!(waiter.join().unwrap().is_none());
    });
}

#[test]
fn drop_with_requests_in_flight() {
    let engine = engine();
    engine
        .submit(Urb::bulk_in(UrbHandle(19), 0x81, 3 * C), None)
        .unwrap();
    engine.forget(UrbHandle(19)).unwrap();
    drop(engine);
}
