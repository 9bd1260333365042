#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    usbfs_relay::fuzz_fragment_isochronous(data);
});
