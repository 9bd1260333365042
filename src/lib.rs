//! Asynchronous USB transfer engine on top of Linux usbfs.
//!
//! An [`Engine`] drives one open device node. Requests ([`Urb`]) of any
//! size are split into kernel-sized URBs, submitted, reaped by a background
//! thread and reassembled, so a caller relaying transfers for a remote host
//! only deals with whole requests.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("usbfs-relay only supports Linux and Android");

pub mod platform;
pub use platform::{
    IsoPacketDesc, LinuxUsbFs, RawUrb, UsbFs, DEFAULT_MAX_FRAGMENT_LEN, ISO_MAX_PACKETS,
};

#[cfg(fuzzing)]
pub use platform::fuzz_fragment_isochronous;

mod error;
pub use error::{Error, ErrorKind};

pub mod transfer;
pub use transfer::{
    ControlSetup, ControlType, Direction, EndpointType, IsoPacket, Notify, Recipient,
    TransferFlags, Urb, UrbHandle, UrbKind, UrbStatus,
};

mod device;
pub use device::DeviceTransfer;

mod engine;
pub use engine::{
    DisconnectCause, DisconnectEvent, Engine, EngineOptions, MAX_SYNC_CONTROL_LEN,
};
