//! Transfer-related types.
//!
//! A [`Urb`] is moved into the engine with
//! [`DeviceTransfer::submit`][crate::DeviceTransfer::submit] and handed back,
//! with its buffer, actual length and status filled in, by one of the reap
//! methods.

use std::fmt::Display;

mod control;
pub(crate) use control::{
    FEATURE_ENDPOINT_HALT, SETUP_PACKET_SIZE, STANDARD_REQUEST_CLEAR_FEATURE,
    STANDARD_REQUEST_SET_CONFIGURATION, STANDARD_REQUEST_SET_INTERFACE,
};
pub use control::{ControlSetup, ControlType, Direction, Recipient};

mod notify;
pub use notify::Notify;

/// Endpoint type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Caller-assigned identity of a request.
///
/// The engine uses the handle to find a request again for cancel, forget
/// and [`reap_specific`][crate::DeviceTransfer::reap_specific]. At most one
/// request with a given handle may be outstanding at a time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbHandle(pub u64);

impl Display for UrbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UrbStatus {
    /// The request has not completed yet.
    Pending,

    /// Transfer completed successfully.
    Complete,

    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint in a STALL condition.
    Stall,

    /// Device disconnected.
    Disconnected,

    /// Hardware issue or protocol violation.
    Fault,

    /// A short packet was received on a transfer flagged short-not-ok.
    ShortPacket,

    /// The device sent more data than requested.
    Overflow,

    /// Unknown or OS-specific error.
    UnknownError,
}

impl UrbStatus {
    pub fn is_complete(&self) -> bool {
        *self == UrbStatus::Complete
    }
}

/// Per-packet state of an isochronous request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsoPacket {
    /// Requested length. Packets occupy consecutive ranges of the buffer.
    pub length: u32,

    /// Bytes actually transferred.
    pub actual_length: u32,

    pub status: UrbStatus,
}

impl IsoPacket {
    pub fn new(length: u32) -> IsoPacket {
        IsoPacket {
            length,
            actual_length: 0,
            status: UrbStatus::Pending,
        }
    }
}

/// Transfer type and type-specific fields of a [`Urb`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbKind {
    Control(ControlSetup),
    Bulk,
    Interrupt,
    Isochronous(Vec<IsoPacket>),
}

/// Optional behaviour of bulk and interrupt transfers.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TransferFlags {
    /// Treat a short IN packet as an error.
    pub short_not_ok: bool,

    /// Terminate an OUT transfer whose length is a multiple of the packet size
    /// with a zero-length packet.
    pub zero_packet: bool,
}

/// USB Request Block: one logical transfer.
///
/// The length of `buffer` is the requested length. For OUT transfers it
/// holds the data to send; for IN transfers its contents are overwritten by
/// the received data, and `actual_len` tells how much of it is valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urb {
    pub handle: UrbHandle,

    /// Endpoint address, including the direction bit.
    pub endpoint: u8,

    pub kind: UrbKind,

    pub buffer: Vec<u8>,

    pub actual_len: usize,

    pub status: UrbStatus,

    pub flags: TransferFlags,

    /// Number of isochronous packets that completed with an error.
    pub error_count: u32,
}

impl Urb {
    fn new(handle: UrbHandle, endpoint: u8, kind: UrbKind, buffer: Vec<u8>) -> Urb {
        Urb {
            handle,
            endpoint,
            kind,
            buffer,
            actual_len: 0,
            status: UrbStatus::Pending,
            flags: TransferFlags::default(),
            error_count: 0,
        }
    }

    /// Control transfer on the default endpoint.
    ///
    /// For an OUT request `data` is the data stage; for an IN request it is
    /// ignored and a buffer of `setup.length` bytes is allocated. The setup
    /// packet's `length` is updated to match the data stage.
    ///
    /// `data` is never truncated. A data stage longer than `u16::MAX` bytes
    /// cannot be described by a setup packet and fails to submit with
    /// [`ErrorKind::Capacity`][crate::ErrorKind::Capacity].
    pub fn control(handle: UrbHandle, mut setup: ControlSetup, data: &[u8]) -> Urb {
        let direction = setup.direction();
        let buffer = match direction {
            Direction::Out => {
                setup.length = data.len().try_into().unwrap_or(u16::MAX);
                data.to_vec()
            }
            Direction::In => vec![0; setup.length as usize],
        };
        let endpoint = (direction as u8) << 7;
        Urb::new(handle, endpoint, UrbKind::Control(setup), buffer)
    }

    /// Bulk OUT transfer sending `data`.
    pub fn bulk_out(handle: UrbHandle, endpoint: u8, data: Vec<u8>) -> Urb {
        debug_assert_eq!(Direction::from_address(endpoint), Direction::Out);
        Urb::new(handle, endpoint, UrbKind::Bulk, data)
    }

    /// Bulk IN transfer requesting `len` bytes.
    pub fn bulk_in(handle: UrbHandle, endpoint: u8, len: usize) -> Urb {
        debug_assert_eq!(Direction::from_address(endpoint), Direction::In);
        Urb::new(handle, endpoint, UrbKind::Bulk, vec![0; len])
    }

    /// Interrupt transfer. For IN endpoints `data` only sets the requested length.
    pub fn interrupt(handle: UrbHandle, endpoint: u8, data: Vec<u8>) -> Urb {
        Urb::new(handle, endpoint, UrbKind::Interrupt, data)
    }

    /// Isochronous transfer of consecutive packets with the given lengths.
    ///
    /// For OUT endpoints `data` holds the packets back to back; for IN
    /// endpoints a zeroed buffer is allocated when `data` is empty.
    pub fn isochronous(handle: UrbHandle, endpoint: u8, packet_lengths: &[u32], data: Vec<u8>) -> Urb {
        let packets: Vec<IsoPacket> = packet_lengths.iter().map(|&l| IsoPacket::new(l)).collect();
        let total = packet_lengths.iter().map(|&l| l as usize).sum();
        let buffer = if data.is_empty() && Direction::from_address(endpoint) == Direction::In {
            vec![0; total]
        } else {
            data
        };
        Urb::new(handle, endpoint, UrbKind::Isochronous(packets), buffer)
    }

    /// Set the short-not-ok / zero-packet flags.
    pub fn with_flags(mut self, flags: TransferFlags) -> Urb {
        self.flags = flags;
        self
    }

    pub fn endpoint_type(&self) -> EndpointType {
        match self.kind {
            UrbKind::Control(_) => EndpointType::Control,
            UrbKind::Bulk => EndpointType::Bulk,
            UrbKind::Interrupt => EndpointType::Interrupt,
            UrbKind::Isochronous(_) => EndpointType::Isochronous,
        }
    }

    pub fn direction(&self) -> Direction {
        match &self.kind {
            UrbKind::Control(setup) => setup.direction(),
            _ => Direction::from_address(self.endpoint),
        }
    }

    /// Number of bytes requested (IN) or to send (OUT).
    pub fn requested_len(&self) -> usize {
        self.buffer.len()
    }

    /// Received data of a completed IN transfer, or the sent prefix of an OUT
    /// transfer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_len.min(self.buffer.len())]
    }

    pub(crate) fn setup(&self) -> Option<ControlSetup> {
        match &self.kind {
            UrbKind::Control(setup) => Some(*setup),
            _ => None,
        }
    }

    /// Whether this is a standard request on the default control endpoint.
    pub(crate) fn is_default_standard_request(&self) -> bool {
        self.endpoint & 0x7f == 0 && self.setup().is_some_and(|s| s.is_standard())
    }
}

#[test]
fn test_control_constructors() {
    let get_descriptor = ControlSetup::new(
        Direction::In,
        ControlType::Standard,
        Recipient::Device,
        0x06,
        0x0100,
        0,
        18,
    );
    let urb = Urb::control(UrbHandle(1), get_descriptor, &[]);
    assert_eq!(urb.endpoint, 0x80);
    assert_eq!(urb.requested_len(), 18);
    assert_eq!(urb.direction(), Direction::In);
    assert!(urb.is_default_standard_request());

    let vendor = ControlSetup::new(
        Direction::Out,
        ControlType::Vendor,
        Recipient::Device,
        0x81,
        0,
        0,
        0,
    );
    let urb = Urb::control(UrbHandle(2), vendor, &[1, 2, 3]);
    assert_eq!(urb.endpoint, 0x00);
    assert_eq!(urb.setup().unwrap().length, 3);
    assert!(!urb.is_default_standard_request());
}

#[test]
fn test_isochronous_constructor() {
    let urb = Urb::isochronous(UrbHandle(3), 0x83, &[100, 200, 0], Vec::new());
    assert_eq!(urb.requested_len(), 300);
    assert_eq!(urb.endpoint_type(), EndpointType::Isochronous);
    assert_eq!(urb.direction(), Direction::In);
}
