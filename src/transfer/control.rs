/// Direction of a transfer, from the host's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,

    /// Device to host
    In = 1,
}

impl Direction {
    /// Get the direction from bit 7 of an endpoint address or `bmRequestType`.
    pub fn from_address(addr: u8) -> Direction {
        match addr & 0x80 {
            0 => Direction::Out,
            _ => Direction::In,
        }
    }
}

/// Type of a control request, bits 5..6 of `bmRequestType`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ControlType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Recipient of a control request, bits 0..4 of `bmRequestType`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

pub(crate) const SETUP_PACKET_SIZE: usize = 8;

pub(crate) const STANDARD_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub(crate) const STANDARD_REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub(crate) const STANDARD_REQUEST_SET_INTERFACE: u8 = 0x0b;
pub(crate) const FEATURE_ENDPOINT_HALT: u16 = 0;

/// The eight-byte SETUP stage of a control transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ControlSetup {
    #[doc(alias = "bmRequestType")]
    pub request_type: u8,

    #[doc(alias = "bRequest")]
    pub request: u8,

    #[doc(alias = "wValue")]
    pub value: u16,

    #[doc(alias = "wIndex")]
    pub index: u16,

    #[doc(alias = "wLength")]
    pub length: u16,
}

impl ControlSetup {
    pub fn new(
        direction: Direction,
        control_type: ControlType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> ControlSetup {
        ControlSetup {
            request_type: request_type(direction, control_type, recipient),
            request,
            value,
            index,
            length,
        }
    }

    /// Parse the setup packet as it appears on the wire.
    pub fn from_bytes(b: [u8; SETUP_PACKET_SIZE]) -> ControlSetup {
        ControlSetup {
            request_type: b[0],
            request: b[1],
            value: u16::from_le_bytes([b[2], b[3]]),
            index: u16::from_le_bytes([b[4], b[5]]),
            length: u16::from_le_bytes([b[6], b[7]]),
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::from_address(self.request_type)
    }

    pub fn control_type(&self) -> Option<ControlType> {
        match (self.request_type >> 5) & 0x03 {
            0 => Some(ControlType::Standard),
            1 => Some(ControlType::Class),
            2 => Some(ControlType::Vendor),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        match self.request_type & 0x1f {
            0 => Some(Recipient::Device),
            1 => Some(Recipient::Interface),
            2 => Some(Recipient::Endpoint),
            3 => Some(Recipient::Other),
            _ => None,
        }
    }

    pub(crate) fn is_standard(&self) -> bool {
        self.control_type() == Some(ControlType::Standard)
    }

    pub(crate) fn to_bytes(self) -> [u8; SETUP_PACKET_SIZE] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }
}

fn request_type(direction: Direction, control_type: ControlType, recipient: Recipient) -> u8 {
    ((direction as u8) << 7) | ((control_type as u8) << 5) | (recipient as u8)
}

#[test]
fn test_setup_packet() {
    let setup = ControlSetup::new(
        Direction::In,
        ControlType::Standard,
        Recipient::Device,
        0x06,
        0x0200,
        0,
        0x00ff,
    );
    assert_eq!(setup.to_bytes(), [0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xff, 0x00]);
    assert_eq!(ControlSetup::from_bytes(setup.to_bytes()), setup);
    assert_eq!(setup.direction(), Direction::In);
    assert!(setup.is_standard());
}

#[test]
fn test_request_type_fields() {
    let setup = ControlSetup::from_bytes([0x41, 0x01, 0, 0, 0, 0, 0, 0]);
    assert_eq!(setup.direction(), Direction::Out);
    assert_eq!(setup.control_type(), Some(ControlType::Vendor));
    assert_eq!(setup.recipient(), Some(Recipient::Interface));
    assert_eq!(ControlSetup::from_bytes([0x60, 0, 0, 0, 0, 0, 0, 0]).control_type(), None);
}
