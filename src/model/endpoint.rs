//! Endpoint descriptors, transfer types and directions.

use std::fmt;

/// USB transfer types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decode bits 1:0 of bmAttributes.
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    pub fn attribute_bits(&self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    /// Returns true if this transfer type reserves bandwidth.
    /// Only Interrupt and Isochronous endpoints reserve bandwidth.
    pub fn reserves_bandwidth(&self) -> bool {
        matches!(self, Self::Interrupt | Self::Isochronous)
    }

    /// Bulk and interrupt pipes track a running DATA0/DATA1 toggle.
    pub fn uses_data_toggle(&self) -> bool {
        matches!(self, Self::Bulk | Self::Interrupt)
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "Control",
            Self::Bulk => "Bulk",
            Self::Interrupt => "Interrupt",
            Self::Isochronous => "Isochronous",
        };
        write!(f, "{}", name)
    }
}

/// Data direction of a pipe or segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    /// Control pipes carry both.
    Both,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address or bmRequestType.
    pub fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 { Self::In } else { Self::Out }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
            Self::Both => Self::Both,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => write!(f, "IN"),
            Self::Out => write!(f, "OUT"),
            Self::Both => write!(f, "IN/OUT"),
        }
    }
}

/// Length of a standard endpoint descriptor.
pub const ENDPOINT_DESCRIPTOR_LEN: usize = 7;

/// A standard endpoint descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address (e.g., 0x81 = IN endpoint 1, 0x02 = OUT endpoint 2).
    pub address: u8,
    /// bmAttributes; bits 1:0 select the transfer type.
    pub attributes: u8,
    /// Maximum packet size in bytes (from wMaxPacketSize).
    /// For high-speed, this includes the multiplier in bits 12:11.
    pub max_packet_size: u16,
    /// Polling interval (raw bInterval value from descriptor).
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn new(address: u8, transfer_type: TransferType, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            attributes: transfer_type.attribute_bits(),
            max_packet_size,
            interval,
        }
    }

    /// Parse from raw descriptor bytes (bLength, bDescriptorType, ...).
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENDPOINT_DESCRIPTOR_LEN {
            return None;
        }
        Some(Self {
            address: bytes[2],
            attributes: bytes[3],
            max_packet_size: u16::from_le_bytes([bytes[4], bytes[5]]),
            interval: bytes[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; ENDPOINT_DESCRIPTOR_LEN] {
        let mps = self.max_packet_size.to_le_bytes();
        [
            ENDPOINT_DESCRIPTOR_LEN as u8,
            super::descriptor::DESC_ENDPOINT,
            self.address,
            self.attributes,
            mps[0],
            mps[1],
            self.interval,
        ]
    }

    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.attributes)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    /// Endpoint number (address without direction bit).
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    /// Extract base packet size (bits 10:0 of wMaxPacketSize).
    pub fn base_packet_size(&self) -> u16 {
        self.max_packet_size & 0x07FF
    }

    /// Extract multiplier from wMaxPacketSize bits 12:11 (for high-speed).
    /// Returns 1, 2, or 3.
    pub fn multiplier(&self) -> u16 {
        let mult_bits = (self.max_packet_size >> 11) & 0x03;
        if mult_bits == 0 { 1 } else { mult_bits + 1 }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EP{:02X} {} {} {}B @ {}",
            self.address,
            self.transfer_type(),
            self.direction(),
            self.base_packet_size(),
            self.interval
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interrupt_endpoint() {
        let ep = EndpointDescriptor::parse(&[7, 5, 0x81, 0x03, 0x40, 0x00, 10]).unwrap();
        assert_eq!(ep.transfer_type(), TransferType::Interrupt);
        assert_eq!(ep.direction(), Direction::In);
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.max_packet_size, 64);
        assert_eq!(ep.interval, 10);
    }

    #[test]
    fn test_high_bandwidth_multiplier() {
        let ep = EndpointDescriptor::new(0x82, TransferType::Isochronous, 0x1400, 1);
        assert_eq!(ep.base_packet_size(), 1024);
        assert_eq!(ep.multiplier(), 3);
        assert_eq!(ep.direction(), Direction::In);
    }

    #[test]
    fn test_short_descriptor_rejected() {
        assert!(EndpointDescriptor::parse(&[7, 5, 0x02]).is_none());
    }

    #[test]
    fn test_toggle_types() {
        assert!(TransferType::Bulk.uses_data_toggle());
        assert!(!TransferType::Isochronous.uses_data_toggle());
        assert!(TransferType::Isochronous.reserves_bandwidth());
        assert!(!TransferType::Bulk.reserves_bandwidth());
    }
}
