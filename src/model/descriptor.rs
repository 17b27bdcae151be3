//! Standard requests, setup packets and descriptors (USB 2.0 chapter 9).

use super::endpoint::{Direction, EndpointDescriptor};

pub const DESC_DEVICE: u8 = 0x01;
pub const DESC_CONFIGURATION: u8 = 0x02;
pub const DESC_STRING: u8 = 0x03;
pub const DESC_INTERFACE: u8 = 0x04;
pub const DESC_ENDPOINT: u8 = 0x05;
pub const DESC_HUB: u8 = 0x29;

pub const REQ_GET_STATUS: u8 = 0x00;
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_FEATURE: u8 = 0x03;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_DESCRIPTOR: u8 = 0x07;
pub const REQ_GET_CONFIGURATION: u8 = 0x08;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_GET_INTERFACE: u8 = 0x0A;
pub const REQ_SET_INTERFACE: u8 = 0x0B;
pub const REQ_SYNCH_FRAME: u8 = 0x0C;

/// Standard feature selector for an endpoint.
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// Standard feature selector for a device.
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

pub const CLASS_HUB: u8 = 0x09;

pub const DEVICE_DESCRIPTOR_LEN: usize = 18;
pub const CONFIG_DESCRIPTOR_LEN: usize = 9;
pub const INTERFACE_DESCRIPTOR_LEN: usize = 9;
/// Bytes of the device descriptor read before bMaxPacketSize0 is known.
pub const DEVICE_DESCRIPTOR_PREFIX_LEN: usize = 8;

/// Request kind, bits 6:5 of bmRequestType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
}

/// Request recipient, bits 4:0 of bmRequestType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Compose bmRequestType.
pub fn request_type(direction: Direction, kind: RequestKind, recipient: Recipient) -> u8 {
    let dir = if direction == Direction::In { 0x80 } else { 0x00 };
    let kind = match kind {
        RequestKind::Standard => 0x00,
        RequestKind::Class => 0x20,
        RequestKind::Vendor => 0x40,
    };
    let recipient = match recipient {
        Recipient::Device => 0x00,
        Recipient::Interface => 0x01,
        Recipient::Endpoint => 0x02,
        Recipient::Other => 0x03,
    };
    dir | kind | recipient
}

/// The 8-byte Setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    pub fn kind(&self) -> Option<RequestKind> {
        match (self.request_type >> 5) & 0x03 {
            0 => Some(RequestKind::Standard),
            1 => Some(RequestKind::Class),
            2 => Some(RequestKind::Vendor),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<Recipient> {
        match self.request_type & 0x1F {
            0 => Some(Recipient::Device),
            1 => Some(Recipient::Interface),
            2 => Some(Recipient::Endpoint),
            3 => Some(Recipient::Other),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 8 {
            return None;
        }
        Some(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }
}

/// Standard device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    /// bMaxPacketSize0 from the first eight bytes of a device descriptor.
    pub fn max_packet_size0_from_prefix(bytes: &[u8]) -> Option<u8> {
        if bytes.len() < DEVICE_DESCRIPTOR_PREFIX_LEN || bytes[1] != DESC_DEVICE {
            return None;
        }
        match bytes[7] {
            8 | 16 | 32 | 64 => Some(bytes[7]),
            _ => None,
        }
    }

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEVICE_DESCRIPTOR_LEN || bytes[1] != DESC_DEVICE {
            return None;
        }
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        Some(Self {
            usb_version: word(2),
            class: bytes[4],
            subclass: bytes[5],
            protocol: bytes[6],
            max_packet_size0: bytes[7],
            vendor_id: word(8),
            product_id: word(10),
            device_version: word(12),
            manufacturer_index: bytes[14],
            product_index: bytes[15],
            serial_index: bytes[16],
            num_configurations: bytes[17],
        })
    }

    pub fn to_bytes(&self) -> [u8; DEVICE_DESCRIPTOR_LEN] {
        let mut out = [0u8; DEVICE_DESCRIPTOR_LEN];
        out[0] = DEVICE_DESCRIPTOR_LEN as u8;
        out[1] = DESC_DEVICE;
        out[2..4].copy_from_slice(&self.usb_version.to_le_bytes());
        out[4] = self.class;
        out[5] = self.subclass;
        out[6] = self.protocol;
        out[7] = self.max_packet_size0;
        out[8..10].copy_from_slice(&self.vendor_id.to_le_bytes());
        out[10..12].copy_from_slice(&self.product_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.device_version.to_le_bytes());
        out[14] = self.manufacturer_index;
        out[15] = self.product_index;
        out[16] = self.serial_index;
        out[17] = self.num_configurations;
        out
    }

    pub fn is_hub(&self) -> bool {
        self.class == CLASS_HUB
    }

    /// Format VID:PID as string.
    pub fn vid_pid(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// One interface (alternate setting) inside a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternate: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// A configuration descriptor with its nested interfaces and endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigDescriptor {
    pub value: u8,
    pub attributes: u8,
    /// bMaxPower in 2 mA units.
    pub max_power: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl ConfigDescriptor {
    /// wTotalLength from the 9-byte configuration header.
    pub fn total_length(header: &[u8]) -> Option<u16> {
        if header.len() < 4 || header[1] != DESC_CONFIGURATION {
            return None;
        }
        Some(u16::from_le_bytes([header[2], header[3]]))
    }

    /// Parse a full configuration bundle. Unknown descriptor types are skipped.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < CONFIG_DESCRIPTOR_LEN || bytes[1] != DESC_CONFIGURATION {
            return None;
        }

        let mut config = Self {
            value: bytes[5],
            attributes: bytes[7],
            max_power: bytes[8],
            interfaces: Vec::new(),
        };

        let mut offset = bytes[0] as usize;
        while offset + 2 <= bytes.len() {
            let len = bytes[offset] as usize;
            if len < 2 || offset + len > bytes.len() {
                break;
            }
            let desc = &bytes[offset..offset + len];
            match desc[1] {
                DESC_INTERFACE if len >= INTERFACE_DESCRIPTOR_LEN => {
                    config.interfaces.push(InterfaceDescriptor {
                        number: desc[2],
                        alternate: desc[3],
                        class: desc[5],
                        subclass: desc[6],
                        protocol: desc[7],
                        endpoints: Vec::new(),
                    });
                }
                DESC_ENDPOINT => {
                    if let Some(ep) = EndpointDescriptor::parse(desc)
                        && let Some(iface) = config.interfaces.last_mut()
                    {
                        iface.endpoints.push(ep);
                    }
                }
                _ => {}
            }
            offset += len;
        }

        Some(config)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for iface in &self.interfaces {
            body.extend_from_slice(&[
                INTERFACE_DESCRIPTOR_LEN as u8,
                DESC_INTERFACE,
                iface.number,
                iface.alternate,
                iface.endpoints.len() as u8,
                iface.class,
                iface.subclass,
                iface.protocol,
                0,
            ]);
            for ep in &iface.endpoints {
                body.extend_from_slice(&ep.to_bytes());
            }
        }

        let total = (CONFIG_DESCRIPTOR_LEN + body.len()) as u16;
        let num_interfaces = self
            .interfaces
            .iter()
            .filter(|i| i.alternate == 0)
            .count() as u8;
        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&[CONFIG_DESCRIPTOR_LEN as u8, DESC_CONFIGURATION]);
        out.extend_from_slice(&total.to_le_bytes());
        out.extend_from_slice(&[num_interfaces, self.value, 0, self.attributes, self.max_power]);
        out.extend_from_slice(&body);
        out
    }

    pub fn is_self_powered(&self) -> bool {
        self.attributes & 0x40 != 0
    }
}

/// A (configuration, interface, class, subclass, protocol) tuple a node exposes.
///
/// Devices that declare their class in the device descriptor expose one tuple
/// with configuration and interface both zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassTuple {
    pub configuration: u8,
    pub interface: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

impl ClassTuple {
    /// Derive the class tuples a device exposes.
    pub fn collect(device: &DeviceDescriptor, configs: &[ConfigDescriptor]) -> Vec<ClassTuple> {
        if device.class != 0 {
            return vec![ClassTuple {
                configuration: 0,
                interface: 0,
                class: device.class,
                subclass: device.subclass,
                protocol: device.protocol,
            }];
        }

        configs
            .iter()
            .flat_map(|config| {
                config
                    .interfaces
                    .iter()
                    .filter(|iface| iface.alternate == 0)
                    .map(|iface| ClassTuple {
                        configuration: config.value,
                        interface: iface.number,
                        class: iface.class,
                        subclass: iface.subclass,
                        protocol: iface.protocol,
                    })
            })
            .collect()
    }
}
