//! Hub class descriptor, port status and feature selectors (USB 2.0 chapter 11).

use super::descriptor::DESC_HUB;
use super::speed::UsbSpeed;

bitflags::bitflags! {
    /// wPortStatus.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
    }
}

bitflags::bitflags! {
    /// wPortChange.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortChange: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
    }
}

impl PortStatus {
    pub fn speed(&self) -> UsbSpeed {
        UsbSpeed::from_port_bits(
            self.contains(Self::LOW_SPEED),
            self.contains(Self::HIGH_SPEED),
        )
    }
}

impl PortChange {
    /// The C_PORT_* feature that acknowledges each change bit.
    pub fn acknowledgements(&self) -> Vec<PortFeature> {
        let mut acks = Vec::new();
        if self.contains(Self::CONNECTION) {
            acks.push(PortFeature::CPortConnection);
        }
        if self.contains(Self::ENABLE) {
            acks.push(PortFeature::CPortEnable);
        }
        if self.contains(Self::SUSPEND) {
            acks.push(PortFeature::CPortSuspend);
        }
        if self.contains(Self::OVER_CURRENT) {
            acks.push(PortFeature::CPortOverCurrent);
        }
        if self.contains(Self::RESET) {
            acks.push(PortFeature::CPortReset);
        }
        acks
    }
}

/// GET_STATUS reply for a port: status word then change word.
pub fn parse_port_status(bytes: &[u8]) -> Option<(PortStatus, PortChange)> {
    if bytes.len() < 4 {
        return None;
    }
    Some((
        PortStatus::from_bits_truncate(u16::from_le_bytes([bytes[0], bytes[1]])),
        PortChange::from_bits_truncate(u16::from_le_bytes([bytes[2], bytes[3]])),
    ))
}

pub fn port_status_bytes(status: PortStatus, change: PortChange) -> [u8; 4] {
    let s = status.bits().to_le_bytes();
    let c = change.bits().to_le_bytes();
    [s[0], s[1], c[0], c[1]]
}

/// Hub-level feature selectors for SET_FEATURE/CLEAR_FEATURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HubFeature {
    CHubLocalPower = 0,
    CHubOverCurrent = 1,
}

/// Port feature selectors for SET_FEATURE/CLEAR_FEATURE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
    PortTest = 21,
    PortIndicator = 22,
}

impl PortFeature {
    pub fn from_selector(selector: u16) -> Option<Self> {
        Some(match selector {
            0 => Self::PortConnection,
            1 => Self::PortEnable,
            2 => Self::PortSuspend,
            3 => Self::PortOverCurrent,
            4 => Self::PortReset,
            8 => Self::PortPower,
            9 => Self::PortLowSpeed,
            16 => Self::CPortConnection,
            17 => Self::CPortEnable,
            18 => Self::CPortSuspend,
            19 => Self::CPortOverCurrent,
            20 => Self::CPortReset,
            21 => Self::PortTest,
            22 => Self::PortIndicator,
            _ => return None,
        })
    }
}

/// Hub descriptor (fixed part; port bitmaps are not retained).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubDescriptor {
    pub ports: u8,
    pub characteristics: u16,
    /// bPwrOn2PwrGood in 2 ms units.
    pub power_on_good: u8,
    /// bHubContrCurrent in mA.
    pub controller_current: u8,
}

impl HubDescriptor {
    pub const MIN_LEN: usize = 7;

    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::MIN_LEN || bytes[1] != DESC_HUB {
            return None;
        }
        Some(Self {
            ports: bytes[2],
            characteristics: u16::from_le_bytes([bytes[3], bytes[4]]),
            power_on_good: bytes[5],
            controller_current: bytes[6],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // One removable bitmap byte and one power mask byte per 8 ports (+1 for bit 0).
        let bitmap_len = (self.ports as usize / 8) + 1;
        let mut out = vec![(Self::MIN_LEN + 2 * bitmap_len) as u8, DESC_HUB, self.ports];
        out.extend_from_slice(&self.characteristics.to_le_bytes());
        out.push(self.power_on_good);
        out.push(self.controller_current);
        out.extend(std::iter::repeat_n(0x00, bitmap_len));
        out.extend(std::iter::repeat_n(0xFF, bitmap_len));
        out
    }

    pub fn power_on_good_ms(&self) -> u64 {
        u64::from(self.power_on_good) * 2
    }
}

/// Length of the status-change bitmap for a hub with `ports` ports (bit 0 is the hub).
pub fn status_bitmap_len(ports: u8) -> usize {
    (ports as usize / 8) + 1
}

/// Ports flagged in a status-change bitmap, ascending. Bit 0 (the hub) is skipped.
pub fn changed_ports(bitmap: &[u8], ports: u8) -> Vec<u8> {
    (1..=ports)
        .filter(|&port| {
            bitmap
                .get(port as usize / 8)
                .is_some_and(|byte| byte & (1 << (port % 8)) != 0)
        })
        .collect()
}

pub fn hub_changed(bitmap: &[u8]) -> bool {
    bitmap.first().is_some_and(|byte| byte & 1 != 0)
}
