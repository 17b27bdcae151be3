//! USB signalling speeds with their bus-time characteristics.

use std::fmt;

/// Device signalling speed as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbSpeed {
    /// USB 1.0 Low Speed - 1.5 Mbps
    Low,
    /// USB 1.1 Full Speed - 12 Mbps
    #[default]
    Full,
    /// USB 2.0 High Speed - 480 Mbps
    High,
}

impl UsbSpeed {
    /// Infer speed from the hub port status low/high-speed bits.
    pub fn from_port_bits(low_speed: bool, high_speed: bool) -> Self {
        if low_speed {
            Self::Low
        } else if high_speed {
            Self::High
        } else {
            Self::Full
        }
    }

    /// Frame/microframe period in nanoseconds.
    /// - Low/Full speed: 1ms frames
    /// - High speed: 125µs microframes
    pub fn frame_period_ns(&self) -> u32 {
        match self {
            Self::Low | Self::Full => 1_000_000,
            Self::High => 125_000,
        }
    }

    /// Periodic (interrupt + isochronous) budget per frame in nanoseconds.
    /// 90% of a full-speed frame, 80% of a high-speed microframe.
    pub fn max_periodic_ns(&self) -> u32 {
        match self {
            Self::Low | Self::Full => self.frame_period_ns() / 100 * 90,
            Self::High => self.frame_period_ns() / 100 * 80,
        }
    }

    /// Default control endpoint packet size before the device descriptor is read.
    pub fn default_control_packet_size(&self) -> u16 {
        match self {
            Self::High => 64,
            Self::Low | Self::Full => 8,
        }
    }

    /// Short display name.
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Low => "1.5M",
            Self::Full => "12M",
            Self::High => "480M",
        }
    }
}

impl fmt::Display for UsbSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "Low Speed (1.5 Mbps)",
            Self::Full => "Full Speed (12 Mbps)",
            Self::High => "High Speed (480 Mbps)",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_port_bits() {
        assert_eq!(UsbSpeed::from_port_bits(true, false), UsbSpeed::Low);
        assert_eq!(UsbSpeed::from_port_bits(false, false), UsbSpeed::Full);
        assert_eq!(UsbSpeed::from_port_bits(false, true), UsbSpeed::High);
    }

    #[test]
    fn test_periodic_budget() {
        assert_eq!(UsbSpeed::Full.max_periodic_ns(), 900_000);
        assert_eq!(UsbSpeed::High.max_periodic_ns(), 100_000);
    }
}
