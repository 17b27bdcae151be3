//! Periodic bandwidth accounting and bus-time calculation.

use super::endpoint::{Direction, TransferType};
use super::speed::UsbSpeed;
use crate::error::HcdFault;

/// Host controller turnaround assumed by the bus-time formulas.
pub const DEFAULT_HOST_DELAY_NS: u32 = 1_000;
/// Hub low-speed setup time (two of these per low-speed transaction).
pub const DEFAULT_HUB_LS_SETUP_NS: u32 = 333;

/// Periodic bandwidth pool for a bus, in nanoseconds per frame.
#[derive(Debug, Clone)]
pub struct BandwidthPool {
    /// Maximum available for periodic transfers per frame.
    pub max_periodic_ns: u32,
    /// Currently reserved by periodic pipes.
    pub used_periodic_ns: u32,
    /// Bus speed.
    pub speed: UsbSpeed,
}

impl BandwidthPool {
    /// Create a new bandwidth pool for a given speed.
    pub fn new(speed: UsbSpeed) -> Self {
        Self::with_budget(speed, speed.max_periodic_ns())
    }

    /// Create with an explicit periodic budget.
    pub fn with_budget(speed: UsbSpeed, max_periodic_ns: u32) -> Self {
        Self {
            max_periodic_ns,
            used_periodic_ns: 0,
            speed,
        }
    }

    /// Admit a reservation, or refuse it if the budget would be exceeded.
    pub fn try_reserve(&mut self, ns: u32) -> Result<(), HcdFault> {
        match self.used_periodic_ns.checked_add(ns) {
            Some(total) if total <= self.max_periodic_ns => {
                self.used_periodic_ns = total;
                Ok(())
            }
            _ => Err(HcdFault::Bandwidth),
        }
    }

    /// Add usage without admission control.
    pub fn add_usage(&mut self, ns: u32) {
        self.used_periodic_ns = self.used_periodic_ns.saturating_add(ns);
    }

    /// Return a reservation to the pool.
    pub fn release(&mut self, ns: u32) {
        self.used_periodic_ns = self.used_periodic_ns.saturating_sub(ns);
    }
}

/// Worst-case bus time for one transaction of `bytes`, per USB 2.0 section 5.11.3.
pub fn transfer_time_ns(
    speed: UsbSpeed,
    transfer_type: TransferType,
    direction: Direction,
    bytes: u32,
) -> u32 {
    let bit_stuffed = (3.167 + 7.0 * 8.0 * bytes as f64 / 6.0).floor();
    let host_delay = DEFAULT_HOST_DELAY_NS as f64;
    let iso = transfer_type == TransferType::Isochronous;

    let ns = match speed {
        UsbSpeed::High => {
            let overhead = if iso { 38.0 } else { 55.0 };
            overhead * 8.0 * 2.083 + 2.083 * bit_stuffed + host_delay
        }
        UsbSpeed::Full => {
            let base = match (iso, direction) {
                (true, Direction::In) => 7268.0,
                (true, _) => 6265.0,
                (false, _) => 9107.0,
            };
            base + 83.54 * bit_stuffed + host_delay
        }
        UsbSpeed::Low => {
            let hub_setup = 2.0 * DEFAULT_HUB_LS_SETUP_NS as f64;
            match direction {
                Direction::In => 64060.0 + hub_setup + 676.67 * bit_stuffed + host_delay,
                _ => 64107.0 + hub_setup + 667.0 * bit_stuffed + host_delay,
            }
        }
    };

    ns.round() as u32
}

/// Convert an isochronous rate in bytes/second into bytes per (micro)frame.
pub fn bytes_per_frame(speed: UsbSpeed, bytes_per_second: u32) -> u32 {
    let frames_per_second = 1_000_000_000 / speed.frame_period_ns();
    bytes_per_second.div_ceil(frames_per_second)
}

/// Format nanoseconds as a human-readable duration.
pub fn format_ns(ns: u32) -> String {
    if ns >= 1_000_000 {
        format!("{:.2} ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2} us", ns as f64 / 1_000.0)
    } else {
        format!("{} ns", ns)
    }
}
