//! TOML scenarios for the virtual host controller.
//!
//! ```toml
//! settle_ms = 300
//!
//! [[bus]]
//! speed = "full"
//! ports = 4
//!
//! [[device]]
//! path = [2]
//! kind = "hub"
//! ports = 4
//!
//! [[device]]
//! path = [2, 1]
//! class = 3
//! subclass = 1
//! protocol = 1
//! speed = "low"
//! plug_at_ms = 100
//! unplug_at_ms = 400
//! ```

use super::sim::{SimBusSpec, SimDeviceSpec, SimHcd};
use crate::config::ConfigError;
use crate::model::UsbSpeed;
use serde::Deserialize;
use std::path::Path;

/// A bus and the devices that come and go on it.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// How long to keep running after the last step.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default, rename = "bus")]
    pub buses: Vec<BusEntry>,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusEntry {
    #[serde(default)]
    pub speed: UsbSpeed,
    #[serde(default = "default_root_ports")]
    pub ports: u8,
    pub budget_ns: Option<u32>,
    #[serde(default)]
    pub reserved_ns: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Device,
    Hub,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub bus: u16,
    /// Ports from the root hub down to the device.
    pub path: Vec<u8>,
    #[serde(default)]
    pub kind: DeviceKind,
    /// Downstream ports, hubs only.
    #[serde(default = "default_hub_ports")]
    pub ports: u8,
    #[serde(default = "default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default)]
    pub product_id: u16,
    #[serde(default = "default_class")]
    pub class: u8,
    #[serde(default)]
    pub subclass: u8,
    #[serde(default)]
    pub protocol: u8,
    #[serde(default)]
    pub speed: UsbSpeed,
    /// Plugged before the controller attaches when 0.
    #[serde(default)]
    pub plug_at_ms: u64,
    pub unplug_at_ms: Option<u64>,
}

/// What happens at one point of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Plug(usize),
    Unplug(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub at_ms: u64,
    pub action: Action,
}

fn default_settle_ms() -> u64 {
    300
}

fn default_root_ports() -> u8 {
    4
}

fn default_hub_ports() -> u8 {
    4
}

fn default_vendor_id() -> u16 {
    0x1209
}

fn default_class() -> u8 {
    0xFF
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let scenario: Scenario = toml::from_str(content)?;
        if scenario.buses.is_empty() {
            return Err(ConfigError::Invalid("scenario declares no bus".into()));
        }
        for (i, dev) in scenario.devices.iter().enumerate() {
            if dev.path.is_empty() || dev.path.contains(&0) {
                return Err(ConfigError::Invalid(format!(
                    "device {} has an invalid port path {:?}",
                    i, dev.path
                )));
            }
            if dev.bus as usize >= scenario.buses.len() {
                return Err(ConfigError::Invalid(format!(
                    "device {} is on bus {}, which does not exist",
                    i, dev.bus
                )));
            }
            if let Some(unplug) = dev.unplug_at_ms
                && unplug < dev.plug_at_ms
            {
                return Err(ConfigError::Invalid(format!(
                    "device {} is unplugged before it is plugged",
                    i
                )));
            }
        }
        Ok(scenario)
    }

    /// Controller with every bus, and the devices present before attach.
    pub fn build(&self) -> (SimHcd, Vec<Step>) {
        let buses = self
            .buses
            .iter()
            .map(|b| {
                let mut spec = SimBusSpec::new(b.speed, b.ports).with_reserved(b.reserved_ns);
                if let Some(budget) = b.budget_ns {
                    spec = spec.with_periodic_budget(budget);
                }
                spec
            })
            .collect();
        let hcd = SimHcd::new(buses);

        let mut initial: Vec<usize> = (0..self.devices.len())
            .filter(|&i| self.devices[i].plug_at_ms == 0)
            .collect();
        initial.sort_by_key(|&i| self.devices[i].path.len());
        for i in initial {
            let dev = &self.devices[i];
            if let Err(e) = hcd.plug(dev.bus, &dev.path, dev.spec()) {
                tracing::warn!(device = i, error = %e, "scenario: initial plug failed");
            }
        }

        (hcd, self.timeline())
    }

    /// Timed steps after attach, in order.
    pub fn timeline(&self) -> Vec<Step> {
        let mut steps = Vec::new();
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.plug_at_ms > 0 {
                steps.push(Step {
                    at_ms: dev.plug_at_ms,
                    action: Action::Plug(i),
                });
            }
            if let Some(at_ms) = dev.unplug_at_ms {
                steps.push(Step {
                    at_ms,
                    action: Action::Unplug(i),
                });
            }
        }
        steps.sort_by_key(|s| s.at_ms);
        steps
    }
}

impl DeviceEntry {
    pub fn spec(&self) -> SimDeviceSpec {
        let spec = match self.kind {
            DeviceKind::Hub => SimDeviceSpec::hub(self.ports),
            DeviceKind::Device => SimDeviceSpec::device(
                self.vendor_id,
                self.product_id,
                self.class,
                self.subclass,
                self.protocol,
            ),
        };
        spec.with_speed(self.speed)
    }
}
