//! Topology snapshots handed out to clients.

use super::descriptor::ClassTuple;
use super::speed::UsbSpeed;
use crate::handle::NodeId;

/// Unique device location: bus-port.port.port...
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePath(pub String);

impl DevicePath {
    /// Create a new device path.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Path of the root hub of `bus` (1-based), e.g. "usb3".
    pub fn root(bus: u16) -> Self {
        Self(format!("usb{}", bus))
    }

    /// Path of the device on `port` below this one.
    /// Examples:
    /// - "usb3" + 1 -> "3-1"
    /// - "3-1" + 2 -> "3-1.2"
    pub fn child(&self, port: u8) -> Self {
        match self.0.strip_prefix("usb") {
            Some(bus) => Self(format!("{}-{}", bus, port)),
            None => Self(format!("{}.{}", self.0, port)),
        }
    }

    /// Get bus number from path.
    pub fn bus_num(&self) -> Option<u16> {
        self.0
            .strip_prefix("usb")
            .or_else(|| self.0.split('-').next())
            .and_then(|s| s.parse().ok())
    }
}

impl std::fmt::Display for DevicePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hub-specific node details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubInfo {
    pub ports: u8,
    pub self_powered: bool,
    /// Current each downstream port may draw.
    pub per_port_ma: u16,
    /// Current drawn by the hub controller itself.
    pub controller_ma: u16,
}

/// Snapshot of one node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub path: DevicePath,
    pub speed: UsbSpeed,
    pub address: u8,
    /// Topology depth (root hub = 0).
    pub depth: u8,
    /// Parent hub and the port this node hangs off.
    pub parent: Option<(NodeId, u8)>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub classes: Vec<ClassTuple>,
    pub hub: Option<HubInfo>,
}

impl NodeInfo {
    pub fn is_hub(&self) -> bool {
        self.hub.is_some()
    }

    /// Format VID:PID as string.
    pub fn vid_pid(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// Snapshot of one bus.
#[derive(Debug, Clone)]
pub struct BusTopology {
    /// Bus number (1-based, across all attached controllers).
    pub bus_num: u16,
    pub speed: UsbSpeed,
    pub reserved_ns: u32,
    /// Nodes in tree order (depth-first from the root hub, ports ascending).
    pub nodes: Vec<NodeInfo>,
}

impl BusTopology {
    /// Get device count.
    pub fn device_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn find(&self, path: &DevicePath) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| &n.path == path)
    }
}

/// Complete topology across every attached controller.
#[derive(Debug, Default, Clone)]
pub struct UsbTopology {
    pub buses: Vec<BusTopology>,
}

impl UsbTopology {
    /// Get total device count across all buses.
    pub fn total_device_count(&self) -> usize {
        self.buses.iter().map(|b| b.device_count()).sum()
    }

    /// Get a node by its path, searching all buses.
    pub fn get(&self, path: &DevicePath) -> Option<&NodeInfo> {
        let bus_num = path.bus_num()?;
        self.buses
            .iter()
            .find(|b| b.bus_num == bus_num)
            .and_then(|b| b.find(path))
    }

    /// Render as an indented tree, one node per line.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for bus in &self.buses {
            out.push_str(&format!(
                "Bus {} [{}] periodic {}\n",
                bus.bus_num,
                bus.speed.short_name(),
                super::bandwidth::format_ns(bus.reserved_ns)
            ));
            for node in &bus.nodes {
                let indent = "  ".repeat(node.depth as usize + 1);
                let kind = match &node.hub {
                    Some(hub) => format!("Hub {} ports", hub.ports),
                    None => format!("Dev class {:02x}", node.device_class),
                };
                out.push_str(&format!(
                    "{}{} addr {} {} {} [{}]\n",
                    indent,
                    node.path,
                    node.address,
                    node.vid_pid(),
                    kind,
                    node.speed.short_name()
                ));
            }
        }
        out
    }
}
