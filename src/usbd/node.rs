//! Nodes: enumeration of a newly reset device and teardown of a subtree.

use super::bus::{BusCounters, BusKey};
use super::control::{ControlPath, control_sync};
use super::hub::{HubState, configure_hub};
use super::notify::{AttachKind, node_event};
use super::{Object, Reaper, Registry, SIG_NODE, Shared, Usbd};
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, NodeId, PipeHandle};
use crate::hcd::HcdPipeSpec;
use crate::model::descriptor::{
    CONFIG_DESCRIPTOR_LEN, DESC_CONFIGURATION, DESC_DEVICE, DEVICE_DESCRIPTOR_LEN,
    DEVICE_DESCRIPTOR_PREFIX_LEN, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS, Recipient, RequestKind,
    request_type,
};
use crate::model::{
    ClassTuple, ConfigDescriptor, DeviceDescriptor, DevicePath, Direction, HubInfo, NodeInfo,
    SetupPacket, TransferType, UsbSpeed,
};
use crate::sync::ControlGate;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub(crate) struct Node {
    pub bus: BusKey,
    pub path: DevicePath,
    pub speed: UsbSpeed,
    pub address: u8,
    pub depth: u8,
    pub parent: Option<(NodeId, u8)>,
    pub descriptor: DeviceDescriptor,
    pub configs: Vec<ConfigDescriptor>,
    pub classes: Vec<ClassTuple>,
    /// Configuration value last set through this USBD, 0 if unconfigured.
    pub configuration: u8,
    pub control: ControlPath,
    pub hub: Option<HubState>,
    pub pipes: Vec<PipeHandle>,
    pub delete_pending: bool,
    /// Attach notifications went out; removal must follow.
    pub announced: bool,
}

impl Node {
    pub(crate) fn snapshot(reg: &Registry, id: NodeId) -> Result<NodeInfo> {
        let node = reg.node(id)?;
        Ok(NodeInfo {
            id,
            path: node.path.clone(),
            speed: node.speed,
            address: node.address,
            depth: node.depth,
            parent: node.parent,
            vendor_id: node.descriptor.vendor_id,
            product_id: node.descriptor.product_id,
            device_class: node.descriptor.class,
            classes: node.classes.clone(),
            hub: node.hub.as_ref().map(|h| HubInfo {
                ports: h.ports.len() as u8,
                self_powered: h.self_powered,
                per_port_ma: h.per_port_ma,
                controller_ma: h.controller_ma,
            }),
        })
    }

    pub(crate) fn children(&self) -> Vec<NodeId> {
        self.hub
            .as_ref()
            .map(|h| h.ports.iter().flatten().copied().collect())
            .unwrap_or_default()
    }
}

/// `root` and its descendants, parents before children, ports ascending.
pub(crate) fn collect_tree(reg: &Registry, root: NodeId) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Ok(node) = reg.node(id) else {
            continue;
        };
        if node.delete_pending {
            continue;
        }
        order.push(id);
        stack.extend(node.children().into_iter().rev());
    }
    order
}

fn get_descriptor(desc_type: u8, index: u8, length: u16) -> SetupPacket {
    SetupPacket::new(
        request_type(Direction::In, RequestKind::Standard, Recipient::Device),
        REQ_GET_DESCRIPTOR,
        (u16::from(desc_type) << 8) | u16::from(index),
        0,
        length,
    )
}

fn malformed(what: &str) -> UsbdError {
    UsbdError::General(format!("malformed {} descriptor", what))
}

struct Probe {
    descriptor: DeviceDescriptor,
    configs: Vec<ConfigDescriptor>,
}

/// Address the device at address 0 and read its descriptors.
///
/// `address` is set as soon as one is allocated so the caller can give it
/// back on failure.
fn probe(
    shared: &Shared,
    reg: &mut Registry,
    key: BusKey,
    control: &mut ControlPath,
    address: &mut Option<u8>,
) -> Result<Probe> {
    let prefix = control_sync(
        shared,
        control,
        get_descriptor(DESC_DEVICE, 0, DEVICE_DESCRIPTOR_PREFIX_LEN as u16),
        Vec::new(),
    )?;
    let mps0 = DeviceDescriptor::max_packet_size0_from_prefix(&prefix)
        .ok_or_else(|| malformed("device"))?;
    let mps0 = u16::from(mps0);
    if mps0 != control.max_packet_size {
        control.link.pipe_modify(control.pipe, 0, mps0)?;
        control.max_packet_size = mps0;
    }

    let assigned = reg.bus_mut(key)?.addresses.allocate()?;
    *address = Some(assigned);
    control_sync(
        shared,
        control,
        SetupPacket::new(
            request_type(Direction::Out, RequestKind::Standard, Recipient::Device),
            REQ_SET_ADDRESS,
            u16::from(assigned),
            0,
            0,
        ),
        Vec::new(),
    )?;
    thread::sleep(shared.config().timing.set_address_recovery());
    control.link.pipe_modify(control.pipe, assigned, mps0)?;
    debug!(address = assigned, mps0, "device addressed");

    let bytes = control_sync(
        shared,
        control,
        get_descriptor(DESC_DEVICE, 0, DEVICE_DESCRIPTOR_LEN as u16),
        Vec::new(),
    )?;
    let descriptor = DeviceDescriptor::parse(&bytes).ok_or_else(|| malformed("device"))?;

    let mut configs = Vec::with_capacity(descriptor.num_configurations as usize);
    for index in 0..descriptor.num_configurations {
        let header = control_sync(
            shared,
            control,
            get_descriptor(DESC_CONFIGURATION, index, CONFIG_DESCRIPTOR_LEN as u16),
            Vec::new(),
        )?;
        let total = ConfigDescriptor::total_length(&header).ok_or_else(|| malformed("configuration"))?;
        let full = control_sync(
            shared,
            control,
            get_descriptor(DESC_CONFIGURATION, index, total),
            Vec::new(),
        )?;
        configs.push(ConfigDescriptor::parse(&full).ok_or_else(|| malformed("configuration"))?);
    }

    Ok(Probe { descriptor, configs })
}

/// Enumerate the device behind a freshly reset port (or a new root hub) and
/// insert it into the tree. On failure nothing of the node remains.
pub(crate) fn create_node(
    shared: &Shared,
    reg: &mut Registry,
    reaper: &mut Reaper,
    key: BusKey,
    parent: Option<(NodeId, u8)>,
    speed: UsbSpeed,
    depth: u8,
) -> Result<NodeId> {
    let path = match parent {
        Some((hub, port)) => reg.live_node(hub)?.path.child(port),
        None => DevicePath::root(reg.bus(key)?.number),
    };
    let link = reg.hcd(key.hcd)?.link.clone();
    let counters: Arc<BusCounters> = reg.bus(key)?.counters.clone();

    let default_mps = speed.default_control_packet_size();
    let (pipe, _) = link.pipe_create(HcdPipeSpec {
        bus: key.index,
        address: 0,
        endpoint: 0,
        transfer_type: TransferType::Control,
        direction: Direction::Both,
        speed,
        max_packet_size: default_mps,
        bandwidth: 0,
        interval: 0,
    })?;
    let mut control = ControlPath {
        link,
        pipe,
        max_packet_size: default_mps,
        gate: Arc::new(ControlGate::new()),
        counters,
    };

    let mut address = None;
    let probed = probe(shared, reg, key, &mut control, &mut address);
    let give_back = |reg: &mut Registry, reaper: &mut Reaper, control: ControlPath| {
        if let Some(a) = address
            && let Ok(bus) = reg.bus_mut(key)
        {
            bus.addresses.release(a);
        }
        reaper.destroy_pipe(control.link, control.pipe);
    };
    let probe = match probed {
        Ok(p) => p,
        Err(e) => {
            warn!(%path, error = %e, "enumeration failed");
            give_back(reg, reaper, control);
            return Err(e);
        }
    };
    let Some(address) = address else {
        give_back(reg, reaper, control);
        return Err(UsbdError::General("device left unaddressed".into()));
    };

    let node = Node {
        bus: key,
        path: path.clone(),
        speed,
        address,
        depth,
        parent,
        classes: ClassTuple::collect(&probe.descriptor, &probe.configs),
        descriptor: probe.descriptor,
        configs: probe.configs,
        configuration: 0,
        control: control.clone(),
        hub: None,
        pipes: Vec::new(),
        delete_pending: false,
        announced: false,
    };
    let id = match reg.handles.allocate(SIG_NODE, Object::Node(node)) {
        Ok(h) => NodeId(h),
        Err(e) => {
            give_back(reg, reaper, control);
            return Err(e);
        }
    };

    match parent {
        Some((hub, port)) => {
            if let Some(slot) = reg
                .node_mut(hub)?
                .hub
                .as_mut()
                .and_then(|h| h.ports.get_mut(usize::from(port).wrapping_sub(1)))
            {
                *slot = Some(id);
            }
        }
        None => reg.bus_mut(key)?.root = Some(id),
    }

    if reg.node(id)?.descriptor.is_hub()
        && let Err(e) = configure_hub(shared, reg, id)
    {
        warn!(%path, error = %e, "hub setup failed");
        if let Err(e) = destroy_subtree(shared, reg, reaper, id) {
            warn!(%path, error = %e, "cleanup after failed hub setup failed");
        }
        return Err(e);
    }

    let node = reg.node_mut(id)?;
    node.announced = true;
    info!(
        %path,
        address,
        %speed,
        vid_pid = %node.descriptor.vid_pid(),
        hub = node.hub.is_some(),
        "node attached"
    );
    node_event(shared, reg, id, AttachKind::Attach);
    Ok(id)
}

/// Remove `id` and everything below it, children first.
pub(crate) fn destroy_subtree(shared: &Shared, reg: &mut Registry, reaper: &mut Reaper, id: NodeId) -> Result<()> {
    let node = reg.node_mut(id)?;
    node.delete_pending = true;
    for child in node.children() {
        if let Err(e) = destroy_subtree(shared, reg, reaper, child) {
            warn!(node = %child, error = %e, "child teardown failed");
        }
    }
    destroy_node(shared, reg, reaper, id)
}

fn destroy_node(shared: &Shared, reg: &mut Registry, reaper: &mut Reaper, id: NodeId) -> Result<()> {
    let pipes = reg.node(id)?.pipes.clone();
    for pipe in pipes {
        if let Err(e) = super::pipe::destroy_locked(reg, reaper, pipe) {
            warn!(%pipe, error = %e, "pipe teardown failed");
        }
    }

    let node = reg.node_mut(id)?;
    let key = node.bus;
    let mut released_ns = 0;
    if let Some(hub) = node.hub.as_mut() {
        if let Some((irp, done)) = hub.status_irp.take() {
            match node.control.link.irp_cancel(hub.status_pipe, irp) {
                Ok(()) | Err(UsbdError::CannotCancel) => {}
                Err(e) => warn!(node = %id, error = %e, "status IRP cancel failed"),
            }
            reaper.wait_for(done);
        }
        reaper.destroy_pipe(node.control.link.clone(), hub.status_pipe);
        released_ns = hub.status_time_ns;
    }

    if node.announced {
        node_event(shared, reg, id, AttachKind::Remove);
    }

    let node = reg.release_node(id)?;
    if let Ok(bus) = reg.bus_mut(key) {
        bus.addresses.release(node.address);
        bus.reserved_ns = bus.reserved_ns.saturating_sub(released_ns);
        if bus.root == Some(id) {
            bus.root = None;
        }
    }
    if let Some((hub, port)) = node.parent
        && let Ok(parent) = reg.node_mut(hub)
        && let Some(slot) = parent
            .hub
            .as_mut()
            .and_then(|h| h.ports.get_mut(usize::from(port).wrapping_sub(1)))
        && *slot == Some(id)
    {
        *slot = None;
    }

    info!(path = %node.path, address = node.address, "node removed");
    reaper.wait_gate(node.control.gate.clone());
    reaper.destroy_pipe(node.control.link, node.control.pipe);
    Ok(())
}

impl Usbd {
    pub fn node_info(&self, client: ClientHandle, node: NodeId) -> Result<NodeInfo> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            reg.live_node(node)?;
            Node::snapshot(reg, node)
        })
    }

    /// Number of downstream ports. Fails with `NotHub` for devices.
    pub fn hub_port_count(&self, client: ClientHandle, node: NodeId) -> Result<u8> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let hub = reg.live_node(node)?.hub.as_ref().ok_or(UsbdError::NotHub)?;
            Ok(hub.ports.len() as u8)
        })
    }

    /// The node on `port` of a hub (1-based), if any.
    pub fn child_node(&self, client: ClientHandle, node: NodeId, port: u8) -> Result<Option<NodeId>> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let hub = reg.live_node(node)?.hub.as_ref().ok_or(UsbdError::NotHub)?;
            if port == 0 {
                return Err(UsbdError::BadParam("ports are numbered from 1"));
            }
            hub.ports
                .get(usize::from(port) - 1)
                .copied()
                .ok_or(UsbdError::BadParam("no such port"))
        })
    }

    /// Parent hub and port, `None` for a root hub.
    pub fn parent_node(&self, client: ClientHandle, node: NodeId) -> Result<Option<(NodeId, u8)>> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.live_node(node)?.parent)
        })
    }

    /// Descriptors read during enumeration.
    pub fn device_descriptor(&self, client: ClientHandle, node: NodeId) -> Result<DeviceDescriptor> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.live_node(node)?.descriptor.clone())
        })
    }

    pub fn config_descriptors(&self, client: ClientHandle, node: NodeId) -> Result<Vec<ConfigDescriptor>> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.live_node(node)?.configs.clone())
        })
    }
}
