//! Hub setup and port status handling.
//!
//! Each hub keeps one interrupt IRP outstanding on its status-change
//! endpoint. When it completes, the bus monitor thread walks the changed
//! ports: connection changes first tear down whatever hung off the port, then
//! a port that is still connected is reset and its device enumerated.

use super::bus::BusMsg;
use super::control::{ControlPath, control_sync};
use super::node::{create_node, destroy_subtree};
use super::{Reaper, Registry, Shared};
use crate::error::{HcdFault, Result, UsbdError};
use crate::handle::NodeId;
use crate::hcd::{HcdPipe, HcdPipeSpec};
use crate::irp::{DataToggle, Irp, IrpId};
use crate::model::descriptor::{
    DESC_HUB, REQ_CLEAR_FEATURE, REQ_GET_DESCRIPTOR, REQ_GET_STATUS, REQ_SET_CONFIGURATION,
    REQ_SET_FEATURE, Recipient, RequestKind, request_type,
};
use crate::model::hub::{
    HubFeature, changed_ports, hub_changed, parse_port_status, status_bitmap_len,
};
use crate::model::{
    ConfigDescriptor, Direction, EndpointDescriptor, HubDescriptor, PortChange, PortFeature,
    PortStatus, SetupPacket, TransferType,
};
use crate::sync::Completion;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest hub descriptor: 7 fixed bytes plus two 32-byte port bitmaps.
const HUB_DESCRIPTOR_MAX: u16 = 71;

/// Hub-only node state.
pub(crate) struct HubState {
    /// Child on each port, index 0 is port 1.
    pub ports: Vec<Option<NodeId>>,
    pub self_powered: bool,
    pub per_port_ma: u16,
    pub controller_ma: u16,
    pub status_pipe: HcdPipe,
    pub status_mps: u16,
    pub status_time_ns: u32,
    pub status_toggle: DataToggle,
    /// Outstanding status-change IRP, signalled once handed to the monitor.
    pub status_irp: Option<(IrpId, Arc<Completion>)>,
}

impl HubState {
    pub(crate) fn child(&self, port: u8) -> Option<NodeId> {
        self.ports
            .get(usize::from(port).wrapping_sub(1))
            .copied()
            .flatten()
    }
}

fn hub_request(direction: Direction, recipient: Recipient, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket::new(
        request_type(direction, RequestKind::Class, recipient),
        request,
        value,
        index,
        length,
    )
}

fn port_status(shared: &Shared, control: &ControlPath, port: u8) -> Result<(PortStatus, PortChange)> {
    let bytes = control_sync(
        shared,
        control,
        hub_request(Direction::In, Recipient::Other, REQ_GET_STATUS, 0, u16::from(port), 4),
        Vec::new(),
    )?;
    parse_port_status(&bytes).ok_or(UsbdError::Hcd(HcdFault::ShortPacket))
}

fn set_port_feature(shared: &Shared, control: &ControlPath, port: u8, feature: PortFeature) -> Result<()> {
    control_sync(
        shared,
        control,
        hub_request(Direction::Out, Recipient::Other, REQ_SET_FEATURE, feature as u16, u16::from(port), 0),
        Vec::new(),
    )
    .map(|_| ())
}

fn clear_port_feature(shared: &Shared, control: &ControlPath, port: u8, feature: PortFeature) -> Result<()> {
    control_sync(
        shared,
        control,
        hub_request(Direction::Out, Recipient::Other, REQ_CLEAR_FEATURE, feature as u16, u16::from(port), 0),
        Vec::new(),
    )
    .map(|_| ())
}

/// Configure a freshly enumerated hub, power its ports and start watching
/// its status-change endpoint.
pub(crate) fn configure_hub(shared: &Shared, reg: &mut Registry, id: NodeId) -> Result<()> {
    let node = reg.node(id)?;
    let control = node.control.clone();
    let (key, address, speed) = (node.bus, node.address, node.speed);
    let config: ConfigDescriptor = node
        .configs
        .first()
        .cloned()
        .ok_or(UsbdError::BadParam("hub without a configuration"))?;

    control_sync(
        shared,
        &control,
        SetupPacket::new(
            request_type(Direction::Out, RequestKind::Standard, Recipient::Device),
            REQ_SET_CONFIGURATION,
            u16::from(config.value),
            0,
            0,
        ),
        Vec::new(),
    )?;
    reg.node_mut(id)?.configuration = config.value;

    let bytes = control_sync(
        shared,
        &control,
        hub_request(
            Direction::In,
            Recipient::Device,
            REQ_GET_DESCRIPTOR,
            u16::from(DESC_HUB) << 8,
            0,
            HUB_DESCRIPTOR_MAX,
        ),
        Vec::new(),
    )?;
    let desc = HubDescriptor::parse(&bytes)
        .ok_or_else(|| UsbdError::General("malformed hub descriptor".into()))?;

    let self_powered = config.is_self_powered();
    let per_port_ma = if self_powered { 500 } else { 100 };
    for port in 1..=desc.ports {
        set_port_feature(shared, &control, port, PortFeature::PortPower)?;
    }
    thread::sleep(Duration::from_millis(desc.power_on_good_ms()));

    let bitmap_len = status_bitmap_len(desc.ports);
    let endpoint = config
        .interfaces
        .iter()
        .flat_map(|i| i.endpoints.iter())
        .find(|e| e.transfer_type() == TransferType::Interrupt && e.direction() == Direction::In)
        .copied()
        .unwrap_or_else(|| EndpointDescriptor::new(0x81, TransferType::Interrupt, bitmap_len as u16, 255));
    let (status_pipe, status_time_ns) = control.link.pipe_create(HcdPipeSpec {
        bus: key.index,
        address,
        endpoint: endpoint.address,
        transfer_type: TransferType::Interrupt,
        direction: Direction::In,
        speed,
        max_packet_size: endpoint.base_packet_size().max(1),
        bandwidth: bitmap_len as u32,
        interval: u16::from(endpoint.interval.max(1)),
    })?;

    reg.node_mut(id)?.hub = Some(HubState {
        ports: vec![None; usize::from(desc.ports)],
        self_powered,
        per_port_ma,
        controller_ma: u16::from(desc.controller_current),
        status_pipe,
        status_mps: endpoint.base_packet_size().max(1),
        status_time_ns,
        status_toggle: DataToggle::Data0,
        status_irp: None,
    });
    reg.bus_mut(key)?.reserved_ns += status_time_ns;
    debug!(node = %id, ports = desc.ports, self_powered, "hub configured");

    submit_status_irp(shared, reg, id)
}

/// Queue the hub's status-change IRP; its completion goes to the bus monitor.
fn submit_status_irp(shared: &Shared, reg: &mut Registry, hub: NodeId) -> Result<()> {
    let key = reg.node(hub)?.bus;
    let tx = reg.bus(key)?.monitor.sender();
    let node = reg.node_mut(hub)?;
    let link = node.control.link.clone();
    let state = node.hub.as_mut().ok_or(UsbdError::NotHub)?;

    let mut irp = Irp::read(status_bitmap_len(state.ports.len() as u8));
    let id = shared.next_irp_id();
    irp.assign_id(id);
    let done = Arc::new(Completion::new());
    {
        let done = done.clone();
        irp.set_callback(Box::new(move |irp: Irp| {
            if tx.send(BusMsg::HubStatus { hub, irp }).is_err() {
                debug!(node = %hub, "bus monitor gone; status change dropped");
            }
            done.signal();
        }));
    }
    state.status_irp = Some((id, done));
    link.irp_submit(state.status_pipe, irp, state.status_toggle)
}

struct PortPlan {
    changes: Vec<(u8, PortChange)>,
    hub_change: bool,
}

/// Handle a completed status-change IRP. Runs on the bus monitor thread.
pub(crate) fn hub_status(shared: &Shared, hub: NodeId, irp: Irp) {
    let plan = match shared.locked(|reg, reaper| scan_ports(shared, reg, reaper, hub, &irp)) {
        Ok(Some(plan)) => plan,
        Ok(None) => return,
        Err(e) => {
            warn!(node = %hub, error = %e, "hub status scan failed");
            return;
        }
    };
    if let Err(e) = shared.locked(|reg, reaper| update_ports(shared, reg, reaper, hub, &plan)) {
        warn!(node = %hub, error = %e, "hub port update failed");
    }
}

/// Read every changed port and remove whatever sat behind a port whose
/// connection changed.
fn scan_ports(
    shared: &Shared,
    reg: &mut Registry,
    reaper: &mut Reaper,
    hub: NodeId,
    irp: &Irp,
) -> Result<Option<PortPlan>> {
    let Ok(node) = reg.node_mut(hub) else {
        return Ok(None);
    };
    let delete_pending = node.delete_pending;
    let control = node.control.clone();
    let Some(state) = node.hub.as_mut() else {
        return Ok(None);
    };
    if state.status_irp.as_ref().map(|(id, _)| Some(*id)) == Some(irp.id()) {
        state.status_irp = None;
    }
    if delete_pending {
        return Ok(None);
    }
    match irp.result() {
        Some(Ok(())) => {}
        Some(Err(UsbdError::Canceled)) | None => return Ok(None),
        Some(Err(e)) => {
            warn!(node = %hub, error = %e, "hub status transfer failed; port monitoring stops");
            return Ok(None);
        }
    }
    state.status_toggle = state.status_toggle.advance(irp.packet_count(state.status_mps));

    let bitmap = irp.received();
    let ports = changed_ports(&bitmap, state.ports.len() as u8);
    let hub_change = hub_changed(&bitmap);

    let mut changes = Vec::with_capacity(ports.len());
    for port in ports {
        let (status, change) = match port_status(shared, &control, port) {
            Ok(s) => s,
            Err(e) => {
                warn!(node = %hub, port, error = %e, "port status read failed");
                continue;
            }
        };
        debug!(node = %hub, port, ?status, ?change, "port change");
        if change.contains(PortChange::CONNECTION)
            && let Some(child) = reg.node(hub)?.hub.as_ref().and_then(|h| h.child(port))
        {
            info!(node = %hub, port, "connection change; removing attached subtree");
            if let Err(e) = destroy_subtree(shared, reg, reaper, child) {
                warn!(node = %child, error = %e, "subtree teardown failed");
            }
        }
        changes.push((port, change));
    }
    Ok(Some(PortPlan { changes, hub_change }))
}

/// Bring up devices on connected ports, acknowledge every change and re-arm
/// the status IRP.
fn update_ports(shared: &Shared, reg: &mut Registry, reaper: &mut Reaper, hub: NodeId, plan: &PortPlan) -> Result<()> {
    let Ok(node) = reg.live_node(hub) else {
        return Ok(());
    };
    let control = node.control.clone();

    for &(port, change) in &plan.changes {
        if change.contains(PortChange::CONNECTION)
            && let Err(e) = connect_port(shared, reg, reaper, hub, &control, port)
        {
            warn!(node = %hub, port, error = %e, "device on port not brought up");
        }
        if let Err(e) = acknowledge_port(shared, &control, hub, port) {
            warn!(node = %hub, port, error = %e, "port change acknowledgement failed");
        }
    }
    if plan.hub_change
        && let Err(e) = acknowledge_hub(shared, &control, hub)
    {
        warn!(node = %hub, error = %e, "hub change acknowledgement failed");
    }

    if reg.live_node(hub).is_err() {
        return Ok(());
    }
    submit_status_irp(shared, reg, hub)
}

/// Reset a newly connected port and enumerate what is behind it.
fn connect_port(
    shared: &Shared,
    reg: &mut Registry,
    reaper: &mut Reaper,
    hub: NodeId,
    control: &ControlPath,
    port: u8,
) -> Result<()> {
    let timing = &shared.config().timing;
    let (status, _) = port_status(shared, control, port)?;
    if !status.contains(PortStatus::CONNECTION) {
        debug!(node = %hub, port, "port empty");
        return Ok(());
    }

    thread::sleep(timing.power_settle());
    set_port_feature(shared, control, port, PortFeature::PortReset)?;
    thread::sleep(timing.reset());

    let (status, change) = port_status(shared, control, port)?;
    if change.contains(PortChange::RESET) {
        clear_port_feature(shared, control, port, PortFeature::CPortReset)?;
    }
    clear_port_feature(shared, control, port, PortFeature::CPortConnection)?;
    if !status.contains(PortStatus::CONNECTION | PortStatus::ENABLE) {
        debug!(node = %hub, port, ?status, "device went away during reset");
        return Ok(());
    }

    let parent = reg.live_node(hub)?;
    let (key, depth) = (parent.bus, parent.depth);
    if depth + 1 > shared.config().bus.max_tiers {
        warn!(node = %hub, port, depth, "topology too deep; device ignored");
        return Err(UsbdError::OutOfResources("topology tiers"));
    }
    create_node(shared, reg, reaper, key, Some((hub, port)), status.speed(), depth + 1)?;
    Ok(())
}

fn acknowledge_port(shared: &Shared, control: &ControlPath, hub: NodeId, port: u8) -> Result<()> {
    let (status, change) = port_status(shared, control, port)?;
    if change.contains(PortChange::OVER_CURRENT) {
        warn!(node = %hub, port, over_current = status.contains(PortStatus::OVER_CURRENT), "port over-current change");
    }
    for feature in change.acknowledgements() {
        clear_port_feature(shared, control, port, feature)?;
    }
    Ok(())
}

fn acknowledge_hub(shared: &Shared, control: &ControlPath, hub: NodeId) -> Result<()> {
    let bytes = control_sync(
        shared,
        control,
        hub_request(Direction::In, Recipient::Device, REQ_GET_STATUS, 0, 0, 4),
        Vec::new(),
    )?;
    let change = match bytes.as_slice() {
        [_, _, lo, hi, ..] => u16::from_le_bytes([*lo, *hi]),
        _ => return Err(UsbdError::Hcd(HcdFault::ShortPacket)),
    };
    for (bit, feature) in [(0, HubFeature::CHubLocalPower), (1, HubFeature::CHubOverCurrent)] {
        if change & (1 << bit) != 0 {
            if feature == HubFeature::CHubOverCurrent {
                warn!(node = %hub, "hub over-current change");
            }
            control_sync(
                shared,
                control,
                hub_request(Direction::Out, Recipient::Device, REQ_CLEAR_FEATURE, feature as u16, 0, 0),
                Vec::new(),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_request_types() {
        let get = hub_request(Direction::In, Recipient::Other, REQ_GET_STATUS, 0, 3, 4);
        assert_eq!(get.request_type, 0xA3);
        assert_eq!(get.index, 3);
        let set = hub_request(Direction::Out, Recipient::Other, REQ_SET_FEATURE, PortFeature::PortReset as u16, 1, 0);
        assert_eq!(set.request_type, 0x23);
        assert_eq!(set.value, 4);
        let desc = hub_request(Direction::In, Recipient::Device, REQ_GET_DESCRIPTOR, 0x2900, 0, 71);
        assert_eq!(desc.request_type, 0xA0);
    }
}
