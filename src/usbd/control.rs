//! Control transfers: Setup, optional Data, Status, one at a time per node.

use super::bus::BusCounters;
use super::client::ClientMsg;
use super::pipe::reset_toggles;
use super::{Shared, Usbd};
use crate::error::{HcdFault, Result, UsbdError};
use crate::handle::{ClientHandle, NodeId, PipeHandle};
use crate::hcd::{HcdLink, HcdPipe};
use crate::irp::{DataToggle, Irp, IrpId, IrpSegment};
use crate::model::descriptor::{
    FEATURE_ENDPOINT_HALT, REQ_CLEAR_FEATURE, REQ_GET_CONFIGURATION, REQ_GET_DESCRIPTOR,
    REQ_GET_INTERFACE, REQ_GET_STATUS, REQ_SET_ADDRESS, REQ_SET_CONFIGURATION,
    REQ_SET_DESCRIPTOR, REQ_SET_FEATURE, REQ_SET_INTERFACE, REQ_SYNCH_FRAME, Recipient,
    RequestKind, request_type,
};
use crate::model::{Direction, SetupPacket};
use crate::sync::{Completion, ControlGate};
use crossbeam_channel::SendError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

/// Everything needed to run a control transfer to one node.
#[derive(Clone)]
pub(crate) struct ControlPath {
    pub link: HcdLink,
    pub pipe: HcdPipe,
    pub max_packet_size: u16,
    /// Held from submission until completion.
    pub gate: Arc<ControlGate>,
    pub counters: Arc<BusCounters>,
}

/// Setup segment, data segment if `length` is non-zero, then a zero-length
/// status segment in the opposite direction (IN when there is no data).
pub(crate) fn build_control_irp(setup: &SetupPacket, out: Vec<u8>) -> Result<Irp> {
    let direction = setup.direction();
    let mut segments = vec![IrpSegment::setup(setup)];
    if setup.length > 0 {
        match direction {
            Direction::In => {
                if !out.is_empty() {
                    return Err(UsbdError::BadParam("IN request with OUT data"));
                }
                segments.push(IrpSegment::input(usize::from(setup.length)));
            }
            _ => {
                if out.len() != usize::from(setup.length) {
                    return Err(UsbdError::BadParam("OUT data does not match wLength"));
                }
                segments.push(IrpSegment::output(out));
            }
        }
    } else if !out.is_empty() {
        return Err(UsbdError::BadParam("data without wLength"));
    }
    let status = if setup.length > 0 && direction == Direction::In {
        IrpSegment::output(Vec::new())
    } else {
        IrpSegment::input(0)
    };
    segments.push(status);
    Ok(Irp::new(segments))
}

/// Run one control transfer and wait for it. Returns the IN data.
pub(crate) fn control_sync(shared: &Shared, path: &ControlPath, setup: SetupPacket, out: Vec<u8>) -> Result<Vec<u8>> {
    let mut irp = build_control_irp(&setup, out)?;
    irp.assign_id(shared.next_irp_id());

    let slot: Arc<Mutex<Option<Irp>>> = Arc::new(Mutex::new(None));
    let done = Arc::new(Completion::new());
    {
        let slot = slot.clone();
        let done = done.clone();
        let gate = path.gate.clone();
        let counters = path.counters.clone();
        let direction = setup.direction();
        irp.set_callback(Box::new(move |irp: Irp| {
            counters.record(direction, irp.is_ok());
            *slot.lock() = Some(irp);
            gate.release();
            done.signal();
        }));
    }

    path.gate.acquire();
    // a refused IRP is still completed, so the gate is always released
    let submitted = path.link.irp_submit(path.pipe, irp, DataToggle::Data0);
    done.wait();
    let irp = slot
        .lock()
        .take()
        .ok_or_else(|| UsbdError::General("control completion lost".into()))?;
    submitted?;

    match irp.result() {
        Some(Ok(())) => Ok(irp.received()),
        Some(Err(e)) => {
            debug!(request = setup.request, error = %e, "control transfer failed");
            Err(e.clone())
        }
        None => Err(UsbdError::General("control transfer completed without a result".into())),
    }
}

fn standard(direction: Direction, recipient: Recipient, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket::new(
        request_type(direction, RequestKind::Standard, recipient),
        request,
        value,
        index,
        length,
    )
}

impl Usbd {
    fn control_path(&self, client: ClientHandle, node: NodeId) -> Result<ControlPath> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.live_node(node)?.control.clone())
        })
    }

    /// Issue an arbitrary control request to a node's default pipe and wait
    /// for it. Returns the bytes read for IN requests.
    pub fn control_request(&self, client: ClientHandle, node: NodeId, setup: SetupPacket, out: Vec<u8>) -> Result<Vec<u8>> {
        let path = self.control_path(client, node)?;
        control_sync(&self.shared, &path, setup, out)
    }

    /// Issue a control request without waiting. `callback` runs on the
    /// client's callback thread.
    pub fn control_request_async(
        &self,
        client: ClientHandle,
        node: NodeId,
        setup: SetupPacket,
        out: Vec<u8>,
        callback: impl FnOnce(Irp) + Send + 'static,
    ) -> Result<IrpId> {
        let (path, tx) = self.shared.locked(|reg, _| {
            let tx = reg.client(client)?.completion_sender();
            Ok((reg.live_node(node)?.control.clone(), tx))
        })?;

        let mut irp = build_control_irp(&setup, out)?;
        let id = self.shared.next_irp_id();
        irp.assign_id(id);
        let user: Box<dyn FnOnce(Irp) + Send> = Box::new(callback);
        {
            let gate = path.gate.clone();
            let counters = path.counters.clone();
            let direction = setup.direction();
            irp.set_callback(Box::new(move |mut irp: Irp| {
                counters.record(direction, irp.is_ok());
                gate.release();
                irp.set_callback(user);
                let msg = ClientMsg::IrpComplete {
                    irp,
                    finish: Box::new(|| {}),
                };
                if let Err(SendError(ClientMsg::IrpComplete { irp, finish })) = tx.send(msg) {
                    irp.complete();
                    finish();
                }
            }));
        }

        path.gate.acquire();
        path.link.irp_submit(path.pipe, irp, DataToggle::Data0)?;
        Ok(id)
    }

    pub fn get_descriptor(
        &self,
        client: ClientHandle,
        node: NodeId,
        desc_type: u8,
        index: u8,
        language: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let value = (u16::from(desc_type) << 8) | u16::from(index);
        self.control_request(
            client,
            node,
            standard(Direction::In, Recipient::Device, REQ_GET_DESCRIPTOR, value, language, length),
            Vec::new(),
        )
    }

    pub fn set_descriptor(
        &self,
        client: ClientHandle,
        node: NodeId,
        desc_type: u8,
        index: u8,
        language: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        let value = (u16::from(desc_type) << 8) | u16::from(index);
        let length = u16::try_from(data.len()).map_err(|_| UsbdError::BadParam("descriptor too long"))?;
        self.control_request(
            client,
            node,
            standard(Direction::Out, Recipient::Device, REQ_SET_DESCRIPTOR, value, language, length),
            data,
        )
        .map(|_| ())
    }

    pub fn get_status(&self, client: ClientHandle, node: NodeId, recipient: Recipient, index: u16) -> Result<u16> {
        let bytes = self.control_request(
            client,
            node,
            standard(Direction::In, recipient, REQ_GET_STATUS, 0, index, 2),
            Vec::new(),
        )?;
        match bytes.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(UsbdError::Hcd(HcdFault::ShortPacket)),
        }
    }

    pub fn set_feature(&self, client: ClientHandle, node: NodeId, recipient: Recipient, selector: u16, index: u16) -> Result<()> {
        self.control_request(
            client,
            node,
            standard(Direction::Out, recipient, REQ_SET_FEATURE, selector, index, 0),
            Vec::new(),
        )
        .map(|_| ())
    }

    pub fn clear_feature(&self, client: ClientHandle, node: NodeId, recipient: Recipient, selector: u16, index: u16) -> Result<()> {
        self.control_request(
            client,
            node,
            standard(Direction::Out, recipient, REQ_CLEAR_FEATURE, selector, index, 0),
            Vec::new(),
        )
        .map(|_| ())
    }

    pub fn get_configuration(&self, client: ClientHandle, node: NodeId) -> Result<u8> {
        let bytes = self.control_request(
            client,
            node,
            standard(Direction::In, Recipient::Device, REQ_GET_CONFIGURATION, 0, 0, 1),
            Vec::new(),
        )?;
        bytes
            .first()
            .copied()
            .ok_or(UsbdError::Hcd(HcdFault::ShortPacket))
    }

    /// Select a configuration. Pipes opened for it restart at DATA0.
    pub fn set_configuration(&self, client: ClientHandle, node: NodeId, value: u8) -> Result<()> {
        let path = self.shared.locked(|reg, _| {
            reg.client(client)?;
            let path = reg.live_node(node)?.control.clone();
            reset_toggles(reg, node, |req| req.configuration == value)?;
            Ok(path)
        })?;
        control_sync(
            &self.shared,
            &path,
            standard(Direction::Out, Recipient::Device, REQ_SET_CONFIGURATION, u16::from(value), 0, 0),
            Vec::new(),
        )?;
        self.shared.locked(|reg, _| {
            reg.node_mut(node)?.configuration = value;
            Ok(())
        })
    }

    pub fn get_interface(&self, client: ClientHandle, node: NodeId, interface: u8) -> Result<u8> {
        let bytes = self.control_request(
            client,
            node,
            standard(Direction::In, Recipient::Interface, REQ_GET_INTERFACE, 0, u16::from(interface), 1),
            Vec::new(),
        )?;
        bytes
            .first()
            .copied()
            .ok_or(UsbdError::Hcd(HcdFault::ShortPacket))
    }

    /// Select an alternate setting. Pipes on the interface restart at DATA0.
    pub fn set_interface(&self, client: ClientHandle, node: NodeId, interface: u8, alternate: u8) -> Result<()> {
        let path = self.shared.locked(|reg, _| {
            reg.client(client)?;
            let n = reg.live_node(node)?;
            let path = n.control.clone();
            let configuration = n.configuration;
            reset_toggles(reg, node, |req| {
                req.configuration == configuration && req.interface == interface
            })?;
            Ok(path)
        })?;
        control_sync(
            &self.shared,
            &path,
            standard(
                Direction::Out,
                Recipient::Interface,
                REQ_SET_INTERFACE,
                u16::from(alternate),
                u16::from(interface),
                0,
            ),
            Vec::new(),
        )
        .map(|_| ())
    }

    /// Clear ENDPOINT_HALT on a pipe's endpoint. The pipe restarts at DATA0.
    pub fn clear_halt(&self, client: ClientHandle, pipe: PipeHandle) -> Result<()> {
        let (path, endpoint) = self.shared.locked(|reg, _| {
            reg.client(client)?;
            let p = reg.pipe(pipe)?;
            if p.client != client {
                return Err(UsbdError::BadHandle);
            }
            let path = reg.live_node(p.node)?.control.clone();
            p.io.reset_toggle();
            Ok((path, p.request.endpoint_address()))
        })?;
        control_sync(
            &self.shared,
            &path,
            standard(
                Direction::Out,
                Recipient::Endpoint,
                REQ_CLEAR_FEATURE,
                FEATURE_ENDPOINT_HALT,
                u16::from(endpoint),
                0,
            ),
            Vec::new(),
        )
        .map(|_| ())
    }

    pub fn get_address(&self, client: ClientHandle, node: NodeId) -> Result<u8> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.live_node(node)?.address)
        })
    }

    /// Move a node to another bus address. The node's default pipe and every
    /// pipe opened on it follow.
    pub fn set_address(&self, client: ClientHandle, node: NodeId, address: u8) -> Result<()> {
        let (path, key, old) = self.shared.locked(|reg, _| {
            reg.client(client)?;
            let n = reg.live_node(node)?;
            let (path, key, old) = (n.control.clone(), n.bus, n.address);
            if address != old {
                reg.bus_mut(key)?.addresses.claim(address)?;
            }
            Ok((path, key, old))
        })?;
        if address == old {
            return Ok(());
        }

        let result = control_sync(
            &self.shared,
            &path,
            standard(Direction::Out, Recipient::Device, REQ_SET_ADDRESS, u16::from(address), 0, 0),
            Vec::new(),
        );

        self.shared.locked(|reg, _| {
            let release = |reg: &mut super::Registry, a: u8| {
                if let Ok(bus) = reg.bus_mut(key) {
                    bus.addresses.release(a);
                }
            };
            if let Err(e) = result {
                release(reg, address);
                return Err(e);
            }
            if let Err(e) = reg.node(node) {
                release(reg, address);
                return Err(e);
            }
            let n = reg.node_mut(node)?;
            n.address = address;
            n.control.link.pipe_modify(n.control.pipe, address, n.control.max_packet_size)?;
            for handle in n.pipes.clone() {
                let p = reg.pipe(handle)?;
                if let Err(e) = p.link.pipe_modify(p.hcd_pipe, address, p.request.max_packet_size) {
                    warn!(pipe = %handle, error = %e, "pipe did not follow address change");
                }
            }
            release(reg, old);
            Ok(())
        })?;
        thread::sleep(self.shared.config().timing.set_address_recovery());
        Ok(())
    }

    /// Frame number an isochronous endpoint's pattern restarts on.
    pub fn synch_frame(&self, client: ClientHandle, node: NodeId, endpoint: u8) -> Result<u16> {
        let bytes = self.control_request(
            client,
            node,
            standard(Direction::In, Recipient::Endpoint, REQ_SYNCH_FRAME, 0, u16::from(endpoint), 2),
            Vec::new(),
        )?;
        match bytes.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(UsbdError::Hcd(HcdFault::ShortPacket)),
        }
    }

    /// Vendor-specific IN request.
    #[allow(clippy::too_many_arguments)]
    pub fn vendor_in(
        &self,
        client: ClientHandle,
        node: NodeId,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Result<Vec<u8>> {
        let setup = SetupPacket::new(
            request_type(Direction::In, RequestKind::Vendor, recipient),
            request,
            value,
            index,
            length,
        );
        self.control_request(client, node, setup, Vec::new())
    }

    /// Vendor-specific OUT request.
    #[allow(clippy::too_many_arguments)]
    pub fn vendor_out(
        &self,
        client: ClientHandle,
        node: NodeId,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        data: Vec<u8>,
    ) -> Result<()> {
        let length = u16::try_from(data.len()).map_err(|_| UsbdError::BadParam("vendor data too long"))?;
        let setup = SetupPacket::new(
            request_type(Direction::Out, RequestKind::Vendor, recipient),
            request,
            value,
            index,
            length,
        );
        self.control_request(client, node, setup, data).map(|_| ())
    }
}
