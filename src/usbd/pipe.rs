//! Client pipes and IRP dispatch.

use super::bus::{BusCounters, BusKey};
use super::client::{ClientMsg, wait_pumping};
use super::{Object, Reaper, Registry, SIG_PIPE, Usbd};
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, NodeId, PipeHandle};
use crate::hcd::{HcdLink, HcdPipe, HcdPipeSpec};
use crate::irp::{DataToggle, Irp, IrpId, Pid};
use crate::model::bandwidth::bytes_per_frame;
use crate::model::{Direction, EndpointDescriptor, TransferType};
use crate::sync::{Completion, ControlGate};
use crossbeam_channel::{SendError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a client asks for when it opens a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeRequest {
    /// Endpoint number, 0..=15.
    pub endpoint: u8,
    pub configuration: u8,
    pub interface: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub max_packet_size: u16,
    /// Isochronous: bytes per second. Interrupt: bytes per frame.
    pub bandwidth: u32,
    /// Interrupt: service interval in frames.
    pub interval: u16,
}

impl PipeRequest {
    pub fn bulk(endpoint: u8, direction: Direction, max_packet_size: u16) -> Self {
        Self {
            endpoint,
            configuration: 1,
            interface: 0,
            transfer_type: TransferType::Bulk,
            direction,
            max_packet_size,
            bandwidth: 0,
            interval: 0,
        }
    }

    pub fn interrupt(endpoint: u8, direction: Direction, max_packet_size: u16, bytes_per_frame: u32, interval: u16) -> Self {
        Self {
            transfer_type: TransferType::Interrupt,
            bandwidth: bytes_per_frame,
            interval,
            ..Self::bulk(endpoint, direction, max_packet_size)
        }
    }

    pub fn isochronous(endpoint: u8, direction: Direction, max_packet_size: u16, bytes_per_second: u32) -> Self {
        Self {
            transfer_type: TransferType::Isochronous,
            bandwidth: bytes_per_second,
            ..Self::bulk(endpoint, direction, max_packet_size)
        }
    }

    pub fn control(endpoint: u8, max_packet_size: u16) -> Self {
        Self {
            transfer_type: TransferType::Control,
            ..Self::bulk(endpoint, Direction::Both, max_packet_size)
        }
    }

    /// Request matching an endpoint descriptor, reserving its full
    /// per-frame payload for periodic endpoints.
    pub fn from_endpoint(desc: &EndpointDescriptor, configuration: u8, interface: u8) -> Self {
        let payload = u32::from(desc.base_packet_size()) * u32::from(desc.multiplier());
        let base = Self {
            configuration,
            interface,
            ..Self::bulk(desc.number(), desc.direction(), desc.base_packet_size())
        };
        match desc.transfer_type() {
            TransferType::Bulk => base,
            TransferType::Control => Self {
                transfer_type: TransferType::Control,
                direction: Direction::Both,
                ..base
            },
            TransferType::Interrupt => Self {
                transfer_type: TransferType::Interrupt,
                bandwidth: payload,
                interval: u16::from(desc.interval.max(1)),
                ..base
            },
            TransferType::Isochronous => Self {
                transfer_type: TransferType::Isochronous,
                bandwidth: payload * 1000,
                ..base
            },
        }
    }

    pub fn with_interface(mut self, configuration: u8, interface: u8) -> Self {
        self.configuration = configuration;
        self.interface = interface;
        self
    }

    /// Endpoint address as carried on the wire.
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            _ => self.endpoint,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint > 15 {
            return Err(UsbdError::BadParam("endpoint number above 15"));
        }
        if self.max_packet_size == 0 {
            return Err(UsbdError::BadParam("zero max packet size"));
        }
        match self.transfer_type {
            TransferType::Control => {}
            _ if self.direction == Direction::Both => {
                return Err(UsbdError::BadParam("only control pipes are bidirectional"));
            }
            TransferType::Isochronous if self.bandwidth == 0 => {
                return Err(UsbdError::BadParam("isochronous pipes need a bytes/second rate"));
            }
            TransferType::Interrupt if self.bandwidth == 0 => {
                return Err(UsbdError::BadParam("interrupt pipes need a bytes/frame size"));
            }
            TransferType::Interrupt if self.interval == 0 => {
                return Err(UsbdError::BadParam("interrupt pipes need a service interval"));
            }
            _ => {}
        }
        Ok(())
    }
}

/// Snapshot of a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    pub node: NodeId,
    pub client: ClientHandle,
    pub request: PipeRequest,
    /// Worst-case time per frame reserved for the pipe, 0 for non-periodic.
    pub time_ns: u32,
    pub toggle: DataToggle,
    pub in_flight: usize,
}

#[derive(Default)]
struct IoState {
    closed: bool,
    toggle: DataToggle,
    /// Signalled once the IRP's callback has run.
    in_flight: HashMap<IrpId, Arc<Completion>>,
}

/// Transfer state shared with completion context.
#[derive(Default)]
pub(crate) struct PipeIo {
    state: Mutex<IoState>,
}

impl PipeIo {
    pub(crate) fn reset_toggle(&self) {
        self.state.lock().toggle = DataToggle::Data0;
    }

    fn toggle(&self) -> DataToggle {
        self.state.lock().toggle
    }
}

pub(crate) struct Pipe {
    pub client: ClientHandle,
    pub node: NodeId,
    pub bus: BusKey,
    pub link: HcdLink,
    pub hcd_pipe: HcdPipe,
    pub request: PipeRequest,
    pub time_ns: u32,
    pub counters: Arc<BusCounters>,
    pub io: Arc<PipeIo>,
}

/// Cancel a pipe's IRPs, release it, and queue the HCD pipe for destruction
/// once every cancelled callback has run.
pub(crate) fn destroy_locked(reg: &mut Registry, reaper: &mut Reaper, handle: PipeHandle) -> Result<()> {
    let pipe = reg.release_pipe(handle)?;

    let pending: Vec<(IrpId, Arc<Completion>)> = {
        let mut state = pipe.io.state.lock();
        state.closed = true;
        state.in_flight.iter().map(|(id, done)| (*id, done.clone())).collect()
    };
    for (id, done) in pending {
        match pipe.link.irp_cancel(pipe.hcd_pipe, id) {
            Ok(()) | Err(UsbdError::CannotCancel) => {}
            Err(e) => warn!(%handle, irp = %id, error = %e, "IRP cancel failed"),
        }
        reaper.wait_for(done);
    }
    reaper.destroy_pipe(pipe.link.clone(), pipe.hcd_pipe);

    if let Ok(client) = reg.client_mut(pipe.client) {
        client.pipes.retain(|&p| p != handle);
    }
    if let Ok(node) = reg.node_mut(pipe.node) {
        node.pipes.retain(|&p| p != handle);
    }
    if let Ok(bus) = reg.bus_mut(pipe.bus) {
        bus.reserved_ns = bus.reserved_ns.saturating_sub(pipe.time_ns);
    }
    debug!(%handle, endpoint = pipe.request.endpoint_address(), "pipe destroyed");
    Ok(())
}

/// Restart every pipe on `node` that `affected` selects at DATA0.
pub(crate) fn reset_toggles(reg: &Registry, node: NodeId, affected: impl Fn(&PipeRequest) -> bool) -> Result<()> {
    for &handle in &reg.live_node(node)?.pipes {
        let pipe = reg.pipe(handle)?;
        if affected(&pipe.request) {
            pipe.io.reset_toggle();
        }
    }
    Ok(())
}

/// Fail an IRP before it reaches the controller.
fn reject(mut irp: Irp, error: UsbdError) -> Result<IrpId> {
    irp.set_result(Err(error.clone()));
    irp.complete();
    Err(error)
}

fn check_segments(irp: &Irp, request: &PipeRequest) -> Result<()> {
    if irp.segments.is_empty() {
        return Err(UsbdError::BadParam("IRP without segments"));
    }
    let ok = match request.direction {
        Direction::In => irp.segments.iter().all(|s| s.pid == Pid::In),
        Direction::Out => irp.segments.iter().all(|s| s.pid == Pid::Out),
        Direction::Both => irp.segments[0].pid == Pid::Setup,
    };
    if !ok {
        return Err(UsbdError::BadParam("segment direction does not match pipe"));
    }
    Ok(())
}

/// What the completion relay of one IRP needs.
struct Dispatch {
    tx: Sender<ClientMsg>,
    link: HcdLink,
    hcd_pipe: HcdPipe,
    io: Arc<PipeIo>,
    counters: Arc<BusCounters>,
    max_packet_size: u16,
    uses_toggle: bool,
    direction: Direction,
}

impl Dispatch {
    fn lookup(reg: &Registry, client: ClientHandle, pipe: PipeHandle, irp: &Irp) -> Result<Self> {
        let tx = reg.client(client)?.completion_sender();
        let p = reg.pipe(pipe)?;
        if p.client != client || p.io.state.lock().closed {
            return Err(UsbdError::BadHandle);
        }
        reg.live_node(p.node)?;
        check_segments(irp, &p.request)?;
        Ok(Self {
            tx,
            link: p.link.clone(),
            hcd_pipe: p.hcd_pipe,
            io: p.io.clone(),
            counters: p.counters.clone(),
            max_packet_size: p.request.max_packet_size,
            uses_toggle: p.request.transfer_type.uses_data_toggle(),
            direction: p.request.direction,
        })
    }
}

impl Usbd {
    /// Open a pipe to an endpoint of `node`.
    ///
    /// Periodic pipes reserve bus bandwidth; if the controller refuses, the
    /// call fails and no pipe exists.
    pub fn create_pipe(&self, client: ClientHandle, node: NodeId, request: PipeRequest) -> Result<PipeHandle> {
        request.validate()?;
        self.shared.locked(|reg, reaper| {
            reg.client(client)?;
            let n = reg.live_node(node)?;
            let (key, link, counters) = (n.bus, n.control.link.clone(), n.control.counters.clone());
            let bandwidth = match request.transfer_type {
                TransferType::Isochronous => bytes_per_frame(n.speed, request.bandwidth),
                TransferType::Interrupt => request.bandwidth,
                _ => 0,
            };
            let spec = HcdPipeSpec {
                bus: key.index,
                address: n.address,
                endpoint: request.endpoint_address(),
                transfer_type: request.transfer_type,
                direction: request.direction,
                speed: n.speed,
                max_packet_size: request.max_packet_size,
                bandwidth,
                interval: request.interval,
            };

            let (hcd_pipe, time_ns) = link.pipe_create(spec)?;
            let time_ns = if request.transfer_type.reserves_bandwidth() {
                time_ns
            } else {
                0
            };
            let pipe = Pipe {
                client,
                node,
                bus: key,
                link: link.clone(),
                hcd_pipe,
                request,
                time_ns,
                counters,
                io: Arc::new(PipeIo::default()),
            };
            let handle = match reg.handles.allocate(SIG_PIPE, Object::Pipe(pipe)) {
                Ok(h) => PipeHandle(h),
                Err(e) => {
                    reaper.destroy_pipe(link, hcd_pipe);
                    return Err(e);
                }
            };

            reg.client_mut(client)?.pipes.push(handle);
            reg.node_mut(node)?.pipes.push(handle);
            reg.bus_mut(key)?.reserved_ns += time_ns;
            info!(
                %handle,
                %node,
                endpoint = request.endpoint_address(),
                kind = %request.transfer_type,
                time_ns,
                "pipe created"
            );
            Ok(handle)
        })
    }

    /// Cancel every IRP on the pipe, wait for their callbacks and close it.
    pub fn destroy_pipe(&self, client: ClientHandle, pipe: PipeHandle) -> Result<()> {
        self.shared.locked(|reg, reaper| {
            reg.client(client)?;
            if reg.pipe(pipe)?.client != client {
                return Err(UsbdError::BadHandle);
            }
            destroy_locked(reg, reaper, pipe)
        })
    }

    pub fn pipe_info(&self, client: ClientHandle, pipe: PipeHandle) -> Result<PipeInfo> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let p = reg.pipe(pipe)?;
            if p.client != client {
                return Err(UsbdError::BadHandle);
            }
            Ok(PipeInfo {
                node: p.node,
                client: p.client,
                request: p.request,
                time_ns: p.time_ns,
                toggle: p.io.toggle(),
                in_flight: p.io.state.lock().in_flight.len(),
            })
        })
    }

    /// Queue an IRP on a pipe.
    ///
    /// The IRP's callback runs exactly once on the client's callback thread,
    /// or on the calling thread if the IRP is refused before reaching the
    /// controller. The returned id names the IRP for
    /// [`abort_transfer`](Self::abort_transfer).
    ///
    /// Control pipes share the node's control gate with
    /// [`control_request`](Self::control_request), so this blocks while
    /// another control transfer to the node is in flight.
    pub fn submit_transfer(&self, client: ClientHandle, pipe: PipeHandle, mut irp: Irp) -> Result<IrpId> {
        let id = self.shared.next_irp_id();
        irp.assign_id(id);

        let gate = match self.control_gate(pipe) {
            Ok(gate) => gate,
            Err(e) => return reject(irp, e),
        };
        if let Some(gate) = &gate {
            gate.acquire();
        }
        let refuse = |irp: Irp, error: UsbdError| {
            if let Some(gate) = &gate {
                gate.release();
            }
            reject(irp, error)
        };

        let reg = match self.shared.registry() {
            Ok(reg) => reg,
            Err(e) => return refuse(irp, e),
        };
        let ctx = match Dispatch::lookup(&reg, client, pipe, &irp) {
            Ok(ctx) => ctx,
            Err(e) => {
                drop(reg);
                return refuse(irp, e);
            }
        };

        let done = Arc::new(Completion::new());
        let toggle = {
            let mut state = ctx.io.state.lock();
            state.in_flight.insert(id, done.clone());
            state.toggle
        };

        let user = irp.take_callback();
        let held = gate.clone();
        let Dispatch {
            tx,
            link,
            hcd_pipe,
            io,
            counters,
            max_packet_size,
            uses_toggle,
            direction,
        } = ctx;
        irp.set_callback(Box::new(move |mut irp: Irp| {
            if uses_toggle && irp.is_ok() {
                let mut state = io.state.lock();
                state.toggle = state.toggle.advance(irp.packet_count(max_packet_size));
            }
            counters.record(direction, irp.is_ok());
            if let Some(gate) = held {
                gate.release();
            }
            if let Some(user) = user {
                irp.set_callback(user);
            }
            let finish = Box::new(move || {
                io.state.lock().in_flight.remove(&id);
                done.signal();
            });
            let msg = ClientMsg::IrpComplete { irp, finish };
            if let Err(SendError(ClientMsg::IrpComplete { irp, finish })) = tx.send(msg) {
                irp.complete();
                finish();
            }
        }));

        let submitted = link.irp_submit(hcd_pipe, irp, toggle);
        drop(reg);
        submitted.map(|_| id)
    }

    /// The node's control gate if `pipe` is a control pipe.
    fn control_gate(&self, pipe: PipeHandle) -> Result<Option<Arc<ControlGate>>> {
        let reg = self.shared.registry()?;
        let p = reg.pipe(pipe)?;
        if p.request.transfer_type != TransferType::Control {
            return Ok(None);
        }
        Ok(Some(reg.live_node(p.node)?.control.gate.clone()))
    }

    /// Cancel an IRP and wait until its callback has run.
    ///
    /// Fails with `CannotCancel` if the IRP's callback already ran.
    pub fn abort_transfer(&self, client: ClientHandle, pipe: PipeHandle, irp: IrpId) -> Result<()> {
        let done = self.shared.locked(|reg, _| {
            reg.client(client)?;
            let p = reg.pipe(pipe)?;
            if p.client != client {
                return Err(UsbdError::BadHandle);
            }
            let done = p
                .io
                .state
                .lock()
                .in_flight
                .get(&irp)
                .cloned()
                .ok_or(UsbdError::CannotCancel)?;
            match p.link.irp_cancel(p.hcd_pipe, irp) {
                Ok(()) | Err(UsbdError::CannotCancel) => {}
                Err(e) => warn!(%pipe, %irp, error = %e, "IRP cancel failed"),
            }
            Ok(done)
        })?;
        wait_pumping(&done);
        Ok(())
    }
}
