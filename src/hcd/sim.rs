//! A complete virtual host controller.
//!
//! `SimHcd` models one or more buses, each with a root hub, plus any tree of
//! external hubs and devices plugged into their ports. It answers standard,
//! hub-class and vendor control requests, keeps per-port status/change bits,
//! admits periodic pipes against a nanosecond budget and completes every IRP
//! on its own worker thread.

use super::{BusState, HcdEventSink, HcdPipe, HcdPipeSpec, HcdReply, HcdRequest, HostController, MgmtEvent};
use crate::error::{HcdFault, Result, UsbdError};
use crate::irp::{DataToggle, Irp, IrpId, Pid};
use crate::model::descriptor::{
    CLASS_HUB, DESC_CONFIGURATION, DESC_DEVICE, DESC_HUB, DESC_STRING, FEATURE_DEVICE_REMOTE_WAKEUP,
    FEATURE_ENDPOINT_HALT, InterfaceDescriptor, Recipient, RequestKind, REQ_CLEAR_FEATURE,
    REQ_GET_CONFIGURATION, REQ_GET_DESCRIPTOR, REQ_GET_INTERFACE, REQ_GET_STATUS, REQ_SET_ADDRESS,
    REQ_SET_CONFIGURATION, REQ_SET_DESCRIPTOR, REQ_SET_FEATURE, REQ_SET_INTERFACE, REQ_SYNCH_FRAME,
};
use crate::model::hub::{HubFeature, port_status_bytes, status_bitmap_len};
use crate::model::{
    BandwidthPool, ConfigDescriptor, DeviceDescriptor, Direction, EndpointDescriptor, HubDescriptor,
    PortChange, PortFeature, PortStatus, SetupPacket, TransferType, UsbSpeed, transfer_time_ns,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// SOF interval in bit times after reset.
pub const DEFAULT_SOF_INTERVAL: u16 = 12_000;
/// Adjustable SOF interval range.
pub const SOF_INTERVAL_RANGE: RangeInclusive<u16> = 11_900..=12_100;
/// Frames ahead an isochronous transfer may be scheduled.
pub const FRAME_WINDOW: u16 = 1024;

const WORKER_TICK: Duration = Duration::from_millis(5);
const HUB_STATUS_ENDPOINT: u8 = 0x81;
const HUB_LOCAL_POWER_CHANGE: u16 = 1 << 0;
const HUB_OVER_CURRENT_CHANGE: u16 = 1 << 1;

type DeviceKey = u32;

/// A device model that can be plugged into a port.
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub speed: UsbSpeed,
    pub descriptor: DeviceDescriptor,
    pub configs: Vec<ConfigDescriptor>,
    /// Downstream ports when the device is a hub.
    pub hub_ports: Option<u8>,
    pub strings: Vec<String>,
}

impl SimDeviceSpec {
    /// A self-powered full-speed hub with `ports` downstream ports.
    pub fn hub(ports: u8) -> Self {
        let status_len = status_bitmap_len(ports) as u16;
        Self {
            speed: UsbSpeed::Full,
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                class: CLASS_HUB,
                max_packet_size0: 64,
                vendor_id: 0x0451,
                product_id: 0x2046,
                device_version: 0x0100,
                num_configurations: 1,
                ..Default::default()
            },
            configs: vec![ConfigDescriptor {
                value: 1,
                attributes: 0xE0,
                max_power: 50,
                interfaces: vec![InterfaceDescriptor {
                    number: 0,
                    alternate: 0,
                    class: CLASS_HUB,
                    subclass: 0,
                    protocol: 0,
                    endpoints: vec![EndpointDescriptor::new(
                        HUB_STATUS_ENDPOINT,
                        TransferType::Interrupt,
                        status_len,
                        255,
                    )],
                }],
            }],
            hub_ports: Some(ports),
            strings: vec!["Virtual Hub".into()],
        }
    }

    fn root_hub(ports: u8, speed: UsbSpeed) -> Self {
        let mut spec = Self::hub(ports).with_speed(speed);
        spec.descriptor.vendor_id = 0x1d6b;
        spec.descriptor.product_id = match speed {
            UsbSpeed::High => 0x0002,
            _ => 0x0001,
        };
        spec.descriptor.max_packet_size0 = 64;
        spec.strings = vec!["Virtual Root Hub".into()];
        spec
    }

    /// A device declaring its class in the device descriptor, with one
    /// interface carrying a bulk IN/OUT endpoint pair.
    pub fn device(vendor_id: u16, product_id: u16, class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            speed: UsbSpeed::Full,
            descriptor: DeviceDescriptor {
                usb_version: 0x0200,
                class,
                subclass,
                protocol,
                max_packet_size0: 64,
                vendor_id,
                product_id,
                device_version: 0x0100,
                num_configurations: 1,
                ..Default::default()
            },
            configs: vec![ConfigDescriptor {
                value: 1,
                attributes: 0x80,
                max_power: 50,
                interfaces: vec![InterfaceDescriptor {
                    number: 0,
                    alternate: 0,
                    class,
                    subclass,
                    protocol,
                    endpoints: vec![
                        EndpointDescriptor::new(0x81, TransferType::Bulk, 64, 0),
                        EndpointDescriptor::new(0x02, TransferType::Bulk, 64, 0),
                    ],
                }],
            }],
            hub_ports: None,
            strings: Vec::new(),
        }
    }

    /// A device that declares classes per interface (device class 0), in one
    /// configuration with value 1.
    pub fn composite(vendor_id: u16, product_id: u16, interfaces: Vec<InterfaceDescriptor>) -> Self {
        let mut spec = Self::device(vendor_id, product_id, 0, 0, 0);
        spec.configs[0].interfaces = interfaces;
        spec
    }

    /// Change the signalling speed. Low-speed devices get an 8-byte control endpoint.
    pub fn with_speed(mut self, speed: UsbSpeed) -> Self {
        self.speed = speed;
        if speed == UsbSpeed::Low {
            self.descriptor.max_packet_size0 = 8;
        }
        self
    }

    /// Append another configuration.
    pub fn with_config(mut self, config: ConfigDescriptor) -> Self {
        self.configs.push(config);
        self.descriptor.num_configurations = self.configs.len() as u8;
        self
    }

    pub fn with_strings(mut self, strings: Vec<String>) -> Self {
        self.strings = strings;
        self
    }
}

/// One bus of the simulated controller.
#[derive(Debug, Clone)]
pub struct SimBusSpec {
    pub speed: UsbSpeed,
    pub root_ports: u8,
    /// Periodic budget per frame; the speed's default when `None`.
    pub periodic_budget_ns: Option<u32>,
    /// Periodic time already claimed by traffic outside this host.
    pub reserved_ns: u32,
}

impl SimBusSpec {
    pub fn new(speed: UsbSpeed, root_ports: u8) -> Self {
        Self {
            speed,
            root_ports,
            periodic_budget_ns: None,
            reserved_ns: 0,
        }
    }

    pub fn with_periodic_budget(mut self, ns: u32) -> Self {
        self.periodic_budget_ns = Some(ns);
        self
    }

    pub fn with_reserved(mut self, ns: u32) -> Self {
        self.reserved_ns = ns;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SimPort {
    status: PortStatus,
    change: PortChange,
    device: Option<DeviceKey>,
}

struct SimDevice {
    spec: SimDeviceSpec,
    bus: u16,
    upstream: Option<(DeviceKey, u8)>,
    address: u8,
    configuration: u8,
    alternates: HashMap<u8, u8>,
    halted: HashSet<u8>,
    remote_wakeup: bool,
    scratch: Vec<u8>,
    extra_descriptors: HashMap<u16, Vec<u8>>,
    in_data: HashMap<u8, VecDeque<Vec<u8>>>,
    out_data: HashMap<u8, Vec<Vec<u8>>>,
    ports: Vec<SimPort>,
    hub_change: u16,
    control_in_flight: usize,
    max_control_in_flight: usize,
    control_log: Vec<SetupPacket>,
}

impl SimDevice {
    fn new(spec: SimDeviceSpec, bus: u16, upstream: Option<(DeviceKey, u8)>) -> Self {
        let ports = vec![SimPort::default(); spec.hub_ports.unwrap_or(0) as usize];
        Self {
            spec,
            bus,
            upstream,
            address: 0,
            configuration: 0,
            alternates: HashMap::new(),
            halted: HashSet::new(),
            remote_wakeup: false,
            scratch: Vec::new(),
            extra_descriptors: HashMap::new(),
            in_data: HashMap::new(),
            out_data: HashMap::new(),
            ports,
            hub_change: 0,
            control_in_flight: 0,
            max_control_in_flight: 0,
            control_log: Vec::new(),
        }
    }

    fn is_hub(&self) -> bool {
        self.spec.hub_ports.is_some()
    }

    fn active_config(&self) -> Option<&ConfigDescriptor> {
        self.spec.configs.iter().find(|c| c.value == self.configuration)
    }

    fn self_powered(&self) -> bool {
        self.active_config()
            .or(self.spec.configs.first())
            .is_some_and(|c| c.is_self_powered())
    }

    /// Back to the default state after a bus reset.
    fn reset(&mut self) {
        self.address = 0;
        self.configuration = 0;
        self.alternates.clear();
        self.halted.clear();
        self.remote_wakeup = false;
    }

    fn status_bitmap(&self) -> Option<Vec<u8>> {
        let ports = self.ports.len() as u8;
        let mut bitmap = vec![0u8; status_bitmap_len(ports)];
        if self.hub_change != 0 {
            bitmap[0] |= 1;
        }
        for (i, port) in self.ports.iter().enumerate() {
            let n = i + 1;
            if !port.change.is_empty() {
                bitmap[n / 8] |= 1 << (n % 8);
            }
        }
        bitmap.iter().any(|b| *b != 0).then_some(bitmap)
    }
}

#[derive(Debug, Clone, Copy)]
struct SimPipe {
    bus: u16,
    address: u8,
    endpoint: u8,
    transfer_type: TransferType,
    direction: Direction,
    max_packet_size: u16,
    reserved_ns: u32,
}

struct SimBus {
    speed: UsbSpeed,
    root: DeviceKey,
    bandwidth: BandwidthPool,
    base_reserved_ns: u32,
    sof_interval: u16,
    suspended: bool,
}

struct Parked {
    pipe: u64,
    irp: Irp,
    deadline: Option<Instant>,
}

enum Job {
    Complete {
        irp: Irp,
        control: Option<DeviceKey>,
        delay: Duration,
    },
    Event {
        bus: u16,
        event: MgmtEvent,
    },
    Stop,
}

struct SimState {
    buses: Vec<SimBus>,
    devices: HashMap<DeviceKey, SimDevice>,
    next_device: DeviceKey,
    pipes: HashMap<u64, SimPipe>,
    next_pipe: u64,
    parked: Vec<Parked>,
    attached: bool,
    events: Option<HcdEventSink>,
    control_latency: Duration,
    started: Instant,
    jobs: Sender<Job>,
}

struct Inner {
    state: Mutex<SimState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.state.get_mut().jobs.send(Job::Stop);
    }
}

/// Virtual host controller.
pub struct SimHcd {
    inner: Arc<Inner>,
}

impl SimHcd {
    pub fn new(buses: Vec<SimBusSpec>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = SimState {
            buses: Vec::new(),
            devices: HashMap::new(),
            next_device: 1,
            pipes: HashMap::new(),
            next_pipe: 1,
            parked: Vec::new(),
            attached: false,
            events: None,
            control_latency: Duration::ZERO,
            started: Instant::now(),
            jobs: tx,
        };

        for (index, spec) in buses.into_iter().enumerate() {
            let root = state.add_device(
                SimDeviceSpec::root_hub(spec.root_ports, spec.speed),
                index as u16,
                None,
            );
            let budget = spec
                .periodic_budget_ns
                .unwrap_or_else(|| spec.speed.max_periodic_ns());
            let mut bandwidth = BandwidthPool::with_budget(spec.speed, budget);
            bandwidth.add_usage(spec.reserved_ns);
            state.buses.push(SimBus {
                speed: spec.speed,
                root,
                bandwidth,
                base_reserved_ns: spec.reserved_ns,
                sof_interval: DEFAULT_SOF_INTERVAL,
                suspended: false,
            });
        }

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
        });
        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("sim-hcd".into())
            .spawn(move || run_worker(weak, rx))
            .ok();

        Self { inner }
    }

    /// One bus with a root hub of `ports` ports.
    pub fn single_bus(speed: UsbSpeed, ports: u8) -> Self {
        Self::new(vec![SimBusSpec::new(speed, ports)])
    }

    /// Plug a device into the port at `path` (ports from the root hub down;
    /// the last entry is the port the device goes into).
    pub fn plug(&self, bus: u16, path: &[u8], spec: SimDeviceSpec) -> Result<()> {
        let mut state = self.inner.state.lock();
        let (hub, port) = state.port_at(bus, path)?;
        if state.port(hub, port).device.is_some() {
            return Err(UsbdError::BadParam("port already occupied"));
        }
        debug!(bus, ?path, vid_pid = %spec.descriptor.vid_pid(), "sim: plug");
        let speed = spec.speed;
        let key = state.add_device(spec, bus, Some((hub, port)));
        let p = state.port_mut(hub, port)?;
        p.device = Some(key);
        if p.status.contains(PortStatus::POWER) {
            p.status.insert(PortStatus::CONNECTION);
            p.status.set(PortStatus::LOW_SPEED, speed == UsbSpeed::Low);
            p.status.set(PortStatus::HIGH_SPEED, speed == UsbSpeed::High);
            p.change.insert(PortChange::CONNECTION);
        }
        state.service_parked();
        Ok(())
    }

    /// Remove whatever is plugged into the port at `path`, with its subtree.
    pub fn unplug(&self, bus: u16, path: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        let (hub, port) = state.port_at(bus, path)?;
        let Some(key) = state.port(hub, port).device else {
            return Err(UsbdError::BadParam("port is empty"));
        };
        debug!(bus, ?path, "sim: unplug");
        state.remove_subtree(key);
        let p = state.port_mut(hub, port)?;
        p.device = None;
        let was_connected = p.status.contains(PortStatus::CONNECTION);
        p.status.remove(
            PortStatus::CONNECTION
                | PortStatus::ENABLE
                | PortStatus::SUSPEND
                | PortStatus::LOW_SPEED
                | PortStatus::HIGH_SPEED,
        );
        if was_connected {
            p.change.insert(PortChange::CONNECTION);
        }
        state.service_parked();
        Ok(())
    }

    /// Raise an over-current condition on the port at `path`.
    pub fn over_current(&self, bus: u16, path: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        let (hub, port) = state.port_at(bus, path)?;
        let p = state.port_mut(hub, port)?;
        p.status.insert(PortStatus::OVER_CURRENT);
        p.change.insert(PortChange::OVER_CURRENT);
        state.service_parked();
        Ok(())
    }

    /// A device on `bus` signals remote wakeup.
    pub fn remote_wakeup(&self, bus: u16) -> Result<()> {
        let mut state = self.inner.state.lock();
        let sim_bus = state
            .buses
            .get_mut(bus as usize)
            .ok_or(UsbdError::BadParam("no such bus"))?;
        sim_bus.suspended = false;
        let _ = state.jobs.send(Job::Event {
            bus,
            event: MgmtEvent::RemoteWakeup,
        });
        Ok(())
    }

    /// Queue data the device at `path` will return on IN `endpoint`.
    pub fn push_in_data(&self, bus: u16, path: &[u8], endpoint: u8, data: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let key = state.device_at(bus, path)?;
        if let Some(dev) = state.devices.get_mut(&key) {
            dev.in_data.entry(endpoint).or_default().push_back(data);
        }
        state.service_parked();
        Ok(())
    }

    /// Drain what the device at `path` received on OUT `endpoint`.
    pub fn take_out_data(&self, bus: u16, path: &[u8], endpoint: u8) -> Vec<Vec<u8>> {
        let mut state = self.inner.state.lock();
        state
            .device_at(bus, path)
            .ok()
            .and_then(|key| state.devices.get_mut(&key))
            .and_then(|dev| dev.out_data.remove(&endpoint))
            .unwrap_or_default()
    }

    /// Largest number of control transfers the device at `path` ever had in flight.
    pub fn max_control_concurrency(&self, bus: u16, path: &[u8]) -> usize {
        self.with_device(bus, path, |dev| dev.max_control_in_flight)
            .unwrap_or(0)
    }

    /// Setup packets the device at `path` received, in order.
    pub fn control_log(&self, bus: u16, path: &[u8]) -> Vec<SetupPacket> {
        self.with_device(bus, path, |dev| dev.control_log.clone())
            .unwrap_or_default()
    }

    /// Bus address of the device at `path`, 0 while unaddressed.
    pub fn device_address(&self, bus: u16, path: &[u8]) -> Option<u8> {
        self.with_device(bus, path, |dev| dev.address)
    }

    /// Whether the device at `path` has `endpoint` halted.
    pub fn is_halted(&self, bus: u16, path: &[u8], endpoint: u8) -> bool {
        self.with_device(bus, path, |dev| dev.halted.contains(&endpoint))
            .unwrap_or(false)
    }

    /// Delay every control completion, widening race windows in tests.
    pub fn set_control_latency(&self, latency: Duration) {
        self.inner.state.lock().control_latency = latency;
    }

    /// Periodic time reserved on `bus`, including the pre-claimed share.
    pub fn reserved_ns(&self, bus: u16) -> u32 {
        let state = self.inner.state.lock();
        state
            .buses
            .get(bus as usize)
            .map(|b| b.bandwidth.used_periodic_ns)
            .unwrap_or(0)
    }

    pub fn is_suspended(&self, bus: u16) -> bool {
        let state = self.inner.state.lock();
        state.buses.get(bus as usize).is_some_and(|b| b.suspended)
    }

    /// IRPs waiting for data or a status change.
    pub fn parked_count(&self) -> usize {
        self.inner.state.lock().parked.len()
    }

    /// Open pipes.
    pub fn pipe_count(&self) -> usize {
        self.inner.state.lock().pipes.len()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().attached
    }

    fn with_device<R>(&self, bus: u16, path: &[u8], f: impl FnOnce(&SimDevice) -> R) -> Option<R> {
        let state = self.inner.state.lock();
        let key = state.device_at(bus, path).ok()?;
        state.devices.get(&key).map(f)
    }
}

impl HostController for SimHcd {
    fn execute(&self, request: HcdRequest) -> Result<HcdReply> {
        let mut state = self.inner.state.lock();
        trace!(code = request.code(), request = request.name(), "sim: execute");

        if !state.attached && !matches!(request, HcdRequest::Attach { .. }) {
            if let HcdRequest::IrpSubmit { irp, .. } = request {
                return state.reject(irp, UsbdError::NotInitialized);
            }
            return Err(UsbdError::NotInitialized);
        }

        match request {
            HcdRequest::Attach { events } => {
                if state.attached {
                    return Err(UsbdError::General("host controller already attached".into()));
                }
                state.attached = true;
                state.events = Some(events);
                Ok(HcdReply::Attached {
                    buses: state.buses.iter().map(|b| b.speed).collect(),
                })
            }
            HcdRequest::Detach => {
                state.detach();
                Ok(HcdReply::Done)
            }
            HcdRequest::SetBusState { bus, state: wanted } => {
                let sim_bus = state.bus_mut(bus)?;
                sim_bus.suspended = wanted == BusState::Suspend;
                Ok(HcdReply::Done)
            }
            HcdRequest::CurrentFrame { bus } => {
                state.bus_mut(bus)?;
                Ok(HcdReply::Frame {
                    current: state.frame(),
                    window: FRAME_WINDOW,
                })
            }
            HcdRequest::GetSofInterval { bus } => {
                Ok(HcdReply::SofInterval(state.bus_mut(bus)?.sof_interval))
            }
            HcdRequest::SetSofInterval { bus, interval } => {
                let sim_bus = state.bus_mut(bus)?;
                if !SOF_INTERVAL_RANGE.contains(&interval) {
                    return Err(HcdFault::SofInterval.into());
                }
                sim_bus.sof_interval = interval;
                Ok(HcdReply::Done)
            }
            HcdRequest::PipeCreate(spec) => state.pipe_create(spec),
            HcdRequest::PipeDestroy { pipe } => {
                state.pipe_destroy(pipe)?;
                Ok(HcdReply::Done)
            }
            HcdRequest::PipeModify {
                pipe,
                address,
                max_packet_size,
            } => {
                let p = state.pipes.get_mut(&pipe.0).ok_or(UsbdError::BadHandle)?;
                p.address = address;
                p.max_packet_size = max_packet_size;
                Ok(HcdReply::Done)
            }
            HcdRequest::IrpSubmit { pipe, irp, toggle } => {
                state.submit(pipe, irp, toggle)?;
                Ok(HcdReply::Done)
            }
            HcdRequest::IrpCancel { pipe, irp } => {
                state.cancel(pipe, irp)?;
                Ok(HcdReply::Done)
            }
        }
    }
}

impl SimState {
    fn add_device(&mut self, spec: SimDeviceSpec, bus: u16, upstream: Option<(DeviceKey, u8)>) -> DeviceKey {
        let key = self.next_device;
        self.next_device += 1;
        self.devices.insert(key, SimDevice::new(spec, bus, upstream));
        key
    }

    fn remove_subtree(&mut self, key: DeviceKey) {
        if let Some(dev) = self.devices.remove(&key) {
            for child in dev.ports.iter().filter_map(|p| p.device) {
                self.remove_subtree(child);
            }
        }
    }

    fn bus_mut(&mut self, bus: u16) -> Result<&mut SimBus> {
        self.buses
            .get_mut(bus as usize)
            .ok_or(UsbdError::BadParam("no such bus"))
    }

    fn frame(&self) -> u16 {
        (self.started.elapsed().as_millis() & 0x7ff) as u16
    }

    fn device_at(&self, bus: u16, path: &[u8]) -> Result<DeviceKey> {
        let mut key = self
            .buses
            .get(bus as usize)
            .ok_or(UsbdError::BadParam("no such bus"))?
            .root;
        for &port in path {
            key = self
                .devices
                .get(&key)
                .and_then(|dev| dev.ports.get((port as usize).wrapping_sub(1)))
                .and_then(|p| p.device)
                .ok_or(UsbdError::BadParam("no device at path"))?;
        }
        Ok(key)
    }

    fn port_at(&self, bus: u16, path: &[u8]) -> Result<(DeviceKey, u8)> {
        let (&port, upstream) = path
            .split_last()
            .ok_or(UsbdError::BadParam("empty port path"))?;
        let hub = self.device_at(bus, upstream)?;
        let ports = self.devices.get(&hub).map(|d| d.ports.len()).unwrap_or(0);
        if port == 0 || port as usize > ports {
            return Err(UsbdError::BadParam("no such port"));
        }
        Ok((hub, port))
    }

    fn port(&self, hub: DeviceKey, port: u8) -> SimPort {
        self.devices
            .get(&hub)
            .and_then(|d| d.ports.get((port as usize).wrapping_sub(1)))
            .copied()
            .unwrap_or_default()
    }

    fn port_mut(&mut self, hub: DeviceKey, port: u8) -> Result<&mut SimPort> {
        self.devices
            .get_mut(&hub)
            .and_then(|d| d.ports.get_mut((port as usize).wrapping_sub(1)))
            .ok_or(UsbdError::BadParam("no such port"))
    }

    /// Whether the device can currently see bus traffic.
    fn reachable(&self, key: DeviceKey) -> bool {
        let Some(dev) = self.devices.get(&key) else {
            return false;
        };
        match dev.upstream {
            None => true,
            Some((hub, port)) => {
                let p = self.port(hub, port);
                p.device == Some(key)
                    && p.status.contains(PortStatus::ENABLE)
                    && !p.status.contains(PortStatus::SUSPEND)
                    && self.reachable(hub)
            }
        }
    }

    fn find_device(&self, bus: u16, address: u8) -> Option<DeviceKey> {
        self.devices
            .iter()
            .filter(|(_, d)| d.bus == bus && d.address == address)
            .map(|(k, _)| *k)
            .filter(|k| self.reachable(*k))
            .min()
    }

    fn finish(&self, irp: Irp, control: Option<DeviceKey>) {
        let delay = if control.is_some() {
            self.control_latency
        } else {
            Duration::ZERO
        };
        let _ = self.jobs.send(Job::Complete {
            irp,
            control,
            delay,
        });
    }

    fn reject(&self, mut irp: Irp, err: UsbdError) -> Result<HcdReply> {
        irp.set_result(Err(err.clone()));
        self.finish(irp, None);
        Err(err)
    }

    fn detach(&mut self) {
        self.attached = false;
        self.events = None;
        for parked in std::mem::take(&mut self.parked) {
            let mut irp = parked.irp;
            irp.set_result(Err(UsbdError::Canceled));
            self.finish(irp, None);
        }
        self.pipes.clear();
        for bus in &mut self.buses {
            bus.bandwidth.used_periodic_ns = bus.base_reserved_ns;
        }
    }

    fn pipe_create(&mut self, spec: HcdPipeSpec) -> Result<HcdReply> {
        let bus = self.bus_mut(spec.bus)?;
        let periodic = spec.transfer_type.reserves_bandwidth();
        let bytes = if periodic {
            spec.bandwidth
        } else {
            u32::from(spec.max_packet_size)
        };
        let time_ns = transfer_time_ns(spec.speed, spec.transfer_type, spec.direction, bytes);
        if periodic {
            bus.bandwidth.try_reserve(time_ns)?;
        }

        let id = self.next_pipe;
        self.next_pipe += 1;
        self.pipes.insert(
            id,
            SimPipe {
                bus: spec.bus,
                address: spec.address,
                endpoint: spec.endpoint,
                transfer_type: spec.transfer_type,
                direction: spec.direction,
                max_packet_size: spec.max_packet_size,
                reserved_ns: if periodic { time_ns } else { 0 },
            },
        );
        Ok(HcdReply::PipeCreated {
            pipe: HcdPipe(id),
            time_ns,
        })
    }

    fn pipe_destroy(&mut self, pipe: HcdPipe) -> Result<()> {
        let p = self.pipes.remove(&pipe.0).ok_or(UsbdError::BadHandle)?;
        if let Some(bus) = self.buses.get_mut(p.bus as usize) {
            bus.bandwidth.release(p.reserved_ns);
        }
        let (orphans, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|parked| parked.pipe == pipe.0);
        self.parked = keep;
        for parked in orphans {
            let mut irp = parked.irp;
            irp.set_result(Err(UsbdError::Canceled));
            self.finish(irp, None);
        }
        Ok(())
    }

    fn cancel(&mut self, pipe: HcdPipe, id: IrpId) -> Result<()> {
        let pos = self
            .parked
            .iter()
            .position(|p| p.pipe == pipe.0 && p.irp.id() == Some(id))
            .ok_or(UsbdError::CannotCancel)?;
        let mut irp = self.parked.remove(pos).irp;
        irp.set_result(Err(UsbdError::Canceled));
        self.finish(irp, None);
        Ok(())
    }

    fn submit(&mut self, pipe: HcdPipe, irp: Irp, _toggle: DataToggle) -> Result<HcdReply> {
        let Some(p) = self.pipes.get(&pipe.0).copied() else {
            return self.reject(irp, UsbdError::BadHandle);
        };
        if irp.segments.is_empty() {
            return self.reject(irp, UsbdError::BadParam("IRP has no segments"));
        }
        match p.transfer_type {
            TransferType::Control => self.control(p, irp),
            _ => self.data(pipe.0, p, irp),
        }
    }

    fn control(&mut self, pipe: SimPipe, mut irp: Irp) -> Result<HcdReply> {
        let setup = irp
            .segments
            .first()
            .filter(|s| s.pid == Pid::Setup)
            .and_then(|s| SetupPacket::parse(&s.data));
        let Some(setup) = setup else {
            return self.reject(irp, UsbdError::BadParam("control transfer without setup stage"));
        };

        let Some(key) = self.find_device(pipe.bus, pipe.address) else {
            irp.set_result(Err(HcdFault::CrcTimeout.into()));
            self.finish(irp, None);
            return Ok(HcdReply::Done);
        };

        if let Some(dev) = self.devices.get_mut(&key) {
            dev.control_in_flight += 1;
            dev.max_control_in_flight = dev.max_control_in_flight.max(dev.control_in_flight);
            dev.control_log.push(setup);
        }

        let out: Vec<u8> = irp
            .segments
            .iter()
            .skip(1)
            .filter(|s| s.pid == Pid::Out)
            .flat_map(|s| s.data.iter().copied())
            .collect();

        match self.handle_request(key, &setup, &out) {
            Ok(reply) => {
                for seg in irp.segments.iter_mut().skip(1) {
                    match seg.pid {
                        Pid::In => {
                            let n = reply.len().min(seg.data.len());
                            seg.data[..n].copy_from_slice(&reply[..n]);
                            seg.actual = n;
                        }
                        Pid::Out => seg.actual = seg.data.len(),
                        Pid::Setup => {}
                    }
                }
                irp.set_result(Ok(()));
            }
            Err(fault) => {
                trace!(?setup, %fault, "sim: control request failed");
                irp.set_result(Err(fault.into()));
            }
        }

        self.finish(irp, Some(key));
        self.service_parked();
        Ok(HcdReply::Done)
    }

    fn handle_request(&mut self, key: DeviceKey, setup: &SetupPacket, out: &[u8]) -> Result<Vec<u8>, HcdFault> {
        let is_hub = self.devices.get(&key).is_some_and(|d| d.is_hub());
        match (setup.kind(), setup.recipient()) {
            (Some(RequestKind::Standard), _) => self.standard_request(key, setup, out),
            (Some(RequestKind::Class), Some(Recipient::Device | Recipient::Other)) if is_hub => {
                self.hub_request(key, setup)
            }
            (Some(RequestKind::Vendor), _) => {
                let dev = self.devices.get_mut(&key).ok_or(HcdFault::CrcTimeout)?;
                if setup.direction() == Direction::In {
                    Ok(truncate(dev.scratch.clone(), setup.length))
                } else {
                    dev.scratch = out.to_vec();
                    Ok(Vec::new())
                }
            }
            _ => Err(HcdFault::Stall),
        }
    }

    fn standard_request(&mut self, key: DeviceKey, setup: &SetupPacket, out: &[u8]) -> Result<Vec<u8>, HcdFault> {
        let frame = self.frame();
        let dev = self.devices.get_mut(&key).ok_or(HcdFault::CrcTimeout)?;
        let recipient = setup.recipient();

        match setup.request {
            REQ_GET_DESCRIPTOR => {
                let (ty, index) = ((setup.value >> 8) as u8, setup.value as u8);
                let bytes = match ty {
                    DESC_DEVICE => dev.spec.descriptor.to_bytes().to_vec(),
                    DESC_CONFIGURATION => dev
                        .spec
                        .configs
                        .get(index as usize)
                        .map(|c| c.to_bytes())
                        .ok_or(HcdFault::Stall)?,
                    DESC_STRING => string_descriptor(&dev.spec.strings, index).ok_or(HcdFault::Stall)?,
                    _ => dev
                        .extra_descriptors
                        .get(&setup.value)
                        .cloned()
                        .ok_or(HcdFault::Stall)?,
                };
                Ok(truncate(bytes, setup.length))
            }
            REQ_SET_DESCRIPTOR => {
                dev.extra_descriptors.insert(setup.value, out.to_vec());
                Ok(Vec::new())
            }
            REQ_SET_ADDRESS => {
                if setup.value > 127 {
                    return Err(HcdFault::Stall);
                }
                dev.address = setup.value as u8;
                Ok(Vec::new())
            }
            REQ_GET_CONFIGURATION => Ok(vec![dev.configuration]),
            REQ_SET_CONFIGURATION => {
                let value = setup.value as u8;
                if value != 0 && !dev.spec.configs.iter().any(|c| c.value == value) {
                    return Err(HcdFault::Stall);
                }
                dev.configuration = value;
                dev.alternates.clear();
                dev.halted.clear();
                Ok(Vec::new())
            }
            REQ_GET_INTERFACE => {
                let iface = setup.index as u8;
                let known = dev
                    .active_config()
                    .is_some_and(|c| c.interfaces.iter().any(|i| i.number == iface));
                if !known {
                    return Err(HcdFault::Stall);
                }
                Ok(vec![dev.alternates.get(&iface).copied().unwrap_or(0)])
            }
            REQ_SET_INTERFACE => {
                let (iface, alt) = (setup.index as u8, setup.value as u8);
                let known = dev.active_config().is_some_and(|c| {
                    c.interfaces
                        .iter()
                        .any(|i| i.number == iface && i.alternate == alt)
                });
                if !known {
                    return Err(HcdFault::Stall);
                }
                dev.alternates.insert(iface, alt);
                Ok(Vec::new())
            }
            REQ_GET_STATUS => match recipient {
                Some(Recipient::Device) => {
                    let bits = u8::from(dev.self_powered()) | (u8::from(dev.remote_wakeup) << 1);
                    Ok(vec![bits, 0])
                }
                Some(Recipient::Interface) => Ok(vec![0, 0]),
                Some(Recipient::Endpoint) => {
                    Ok(vec![u8::from(dev.halted.contains(&(setup.index as u8))), 0])
                }
                _ => Err(HcdFault::Stall),
            },
            REQ_SET_FEATURE | REQ_CLEAR_FEATURE => {
                let set = setup.request == REQ_SET_FEATURE;
                match (recipient, setup.value) {
                    (Some(Recipient::Device), FEATURE_DEVICE_REMOTE_WAKEUP) => {
                        dev.remote_wakeup = set;
                    }
                    (Some(Recipient::Endpoint), FEATURE_ENDPOINT_HALT) => {
                        let ep = setup.index as u8;
                        if set {
                            dev.halted.insert(ep);
                        } else {
                            dev.halted.remove(&ep);
                        }
                    }
                    _ => return Err(HcdFault::Stall),
                }
                Ok(Vec::new())
            }
            REQ_SYNCH_FRAME => Ok(frame.to_le_bytes().to_vec()),
            _ => Err(HcdFault::Stall),
        }
    }

    fn hub_request(&mut self, key: DeviceKey, setup: &SetupPacket) -> Result<Vec<u8>, HcdFault> {
        let dev = self.devices.get_mut(&key).ok_or(HcdFault::CrcTimeout)?;
        let ports = dev.ports.len() as u8;

        if setup.recipient() == Some(Recipient::Device) {
            return match setup.request {
                REQ_GET_DESCRIPTOR if (setup.value >> 8) as u8 == DESC_HUB => {
                    let desc = HubDescriptor {
                        ports,
                        characteristics: 0x0009,
                        power_on_good: 1,
                        controller_current: 100,
                    };
                    Ok(truncate(desc.to_bytes(), setup.length))
                }
                REQ_GET_STATUS => {
                    let change = dev.hub_change.to_le_bytes();
                    Ok(vec![0, 0, change[0], change[1]])
                }
                REQ_CLEAR_FEATURE => {
                    match setup.value {
                        v if v == HubFeature::CHubLocalPower as u16 => {
                            dev.hub_change &= !HUB_LOCAL_POWER_CHANGE
                        }
                        v if v == HubFeature::CHubOverCurrent as u16 => {
                            dev.hub_change &= !HUB_OVER_CURRENT_CHANGE
                        }
                        _ => return Err(HcdFault::Stall),
                    }
                    Ok(Vec::new())
                }
                _ => Err(HcdFault::Stall),
            };
        }

        let port = setup.index as u8;
        if port == 0 || port > ports {
            return Err(HcdFault::Stall);
        }
        let slot = port as usize - 1;

        match setup.request {
            REQ_GET_STATUS => {
                let p = dev.ports[slot];
                Ok(port_status_bytes(p.status, p.change).to_vec())
            }
            REQ_SET_FEATURE => {
                let feature = PortFeature::from_selector(setup.value).ok_or(HcdFault::Stall)?;
                let p = &mut dev.ports[slot];
                let mut reset_child = None;
                match feature {
                    PortFeature::PortPower => {
                        p.status.insert(PortStatus::POWER);
                        if p.device.is_some() && !p.status.contains(PortStatus::CONNECTION) {
                            p.status.insert(PortStatus::CONNECTION);
                            p.change.insert(PortChange::CONNECTION);
                        }
                    }
                    PortFeature::PortReset => {
                        if p.status.contains(PortStatus::CONNECTION) {
                            p.status.insert(PortStatus::ENABLE);
                            p.status.remove(PortStatus::SUSPEND | PortStatus::RESET);
                            p.change.insert(PortChange::RESET);
                            reset_child = p.device;
                        }
                    }
                    PortFeature::PortSuspend => p.status.insert(PortStatus::SUSPEND),
                    PortFeature::PortTest | PortFeature::PortIndicator => {}
                    _ => return Err(HcdFault::Stall),
                }
                if let Some(child) = reset_child {
                    let speed = self.devices.get_mut(&child).map(|c| {
                        c.reset();
                        c.spec.speed
                    });
                    if let Some(speed) = speed
                        && let Some(hub) = self.devices.get_mut(&key)
                    {
                        let p = &mut hub.ports[slot];
                        p.status.set(PortStatus::LOW_SPEED, speed == UsbSpeed::Low);
                        p.status.set(PortStatus::HIGH_SPEED, speed == UsbSpeed::High);
                    }
                }
                Ok(Vec::new())
            }
            REQ_CLEAR_FEATURE => {
                let feature = PortFeature::from_selector(setup.value).ok_or(HcdFault::Stall)?;
                let p = &mut dev.ports[slot];
                match feature {
                    PortFeature::PortEnable => p.status.remove(PortStatus::ENABLE),
                    PortFeature::PortSuspend => {
                        if p.status.contains(PortStatus::SUSPEND) {
                            p.status.remove(PortStatus::SUSPEND);
                            p.change.insert(PortChange::SUSPEND);
                        }
                    }
                    PortFeature::PortPower => p.status = PortStatus::empty(),
                    PortFeature::CPortConnection => p.change.remove(PortChange::CONNECTION),
                    PortFeature::CPortEnable => p.change.remove(PortChange::ENABLE),
                    PortFeature::CPortSuspend => p.change.remove(PortChange::SUSPEND),
                    PortFeature::CPortOverCurrent => {
                        p.change.remove(PortChange::OVER_CURRENT);
                        p.status.remove(PortStatus::OVER_CURRENT);
                    }
                    PortFeature::CPortReset => p.change.remove(PortChange::RESET),
                    PortFeature::PortIndicator => {}
                    _ => return Err(HcdFault::Stall),
                }
                Ok(Vec::new())
            }
            _ => Err(HcdFault::Stall),
        }
    }

    fn data(&mut self, pipe_id: u64, pipe: SimPipe, mut irp: Irp) -> Result<HcdReply> {
        let Some(key) = self.find_device(pipe.bus, pipe.address) else {
            irp.set_result(Err(HcdFault::CrcTimeout.into()));
            self.finish(irp, None);
            return Ok(HcdReply::Done);
        };

        let halted = self
            .devices
            .get(&key)
            .is_some_and(|d| d.halted.contains(&pipe.endpoint));
        if halted {
            irp.set_result(Err(HcdFault::Stall.into()));
            self.finish(irp, None);
            return Ok(HcdReply::Done);
        }

        if pipe.direction == Direction::Out {
            if let Some(dev) = self.devices.get_mut(&key) {
                let sink = dev.out_data.entry(pipe.endpoint).or_default();
                for seg in irp.segments.iter_mut().filter(|s| s.pid == Pid::Out) {
                    seg.actual = seg.data.len();
                    sink.push(seg.data.clone());
                }
            }
            irp.set_result(Ok(()));
            self.finish(irp, None);
            return Ok(HcdReply::Done);
        }

        let deadline = irp.timeout.map(|t| Instant::now() + t);
        match self.fill_in(key, &pipe, irp) {
            Ok(irp) => self.finish(irp, None),
            Err(irp) => self.parked.push(Parked {
                pipe: pipe_id,
                irp,
                deadline,
            }),
        }
        Ok(HcdReply::Done)
    }

    /// Complete an IN transfer if the device has something to return.
    fn fill_in(&mut self, key: DeviceKey, pipe: &SimPipe, mut irp: Irp) -> Result<Irp, Irp> {
        let Some(dev) = self.devices.get_mut(&key) else {
            return Err(irp);
        };
        let data = if dev.is_hub() && pipe.endpoint == HUB_STATUS_ENDPOINT {
            dev.status_bitmap()
        } else {
            dev.in_data.get_mut(&pipe.endpoint).and_then(|q| q.pop_front())
        };
        let Some(data) = data else {
            return Err(irp);
        };

        if let Some(seg) = irp.segments.iter_mut().find(|s| s.pid == Pid::In) {
            let n = data.len().min(seg.data.len());
            seg.data[..n].copy_from_slice(&data[..n]);
            seg.actual = n;
        }
        irp.set_result(Ok(()));
        Ok(irp)
    }

    /// Retry every parked IN transfer.
    fn service_parked(&mut self) {
        for parked in std::mem::take(&mut self.parked) {
            let pipe = self.pipes.get(&parked.pipe).copied();
            let key = pipe.and_then(|p| self.find_device(p.bus, p.address));
            match (pipe, key) {
                (Some(pipe), Some(key)) => match self.fill_in(key, &pipe, parked.irp) {
                    Ok(irp) => self.finish(irp, None),
                    Err(irp) => self.parked.push(Parked { irp, ..parked }),
                },
                _ => self.parked.push(parked),
            }
        }
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Irp> {
        let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.parked)
            .into_iter()
            .partition(|p| p.deadline.is_some_and(|d| d <= now));
        self.parked = keep;
        expired
            .into_iter()
            .map(|p| {
                let mut irp = p.irp;
                irp.set_result(Err(UsbdError::Timeout));
                irp
            })
            .collect()
    }

    fn control_finished(&mut self, key: DeviceKey) {
        if let Some(dev) = self.devices.get_mut(&key) {
            dev.control_in_flight = dev.control_in_flight.saturating_sub(1);
        }
    }
}

fn truncate(mut bytes: Vec<u8>, length: u16) -> Vec<u8> {
    bytes.truncate(length as usize);
    bytes
}

fn string_descriptor(strings: &[String], index: u8) -> Option<Vec<u8>> {
    if index == 0 {
        // LANGID table: US English
        return Some(vec![4, DESC_STRING, 0x09, 0x04]);
    }
    let s = strings.get(index as usize - 1)?;
    let mut out = vec![0, DESC_STRING];
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    Some(out)
}

fn run_worker(inner: Weak<Inner>, rx: Receiver<Job>) {
    loop {
        match rx.recv_timeout(WORKER_TICK) {
            Ok(Job::Complete {
                irp,
                control,
                delay,
            }) => {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if let Some(key) = control
                    && let Some(inner) = inner.upgrade()
                {
                    inner.state.lock().control_finished(key);
                }
                irp.complete();
            }
            Ok(Job::Event { bus, event }) => {
                let sink = inner.upgrade().and_then(|i| i.state.lock().events.clone());
                if let Some(sink) = sink {
                    sink(bus, event);
                }
            }
            Ok(Job::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let expired = inner.state.lock().take_expired(Instant::now());
        drop(inner);
        for irp in expired {
            irp.complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcd::HcdLink;
    use crate::irp::IrpSegment;
    use crate::model::descriptor::{request_type, DEVICE_DESCRIPTOR_LEN};
    use crate::model::hub::parse_port_status;

    fn attached(sim: &Arc<SimHcd>) -> HcdLink {
        let link = HcdLink::new(sim.clone());
        link.attach(Arc::new(|_, _| {})).unwrap();
        link
    }

    fn control_pipe(link: &HcdLink, address: u8) -> HcdPipe {
        link.pipe_create(HcdPipeSpec {
            bus: 0,
            address,
            endpoint: 0,
            transfer_type: TransferType::Control,
            direction: Direction::Both,
            speed: UsbSpeed::Full,
            max_packet_size: 64,
            bandwidth: 0,
            interval: 0,
        })
        .unwrap()
        .0
    }

    fn run(link: &HcdLink, pipe: HcdPipe, mut irp: Irp) -> Irp {
        let (tx, rx) = crossbeam_channel::bounded(1);
        irp.assign_id(IrpId(1));
        let irp = irp.with_callback(move |irp| tx.send(irp).unwrap());
        let _ = link.irp_submit(pipe, irp, DataToggle::Data0);
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    fn request(link: &HcdLink, pipe: HcdPipe, setup: SetupPacket) -> Irp {
        let mut segments = vec![IrpSegment::setup(&setup)];
        if setup.direction() == Direction::In && setup.length > 0 {
            segments.push(IrpSegment::input(setup.length as usize));
            segments.push(IrpSegment::output(Vec::new()));
        } else {
            segments.push(IrpSegment::input(0));
        }
        run(link, pipe, Irp::new(segments))
    }

    fn port_request(req: u8, feature: PortFeature, port: u16) -> SetupPacket {
        SetupPacket::new(
            request_type(Direction::Out, RequestKind::Class, Recipient::Other),
            req,
            feature as u16,
            port,
            0,
        )
    }

    #[test]
    fn test_attach_reports_buses() {
        let sim = Arc::new(SimHcd::new(vec![
            SimBusSpec::new(UsbSpeed::Full, 4),
            SimBusSpec::new(UsbSpeed::High, 2),
        ]));
        let link = HcdLink::new(sim.clone());
        let buses = link.attach(Arc::new(|_, _| {})).unwrap();
        assert_eq!(buses, vec![UsbSpeed::Full, UsbSpeed::High]);
        assert!(link.attach(Arc::new(|_, _| {})).is_err());
    }

    #[test]
    fn test_root_hub_answers_at_default_address() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 4));
        let link = attached(&sim);
        let pipe = control_pipe(&link, 0);

        let irp = request(
            &link,
            pipe,
            SetupPacket::new(0x80, REQ_GET_DESCRIPTOR, 0x0100, 0, DEVICE_DESCRIPTOR_LEN as u16),
        );
        assert!(irp.is_ok());
        let desc = DeviceDescriptor::parse(&irp.received()).unwrap();
        assert!(desc.is_hub());
    }

    #[test]
    fn test_port_power_reports_connection_change() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 4));
        sim.plug(0, &[2], SimDeviceSpec::device(0x1234, 0x5678, 0xFF, 0, 0))
            .unwrap();
        let link = attached(&sim);
        let pipe = control_pipe(&link, 0);

        let irp = request(&link, pipe, port_request(REQ_SET_FEATURE, PortFeature::PortPower, 2));
        assert!(irp.is_ok());

        let status = request(&link, pipe, SetupPacket::new(0xA3, REQ_GET_STATUS, 0, 2, 4));
        let (status, change) = parse_port_status(&status.received()).unwrap();
        assert!(status.contains(PortStatus::CONNECTION | PortStatus::POWER));
        assert!(!status.contains(PortStatus::ENABLE));
        assert_eq!(change, PortChange::CONNECTION);
    }

    #[test]
    fn test_device_unreachable_until_port_enabled() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 2));
        let link = attached(&sim);
        let root = control_pipe(&link, 0);
        request(&link, root, SetupPacket::new(0x00, REQ_SET_ADDRESS, 1, 0, 0));
        link.pipe_modify(root, 1, 64).unwrap();
        assert_eq!(sim.device_address(0, &[]), Some(1));

        sim.plug(0, &[1], SimDeviceSpec::device(1, 2, 0xFF, 0, 0)).unwrap();
        let irp = request(&link, root, port_request(REQ_SET_FEATURE, PortFeature::PortPower, 1));
        assert!(irp.is_ok());

        let dev = control_pipe(&link, 0);
        let irp = request(&link, dev, SetupPacket::new(0x80, REQ_GET_DESCRIPTOR, 0x0100, 0, 8));
        assert_eq!(irp.result(), Some(&Err(UsbdError::Hcd(HcdFault::CrcTimeout))));

        request(&link, root, port_request(REQ_SET_FEATURE, PortFeature::PortReset, 1));
        let irp = request(&link, dev, SetupPacket::new(0x80, REQ_GET_DESCRIPTOR, 0x0100, 0, 8));
        assert!(irp.is_ok());
        assert_eq!(irp.transferred(), 8);
    }

    #[test]
    fn test_bandwidth_refused() {
        let sim = Arc::new(SimHcd::new(vec![
            SimBusSpec::new(UsbSpeed::Full, 1)
                .with_periodic_budget(999_000)
                .with_reserved(900_000),
        ]));
        let link = attached(&sim);
        let spec = HcdPipeSpec {
            bus: 0,
            address: 2,
            endpoint: 0x81,
            transfer_type: TransferType::Interrupt,
            direction: Direction::In,
            speed: UsbSpeed::Low,
            max_packet_size: 8,
            bandwidth: 64,
            interval: 10,
        };
        assert_eq!(
            link.pipe_create(spec),
            Err(UsbdError::Hcd(HcdFault::Bandwidth))
        );
        assert_eq!(sim.reserved_ns(0), 900_000);
    }

    #[test]
    fn test_parked_irp_cancel() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 2));
        let link = attached(&sim);
        let (status_pipe, _) = link
            .pipe_create(HcdPipeSpec {
                bus: 0,
                address: 0,
                endpoint: HUB_STATUS_ENDPOINT,
                transfer_type: TransferType::Interrupt,
                direction: Direction::In,
                speed: UsbSpeed::Full,
                max_packet_size: 1,
                bandwidth: 1,
                interval: 255,
            })
            .unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let mut irp = Irp::read(1).with_callback(move |irp| tx.send(irp).unwrap());
        irp.assign_id(IrpId(7));
        link.irp_submit(status_pipe, irp, DataToggle::Data0).unwrap();
        assert_eq!(sim.parked_count(), 1);

        link.irp_cancel(status_pipe, IrpId(7)).unwrap();
        let irp = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(irp.result(), Some(&Err(UsbdError::Canceled)));
        assert_eq!(
            link.irp_cancel(status_pipe, IrpId(7)),
            Err(UsbdError::CannotCancel)
        );
    }

    #[test]
    fn test_sof_interval_range() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 1));
        let link = attached(&sim);
        assert_eq!(link.sof_interval(0), Ok(DEFAULT_SOF_INTERVAL));
        assert_eq!(
            link.set_sof_interval(0, 20_000),
            Err(UsbdError::Hcd(HcdFault::SofInterval))
        );
        link.set_sof_interval(0, 12_010).unwrap();
        assert_eq!(link.sof_interval(0), Ok(12_010));
    }

    #[test]
    fn test_rejected_submit_still_completes() {
        let sim = Arc::new(SimHcd::single_bus(UsbSpeed::Full, 1));
        let link = attached(&sim);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let irp = Irp::read(4).with_callback(move |irp| tx.send(irp).unwrap());
        assert_eq!(
            link.irp_submit(HcdPipe(999), irp, DataToggle::Data0),
            Err(UsbdError::BadHandle)
        );
        let irp = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(irp.result(), Some(&Err(UsbdError::BadHandle)));
    }
}
