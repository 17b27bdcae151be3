//! Host controller attachment, buses and their monitor threads.

use super::client::{MgmtNotice, broadcast_mgmt};
use super::node::{Node, collect_tree, create_node, destroy_subtree};
use super::{Object, Reaper, Registry, SIG_HCD, Shared, ThreadStop, Usbd};
use crate::config::UsbdConfig;
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, HcdHandle, NodeId};
use crate::hcd::{BusState, HcdEventSink, HcdLink, HostController, MgmtEvent};
use crate::irp::Irp;
use crate::model::{BusTopology, Direction, UsbSpeed, UsbTopology};
use crate::queue::MessageQueue;
use crate::sync::Completion;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Host controller and bus index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BusKey {
    pub hcd: HcdHandle,
    pub index: u16,
}

/// Addresses in use on one bus, 1..=127.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AddressMap(u128);

impl AddressMap {
    pub const MAX: u8 = 127;

    /// Claim the lowest free address.
    pub fn allocate(&mut self) -> Result<u8> {
        let address = (1..=Self::MAX)
            .find(|&a| !self.contains(a))
            .ok_or(UsbdError::OutOfResources("bus addresses"))?;
        self.0 |= 1 << address;
        Ok(address)
    }

    /// Claim a specific address.
    pub fn claim(&mut self, address: u8) -> Result<()> {
        if address == 0 || address > Self::MAX {
            return Err(UsbdError::BadParam("address out of range"));
        }
        if self.contains(address) {
            return Err(UsbdError::OutOfResources("address in use"));
        }
        self.0 |= 1 << address;
        Ok(())
    }

    pub fn release(&mut self, address: u8) {
        if address <= Self::MAX {
            self.0 &= !(1 << address);
        }
    }

    pub fn contains(&self, address: u8) -> bool {
        address <= Self::MAX && self.0 & (1 << address) != 0
    }

    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }
}

/// Transfer counters, updated from completion context without the mutex.
#[derive(Debug, Default)]
pub(crate) struct BusCounters {
    transfers_in: AtomicU64,
    transfers_out: AtomicU64,
    receive_errors: AtomicU64,
    transmit_errors: AtomicU64,
}

impl BusCounters {
    pub fn record(&self, direction: Direction, ok: bool) {
        let counter = match (direction, ok) {
            (Direction::In, true) => &self.transfers_in,
            (Direction::In, false) => &self.receive_errors,
            (_, true) => &self.transfers_out,
            (_, false) => &self.transmit_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-bus counters returned by [`Usbd::statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStatistics {
    pub transfers_in: u64,
    pub transfers_out: u64,
    pub receive_errors: u64,
    pub transmit_errors: u64,
    /// Periodic bandwidth reserved on the bus, in ns per frame.
    pub reserved_ns: u32,
    /// Live nodes, root hub included.
    pub nodes: usize,
}

pub(crate) enum BusMsg {
    /// A hub's status-change IRP came back.
    HubStatus { hub: NodeId, irp: Irp },
    /// An event the controller raised for this bus.
    Management(MgmtEvent),
    Terminate,
}

pub(crate) struct Bus {
    /// System-wide bus number, 1-based.
    pub number: u16,
    pub speed: UsbSpeed,
    pub root: Option<NodeId>,
    pub addresses: AddressMap,
    pub monitor: MessageQueue<BusMsg>,
    thread: Option<JoinHandle<()>>,
    exited: Arc<Completion>,
    pub timing_master: Option<ClientHandle>,
    pub counters: Arc<BusCounters>,
    /// Periodic reservations made through this USBD, in ns per frame.
    pub reserved_ns: u32,
}

pub(crate) struct HcdAttachment {
    pub link: HcdLink,
    pub buses: Vec<Bus>,
    /// Monitor queues by bus index, for events raised by the controller.
    routes: Arc<Mutex<Vec<Sender<BusMsg>>>>,
}

fn run_monitor(shared: Weak<Shared>, key: BusKey, rx: Receiver<BusMsg>, exited: Arc<Completion>) {
    debug!(hcd = %key.hcd, bus = key.index, "bus monitor started");
    loop {
        let msg = match rx.recv() {
            Ok(BusMsg::Terminate) | Err(_) => break,
            Ok(msg) => msg,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match msg {
            BusMsg::HubStatus { hub, irp } => super::hub::hub_status(&shared, hub, irp),
            BusMsg::Management(event) => bus_event(&shared, key, event),
            BusMsg::Terminate => break,
        }
    }
    debug!(hcd = %key.hcd, bus = key.index, "bus monitor exiting");
    exited.signal();
}

fn bus_event(shared: &Shared, key: BusKey, event: MgmtEvent) {
    let result = shared.locked(|reg, _| {
        let root = reg.bus(key)?.root.ok_or(UsbdError::BadHandle)?;
        info!(hcd = %key.hcd, bus = key.index, ?event, "bus management event");
        broadcast_mgmt(shared, reg, MgmtNotice { root, event });
        Ok(())
    });
    if let Err(e) = result {
        debug!(hcd = %key.hcd, bus = key.index, ?event, error = %e, "management event dropped");
    }
}

impl Bus {
    fn spawn(shared: &Shared, key: BusKey, number: u16, speed: UsbSpeed, config: &UsbdConfig) -> Result<Self> {
        let monitor = MessageQueue::new(config.bus.queue_depth)?;
        let exited = Arc::new(Completion::new());
        let thread = {
            let weak = shared.this.clone();
            let rx = monitor.receiver();
            let exited = exited.clone();
            thread::Builder::new()
                .name(format!("usbd-bus-{}", number))
                .spawn(move || run_monitor(weak, key, rx, exited))
                .map_err(|_| UsbdError::OutOfResources("threads"))?
        };
        Ok(Self {
            number,
            speed,
            root: None,
            addresses: AddressMap::default(),
            monitor,
            thread: Some(thread),
            exited,
            timing_master: None,
            counters: Arc::new(BusCounters::default()),
            reserved_ns: 0,
        })
    }

    fn into_stop(mut self, shared: &Shared) -> ThreadStop {
        let queue = self.monitor.clone();
        let timeout = shared.config().bus_shutdown_timeout();
        ThreadStop {
            name: format!("usbd-bus-{}", self.number),
            terminate: Box::new(move || {
                if let Err(e) = queue.post(BusMsg::Terminate, Some(timeout)) {
                    warn!(error = %e, "could not post terminate to bus monitor");
                }
            }),
            handle: self.thread.take(),
            exited: self.exited.clone(),
            timeout,
        }
    }
}

/// Tear down every bus of a controller and queue its detach.
pub(crate) fn detach_locked(shared: &Shared, reg: &mut Registry, reaper: &mut Reaper, hcd: HcdHandle) -> Result<()> {
    let bus_count = reg.hcd(hcd)?.buses.len();
    for index in 0..bus_count {
        let key = BusKey {
            hcd,
            index: index as u16,
        };
        if let Some(root) = reg.bus(key)?.root
            && let Err(e) = destroy_subtree(shared, reg, reaper, root)
        {
            warn!(%hcd, bus = index, error = %e, "bus teardown failed");
        }
    }

    reg.hcds.retain(|&h| h != hcd);
    let attachment = reg.release_hcd(hcd)?;
    attachment.routes.lock().clear();
    for bus in attachment.buses {
        info!(bus = bus.number, "bus removed");
        reaper.stop_thread(bus.into_stop(shared));
    }
    reaper.detach(attachment.link);
    Ok(())
}

/// The bus a node lives on.
fn node_bus(reg: &Registry, node: NodeId) -> Result<BusKey> {
    Ok(reg.live_node(node)?.bus)
}

fn bus_link(reg: &Registry, key: BusKey) -> Result<HcdLink> {
    Ok(reg.hcd(key.hcd)?.link.clone())
}

fn bus_topology(reg: &Registry, key: BusKey) -> Result<BusTopology> {
    let bus = reg.bus(key)?;
    let nodes = match bus.root {
        Some(root) => collect_tree(reg, root)
            .into_iter()
            .filter_map(|id| Node::snapshot(reg, id).ok())
            .collect(),
        None => Vec::new(),
    };
    Ok(BusTopology {
        bus_num: bus.number,
        speed: bus.speed,
        reserved_ns: bus.reserved_ns,
        nodes,
    })
}

impl Usbd {
    /// Attach a host controller and enumerate every bus it exposes.
    ///
    /// On failure nothing of the controller remains attached.
    pub fn attach_hcd(&self, hcd: Arc<dyn HostController>) -> Result<HcdHandle> {
        let shared = &self.shared;
        shared.locked(|reg, reaper| {
            let link = HcdLink::new(hcd);
            let routes: Arc<Mutex<Vec<Sender<BusMsg>>>> = Arc::new(Mutex::new(Vec::new()));
            let handle = HcdHandle(reg.handles.allocate(
                SIG_HCD,
                Object::Hcd(HcdAttachment {
                    link: link.clone(),
                    buses: Vec::new(),
                    routes: routes.clone(),
                }),
            )?);

            let sink: HcdEventSink = {
                let routes = Arc::downgrade(&routes);
                Arc::new(move |bus: u16, event: MgmtEvent| {
                    let Some(routes) = routes.upgrade() else {
                        return;
                    };
                    let tx = routes.lock().get(bus as usize).cloned();
                    if let Some(tx) = tx
                        && tx.try_send(BusMsg::Management(event)).is_err()
                    {
                        warn!(bus, ?event, "bus monitor queue full; management event dropped");
                    }
                })
            };

            let speeds = match link.attach(sink) {
                Ok(speeds) => speeds,
                Err(e) => {
                    warn!(error = %e, "host controller refused attach");
                    if let Err(release) = reg.release_hcd(handle) {
                        warn!(%handle, error = %release, "refused controller handle not released");
                    }
                    return Err(e);
                }
            };
            reg.hcds.push(handle);

            if let Err(e) = attach_buses(shared, reg, reaper, handle, &speeds, &routes) {
                warn!(%handle, error = %e, "bus setup failed; detaching controller");
                if let Err(e) = detach_locked(shared, reg, reaper, handle) {
                    warn!(%handle, error = %e, "cleanup after failed attach failed");
                }
                return Err(e);
            }
            info!(%handle, buses = speeds.len(), "host controller attached");
            Ok(handle)
        })
    }

    /// Remove every node of the controller's buses, stop their monitors and
    /// detach the controller.
    pub fn detach_hcd(&self, hcd: HcdHandle) -> Result<()> {
        self.shared.locked(|reg, reaper| {
            detach_locked(&self.shared, reg, reaper, hcd)?;
            info!(%hcd, "host controller detached");
            Ok(())
        })
    }

    /// Number of buses across every attached controller.
    pub fn bus_count(&self, client: ClientHandle) -> Result<u16> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            Ok(reg.bus_keys().len() as u16)
        })
    }

    /// Root hub of the `bus`-th bus, counted from 0 in attach order.
    pub fn root_node(&self, client: ClientHandle, bus: u16) -> Result<NodeId> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = *reg
                .bus_keys()
                .get(bus as usize)
                .ok_or(UsbdError::BadParam("no such bus"))?;
            reg.bus(key)?.root.ok_or(UsbdError::BadHandle)
        })
    }

    /// Suspend or resume the bus a root hub belongs to.
    pub fn set_bus_state(&self, client: ClientHandle, root: NodeId, state: BusState) -> Result<()> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, root)?;
            if reg.bus(key)?.root != Some(root) {
                return Err(UsbdError::BadParam("not a root hub"));
            }
            bus_link(reg, key)?.set_bus_state(key.index, state)?;
            let event = match state {
                BusState::Suspend => MgmtEvent::Suspend,
                BusState::Resume => MgmtEvent::Resume,
            };
            info!(bus = reg.bus(key)?.number, ?state, "bus state changed");
            broadcast_mgmt(&self.shared, reg, MgmtNotice { root, event });
            Ok(())
        })
    }

    /// Current frame number and scheduling window of a node's bus.
    pub fn current_frame(&self, client: ClientHandle, node: NodeId) -> Result<(u16, u16)> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            bus_link(reg, key)?.current_frame(key.index)
        })
    }

    /// Become the bus's frame timing master.
    pub fn take_timing_master(&self, client: ClientHandle, node: NodeId) -> Result<()> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            let bus = reg.bus_mut(key)?;
            match bus.timing_master {
                Some(owner) if owner != client => Err(UsbdError::OutOfResources("timing master taken")),
                _ => {
                    bus.timing_master = Some(client);
                    Ok(())
                }
            }
        })
    }

    pub fn release_timing_master(&self, client: ClientHandle, node: NodeId) -> Result<()> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            let bus = reg.bus_mut(key)?;
            if bus.timing_master != Some(client) {
                return Err(UsbdError::BadParam("not the timing master"));
            }
            bus.timing_master = None;
            Ok(())
        })
    }

    pub fn timing_master(&self, client: ClientHandle, node: NodeId) -> Result<Option<ClientHandle>> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            Ok(reg.bus(key)?.timing_master)
        })
    }

    pub fn sof_interval(&self, client: ClientHandle, node: NodeId) -> Result<u16> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            bus_link(reg, key)?.sof_interval(key.index)
        })
    }

    /// Adjust the SOF interval. Only the timing master may do this.
    pub fn set_sof_interval(&self, client: ClientHandle, node: NodeId, interval: u16) -> Result<()> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let key = node_bus(reg, node)?;
            if reg.bus(key)?.timing_master != Some(client) {
                return Err(UsbdError::BadParam("not the timing master"));
            }
            bus_link(reg, key)?.set_sof_interval(key.index, interval)
        })
    }

    pub fn statistics(&self, client: ClientHandle, node: NodeId) -> Result<BusStatistics> {
        self.shared.locked(|reg, _| {
            reg.client(client)?;
            let bus = reg.bus(node_bus(reg, node)?)?;
            let c = &bus.counters;
            Ok(BusStatistics {
                transfers_in: c.transfers_in.load(Ordering::Relaxed),
                transfers_out: c.transfers_out.load(Ordering::Relaxed),
                receive_errors: c.receive_errors.load(Ordering::Relaxed),
                transmit_errors: c.transmit_errors.load(Ordering::Relaxed),
                reserved_ns: bus.reserved_ns,
                nodes: bus.addresses.count(),
            })
        })
    }

    /// Snapshot of every bus and node.
    pub fn topology(&self) -> Result<UsbTopology> {
        self.shared.locked(|reg, _| {
            let buses = reg
                .bus_keys()
                .into_iter()
                .map(|key| bus_topology(reg, key))
                .collect::<Result<Vec<_>>>()?;
            Ok(UsbTopology { buses })
        })
    }
}

fn attach_buses(
    shared: &Shared,
    reg: &mut Registry,
    reaper: &mut Reaper,
    handle: HcdHandle,
    speeds: &[UsbSpeed],
    routes: &Mutex<Vec<Sender<BusMsg>>>,
) -> Result<()> {
    for (index, &speed) in speeds.iter().enumerate() {
        let key = BusKey {
            hcd: handle,
            index: index as u16,
        };
        let number = reg.next_bus_number;
        reg.next_bus_number = reg.next_bus_number.wrapping_add(1).max(1);

        let bus = Bus::spawn(shared, key, number, speed, shared.config())?;
        routes.lock().push(bus.monitor.sender());
        reg.hcd_mut(handle)?.buses.push(bus);
        info!(bus = number, %speed, "bus added");

        create_node(shared, reg, reaper, key, None, speed, 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_address_allocation_lowest_first() {
        let mut map = AddressMap::default();
        assert_eq!(map.allocate(), Ok(1));
        assert_eq!(map.allocate(), Ok(2));
        map.release(1);
        assert_eq!(map.allocate(), Ok(1));
        assert_eq!(map.count(), 2);
    }

    #[test]
    fn test_address_exhaustion() {
        let mut map = AddressMap::default();
        for _ in 1..=AddressMap::MAX {
            map.allocate().unwrap();
        }
        assert_eq!(map.allocate(), Err(UsbdError::OutOfResources("bus addresses")));
        assert!(!map.contains(0));
    }

    #[test]
    fn test_claim_rejects_used_and_invalid() {
        let mut map = AddressMap::default();
        map.claim(5).unwrap();
        assert!(map.claim(5).is_err());
        assert!(map.claim(0).is_err());
        assert!(map.claim(128).is_err());
    }

    #[test]
    fn test_refused_attach_leaves_no_controller() {
        let hcd = Arc::new(crate::hcd::SimHcd::single_bus(UsbSpeed::Full, 2));
        let first = Usbd::new(UsbdConfig::default()).unwrap();
        let controller = first.attach_hcd(hcd.clone()).unwrap();

        let second = Usbd::new(UsbdConfig::default()).unwrap();
        let handles_before = second
            .shared()
            .locked(|reg, _| Ok(reg.handles.len()))
            .unwrap();
        assert!(second.attach_hcd(hcd.clone()).is_err());
        second
            .shared()
            .locked(|reg, _| {
                assert!(reg.hcds.is_empty());
                assert_eq!(reg.handles.len(), handles_before);
                Ok(())
            })
            .unwrap();

        first.detach_hcd(controller).unwrap();
        second.shutdown().unwrap();
        first.shutdown().unwrap();
    }

    #[test]
    fn test_counters_by_direction() {
        let counters = BusCounters::default();
        counters.record(Direction::In, true);
        counters.record(Direction::Out, false);
        counters.record(Direction::Both, true);
        assert_eq!(counters.transfers_in.load(Ordering::Relaxed), 1);
        assert_eq!(counters.transmit_errors.load(Ordering::Relaxed), 1);
        assert_eq!(counters.transfers_out.load(Ordering::Relaxed), 1);
    }

    proptest! {
        #[test]
        fn address_map_never_duplicates(ops in proptest::collection::vec(any::<Option<u8>>(), 0..300)) {
            let mut map = AddressMap::default();
            let mut live: Vec<u8> = Vec::new();
            for op in ops {
                match op {
                    None => {
                        if let Ok(a) = map.allocate() {
                            prop_assert!(!live.contains(&a));
                            prop_assert!((1..=AddressMap::MAX).contains(&a));
                            live.push(a);
                        }
                    }
                    Some(i) if !live.is_empty() => {
                        let a = live.remove(i as usize % live.len());
                        map.release(a);
                    }
                    Some(_) => {}
                }
                prop_assert_eq!(map.count(), live.len());
            }
        }
    }
}
