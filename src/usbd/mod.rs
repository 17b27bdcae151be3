//! The USB driver core.
//!
//! [`Usbd`] owns every client, host controller, bus, node and pipe behind a
//! single structural mutex. Public operations validate their handles against
//! the registry, mutate it, and queue any waiting that must happen without the
//! mutex (IRP completions, HCD pipe teardown, thread shutdown) on a [`Reaper`]
//! that runs once the mutex is released.

mod bus;
mod client;
mod control;
mod hub;
mod node;
mod notify;
mod pipe;

pub use bus::BusStatistics;
pub use client::{MgmtCallback, MgmtNotice};
pub use notify::{AttachKind, ClassPattern, NotifyCallback, NotifyEvent, NotifyId};
pub use pipe::{PipeInfo, PipeRequest};

pub(crate) use client::wait_pumping;

use crate::config::UsbdConfig;
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, HandleRegistry, HcdHandle, NodeId, PipeHandle, Signature};
use crate::hcd::{HcdLink, HcdPipe};
use crate::irp::IrpId;
use crate::sync::{Completion, ControlGate};
use bus::{Bus, BusKey, HcdAttachment};
use client::Client;
use node::Node;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use pipe::Pipe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const SIG_CLIENT: Signature = u32::from_be_bytes(*b"CLNT");
const SIG_HCD: Signature = u32::from_be_bytes(*b"HCDA");
const SIG_NODE: Signature = u32::from_be_bytes(*b"NODE");
const SIG_PIPE: Signature = u32::from_be_bytes(*b"PIPE");

/// Payload of every live handle.
pub(crate) enum Object {
    Client(Client),
    Hcd(HcdAttachment),
    Node(Node),
    Pipe(Pipe),
}

/// Everything guarded by the structural mutex.
pub(crate) struct Registry {
    handles: HandleRegistry<Object>,
    /// Clients in registration order.
    clients: Vec<ClientHandle>,
    /// Host controllers in attach order.
    hcds: Vec<HcdHandle>,
    next_bus_number: u16,
    next_notify: u64,
}

impl Registry {
    fn new(capacity: usize) -> Self {
        Self {
            handles: HandleRegistry::with_capacity(capacity),
            clients: Vec::new(),
            hcds: Vec::new(),
            next_bus_number: 1,
            next_notify: 1,
        }
    }

    pub(crate) fn client(&self, h: ClientHandle) -> Result<&Client> {
        match self.handles.validate(h.0, SIG_CLIENT)? {
            Object::Client(c) => Ok(c),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn client_mut(&mut self, h: ClientHandle) -> Result<&mut Client> {
        match self.handles.validate_mut(h.0, SIG_CLIENT)? {
            Object::Client(c) => Ok(c),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn hcd(&self, h: HcdHandle) -> Result<&HcdAttachment> {
        match self.handles.validate(h.0, SIG_HCD)? {
            Object::Hcd(a) => Ok(a),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn hcd_mut(&mut self, h: HcdHandle) -> Result<&mut HcdAttachment> {
        match self.handles.validate_mut(h.0, SIG_HCD)? {
            Object::Hcd(a) => Ok(a),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node> {
        match self.handles.validate(id.0, SIG_NODE)? {
            Object::Node(n) => Ok(n),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        match self.handles.validate_mut(id.0, SIG_NODE)? {
            Object::Node(n) => Ok(n),
            _ => Err(UsbdError::BadHandle),
        }
    }

    /// A node that is not being torn down.
    pub(crate) fn live_node(&self, id: NodeId) -> Result<&Node> {
        let node = self.node(id)?;
        if node.delete_pending {
            return Err(UsbdError::BadHandle);
        }
        Ok(node)
    }

    pub(crate) fn pipe(&self, h: PipeHandle) -> Result<&Pipe> {
        match self.handles.validate(h.0, SIG_PIPE)? {
            Object::Pipe(p) => Ok(p),
            _ => Err(UsbdError::BadHandle),
        }
    }

    pub(crate) fn bus(&self, key: BusKey) -> Result<&Bus> {
        self.hcd(key.hcd)?
            .buses
            .get(key.index as usize)
            .ok_or(UsbdError::BadHandle)
    }

    pub(crate) fn bus_mut(&mut self, key: BusKey) -> Result<&mut Bus> {
        self.hcd_mut(key.hcd)?
            .buses
            .get_mut(key.index as usize)
            .ok_or(UsbdError::BadHandle)
    }

    /// Every bus, in attach order.
    pub(crate) fn bus_keys(&self) -> Vec<BusKey> {
        self.hcds
            .iter()
            .filter_map(|&hcd| {
                let count = self.hcd(hcd).ok()?.buses.len();
                Some((0..count).map(move |index| BusKey {
                    hcd,
                    index: index as u16,
                }))
            })
            .flatten()
            .collect()
    }

    fn release_client(&mut self, h: ClientHandle) -> Result<Client> {
        match self.handles.release(h.0, SIG_CLIENT)? {
            Object::Client(c) => Ok(c),
            _ => Err(UsbdError::BadHandle),
        }
    }

    fn release_hcd(&mut self, h: HcdHandle) -> Result<HcdAttachment> {
        match self.handles.release(h.0, SIG_HCD)? {
            Object::Hcd(a) => Ok(a),
            _ => Err(UsbdError::BadHandle),
        }
    }

    fn release_node(&mut self, id: NodeId) -> Result<Node> {
        match self.handles.release(id.0, SIG_NODE)? {
            Object::Node(n) => Ok(n),
            _ => Err(UsbdError::BadHandle),
        }
    }

    fn release_pipe(&mut self, h: PipeHandle) -> Result<Pipe> {
        match self.handles.release(h.0, SIG_PIPE)? {
            Object::Pipe(p) => Ok(p),
            _ => Err(UsbdError::BadHandle),
        }
    }
}

/// Work deferred until the structural mutex is released.
#[derive(Default)]
pub(crate) struct Reaper {
    waits: Vec<Wait>,
    pipes: Vec<(HcdLink, HcdPipe)>,
    threads: Vec<ThreadStop>,
    detaches: Vec<HcdLink>,
}

enum Wait {
    Completion(Arc<Completion>),
    Gate(Arc<ControlGate>),
}

impl Reaper {
    /// Block until a completion callback has run.
    pub(crate) fn wait_for(&mut self, done: Arc<Completion>) {
        self.waits.push(Wait::Completion(done));
    }

    /// Block until no control transfer holds `gate`.
    pub(crate) fn wait_gate(&mut self, gate: Arc<ControlGate>) {
        self.waits.push(Wait::Gate(gate));
    }

    pub(crate) fn destroy_pipe(&mut self, link: HcdLink, pipe: HcdPipe) {
        self.pipes.push((link, pipe));
    }

    pub(crate) fn stop_thread(&mut self, stop: ThreadStop) {
        self.threads.push(stop);
    }

    pub(crate) fn detach(&mut self, link: HcdLink) {
        self.detaches.push(link);
    }

    /// Completions, then HCD pipes, then threads, then controllers.
    pub(crate) fn finish(self) {
        for wait in self.waits {
            match wait {
                Wait::Completion(done) => wait_pumping(&done),
                Wait::Gate(gate) => {
                    gate.acquire();
                    gate.release();
                }
            }
        }
        for (link, pipe) in self.pipes {
            if let Err(e) = link.pipe_destroy(pipe) {
                warn!(%pipe, error = %e, "HCD pipe release failed");
            }
        }
        for stop in self.threads {
            stop.stop();
        }
        for link in self.detaches {
            if let Err(e) = link.detach() {
                warn!(error = %e, "HCD detach failed");
            }
        }
    }
}

/// Message-then-bounded-wait shutdown of a worker thread.
pub(crate) struct ThreadStop {
    pub(crate) name: String,
    pub(crate) terminate: Box<dyn FnOnce() + Send>,
    pub(crate) handle: Option<JoinHandle<()>>,
    pub(crate) exited: Arc<Completion>,
    pub(crate) timeout: Duration,
}

impl ThreadStop {
    fn stop(self) {
        (self.terminate)();
        let Some(handle) = self.handle else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(thread = %self.name, "stopping from its own thread");
            return;
        }
        if self.exited.wait_timeout(self.timeout) {
            let _ = handle.join();
        } else {
            warn!(thread = %self.name, timeout = ?self.timeout, "thread did not exit in time; detaching it");
        }
    }
}

/// State shared with monitor threads and HCD callbacks.
pub(crate) struct Shared {
    config: UsbdConfig,
    next_irp: AtomicU64,
    this: Weak<Shared>,
    registry: Mutex<Option<Registry>>,
}

impl Shared {
    pub(crate) fn config(&self) -> &UsbdConfig {
        &self.config
    }

    pub(crate) fn next_irp_id(&self) -> IrpId {
        IrpId(self.next_irp.fetch_add(1, Ordering::Relaxed))
    }

    /// Bounded wait used when posting to a callback queue under the mutex.
    pub(crate) fn post_timeout(&self) -> Duration {
        self.config.client_shutdown_timeout()
    }

    /// Take the structural mutex.
    pub(crate) fn registry(&self) -> Result<MappedMutexGuard<'_, Registry>> {
        MutexGuard::try_map(self.registry.lock(), |reg| reg.as_mut())
            .map_err(|_| UsbdError::NotInitialized)
    }

    /// Run `f` under the structural mutex, then run whatever it deferred.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut Registry, &mut Reaper) -> Result<R>) -> Result<R> {
        let mut reaper = Reaper::default();
        let result = {
            let mut reg = self.registry()?;
            f(&mut reg, &mut reaper)
        };
        reaper.finish();
        result
    }
}

/// The USB driver.
///
/// Cheap to clone; every clone refers to the same driver instance.
#[derive(Clone)]
pub struct Usbd {
    shared: Arc<Shared>,
}

impl Usbd {
    /// Initialize a driver instance.
    pub fn new(config: UsbdConfig) -> Result<Self> {
        if let Err(e) = config.validate() {
            warn!(error = %e, "rejecting USBD configuration");
            return Err(UsbdError::BadParam("invalid configuration"));
        }
        let capacity = config.handles.capacity;
        let shared = Arc::new_cyclic(|this| Shared {
            config,
            next_irp: AtomicU64::new(1),
            this: this.clone(),
            registry: Mutex::new(Some(Registry::new(capacity))),
        });
        info!(handles = capacity, "USBD initialized");
        Ok(Self { shared })
    }

    pub fn config(&self) -> &UsbdConfig {
        self.shared.config()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.registry.lock().is_some()
    }

    /// Detach every host controller, unregister every client and release
    /// the registry. Every later call fails with `NotInitialized`.
    pub fn shutdown(&self) -> Result<()> {
        let mut reaper = Reaper::default();
        {
            let mut guard = self.shared.registry.lock();
            let reg = guard.as_mut().ok_or(UsbdError::NotInitialized)?;
            for hcd in reg.hcds.clone() {
                if let Err(e) = bus::detach_locked(&self.shared, reg, &mut reaper, hcd) {
                    warn!(%hcd, error = %e, "detach during shutdown failed");
                }
            }
            for client in reg.clients.clone() {
                if let Err(e) = client::unregister_locked(&self.shared, reg, &mut reaper, client) {
                    warn!(%client, error = %e, "unregister during shutdown failed");
                }
            }
            *guard = None;
        }
        reaper.finish();
        info!("USBD shut down");
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures_are_distinct() {
        let sigs = [SIG_CLIENT, SIG_HCD, SIG_NODE, SIG_PIPE];
        for (i, a) in sigs.iter().enumerate() {
            for b in &sigs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_shutdown_is_terminal() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        assert!(usbd.is_initialized());
        usbd.shutdown().unwrap();
        assert!(!usbd.is_initialized());
        assert_eq!(usbd.shutdown(), Err(UsbdError::NotInitialized));
        assert_eq!(
            usbd.register_client("late", None).map(|_| ()),
            Err(UsbdError::NotInitialized)
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = UsbdConfig::default();
        config.clients.queue_depth = 8;
        assert!(Usbd::new(config).is_err());
    }

    #[test]
    fn test_irp_ids_are_unique() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        let a = usbd.shared().next_irp_id();
        let b = usbd.shared().next_irp_id();
        assert_ne!(a, b);
    }
}
