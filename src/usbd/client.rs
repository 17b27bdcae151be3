//! Clients and their callback threads.
//!
//! Every client owns one thread that runs its callbacks one at a time.
//! Dynamic-attach notifications and management events arrive on the client's
//! bounded queue. IRP completions arrive on a separate unbounded lane, so the
//! controller's completion path never blocks on a client with slow callbacks.

use super::notify::{NotifyCallback, NotifyEvent, Subscription};
use super::{Reaper, Registry, SIG_CLIENT, Shared, ThreadStop, Usbd};
use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, NodeId, PipeHandle};
use crate::hcd::MgmtEvent;
use crate::irp::Irp;
use crate::queue::MessageQueue;
use crate::sync::Completion;
use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A management event as seen by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MgmtNotice {
    /// Root hub of the bus the event concerns.
    pub root: NodeId,
    pub event: MgmtEvent,
}

pub type MgmtCallback = Arc<dyn Fn(MgmtNotice) + Send + Sync>;

type MgmtSlot = Arc<Mutex<Option<MgmtCallback>>>;

pub(crate) enum ClientMsg {
    /// Run the IRP's callback, then `finish`.
    IrpComplete {
        irp: Irp,
        finish: Box<dyn FnOnce() + Send>,
    },
    Notify {
        callback: NotifyCallback,
        event: NotifyEvent,
    },
    Management(MgmtNotice),
    Terminate,
}

pub(crate) struct Client {
    pub(crate) name: String,
    pub(crate) queue: MessageQueue<ClientMsg>,
    completions: Sender<ClientMsg>,
    mgmt: MgmtSlot,
    thread: Option<JoinHandle<()>>,
    exited: Arc<Completion>,
    pub(crate) pipes: Vec<PipeHandle>,
    pub(crate) subscriptions: Vec<Subscription>,
}

/// What a callback thread reads from.
#[derive(Clone)]
struct Lanes {
    queue: Receiver<ClientMsg>,
    completions: Receiver<ClientMsg>,
}

enum Pumped {
    Msg(ClientMsg),
    Woken,
    Closed,
}

impl Lanes {
    /// Next message from either lane, or `Woken` once `wake` is ready.
    /// Completions already queued go first.
    fn next(&self, wake: &Receiver<()>) -> Pumped {
        match self.completions.try_recv() {
            Ok(msg) => return Pumped::Msg(msg),
            Err(TryRecvError::Disconnected) => return self.queue_only(wake),
            Err(TryRecvError::Empty) => {}
        }
        select! {
            recv(wake) -> _ => Pumped::Woken,
            recv(self.completions) -> msg => match msg {
                Ok(msg) => Pumped::Msg(msg),
                Err(_) => self.queue_only(wake),
            },
            recv(self.queue) -> msg => msg.map_or(Pumped::Closed, Pumped::Msg),
        }
    }

    fn queue_only(&self, wake: &Receiver<()>) -> Pumped {
        select! {
            recv(wake) -> _ => Pumped::Woken,
            recv(self.queue) -> msg => msg.map_or(Pumped::Closed, Pumped::Msg),
        }
    }
}

thread_local! {
    static CALLBACK_CONTEXT: RefCell<Option<(Lanes, MgmtSlot)>> = const { RefCell::new(None) };
    static TERMINATED: Cell<bool> = const { Cell::new(false) };
}

fn current_context() -> Option<(Lanes, MgmtSlot)> {
    CALLBACK_CONTEXT.with(|c| c.borrow().clone())
}

/// Block until `done` is signalled.
///
/// On a client's callback thread the wait keeps running that client's
/// callbacks, so a callback that waits on its own IRP cannot deadlock.
pub(crate) fn wait_pumping(done: &Completion) {
    let Some((lanes, mgmt)) = current_context() else {
        done.wait();
        return;
    };
    let wake = done.waker();
    while !done.is_signaled() {
        match lanes.next(&wake) {
            Pumped::Msg(msg) => dispatch(msg, &mgmt),
            Pumped::Woken => return,
            Pumped::Closed => {
                done.wait();
                return;
            }
        }
    }
}

fn dispatch(msg: ClientMsg, mgmt: &MgmtSlot) {
    match msg {
        ClientMsg::IrpComplete { irp, finish } => {
            irp.complete();
            finish();
        }
        ClientMsg::Notify { callback, event } => callback(&event),
        ClientMsg::Management(notice) => {
            let callback = mgmt.lock().clone();
            if let Some(callback) = callback {
                callback(notice);
            }
        }
        ClientMsg::Terminate => TERMINATED.with(|t| t.set(true)),
    }
}

fn run(name: String, lanes: Lanes, mgmt: MgmtSlot, exited: Arc<Completion>) {
    CALLBACK_CONTEXT.with(|c| *c.borrow_mut() = Some((lanes.clone(), mgmt.clone())));
    debug!(client = %name, "callback thread started");
    let idle = crossbeam_channel::never();
    while !TERMINATED.with(Cell::get) {
        match lanes.next(&idle) {
            Pumped::Msg(ClientMsg::Terminate) | Pumped::Woken | Pumped::Closed => break,
            Pumped::Msg(msg) => dispatch(msg, &mgmt),
        }
    }
    // completions that raced the terminate still get their callbacks
    while let Ok(msg) = lanes.completions.try_recv() {
        dispatch(msg, &mgmt);
    }
    CALLBACK_CONTEXT.with(|c| c.borrow_mut().take());
    debug!(client = %name, "callback thread exiting");
    exited.signal();
}

impl Client {
    fn spawn(name: &str, depth: usize, mgmt: Option<MgmtCallback>) -> Result<Self> {
        let queue = MessageQueue::new(depth)?;
        let (completions, completion_rx) = crossbeam_channel::unbounded();
        let mgmt: MgmtSlot = Arc::new(Mutex::new(mgmt));
        let exited = Arc::new(Completion::new());

        let thread = {
            let name = name.to_string();
            let lanes = Lanes {
                queue: queue.receiver(),
                completions: completion_rx,
            };
            let mgmt = mgmt.clone();
            let exited = exited.clone();
            thread::Builder::new()
                .name(format!("usbd-client-{}", name))
                .spawn(move || run(name, lanes, mgmt, exited))
                .map_err(|_| UsbdError::OutOfResources("threads"))?
        };

        Ok(Self {
            name: name.to_string(),
            queue,
            completions,
            mgmt,
            thread: Some(thread),
            exited,
            pipes: Vec::new(),
            subscriptions: Vec::new(),
        })
    }

    /// Queue a message for the callback thread, dropping it if the queue
    /// stays full for `timeout`.
    pub(crate) fn post(&self, msg: ClientMsg, timeout: Duration) {
        if let Err(e) = self.queue.post(msg, Some(timeout)) {
            warn!(client = %self.name, error = %e, "dropping callback message");
        }
    }

    /// Where IRP completion relays send to. Never blocks.
    pub(crate) fn completion_sender(&self) -> Sender<ClientMsg> {
        self.completions.clone()
    }

    fn has_mgmt_callback(&self) -> bool {
        self.mgmt.lock().is_some()
    }

    fn into_stop(mut self, timeout: Duration) -> ThreadStop {
        let queue = self.queue.clone();
        ThreadStop {
            name: format!("usbd-client-{}", self.name),
            terminate: Box::new(move || {
                if let Err(e) = queue.post(ClientMsg::Terminate, Some(timeout)) {
                    warn!(error = %e, "could not post terminate to client thread");
                }
            }),
            handle: self.thread.take(),
            exited: self.exited.clone(),
            timeout,
        }
    }
}

/// Deliver a management event to every client with a management callback.
pub(crate) fn broadcast_mgmt(shared: &Shared, reg: &Registry, notice: MgmtNotice) {
    for &handle in &reg.clients {
        if let Ok(client) = reg.client(handle)
            && client.has_mgmt_callback()
        {
            client.post(ClientMsg::Management(notice), shared.post_timeout());
        }
    }
}

/// Tear down a client's pipes, subscriptions and mastership, then release it.
pub(crate) fn unregister_locked(
    shared: &Shared,
    reg: &mut Registry,
    reaper: &mut Reaper,
    handle: ClientHandle,
) -> Result<()> {
    let pipes = reg.client(handle)?.pipes.clone();
    for pipe in pipes {
        if let Err(e) = super::pipe::destroy_locked(reg, reaper, pipe) {
            warn!(%pipe, error = %e, "pipe teardown during unregister failed");
        }
    }

    for key in reg.bus_keys() {
        if let Ok(bus) = reg.bus_mut(key)
            && bus.timing_master == Some(handle)
        {
            bus.timing_master = None;
        }
    }

    reg.clients.retain(|&c| c != handle);
    let client = reg.release_client(handle)?;
    info!(client = %client.name, "client unregistered");
    reaper.stop_thread(client.into_stop(shared.config().client_shutdown_timeout()));
    Ok(())
}

impl Usbd {
    /// Register a client and start its callback thread.
    pub fn register_client(&self, name: &str, mgmt: Option<MgmtCallback>) -> Result<ClientHandle> {
        let depth = self.shared.config().clients.queue_depth;
        self.shared.locked(|reg, _| {
            // a client dropped here closes its queue, which ends its thread
            let client = Client::spawn(name, depth, mgmt)?;
            let handle = ClientHandle(reg.handles.allocate(SIG_CLIENT, super::Object::Client(client))?);
            reg.clients.push(handle);
            info!(client = name, %handle, "client registered");
            Ok(handle)
        })
    }

    /// Destroy every pipe the client owns, drop its notification
    /// registrations and stop its callback thread.
    ///
    /// Returns once every callback for the client has run, unless called from
    /// the client's own callback thread, in which case the thread stops after
    /// the current callback returns.
    pub fn unregister_client(&self, client: ClientHandle) -> Result<()> {
        self.shared
            .locked(|reg, reaper| unregister_locked(&self.shared, reg, reaper, client))
    }

    /// Install or clear the management event callback.
    pub fn set_management_callback(&self, client: ClientHandle, callback: Option<MgmtCallback>) -> Result<()> {
        self.shared.locked(|reg, _| {
            let client = reg.client(client)?;
            *client.mgmt.lock() = callback;
            Ok(())
        })
    }

    pub fn client_name(&self, client: ClientHandle) -> Result<String> {
        self.shared
            .locked(|reg, _| Ok(reg.client(client)?.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UsbdConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_register_and_unregister() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        let client = usbd.register_client("alpha", None).unwrap();
        assert_eq!(usbd.client_name(client).unwrap(), "alpha");
        usbd.unregister_client(client).unwrap();
        assert_eq!(usbd.client_name(client), Err(UsbdError::BadHandle));
        assert_eq!(usbd.unregister_client(client), Err(UsbdError::BadHandle));
    }

    #[test]
    fn test_callback_thread_runs_queued_work_in_order() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        let handle = usbd.register_client("order", None).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Completion::new());

        usbd.shared()
            .locked(|reg, _| {
                let client = reg.client(handle)?;
                for i in 0..3u64 {
                    let seen = seen.clone();
                    let irp = Irp::read(0).with_tag(i).with_callback(move |irp| seen.lock().push(irp.tag));
                    client.post(
                        ClientMsg::IrpComplete {
                            irp,
                            finish: Box::new(|| {}),
                        },
                        Duration::from_secs(1),
                    );
                }
                let done = done.clone();
                client.post(
                    ClientMsg::IrpComplete {
                        irp: Irp::read(0),
                        finish: Box::new(move || done.signal()),
                    },
                    Duration::from_secs(1),
                );
                Ok(())
            })
            .unwrap();

        assert!(done.wait_timeout(Duration::from_secs(5)));
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        usbd.unregister_client(handle).unwrap();
    }

    #[test]
    fn test_management_callback_replaced() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let client = usbd.register_client("mgmt", None).unwrap();
        let counter = hits.clone();
        usbd.set_management_callback(
            client,
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        usbd.shared()
            .locked(|reg, _| {
                assert!(reg.client(client)?.has_mgmt_callback());
                Ok(())
            })
            .unwrap();
        usbd.set_management_callback(client, None).unwrap();
        usbd.unregister_client(client).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pumping_wait_runs_completions_then_wakes() {
        let usbd = Usbd::new(UsbdConfig::default()).unwrap();
        let handle = usbd.register_client("pump", None).unwrap();
        let lane = usbd
            .shared()
            .locked(|reg, _| Ok(reg.client(handle)?.completion_sender()))
            .unwrap();
        let relay = |irp: Irp| {
            lane.send(ClientMsg::IrpComplete {
                irp,
                finish: Box::new(|| {}),
            })
            .unwrap();
        };

        // a callback blocked on its own completion keeps running later ones
        let target = Arc::new(Completion::new());
        let outer_done = Arc::new(Completion::new());
        {
            let target = target.clone();
            let outer_done = outer_done.clone();
            relay(Irp::read(0).with_callback(move |_| {
                wait_pumping(&target);
                outer_done.signal();
            }));
        }
        {
            let target = target.clone();
            relay(Irp::read(0).with_callback(move |_| target.signal()));
        }
        assert!(outer_done.wait_timeout(Duration::from_secs(5)));

        // with nothing queued, a signal from elsewhere ends the wait
        let later = Arc::new(Completion::new());
        let second_done = Arc::new(Completion::new());
        {
            let later = later.clone();
            let second_done = second_done.clone();
            relay(Irp::read(0).with_callback(move |_| {
                wait_pumping(&later);
                second_done.signal();
            }));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!second_done.is_signaled());
        later.signal();
        assert!(second_done.wait_timeout(Duration::from_secs(5)));

        usbd.unregister_client(handle).unwrap();
    }

    #[test]
    fn test_wait_pumping_off_client_thread_blocks() {
        let done = Arc::new(Completion::new());
        let signaller = done.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal();
        });
        wait_pumping(&done);
        assert!(done.is_signaled());
        t.join().unwrap();
    }
}
