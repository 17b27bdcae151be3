//! Convenience wrapper for code that acts as a single USBD client.

use crate::error::{Result, UsbdError};
use crate::handle::{ClientHandle, NodeId, PipeHandle};
use crate::irp::{Irp, IrpId};
use crate::model::{NodeInfo, SetupPacket};
use crate::sync::Completion;
use crate::usbd::{
    ClassPattern, MgmtCallback, NotifyEvent, NotifyId, PipeInfo, PipeRequest, Usbd, wait_pumping,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// A registered client. Unregisters itself when dropped.
pub struct UsbdClient {
    usbd: Usbd,
    handle: ClientHandle,
    registered: bool,
}

impl UsbdClient {
    pub fn register(usbd: &Usbd, name: &str) -> Result<Self> {
        Self::register_with(usbd, name, None)
    }

    pub fn register_with(usbd: &Usbd, name: &str, mgmt: Option<MgmtCallback>) -> Result<Self> {
        let handle = usbd.register_client(name, mgmt)?;
        Ok(Self {
            usbd: usbd.clone(),
            handle,
            registered: true,
        })
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn usbd(&self) -> &Usbd {
        &self.usbd
    }

    /// Unregister now, reporting any failure.
    pub fn unregister(mut self) -> Result<()> {
        self.registered = false;
        self.usbd.unregister_client(self.handle)
    }

    pub fn subscribe(&self, pattern: ClassPattern, callback: impl Fn(&NotifyEvent) + Send + Sync + 'static) -> Result<NotifyId> {
        self.usbd
            .register_notification(self.handle, pattern, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: NotifyId) -> Result<()> {
        self.usbd.unregister_notification(self.handle, id)
    }

    pub fn node_info(&self, node: NodeId) -> Result<NodeInfo> {
        self.usbd.node_info(self.handle, node)
    }

    pub fn root_node(&self, bus: u16) -> Result<NodeId> {
        self.usbd.root_node(self.handle, bus)
    }

    pub fn open_pipe(&self, node: NodeId, request: PipeRequest) -> Result<PipeHandle> {
        self.usbd.create_pipe(self.handle, node, request)
    }

    pub fn close_pipe(&self, pipe: PipeHandle) -> Result<()> {
        self.usbd.destroy_pipe(self.handle, pipe)
    }

    pub fn pipe_info(&self, pipe: PipeHandle) -> Result<PipeInfo> {
        self.usbd.pipe_info(self.handle, pipe)
    }

    /// Submit and return; the IRP's callback runs on this client's thread.
    pub fn transfer(&self, pipe: PipeHandle, irp: Irp) -> Result<IrpId> {
        self.usbd.submit_transfer(self.handle, pipe, irp)
    }

    /// Submit and wait for completion, returning the completed IRP.
    ///
    /// Any callback already on `irp` is replaced.
    pub fn transfer_sync(&self, pipe: PipeHandle, irp: Irp) -> Result<Irp> {
        let slot: Arc<Mutex<Option<Irp>>> = Arc::new(Mutex::new(None));
        let done = Arc::new(Completion::new());
        let irp = {
            let slot = slot.clone();
            let done = done.clone();
            irp.with_callback(move |irp| {
                *slot.lock() = Some(irp);
                done.signal();
            })
        };
        let submitted = self.usbd.submit_transfer(self.handle, pipe, irp);
        wait_pumping(&done);
        let irp = slot
            .lock()
            .take()
            .ok_or_else(|| UsbdError::General("transfer completion lost".into()))?;
        submitted?;
        match irp.result() {
            Some(Err(e)) => Err(e.clone()),
            _ => Ok(irp),
        }
    }

    pub fn abort(&self, pipe: PipeHandle, irp: IrpId) -> Result<()> {
        self.usbd.abort_transfer(self.handle, pipe, irp)
    }

    pub fn control(&self, node: NodeId, setup: SetupPacket, out: Vec<u8>) -> Result<Vec<u8>> {
        self.usbd.control_request(self.handle, node, setup, out)
    }
}

impl Drop for UsbdClient {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        match self.usbd.unregister_client(self.handle) {
            Ok(()) | Err(UsbdError::BadHandle) | Err(UsbdError::NotInitialized) => {}
            Err(e) => warn!(client = %self.handle, error = %e, "unregister on drop failed"),
        }
    }
}
