//! Host controller driver boundary.
//!
//! A host controller is reached through one synchronous entry point,
//! [`HostController::execute`], which takes a request block and returns a
//! reply. IRP completion is the only asynchronous path: the controller hands
//! every submitted IRP back exactly once through [`Irp::complete`], from its
//! own context, never from inside `execute`.

pub mod scenario;
pub mod sim;

pub use sim::{SimBusSpec, SimDeviceSpec, SimHcd};

use crate::error::{Result, UsbdError};
use crate::irp::{DataToggle, Irp, IrpId};
use crate::model::{Direction, TransferType, UsbSpeed};
use std::fmt;
use std::sync::Arc;

/// Controller-assigned pipe handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HcdPipe(pub u64);

impl fmt::Display for HcdPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hcd-pipe#{}", self.0)
    }
}

/// Requested bus power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Suspend,
    Resume,
}

/// Management events delivered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtEvent {
    Suspend,
    Resume,
    /// A device on the bus signalled remote wakeup.
    RemoteWakeup,
}

/// Sink for events a controller raises on its own, keyed by bus index.
pub type HcdEventSink = Arc<dyn Fn(u16, MgmtEvent) + Send + Sync>;

/// Everything the controller needs to open a pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcdPipeSpec {
    pub bus: u16,
    pub address: u8,
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub direction: Direction,
    pub speed: UsbSpeed,
    pub max_packet_size: u16,
    /// Periodic pipes: bytes per frame to reserve.
    pub bandwidth: u32,
    /// Interrupt pipes: service interval in frames.
    pub interval: u16,
}

/// Request block handed to [`HostController::execute`].
pub enum HcdRequest {
    Attach { events: HcdEventSink },
    Detach,
    SetBusState { bus: u16, state: BusState },
    CurrentFrame { bus: u16 },
    GetSofInterval { bus: u16 },
    SetSofInterval { bus: u16, interval: u16 },
    PipeCreate(HcdPipeSpec),
    PipeDestroy { pipe: HcdPipe },
    PipeModify { pipe: HcdPipe, address: u8, max_packet_size: u16 },
    IrpSubmit { pipe: HcdPipe, irp: Irp, toggle: DataToggle },
    IrpCancel { pipe: HcdPipe, irp: IrpId },
}

impl HcdRequest {
    /// Function code, as carried in the request header.
    pub fn code(&self) -> u16 {
        match self {
            Self::Attach { .. } => 0x00,
            Self::Detach => 0x01,
            Self::SetBusState { .. } => 0x02,
            Self::CurrentFrame { .. } => 0x10,
            Self::GetSofInterval { .. } => 0x11,
            Self::SetSofInterval { .. } => 0x12,
            Self::PipeCreate(_) => 0x20,
            Self::PipeDestroy { .. } => 0x21,
            Self::PipeModify { .. } => 0x22,
            Self::IrpSubmit { .. } => 0x30,
            Self::IrpCancel { .. } => 0x31,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Detach => "detach",
            Self::SetBusState { .. } => "set-bus-state",
            Self::CurrentFrame { .. } => "current-frame",
            Self::GetSofInterval { .. } => "get-sof-interval",
            Self::SetSofInterval { .. } => "set-sof-interval",
            Self::PipeCreate(_) => "pipe-create",
            Self::PipeDestroy { .. } => "pipe-destroy",
            Self::PipeModify { .. } => "pipe-modify",
            Self::IrpSubmit { .. } => "irp-submit",
            Self::IrpCancel { .. } => "irp-cancel",
        }
    }
}

impl fmt::Debug for HcdRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HcdRequest({:#04x} {})", self.code(), self.name())
    }
}

/// Reply to an [`HcdRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HcdReply {
    Done,
    /// One speed per bus the controller exposes.
    Attached { buses: Vec<UsbSpeed> },
    Frame { current: u16, window: u16 },
    SofInterval(u16),
    /// Worst-case time of one transfer on the new pipe.
    PipeCreated { pipe: HcdPipe, time_ns: u32 },
}

/// A host controller driver.
///
/// `IrpSubmit` transfers ownership of the IRP. If the controller refuses it,
/// the IRP is still completed (with the refusal) and the same error is returned.
pub trait HostController: Send + Sync {
    fn execute(&self, request: HcdRequest) -> Result<HcdReply>;
}

fn unexpected(request: &'static str, reply: HcdReply) -> UsbdError {
    UsbdError::General(format!("unexpected HCD reply to {}: {:?}", request, reply))
}

/// Typed wrapper over a controller's entry point.
#[derive(Clone)]
pub struct HcdLink {
    hcd: Arc<dyn HostController>,
}

impl HcdLink {
    pub fn new(hcd: Arc<dyn HostController>) -> Self {
        Self { hcd }
    }

    fn done(&self, request: HcdRequest) -> Result<()> {
        let name = request.name();
        match self.hcd.execute(request)? {
            HcdReply::Done => Ok(()),
            other => Err(unexpected(name, other)),
        }
    }

    /// Attach and learn the speed of every bus.
    pub fn attach(&self, events: HcdEventSink) -> Result<Vec<UsbSpeed>> {
        match self.hcd.execute(HcdRequest::Attach { events })? {
            HcdReply::Attached { buses } => Ok(buses),
            other => Err(unexpected("attach", other)),
        }
    }

    pub fn detach(&self) -> Result<()> {
        self.done(HcdRequest::Detach)
    }

    pub fn set_bus_state(&self, bus: u16, state: BusState) -> Result<()> {
        self.done(HcdRequest::SetBusState { bus, state })
    }

    /// Current frame number and the scheduling window.
    pub fn current_frame(&self, bus: u16) -> Result<(u16, u16)> {
        match self.hcd.execute(HcdRequest::CurrentFrame { bus })? {
            HcdReply::Frame { current, window } => Ok((current, window)),
            other => Err(unexpected("current-frame", other)),
        }
    }

    pub fn sof_interval(&self, bus: u16) -> Result<u16> {
        match self.hcd.execute(HcdRequest::GetSofInterval { bus })? {
            HcdReply::SofInterval(interval) => Ok(interval),
            other => Err(unexpected("get-sof-interval", other)),
        }
    }

    pub fn set_sof_interval(&self, bus: u16, interval: u16) -> Result<()> {
        self.done(HcdRequest::SetSofInterval { bus, interval })
    }

    /// Open a pipe, returning its handle and worst-case transfer time.
    pub fn pipe_create(&self, spec: HcdPipeSpec) -> Result<(HcdPipe, u32)> {
        match self.hcd.execute(HcdRequest::PipeCreate(spec))? {
            HcdReply::PipeCreated { pipe, time_ns } => Ok((pipe, time_ns)),
            other => Err(unexpected("pipe-create", other)),
        }
    }

    pub fn pipe_destroy(&self, pipe: HcdPipe) -> Result<()> {
        self.done(HcdRequest::PipeDestroy { pipe })
    }

    pub fn pipe_modify(&self, pipe: HcdPipe, address: u8, max_packet_size: u16) -> Result<()> {
        self.done(HcdRequest::PipeModify {
            pipe,
            address,
            max_packet_size,
        })
    }

    pub fn irp_submit(&self, pipe: HcdPipe, irp: Irp, toggle: DataToggle) -> Result<()> {
        self.done(HcdRequest::IrpSubmit { pipe, irp, toggle })
    }

    pub fn irp_cancel(&self, pipe: HcdPipe, irp: IrpId) -> Result<()> {
        self.done(HcdRequest::IrpCancel { pipe, irp })
    }
}

impl fmt::Debug for HcdLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HcdLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(HcdReply);

    impl HostController for Fixed {
        fn execute(&self, _request: HcdRequest) -> Result<HcdReply> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_link_rejects_mismatched_reply() {
        let link = HcdLink::new(Arc::new(Fixed(HcdReply::Done)));
        assert!(matches!(link.current_frame(0), Err(UsbdError::General(_))));
        assert!(link.set_bus_state(0, BusState::Suspend).is_ok());
    }

    #[test]
    fn test_link_unwraps_frame() {
        let link = HcdLink::new(Arc::new(Fixed(HcdReply::Frame {
            current: 12,
            window: 1024,
        })));
        assert_eq!(link.current_frame(0), Ok((12, 1024)));
    }

    #[test]
    fn test_request_codes() {
        let req = HcdRequest::IrpCancel {
            pipe: HcdPipe(1),
            irp: IrpId(2),
        };
        assert_eq!(req.code(), 0x31);
        assert_eq!(format!("{:?}", req), "HcdRequest(0x31 irp-cancel)");
    }
}
