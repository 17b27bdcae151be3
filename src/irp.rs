//! I/O request packets.
//!
//! An [`Irp`] is owned by its submitter until it is handed to a pipe. From
//! then on the USBD and the HCD own it, and it comes back exactly once,
//! by value, through its completion callback.

use crate::error::UsbdError;
use std::fmt;
use std::time::Duration;

use crate::model::SetupPacket;

/// Identifier assigned when an IRP is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrpId(pub u64);

impl fmt::Display for IrpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irp#{}", self.0)
    }
}

/// Packet identifier of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Setup,
    In,
    Out,
}

/// DATA0/DATA1 toggle state of a bulk or interrupt pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataToggle {
    #[default]
    Data0,
    Data1,
}

impl DataToggle {
    /// Advance by `packets` transactions.
    pub fn advance(self, packets: usize) -> Self {
        if packets % 2 == 0 {
            self
        } else {
            match self {
                Self::Data0 => Self::Data1,
                Self::Data1 => Self::Data0,
            }
        }
    }
}

/// One (pid, buffer) segment of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrpSegment {
    pub pid: Pid,
    /// OUT/SETUP payload, or the IN receive buffer sized to the requested length.
    pub data: Vec<u8>,
    /// Bytes actually moved, filled in by the HCD.
    pub actual: usize,
}

impl IrpSegment {
    pub fn setup(setup: &SetupPacket) -> Self {
        Self {
            pid: Pid::Setup,
            data: setup.to_bytes().to_vec(),
            actual: 0,
        }
    }

    pub fn input(len: usize) -> Self {
        Self {
            pid: Pid::In,
            data: vec![0; len],
            actual: 0,
        }
    }

    pub fn output(data: Vec<u8>) -> Self {
        Self {
            pid: Pid::Out,
            data,
            actual: 0,
        }
    }

    /// Bytes received, for IN segments.
    pub fn received(&self) -> &[u8] {
        &self.data[..self.actual.min(self.data.len())]
    }
}

/// Completion callback. Receives the IRP back by value.
pub type IrpCallback = Box<dyn FnOnce(Irp) + Send + 'static>;

/// An asynchronous transfer request.
pub struct Irp {
    pub segments: Vec<IrpSegment>,
    /// Transfer timeout enforced by the HCD. `None` uses the HCD default.
    pub timeout: Option<Duration>,
    /// Isochronous: frame to start in, `None` for as soon as possible.
    pub start_frame: Option<u16>,
    /// Isochronous: granularity of data blocks within the buffers.
    pub data_block_size: u32,
    /// Free-form tag for the submitter.
    pub tag: u64,
    id: Option<IrpId>,
    result: Option<Result<(), UsbdError>>,
    callback: Option<IrpCallback>,
}

impl Irp {
    pub fn new(segments: Vec<IrpSegment>) -> Self {
        Self {
            segments,
            timeout: None,
            start_frame: None,
            data_block_size: 0,
            tag: 0,
            id: None,
            result: None,
            callback: None,
        }
    }

    /// Single IN segment of `len` bytes.
    pub fn read(len: usize) -> Self {
        Self::new(vec![IrpSegment::input(len)])
    }

    /// Single OUT segment carrying `data`.
    pub fn write(data: Vec<u8>) -> Self {
        Self::new(vec![IrpSegment::output(data)])
    }

    pub fn with_callback(mut self, callback: impl FnOnce(Irp) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    pub fn id(&self) -> Option<IrpId> {
        self.id
    }

    /// Completion result; `None` while the IRP has not completed.
    pub fn result(&self) -> Option<&Result<(), UsbdError>> {
        self.result.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.result, Some(Ok(())))
    }

    /// Total bytes moved across all data segments.
    pub fn transferred(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.pid != Pid::Setup)
            .map(|s| s.actual)
            .sum()
    }

    /// Bytes received across IN segments, concatenated.
    pub fn received(&self) -> Vec<u8> {
        self.segments
            .iter()
            .filter(|s| s.pid == Pid::In)
            .flat_map(|s| s.received().iter().copied())
            .collect()
    }

    /// Whole packets moved, counting each empty data segment as one packet.
    pub fn packet_count(&self, max_packet_size: u16) -> usize {
        let mps = usize::from(max_packet_size.max(1));
        self.segments
            .iter()
            .filter(|s| s.pid != Pid::Setup)
            .map(|s| if s.actual == 0 { 1 } else { s.actual.div_ceil(mps) })
            .sum()
    }

    /// Record the final result. Called by the HCD.
    pub fn set_result(&mut self, result: Result<(), UsbdError>) {
        self.result = Some(result);
    }

    pub(crate) fn assign_id(&mut self, id: IrpId) {
        self.id = Some(id);
        self.result = None;
    }

    pub(crate) fn take_callback(&mut self) -> Option<IrpCallback> {
        self.callback.take()
    }

    pub(crate) fn set_callback(&mut self, callback: IrpCallback) {
        self.callback = Some(callback);
    }

    /// Hand the IRP back through its callback. A host controller calls this
    /// exactly once per submitted IRP, after [`set_result`](Self::set_result).
    pub fn complete(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl fmt::Debug for Irp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Irp")
            .field("id", &self.id)
            .field("segments", &self.segments.len())
            .field("transferred", &self.transferred())
            .field("result", &self.result)
            .field("tag", &self.tag)
            .finish()
    }
}
