//! USB host driver core.
//!
//! Tracks the device tree behind one or more host controllers, enumerates
//! hubs and the devices behind them, and gives client modules pipes,
//! control requests and attach/removal notification.

pub mod api;
pub mod config;
pub mod error;
pub mod handle;
pub mod hcd;
pub mod irp;
pub mod model;
pub mod queue;
pub mod sync;
pub mod usbd;

pub use api::UsbdClient;
pub use config::UsbdConfig;
pub use error::{HcdFault, Result, UsbdError};
pub use handle::{ClientHandle, HcdHandle, NodeId, PipeHandle};
pub use hcd::{HostController, SimHcd};
pub use irp::{Irp, IrpId};
pub use model::{UsbSpeed, UsbTopology};
pub use usbd::{ClassPattern, NotifyEvent, PipeRequest, Usbd};
