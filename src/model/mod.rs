//! USB data model types.

pub mod bandwidth;
pub mod descriptor;
pub mod endpoint;
pub mod hub;
pub mod speed;
pub mod topology;

pub use bandwidth::{BandwidthPool, format_ns, transfer_time_ns};
pub use descriptor::{ClassTuple, ConfigDescriptor, DeviceDescriptor, SetupPacket};
pub use endpoint::{Direction, EndpointDescriptor, TransferType};
pub use hub::{HubDescriptor, PortChange, PortFeature, PortStatus};
pub use speed::UsbSpeed;
pub use topology::{BusTopology, DevicePath, HubInfo, NodeInfo, UsbTopology};
