//! Configuration loading and management.

mod loader;

pub use loader::{
    BusSettings, ClientSettings, ConfigError, HandleSettings, MAX_TIERS, MIN_CLIENT_QUEUE_DEPTH,
    TimingSettings, UsbdConfig, example_config,
};
