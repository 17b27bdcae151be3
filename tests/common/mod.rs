//! Shared fixtures for the scenario tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use usbd::config::TimingSettings;
use usbd::hcd::SimBusSpec;
use usbd::model::{DevicePath, NodeInfo, UsbSpeed};
use usbd::usbd::{AttachKind, NotifyEvent};
use usbd::{HcdHandle, SimHcd, Usbd, UsbdConfig};

const PATIENCE: Duration = Duration::from_secs(5);

/// Configuration with every hub delay removed.
pub fn config() -> UsbdConfig {
    UsbdConfig {
        timing: TimingSettings::immediate(),
        ..UsbdConfig::default()
    }
}

/// Poll `done` until it holds or a few seconds pass.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

/// A USBD with one simulated controller attached.
pub struct Rig {
    pub usbd: Usbd,
    pub hcd: Arc<SimHcd>,
    pub controller: HcdHandle,
}

impl Rig {
    pub fn new(hcd: SimHcd) -> Self {
        Self::with_config(hcd, config())
    }

    pub fn with_config(hcd: SimHcd, config: UsbdConfig) -> Self {
        let usbd = Usbd::new(config).unwrap();
        let hcd = Arc::new(hcd);
        let controller = usbd.attach_hcd(hcd.clone()).unwrap();
        Self {
            usbd,
            hcd,
            controller,
        }
    }

    /// One full-speed bus with a `ports`-port root hub.
    pub fn single(ports: u8) -> Self {
        Self::new(SimHcd::single_bus(UsbSpeed::Full, ports))
    }

    pub fn with_bus(spec: SimBusSpec) -> Self {
        Self::new(SimHcd::new(vec![spec]))
    }

    /// Snapshot of the node at `path` ("usb1", "1-2", "1-3.1", ...).
    pub fn node(&self, path: &str) -> Option<NodeInfo> {
        self.usbd
            .topology()
            .ok()?
            .get(&DevicePath::new(path))
            .cloned()
    }

    /// Wait for the node at `path` to be enumerated.
    pub fn await_node(&self, path: &str) -> NodeInfo {
        assert!(wait_until(|| self.node(path).is_some()), "{} never enumerated", path);
        self.node(path).unwrap()
    }

    /// Wait for the node at `path` to be gone.
    pub fn await_gone(&self, path: &str) {
        assert!(wait_until(|| self.node(path).is_none()), "{} never removed", path);
    }

    pub fn node_count(&self) -> usize {
        self.usbd
            .topology()
            .map(|t| t.total_device_count())
            .unwrap_or(0)
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        let _ = self.usbd.shutdown();
    }
}

/// Collects notification callbacks.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<NotifyEvent>>>);

impl EventLog {
    pub fn recorder(&self) -> impl Fn(&NotifyEvent) + Send + Sync + 'static {
        let log = self.0.clone();
        move |event: &NotifyEvent| log.lock().push(*event)
    }

    pub fn events(&self) -> Vec<NotifyEvent> {
        self.0.lock().clone()
    }

    pub fn count(&self, kind: AttachKind) -> usize {
        self.0.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}
