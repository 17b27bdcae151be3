mod common;

use common::{EventLog, Rig, config, wait_until};
use std::thread;
use std::time::Duration;
use usbd::hcd::{SimDeviceSpec, SimHcd};
use usbd::model::descriptor::{InterfaceDescriptor, REQ_CLEAR_FEATURE, REQ_SET_FEATURE};
use usbd::model::{PortFeature, UsbSpeed};
use usbd::usbd::AttachKind;
use usbd::{ClassPattern, UsbdClient, UsbdError};

fn vendor_device(product_id: u16) -> SimDeviceSpec {
    SimDeviceSpec::device(0x1209, product_id, 0xFF, 0, 0)
}

fn interface(number: u8, class: u8, subclass: u8, protocol: u8) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alternate: 0,
        class,
        subclass,
        protocol,
        endpoints: Vec::new(),
    }
}

#[test]
fn test_root_hub_takes_first_address() {
    let rig = Rig::single(4);
    let root = rig.await_node("usb1");
    assert_eq!(root.address, 1);
    assert_eq!(root.depth, 0);
    assert_eq!(root.parent, None);
    assert_eq!(root.hub.as_ref().map(|h| h.ports), Some(4));
    assert_eq!(rig.hcd.device_address(0, &[]), Some(1));
}

#[test]
fn test_device_on_port_two_is_enumerated() {
    let rig = Rig::single(4);
    let client = UsbdClient::register(&rig.usbd, "watcher").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::class(0xFF), log.recorder()).unwrap();
    let root = rig.await_node("usb1");

    rig.hcd.plug(0, &[2], vendor_device(0x0002)).unwrap();
    let dev = rig.await_node("1-2");

    assert_eq!(dev.address, 2);
    assert_eq!(dev.depth, 1);
    assert_eq!(dev.parent, Some((root.id, 2)));
    assert_eq!(dev.speed, UsbSpeed::Full);
    assert_eq!(dev.vid_pid(), "1209:0002");
    assert_eq!(rig.hcd.device_address(0, &[2]), Some(2));

    assert!(wait_until(|| log.count(AttachKind::Attach) == 1));
    let event = log.events()[0];
    assert_eq!(event.node, dev.id);
    assert_eq!(event.class, 0xFF);

    let log_on_root = rig.hcd.control_log(0, &[]);
    let reset = log_on_root
        .iter()
        .position(|s| s.request == REQ_SET_FEATURE && s.value == PortFeature::PortReset as u16 && s.index == 2)
        .expect("port 2 was never reset");
    assert!(
        log_on_root[reset..]
            .iter()
            .any(|s| s.request == REQ_CLEAR_FEATURE && s.value == PortFeature::CPortReset as u16 && s.index == 2),
        "reset change never acknowledged"
    );
}

#[test]
fn test_devices_present_before_attach() {
    let hcd = SimHcd::single_bus(UsbSpeed::High, 4);
    hcd.plug(0, &[1], vendor_device(1)).unwrap();
    hcd.plug(0, &[4], vendor_device(4).with_speed(UsbSpeed::Low)).unwrap();
    let rig = Rig::new(hcd);

    let first = rig.await_node("1-1");
    let fourth = rig.await_node("1-4");
    assert_eq!(fourth.speed, UsbSpeed::Low);
    assert_ne!(first.address, fourth.address);
    assert_eq!(rig.node_count(), 3);
}

#[test]
fn test_hub_behind_hub() {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    rig.hcd.plug(0, &[3], SimDeviceSpec::hub(4)).unwrap();
    let hub = rig.await_node("1-3");
    assert!(hub.is_hub());
    assert_eq!(hub.address, 2);

    rig.hcd.plug(0, &[3, 1], vendor_device(7)).unwrap();
    let dev = rig.await_node("1-3.1");
    assert_eq!(dev.depth, 2);
    assert_eq!(dev.parent, Some((hub.id, 1)));
    assert_eq!(dev.address, 3);
}

#[test]
fn test_depth_limit_refuses_deeper_devices() {
    let mut cfg = config();
    cfg.bus.max_tiers = 1;
    let rig = Rig::with_config(SimHcd::single_bus(UsbSpeed::Full, 2), cfg);
    rig.await_node("usb1");

    rig.hcd.plug(0, &[1], SimDeviceSpec::hub(2)).unwrap();
    rig.await_node("1-1");
    rig.hcd.plug(0, &[1, 2], vendor_device(9)).unwrap();

    thread::sleep(Duration::from_millis(200));
    assert!(rig.node("1-1.2").is_none());
    assert_eq!(rig.node_count(), 2);
}

#[test]
fn test_registration_reports_existing_nodes() {
    let hcd = SimHcd::single_bus(UsbSpeed::Full, 4);
    hcd.plug(0, &[1], SimDeviceSpec::device(0x1209, 1, 8, 6, 0x50)).unwrap();
    hcd.plug(0, &[2], SimDeviceSpec::device(0x1209, 2, 8, 6, 0x50)).unwrap();
    hcd.plug(0, &[3], SimDeviceSpec::device(0x1209, 3, 3, 1, 1)).unwrap();
    hcd.plug(
        0,
        &[4],
        SimDeviceSpec::composite(0x1209, 4, vec![interface(0, 3, 0, 0), interface(1, 8, 6, 0x50)]),
    )
    .unwrap();
    let rig = Rig::new(hcd);
    let mass_storage: Vec<_> = ["1-1", "1-2", "1-4"]
        .iter()
        .map(|p| rig.await_node(p).id)
        .collect();
    rig.await_node("1-3");

    let client = UsbdClient::register(&rig.usbd, "storage").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::class(8), log.recorder()).unwrap();

    assert!(wait_until(|| log.events().len() == 3));
    thread::sleep(Duration::from_millis(50));
    let events = log.events();
    assert_eq!(events.len(), 3);
    for node in &mass_storage {
        assert_eq!(events.iter().filter(|e| e.node == *node).count(), 1);
    }
    let composite = events
        .iter()
        .find(|e| e.node == mass_storage[2])
        .unwrap();
    assert_eq!((composite.configuration, composite.interface), (1, 1));
    let whole_device = events
        .iter()
        .find(|e| e.node == mass_storage[0])
        .unwrap();
    assert_eq!(whole_device.configuration, 0);
    assert!(events.iter().all(|e| e.kind == AttachKind::Attach));
}

#[test]
fn test_removal_is_notified_and_unsubscribe_stops_events() {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    let client = UsbdClient::register(&rig.usbd, "watcher").unwrap();
    let log = EventLog::default();
    let id = client.subscribe(ClassPattern::class(0xFF), log.recorder()).unwrap();

    rig.hcd.plug(0, &[1], vendor_device(1)).unwrap();
    let dev = rig.await_node("1-1");
    rig.hcd.unplug(0, &[1]).unwrap();
    rig.await_gone("1-1");
    assert!(wait_until(|| log.count(AttachKind::Remove) == 1));
    let removed = log.events().into_iter().find(|e| e.kind == AttachKind::Remove).unwrap();
    assert_eq!(removed.node, dev.id);

    client.unsubscribe(id).unwrap();
    assert_eq!(client.unsubscribe(id), Err(UsbdError::BadParam("no such notification")));
    log.clear();
    rig.hcd.plug(0, &[1], vendor_device(1)).unwrap();
    rig.await_node("1-1");
    thread::sleep(Duration::from_millis(50));
    assert!(log.events().is_empty());
}

#[test]
fn test_reconnect_gets_a_fresh_node() {
    let rig = Rig::single(2);
    rig.await_node("usb1");
    rig.hcd.plug(0, &[1], vendor_device(1)).unwrap();
    let before = rig.await_node("1-1");

    rig.hcd.unplug(0, &[1]).unwrap();
    rig.await_gone("1-1");
    rig.hcd.plug(0, &[1], vendor_device(2)).unwrap();
    let after = rig.await_node("1-1");

    assert_ne!(before.id, after.id);
    assert_eq!(after.product_id, 2);
    let client = UsbdClient::register(&rig.usbd, "late").unwrap();
    assert_eq!(client.node_info(before.id).unwrap_err(), UsbdError::BadHandle);
}

#[test]
fn test_swap_without_pause_rebuilds_the_port() {
    let rig = Rig::single(2);
    rig.await_node("usb1");
    let client = UsbdClient::register(&rig.usbd, "swapper").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::class(0xFF), log.recorder()).unwrap();

    rig.hcd.plug(0, &[1], vendor_device(1)).unwrap();
    let before = rig.await_node("1-1");
    assert!(wait_until(|| log.count(AttachKind::Attach) == 1));

    // both edges may land in a single status poll
    rig.hcd.unplug(0, &[1]).unwrap();
    rig.hcd.plug(0, &[1], vendor_device(2)).unwrap();

    assert!(wait_until(|| rig.node("1-1").is_some_and(|n| n.product_id == 2)));
    let after = rig.await_node("1-1");
    assert_ne!(before.id, after.id);
    assert!(wait_until(|| log.count(AttachKind::Attach) == 2));
    assert_eq!(log.count(AttachKind::Remove), 1);

    let removed = log.events().into_iter().find(|e| e.kind == AttachKind::Remove).unwrap();
    assert_eq!(removed.node, before.id);
    let attached = log.events().into_iter().rev().find(|e| e.kind == AttachKind::Attach).unwrap();
    assert_eq!(attached.node, after.id);
    assert_eq!(client.node_info(before.id).unwrap_err(), UsbdError::BadHandle);
}
