mod common;

use common::{EventLog, Rig, wait_until};
use parking_lot::Mutex;
use std::sync::Arc;
use usbd::hcd::SimDeviceSpec;
use usbd::model::Direction;
use usbd::usbd::AttachKind;
use usbd::{ClassPattern, Irp, PipeRequest, UsbdClient, UsbdError};

fn vendor_device(product_id: u16) -> SimDeviceSpec {
    SimDeviceSpec::device(0x1209, product_id, 0xFF, 0, 0)
}

#[test]
fn test_unplugging_a_hub_removes_its_subtree() {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    let client = UsbdClient::register(&rig.usbd, "cascade").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::ANY, log.recorder()).unwrap();

    rig.hcd.plug(0, &[1], SimDeviceSpec::hub(4)).unwrap();
    rig.await_node("1-1");
    rig.hcd.plug(0, &[1, 1], SimDeviceSpec::hub(4)).unwrap();
    rig.hcd.plug(0, &[1, 2], vendor_device(1)).unwrap();
    rig.await_node("1-1.1");
    rig.hcd.plug(0, &[1, 1, 1], vendor_device(2)).unwrap();
    rig.hcd.plug(0, &[1, 1, 2], vendor_device(3)).unwrap();

    let paths = ["1-1", "1-1.1", "1-1.2", "1-1.1.1", "1-1.1.2"];
    let nodes: Vec<_> = paths.iter().map(|p| rig.await_node(p)).collect();
    assert_eq!(rig.node_count(), 6);
    // the root hub's control and status pipes
    let baseline_pipes = 2;

    let mut pipes = Vec::new();
    for node in nodes.iter().filter(|n| !n.is_hub()) {
        pipes.push(
            client
                .open_pipe(node.id, PipeRequest::bulk(1, Direction::In, 64))
                .unwrap(),
        );
        pipes.push(
            client
                .open_pipe(node.id, PipeRequest::bulk(2, Direction::Out, 64))
                .unwrap(),
        );
    }

    let pending: Arc<Mutex<Option<Result<(), UsbdError>>>> = Arc::default();
    {
        let pending = pending.clone();
        client
            .transfer(
                pipes[0],
                Irp::read(64).with_callback(move |irp| {
                    *pending.lock() = irp.result().cloned();
                }),
            )
            .unwrap();
    }

    log.clear();
    rig.hcd.unplug(0, &[1]).unwrap();
    for path in paths {
        rig.await_gone(path);
    }
    assert_eq!(rig.node_count(), 1);

    for node in &nodes {
        assert_eq!(client.node_info(node.id).unwrap_err(), UsbdError::BadHandle);
    }
    for pipe in &pipes {
        assert_eq!(client.pipe_info(*pipe).unwrap_err(), UsbdError::BadHandle);
    }
    assert!(wait_until(|| pending.lock().is_some()));
    assert_eq!(*pending.lock(), Some(Err(UsbdError::Canceled)));
    assert!(wait_until(|| rig.hcd.pipe_count() == baseline_pipes));
    assert!(wait_until(|| log.count(AttachKind::Remove) == paths.len()));

    let root = client.root_node(0).unwrap();
    let stats = rig.usbd.statistics(client.handle(), root).unwrap();
    assert_eq!(stats.nodes, 1);

    // every address came back, so the next device gets the lowest one
    rig.hcd.plug(0, &[2], vendor_device(4)).unwrap();
    assert_eq!(rig.await_node("1-2").address, 2);
}

#[test]
fn test_children_are_removed_before_their_hub() {
    let rig = Rig::single(2);
    rig.await_node("usb1");
    let client = UsbdClient::register(&rig.usbd, "order").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::ANY, log.recorder()).unwrap();

    rig.hcd.plug(0, &[2], SimDeviceSpec::hub(2)).unwrap();
    let hub = rig.await_node("1-2");
    rig.hcd.plug(0, &[2, 2], vendor_device(1)).unwrap();
    let dev = rig.await_node("1-2.2");

    log.clear();
    rig.hcd.unplug(0, &[2]).unwrap();
    assert!(wait_until(|| log.count(AttachKind::Remove) == 2));
    let order: Vec<_> = log
        .events()
        .iter()
        .filter(|e| e.kind == AttachKind::Remove)
        .map(|e| e.node)
        .collect();
    assert_eq!(order, vec![dev.id, hub.id]);
}

#[test]
fn test_detach_removes_every_node() {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    let client = UsbdClient::register(&rig.usbd, "detach").unwrap();
    let log = EventLog::default();
    client.subscribe(ClassPattern::ANY, log.recorder()).unwrap();
    rig.hcd.plug(0, &[1], vendor_device(1)).unwrap();
    let dev = rig.await_node("1-1");
    let pipe = client
        .open_pipe(dev.id, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    log.clear();
    rig.usbd.detach_hcd(rig.controller).unwrap();

    assert_eq!(rig.node_count(), 0);
    assert!(!rig.hcd.is_attached());
    assert_eq!(rig.hcd.pipe_count(), 0);
    assert_eq!(client.pipe_info(pipe).unwrap_err(), UsbdError::BadHandle);
    assert_eq!(client.root_node(0).unwrap_err(), UsbdError::BadParam("no such bus"));
    assert!(wait_until(|| log.count(AttachKind::Remove) == 2));
    assert_eq!(rig.usbd.detach_hcd(rig.controller), Err(UsbdError::BadHandle));
}
