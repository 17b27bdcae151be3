mod common;

use common::{Rig, wait_until};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use usbd::hcd::{SimBusSpec, SimDeviceSpec};
use usbd::irp::{DataToggle, IrpSegment};
use usbd::model::descriptor::{
    FEATURE_ENDPOINT_HALT, InterfaceDescriptor, Recipient, RequestKind, request_type,
};
use usbd::model::{Direction, SetupPacket, UsbSpeed};
use usbd::sync::Completion;
use usbd::{HcdFault, Irp, PipeRequest, UsbdClient, UsbdError};

const DEV: &[u8] = &[1];

fn rig_with_device() -> (Rig, UsbdClient, usbd::NodeId) {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    rig.hcd
        .plug(0, DEV, SimDeviceSpec::device(0x1209, 0x0001, 0xFF, 0, 0))
        .unwrap();
    let node = rig.await_node("1-1").id;
    let client = UsbdClient::register(&rig.usbd, "transfers").unwrap();
    (rig, client, node)
}

#[test]
fn test_bulk_in_and_out() {
    let (rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();
    let output = client
        .open_pipe(node, PipeRequest::bulk(2, Direction::Out, 64))
        .unwrap();

    rig.hcd.push_in_data(0, DEV, 0x81, b"ping".to_vec()).unwrap();
    let irp = client.transfer_sync(input, Irp::read(64)).unwrap();
    assert_eq!(irp.received(), b"ping");
    assert_eq!(client.pipe_info(input).unwrap().toggle, DataToggle::Data1);

    let irp = client.transfer_sync(output, Irp::write(b"pong".to_vec())).unwrap();
    assert_eq!(irp.transferred(), 4);
    assert_eq!(rig.hcd.take_out_data(0, DEV, 0x02), vec![b"pong".to_vec()]);

    let root = client.root_node(0).unwrap();
    let stats = rig.usbd.statistics(client.handle(), root).unwrap();
    assert!(stats.transfers_in >= 1);
    assert!(stats.transfers_out >= 1);
    assert_eq!(stats.reserved_ns, rig.usbd.topology().unwrap().buses[0].reserved_ns);
}

#[test]
fn test_in_transfer_waits_for_data() {
    let (rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    let got: Arc<Mutex<Option<Vec<u8>>>> = Arc::default();
    {
        let got = got.clone();
        client
            .transfer(
                input,
                Irp::read(64).with_callback(move |irp| *got.lock() = Some(irp.received())),
            )
            .unwrap();
    }
    thread::sleep(Duration::from_millis(30));
    assert!(got.lock().is_none());
    assert_eq!(client.pipe_info(input).unwrap().in_flight, 1);

    rig.hcd.push_in_data(0, DEV, 0x81, vec![1, 2, 3]).unwrap();
    assert!(wait_until(|| got.lock().is_some()));
    assert_eq!(got.lock().clone(), Some(vec![1, 2, 3]));
    assert!(wait_until(|| client.pipe_info(input).unwrap().in_flight == 0));
}

#[test]
fn test_abort_runs_the_callback_exactly_once() {
    let (_rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let result: Arc<Mutex<Option<Result<(), UsbdError>>>> = Arc::default();
    let id = {
        let calls = calls.clone();
        let result = result.clone();
        client
            .transfer(
                input,
                Irp::read(64).with_callback(move |irp| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *result.lock() = irp.result().cloned();
                }),
            )
            .unwrap()
    };

    client.abort(input, id).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*result.lock(), Some(Err(UsbdError::Canceled)));
    assert_eq!(client.abort(input, id), Err(UsbdError::CannotCancel));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_abort_after_completion_cannot_cancel() {
    let (rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();
    rig.hcd.push_in_data(0, DEV, 0x81, vec![9]).unwrap();
    let irp = client.transfer_sync(input, Irp::read(8)).unwrap();
    let id = irp.id().unwrap();
    assert_eq!(client.abort(input, id), Err(UsbdError::CannotCancel));
}

#[test]
fn test_transfer_timeout() {
    let (_rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();
    let err = client
        .transfer_sync(input, Irp::read(8).with_timeout(Duration::from_millis(20)))
        .unwrap_err();
    assert_eq!(err, UsbdError::Timeout);
}

#[test]
fn test_mismatched_irp_is_rejected_before_the_controller() {
    let (_rig, client, node) = rig_with_device();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    let called = Arc::new(AtomicUsize::new(0));
    let err = {
        let called = called.clone();
        client
            .transfer(
                input,
                Irp::write(vec![1]).with_callback(move |_| {
                    called.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap_err()
    };
    assert!(matches!(err, UsbdError::BadParam(_)));
    assert_eq!(called.load(Ordering::SeqCst), 1);
}

#[test]
fn test_halt_and_clear_halt() {
    let (rig, client, node) = rig_with_device();
    let usbd = client.usbd().clone();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    rig.hcd.push_in_data(0, DEV, 0x81, vec![1]).unwrap();
    client.transfer_sync(input, Irp::read(8)).unwrap();
    assert_eq!(client.pipe_info(input).unwrap().toggle, DataToggle::Data1);

    usbd.set_feature(client.handle(), node, Recipient::Endpoint, FEATURE_ENDPOINT_HALT, 0x81)
        .unwrap();
    assert!(rig.hcd.is_halted(0, DEV, 0x81));
    assert_eq!(
        usbd.get_status(client.handle(), node, Recipient::Endpoint, 0x81).unwrap(),
        1
    );
    let err = client.transfer_sync(input, Irp::read(8)).unwrap_err();
    assert_eq!(err, UsbdError::Hcd(HcdFault::Stall));

    usbd.clear_halt(client.handle(), input).unwrap();
    assert!(!rig.hcd.is_halted(0, DEV, 0x81));
    assert_eq!(client.pipe_info(input).unwrap().toggle, DataToggle::Data0);

    rig.hcd.push_in_data(0, DEV, 0x81, vec![2]).unwrap();
    assert_eq!(client.transfer_sync(input, Irp::read(8)).unwrap().received(), vec![2]);
}

#[test]
fn test_set_configuration_restarts_toggles() {
    let (rig, client, node) = rig_with_device();
    let usbd = client.usbd().clone();
    let input = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();

    for byte in [1u8, 2, 3] {
        rig.hcd.push_in_data(0, DEV, 0x81, vec![byte]).unwrap();
        client.transfer_sync(input, Irp::read(8)).unwrap();
    }
    assert_eq!(client.pipe_info(input).unwrap().toggle, DataToggle::Data1);

    usbd.set_configuration(client.handle(), node, 1).unwrap();
    assert_eq!(usbd.get_configuration(client.handle(), node).unwrap(), 1);
    assert_eq!(client.pipe_info(input).unwrap().toggle, DataToggle::Data0);
}

#[test]
fn test_set_interface_restarts_only_that_interface() {
    let rig = Rig::single(4);
    rig.await_node("usb1");
    let interfaces = (0..2)
        .map(|number| InterfaceDescriptor {
            number,
            alternate: 0,
            class: 0xFF,
            subclass: 0,
            protocol: 0,
            endpoints: Vec::new(),
        })
        .collect();
    rig.hcd
        .plug(0, DEV, SimDeviceSpec::composite(0x1209, 0x0010, interfaces))
        .unwrap();
    let node = rig.await_node("1-1").id;
    let client = UsbdClient::register(&rig.usbd, "alt").unwrap();
    let usbd = client.usbd().clone();
    usbd.set_configuration(client.handle(), node, 1).unwrap();

    let first = client
        .open_pipe(node, PipeRequest::bulk(1, Direction::In, 64))
        .unwrap();
    let second = client
        .open_pipe(node, PipeRequest::bulk(2, Direction::In, 64).with_interface(1, 1))
        .unwrap();
    for (pipe, endpoint) in [(first, 0x81), (second, 0x82)] {
        rig.hcd.push_in_data(0, DEV, endpoint, vec![0]).unwrap();
        client.transfer_sync(pipe, Irp::read(8)).unwrap();
        assert_eq!(client.pipe_info(pipe).unwrap().toggle, DataToggle::Data1);
    }

    usbd.set_interface(client.handle(), node, 1, 0).unwrap();
    assert_eq!(client.pipe_info(first).unwrap().toggle, DataToggle::Data1);
    assert_eq!(client.pipe_info(second).unwrap().toggle, DataToggle::Data0);
}

#[test]
fn test_bandwidth_refusal_leaves_no_pipe() {
    let spec = SimBusSpec::new(UsbSpeed::Full, 4)
        .with_periodic_budget(999_000)
        .with_reserved(900_000);
    let rig = Rig::with_bus(spec);
    rig.await_node("usb1");
    rig.hcd
        .plug(0, &[1], SimDeviceSpec::device(0x1209, 1, 3, 0, 0).with_speed(UsbSpeed::Low))
        .unwrap();
    rig.hcd
        .plug(0, &[2], SimDeviceSpec::device(0x1209, 2, 3, 0, 0))
        .unwrap();
    let slow = rig.await_node("1-1").id;
    let fast = rig.await_node("1-2").id;
    let client = UsbdClient::register(&rig.usbd, "hid").unwrap();
    let root = client.root_node(0).unwrap();

    let reserved = rig.hcd.reserved_ns(0);
    let before = rig.usbd.statistics(client.handle(), root).unwrap().reserved_ns;
    let pipes = rig.hcd.pipe_count();

    let err = client
        .open_pipe(slow, PipeRequest::interrupt(1, Direction::In, 8, 64, 10))
        .unwrap_err();
    assert_eq!(err, UsbdError::Hcd(HcdFault::Bandwidth));
    assert_eq!(rig.hcd.reserved_ns(0), reserved);
    assert_eq!(rig.hcd.pipe_count(), pipes);
    assert_eq!(rig.usbd.statistics(client.handle(), root).unwrap().reserved_ns, before);

    let pipe = client
        .open_pipe(fast, PipeRequest::interrupt(1, Direction::In, 8, 8, 10))
        .unwrap();
    let time_ns = client.pipe_info(pipe).unwrap().time_ns;
    assert!(time_ns > 0);
    assert_eq!(
        rig.usbd.statistics(client.handle(), root).unwrap().reserved_ns,
        before + time_ns
    );

    client.close_pipe(pipe).unwrap();
    assert_eq!(rig.hcd.reserved_ns(0), reserved);
    assert_eq!(rig.usbd.statistics(client.handle(), root).unwrap().reserved_ns, before);
}

#[test]
fn test_one_control_transfer_at_a_time() {
    let (rig, client, node) = rig_with_device();
    rig.hcd.set_control_latency(Duration::from_millis(2));
    let client = Arc::new(client);

    let workers: Vec<_> = (0..4u8)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let usbd = client.usbd().clone();
                for round in 0..5u8 {
                    let data = vec![i, round];
                    usbd.vendor_out(client.handle(), node, Recipient::Device, 1, 0, 0, data)
                        .unwrap();
                    usbd.get_status(client.handle(), node, Recipient::Device, 0)
                        .unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(rig.hcd.max_control_concurrency(0, DEV), 1);
}

#[test]
fn test_control_pipe_shares_the_node_gate() {
    let (rig, client, node) = rig_with_device();
    rig.hcd.set_control_latency(Duration::from_millis(5));
    let pipe = client.open_pipe(node, PipeRequest::control(0, 64)).unwrap();
    let usbd = client.usbd().clone();
    let me = client.handle();

    let writer = thread::spawn(move || {
        for round in 0..10u8 {
            usbd.vendor_out(me, node, Recipient::Device, 1, 0, 0, vec![round, round])
                .unwrap();
        }
    });
    let setup = SetupPacket::new(
        request_type(Direction::In, RequestKind::Vendor, Recipient::Device),
        1,
        0,
        0,
        2,
    );
    for _ in 0..10 {
        let irp = Irp::new(vec![
            IrpSegment::setup(&setup),
            IrpSegment::input(2),
            IrpSegment::output(Vec::new()),
        ]);
        client.transfer_sync(pipe, irp).unwrap();
    }
    writer.join().unwrap();

    assert_eq!(rig.hcd.max_control_concurrency(0, DEV), 1);
}

#[test]
fn test_stalled_callbacks_do_not_hold_up_other_clients() {
    let (rig, slow, node) = rig_with_device();
    let output = slow
        .open_pipe(node, PipeRequest::bulk(2, Direction::Out, 64))
        .unwrap();

    // more completions than a client queue holds, all stuck behind the first
    let hold = Arc::new(Completion::new());
    let ran = Arc::new(AtomicUsize::new(0));
    for i in 0..200u8 {
        let hold = hold.clone();
        let ran = ran.clone();
        let irp = Irp::write(vec![i]).with_callback(move |_| {
            hold.wait();
            ran.fetch_add(1, Ordering::SeqCst);
        });
        slow.transfer(output, irp).unwrap();
    }

    let other = UsbdClient::register(&rig.usbd, "other").unwrap();
    let answered = Arc::new(Completion::new());
    let asker = {
        let usbd = rig.usbd.clone();
        let me = other.handle();
        let answered = answered.clone();
        thread::spawn(move || {
            let status = usbd.get_status(me, node, Recipient::Device, 0);
            answered.signal();
            status
        })
    };
    assert!(answered.wait_timeout(Duration::from_secs(2)));
    asker.join().unwrap().unwrap();

    hold.signal();
    assert!(wait_until(|| ran.load(Ordering::SeqCst) == 200));
    assert!(wait_until(|| slow.pipe_info(output).unwrap().in_flight == 0));
}

#[test]
fn test_async_control_request_completes_on_client_thread() {
    let (rig, client, node) = rig_with_device();
    let usbd = client.usbd().clone();
    usbd.vendor_out(client.handle(), node, Recipient::Device, 1, 0, 0, b"abc".to_vec())
        .unwrap();

    let got: Arc<Mutex<Option<(Vec<u8>, String)>>> = Arc::default();
    {
        let got = got.clone();
        let setup = SetupPacket::new(
            request_type(Direction::In, RequestKind::Vendor, Recipient::Device),
            1,
            0,
            0,
            3,
        );
        usbd.control_request_async(client.handle(), node, setup, Vec::new(), move |irp| {
            let name = thread::current().name().unwrap_or_default().to_string();
            *got.lock() = Some((irp.received(), name));
        })
        .unwrap();
    }
    assert!(wait_until(|| got.lock().is_some()));
    let (data, thread_name) = got.lock().clone().unwrap();
    assert_eq!(data, b"abc");
    assert!(thread_name.starts_with("usbd-client"), "ran on {}", thread_name);
    drop(rig);
}
