//! NIC attachment through the bridge-wrap adapter, and polling.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use harness::{BROADCAST, SMALL_RINGS, attach_open, build_frame, fabric, mac, recv_at_least};
use mvirt_switch::polling::PollingMode;
use mvirt_switch::test_util::MockNic;
use mvirt_switch::{NotifyOutcome, RingRequest, SwitchError};

#[test]
fn test_nic_and_host_stack_bridged_both_ways() {
    let f = fabric(16);
    let mock = harness::register_mock(&f, "eth0");
    let nic = f
        .open_nic("eth0")
        .map(|h| h.nic().clone())
        .expect("nic is free");

    let (hw, host) = f
        .attach("sw0:eth0", true, &RingRequest::default(), None)
        .unwrap();
    assert!(hw.wrap);
    let host = host.expect("host port attached");
    assert_eq!(host.name, "sw0:eth0^");
    assert_eq!(host.port_index, Some(1));

    let v = attach_open(&f, "sw0:v");

    // Wire to bridge.
    let inbound = build_frame(BROADCAST, mac(1), b"from wire");
    mock.inject(0, inbound.clone());
    assert_eq!(nic.interrupt(0), NotifyOutcome::Completed);
    assert_eq!(v.recv(0).unwrap(), vec![inbound.clone()]);
    assert_eq!(mock.transmitted(1), vec![inbound]);

    // Learned: a reply to the wire host stays off the host stack.
    let reply = build_frame(mac(1), mac(2), b"reply");
    v.send(0, &[&reply]).unwrap();
    assert_eq!(mock.transmitted(0), vec![reply]);
    assert!(mock.transmitted(1).is_empty());

    // Host stack to wire.
    let from_host = build_frame(BROADCAST, mac(3), b"from host");
    mock.inject(1, from_host.clone());
    nic.interrupt(1);
    assert_eq!(mock.transmitted(0), vec![from_host.clone()]);
    assert_eq!(v.recv(0).unwrap(), vec![from_host]);
}

#[test]
fn test_nic_ownership() {
    let f = fabric(16);
    harness::register_mock(&f, "eth0");
    assert!(matches!(
        f.register_nic(Arc::new(MockNic::new("eth0")), &SMALL_RINGS),
        Err(SwitchError::PortExists(_))
    ));

    let direct = f.open_nic("eth0").unwrap();
    assert!(matches!(
        f.attach("sw0:eth0", false, &RingRequest::default(), None),
        Err(SwitchError::PortBusy(_))
    ));
    drop(direct);

    f.attach("sw0:eth0", false, &RingRequest::default(), None)
        .unwrap();
    assert!(matches!(f.open_nic("eth0"), Err(SwitchError::PortBusy(_))));
    assert!(matches!(
        f.attach("sw1:eth0", false, &RingRequest::default(), None),
        Err(SwitchError::PortBusy(_))
    ));
    assert!(matches!(
        f.detach("sw0:eth0^", None),
        Err(SwitchError::PortNotFound(_))
    ));

    f.detach("sw0:eth0", None).unwrap();
    assert!(f.bridges().is_empty());
    f.open_nic("eth0").unwrap();
}

#[test]
fn test_host_port_needs_a_nic() {
    let f = fabric(16);
    let err = f
        .attach("sw0:v", true, &RingRequest::default(), None)
        .unwrap_err();
    assert!(matches!(err, SwitchError::InvalidArgument(_)));
    assert!(f.bridges().is_empty());
}

#[test]
fn test_polling_requests_validated() {
    let f = fabric(16);
    harness::register_mock(&f, "eth0");
    attach_open(&f, "sw0:v");
    f.attach("sw0:eth0", false, &RingRequest::default(), None)
        .unwrap();

    assert!(matches!(
        f.polling_enable("sw0:v", PollingMode::SingleCpu, 0, 1),
        Err(SwitchError::NotSupported(_))
    ));
    assert!(matches!(
        f.polling_enable("sw0:eth0", PollingMode::SingleCpu, 0, 0),
        Err(SwitchError::InvalidArgument(_))
    ));
    assert!(matches!(
        f.polling_enable("sw0:eth0", PollingMode::MultiCpu, 0, 2),
        Err(SwitchError::InvalidArgument(_))
    ));
    assert!(matches!(
        f.polling_disable("sw0:eth0"),
        Err(SwitchError::PollingInactive(_))
    ));
}

#[test]
fn test_polling_forwards_without_interrupts() {
    let avail = std::thread::available_parallelism().map_or(1, |n| n.get());
    if avail < 2 {
        return;
    }
    let f = fabric(16);
    let mock = harness::register_mock(&f, "eth0");
    f.attach("sw0:eth0", false, &RingRequest::default(), None)
        .unwrap();
    let v = attach_open(&f, "sw0:v");

    let plan = f
        .polling_enable("sw0:eth0", PollingMode::SingleCpu, 0, 1)
        .unwrap();
    assert_eq!((plan.qfirst, plan.qlast, plan.ncpus), (0, 1, 1));
    assert!(!mock.interrupts_enabled());
    assert!(matches!(
        f.polling_enable("sw0:eth0", PollingMode::SingleCpu, 0, 1),
        Err(SwitchError::PollingActive(_))
    ));
    assert!(matches!(
        f.detach("sw0:eth0", None),
        Err(SwitchError::PortBusy(_))
    ));

    let frames: Vec<_> = (0..8u8)
        .map(|i| build_frame(BROADCAST, mac(1), &[i]))
        .collect();
    for frame in &frames {
        mock.inject(0, frame.clone());
    }
    let got = recv_at_least(&v, frames.len(), Duration::from_secs(5));
    assert_eq!(got, frames);

    f.polling_disable("sw0:eth0").unwrap();
    assert!(mock.interrupts_enabled());
    f.detach("sw0:eth0", None).unwrap();
}

#[test]
fn test_shutdown_stops_polling_and_detaches() {
    let avail = std::thread::available_parallelism().map_or(1, |n| n.get());
    let f = fabric(16);
    let mock = harness::register_mock(&f, "eth0");
    f.attach("sw0:eth0", true, &RingRequest::default(), None)
        .unwrap();
    attach_open(&f, "sw1:v");
    if avail >= 2 {
        f.polling_enable("sw0:eth0", PollingMode::SingleCpu, 0, 1)
            .unwrap();
    }

    f.shutdown();
    assert!(mock.interrupts_enabled());
    assert!(f.list_all().is_empty());
    assert!(f.bridges().is_empty());
    f.open_nic("eth0").unwrap();
}
