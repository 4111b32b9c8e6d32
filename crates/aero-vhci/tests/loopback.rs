use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aero_vhci::loopback::{
    ChannelHost, HostEvent, LoopbackWorker, LOOPBACK_BULK_OUT_EP, LOOPBACK_DEVICE_DESCRIPTOR,
};
use aero_vhci::{
    feature, FetchTimeout, HubRequest, PortChange, PortStatus, SetupPacket, Transfer,
    TransferHandle, TransferStatus, Vhci, VhciConfig,
};

const PORT: u8 = 2;
const TIMEOUT: Duration = Duration::from_secs(5);

fn wait_give_back(events: &Receiver<HostEvent>, want: TransferHandle) -> (Transfer, TransferStatus) {
    loop {
        match events.recv_timeout(TIMEOUT).expect("controller went quiet") {
            HostEvent::GiveBack {
                handle,
                transfer,
                status,
            } => {
                assert_eq!(handle, want);
                return (transfer, status);
            }
            HostEvent::PollRootHub | HostEvent::ResumeRootHub => {}
        }
    }
}

fn wait_change(vhci: &Vhci, events: &Receiver<HostEvent>, want: PortChange) -> PortStatus {
    loop {
        let port = vhci.port(PORT).unwrap();
        if port.change.contains(want) {
            return port.status;
        }
        events.recv_timeout(TIMEOUT).expect("no root hub poll");
    }
}

fn control(
    vhci: &Vhci,
    events: &Receiver<HostEvent>,
    address: u8,
    setup: SetupPacket,
) -> (Transfer, TransferStatus) {
    let handle = vhci.submit(Transfer::control(address, setup, None)).unwrap();
    wait_give_back(events, handle)
}

#[test]
fn loopback_device_enumerates_and_echoes() {
    let (host, events) = ChannelHost::new();
    let vhci = Vhci::start(&VhciConfig::new(2), Arc::new(host)).unwrap();
    let interrupt = vhci.new_interrupt();
    let worker = {
        let vhci = vhci.clone();
        let interrupt = interrupt.clone();
        thread::spawn(move || {
            let mut worker = LoopbackWorker::new(PORT);
            worker
                .run(&vhci, FetchTimeout::from_millis(20), &interrupt)
                .map(|()| worker.transfers_served)
        })
    };

    let hub = |request| vhci.hub_control(request).unwrap();
    hub(HubRequest::set_port_feature(u16::from(PORT), feature::PORT_POWER));
    let status = wait_change(&vhci, &events, PortChange::C_CONNECTION);
    assert!(status.contains(PortStatus::CONNECTION | PortStatus::HIGH_SPEED));
    hub(HubRequest::clear_port_feature(
        u16::from(PORT),
        feature::C_PORT_CONNECTION,
    ));

    hub(HubRequest::set_port_feature(u16::from(PORT), feature::PORT_RESET));
    let status = wait_change(&vhci, &events, PortChange::C_RESET);
    assert!(status.contains(PortStatus::ENABLE));
    assert!(!status.contains(PortStatus::RESET));
    hub(HubRequest::clear_port_feature(
        u16::from(PORT),
        feature::C_PORT_RESET,
    ));

    let (transfer, status) = control(
        &vhci,
        &events,
        0,
        SetupPacket {
            bm_request_type: 0x80,
            b_request: 0x06,
            w_value: 0x0100,
            w_index: 0,
            w_length: 18,
        },
    );
    assert_eq!(status, TransferStatus::Success);
    assert_eq!(transfer.actual_length, 18);
    assert_eq!(transfer.buffer.unwrap(), LOOPBACK_DEVICE_DESCRIPTOR);

    let (_, status) = control(
        &vhci,
        &events,
        0,
        SetupPacket {
            bm_request_type: 0x00,
            b_request: 0x05,
            w_value: 7,
            w_index: 0,
            w_length: 0,
        },
    );
    assert_eq!(status, TransferStatus::Success);

    // The old address no longer answers.
    let stale = vhci.submit(Transfer::bulk_in(0, 1, 4)).unwrap();
    assert_eq!(wait_give_back(&events, stale).1, TransferStatus::Stall);

    let data: Vec<u8> = (0..64).collect();
    let out = vhci
        .submit(Transfer::bulk_out(7, LOOPBACK_BULK_OUT_EP, data.clone()))
        .unwrap();
    let (sent, status) = wait_give_back(&events, out);
    assert_eq!(status, TransferStatus::Success);
    assert_eq!(sent.actual_length, 64);

    let back = vhci.submit(Transfer::bulk_in(7, 1, 128)).unwrap();
    let (received, status) = wait_give_back(&events, back);
    assert_eq!(status, TransferStatus::Success);
    assert_eq!(received.actual_length, 64);
    assert_eq!(&received.buffer.unwrap()[..64], &data[..]);

    interrupt.trigger();
    let served = worker.join().unwrap().unwrap();
    assert_eq!(served, 5);

    vhci.stop();
    assert_eq!(vhci.queue_summary().total(), 0);
}

#[test]
fn worker_stops_on_shutdown() {
    let (host, _events) = ChannelHost::new();
    let vhci = Vhci::start(&VhciConfig::new(1), Arc::new(host)).unwrap();
    let interrupt = vhci.new_interrupt();
    let worker = {
        let vhci = vhci.clone();
        thread::spawn(move || LoopbackWorker::new(1).run(&vhci, FetchTimeout::Unbounded, &interrupt))
    };
    thread::sleep(Duration::from_millis(20));
    vhci.shutdown();
    assert!(worker.join().unwrap().is_ok());
}
