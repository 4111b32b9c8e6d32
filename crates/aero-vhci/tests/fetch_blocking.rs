mod util;

use std::thread;
use std::time::{Duration, Instant};

use aero_vhci::{FetchTimeout, Transfer, TransferStatus, VhciError, Work};
use util::{get_descriptor, start};

#[test]
fn immediate_fetch_does_not_wait() {
    let (vhci, _host) = start(1);
    let started = Instant::now();
    assert_eq!(
        vhci.fetch_work(FetchTimeout::Immediate, None),
        Err(VhciError::NoWorkAvailable)
    );
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn bounded_fetch_times_out() {
    let (vhci, _host) = start(1);
    let started = Instant::now();
    assert_eq!(
        vhci.fetch_work(FetchTimeout::from_millis(30), None),
        Err(VhciError::NoWorkAvailable)
    );
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[test]
fn blocked_fetch_wakes_on_submit() {
    let (vhci, _host) = start(1);
    let worker = {
        let vhci = vhci.clone();
        thread::spawn(move || vhci.fetch_work(FetchTimeout::Unbounded, None))
    };
    thread::sleep(Duration::from_millis(20));
    let handle = vhci.submit(Transfer::bulk_in(1, 1, 8)).unwrap();

    match worker.join().unwrap() {
        Ok(Work::ProcessTransfer(work)) => assert_eq!(work.handle, handle),
        other => panic!("unexpected fetch result {other:?}"),
    }
}

#[test]
fn interrupt_wakes_blocked_fetch() {
    let (vhci, _host) = start(1);
    let interrupt = vhci.new_interrupt();
    let worker = {
        let vhci = vhci.clone();
        let interrupt = interrupt.clone();
        thread::spawn(move || vhci.fetch_work(FetchTimeout::Unbounded, Some(&interrupt)))
    };
    thread::sleep(Duration::from_millis(20));
    interrupt.trigger();
    assert_eq!(worker.join().unwrap(), Err(VhciError::Interrupted));

    // The trigger is consumed by the fetch that observed it.
    assert!(!interrupt.is_triggered());
    assert_eq!(
        vhci.fetch_work(FetchTimeout::Immediate, Some(&interrupt)),
        Err(VhciError::NoWorkAvailable)
    );
}

#[test]
fn pending_work_wins_over_interrupt() {
    let (vhci, _host) = start(1);
    let interrupt = vhci.new_interrupt();
    interrupt.trigger();
    vhci.submit(Transfer::bulk_in(1, 1, 8)).unwrap();
    assert!(matches!(
        vhci.fetch_work(FetchTimeout::Unbounded, Some(&interrupt)),
        Ok(Work::ProcessTransfer(_))
    ));
    assert_eq!(
        vhci.fetch_work(FetchTimeout::Unbounded, Some(&interrupt)),
        Err(VhciError::Interrupted)
    );
}

#[test]
fn shutdown_releases_blocked_fetch() {
    let (vhci, _host) = start(1);
    let worker = {
        let vhci = vhci.clone();
        thread::spawn(move || vhci.fetch_work(FetchTimeout::Unbounded, None))
    };
    thread::sleep(Duration::from_millis(20));
    vhci.shutdown();
    assert_eq!(worker.join().unwrap(), Err(VhciError::ShutDown));
}

#[test]
fn port_update_wakes_blocked_fetch() {
    let (vhci, _host) = start(2);
    let worker = {
        let vhci = vhci.clone();
        thread::spawn(move || vhci.fetch_work(FetchTimeout::from_millis(1000), None))
    };
    thread::sleep(Duration::from_millis(20));
    util::power_port(&vhci, 2);
    assert!(matches!(
        worker.join().unwrap(),
        Ok(Work::PortUpdate { port: 2, .. })
    ));
}

#[test]
fn malformed_transfer_is_given_back_while_worker_waits() {
    let (vhci, host) = start(1);
    let interrupt = vhci.new_interrupt();
    let worker = {
        let vhci = vhci.clone();
        let interrupt = interrupt.clone();
        thread::spawn(move || vhci.fetch_work(FetchTimeout::Unbounded, Some(&interrupt)))
    };
    thread::sleep(Duration::from_millis(20));

    let mut malformed = Transfer::control(1, get_descriptor(64), None);
    malformed.buffer = None;
    malformed.buffer_length = 0;
    let bad = vhci.submit(malformed).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while host.status_of(bad).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(host.status_of(bad), vec![TransferStatus::Stall]);

    // The worker never saw it and is still waiting.
    assert!(!worker.is_finished());
    interrupt.trigger();
    assert_eq!(worker.join().unwrap(), Err(VhciError::Interrupted));
}

#[test]
fn oversized_bounded_wait_is_capped() {
    let (vhci, _host) = start(1);
    let started = Instant::now();
    assert_eq!(
        vhci.fetch_work(FetchTimeout::Bounded(Duration::MAX), None),
        Err(VhciError::NoWorkAvailable)
    );
    let waited = started.elapsed();
    assert!(waited >= FetchTimeout::MAX_WAIT);
    assert!(waited < FetchTimeout::MAX_WAIT * 5);
}
