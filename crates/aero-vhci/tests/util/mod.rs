#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aero_vhci::{
    feature, HubRequest, SetupPacket, Transfer, TransferHandle, TransferStatus, TransferWork,
    Vhci, VhciConfig, VhciHost, Work,
};

/// Records every host callback.
#[derive(Default)]
pub struct RecordingHost {
    given_back: Mutex<Vec<(TransferHandle, Transfer, TransferStatus)>>,
    polls: AtomicUsize,
    resumes: AtomicUsize,
}

impl RecordingHost {
    pub fn given_back(&self) -> Vec<(TransferHandle, TransferStatus)> {
        self.given_back
            .lock()
            .unwrap()
            .iter()
            .map(|(handle, _, status)| (*handle, *status))
            .collect()
    }

    pub fn status_of(&self, handle: TransferHandle) -> Vec<TransferStatus> {
        self.given_back
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _, _)| *h == handle)
            .map(|(_, _, status)| *status)
            .collect()
    }

    /// Removes and returns the transfer given back under `handle`.
    pub fn take(&self, handle: TransferHandle) -> Option<(Transfer, TransferStatus)> {
        let mut given_back = self.given_back.lock().unwrap();
        let idx = given_back.iter().position(|(h, _, _)| *h == handle)?;
        let (_, transfer, status) = given_back.remove(idx);
        Some((transfer, status))
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn resumes(&self) -> usize {
        self.resumes.load(Ordering::SeqCst)
    }
}

impl VhciHost for RecordingHost {
    fn give_back(&self, handle: TransferHandle, transfer: Transfer, status: TransferStatus) {
        self.given_back
            .lock()
            .unwrap()
            .push((handle, transfer, status));
    }

    fn poll_root_hub(&self) {
        self.polls.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_root_hub(&self) {
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn start(ports: u8) -> (Vhci, Arc<RecordingHost>) {
    let host = Arc::new(RecordingHost::default());
    let vhci = Vhci::start(&VhciConfig::new(ports), host.clone()).unwrap();
    (vhci, host)
}

pub fn fetch_now(vhci: &Vhci) -> aero_vhci::Result<Work> {
    vhci.fetch_work(aero_vhci::FetchTimeout::Immediate, None)
}

pub fn expect_transfer(vhci: &Vhci) -> TransferWork {
    match fetch_now(vhci) {
        Ok(Work::ProcessTransfer(work)) => work,
        other => panic!("expected a transfer, got {other:?}"),
    }
}

/// Drains port updates until the queue has none left.
pub fn drain_port_updates(vhci: &Vhci) {
    while let Ok(Work::PortUpdate { .. }) = fetch_now(vhci) {}
}

pub fn power_port(vhci: &Vhci, port: u16) {
    vhci.hub_control(HubRequest::set_port_feature(port, feature::PORT_POWER))
        .unwrap();
}

pub fn get_descriptor(length: u16) -> SetupPacket {
    SetupPacket {
        bm_request_type: 0x80,
        b_request: 0x06,
        w_value: 0x0100,
        w_index: 0,
        w_length: length,
    }
}
