//! In-process worker that emulates a single bulk loopback device.
//!
//! The device enumerates with fixed descriptors, accepts `SET_ADDRESS`/`SET_CONFIGURATION`, and
//! echoes whatever is written to its bulk OUT endpoint back on its bulk IN endpoint. It is used by
//! the `aero-vhci-loopback` binary and by the end-to-end tests.

use std::collections::VecDeque;
use std::sync::mpsc;

use crate::completion::Giveback;
use crate::controller::{FetchInterrupt, FetchTimeout, Vhci, VhciHost};
use crate::dispatch::{TransferWork, Work};
use crate::error::VhciError;
use crate::port::{PortChange, PortFlags, PortStatus};
use crate::transfer::{SetupPacket, Transfer, TransferHandle, TransferStatus, TransferType};

const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;

const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;

pub const LOOPBACK_BULK_IN_EP: u8 = 0x81;
pub const LOOPBACK_BULK_OUT_EP: u8 = 0x01;

/// Device descriptor reported by the loopback device.
pub const LOOPBACK_DEVICE_DESCRIPTOR: [u8; 18] = [
    18,                         // bLength
    USB_DESCRIPTOR_TYPE_DEVICE, // bDescriptorType
    0x00,
    0x02, // bcdUSB 2.00
    0xff, // bDeviceClass (vendor specific)
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    64,   // bMaxPacketSize0
    0x34,
    0x12, // idVendor
    0x78,
    0x56, // idProduct
    0x00,
    0x01, // bcdDevice
    0x00, // iManufacturer
    0x00, // iProduct
    0x00, // iSerialNumber
    0x01, // bNumConfigurations
];

const LOOPBACK_CONFIG_DESCRIPTOR: [u8; 32] = [
    // Configuration
    9,
    USB_DESCRIPTOR_TYPE_CONFIGURATION,
    32,
    0, // wTotalLength
    1, // bNumInterfaces
    1, // bConfigurationValue
    0,
    0x80, // bmAttributes (bus powered)
    50,   // bMaxPower (100 mA)
    // Interface
    9,
    0x04,
    0,
    0,
    2, // bNumEndpoints
    0xff,
    0,
    0,
    0,
    // Bulk IN
    7,
    0x05,
    LOOPBACK_BULK_IN_EP,
    0x02,
    0x00,
    0x02, // wMaxPacketSize 512
    0,
    // Bulk OUT
    7,
    0x05,
    LOOPBACK_BULK_OUT_EP,
    0x02,
    0x00,
    0x02,
    0,
];

/// Events the controller raises towards the kernel side.
#[derive(Debug)]
pub enum HostEvent {
    GiveBack {
        handle: TransferHandle,
        transfer: Transfer,
        status: TransferStatus,
    },
    PollRootHub,
    ResumeRootHub,
}

/// [`VhciHost`] that forwards every callback into a channel.
#[derive(Debug, Clone)]
pub struct ChannelHost {
    tx: mpsc::Sender<HostEvent>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::Receiver<HostEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: HostEvent) {
        // The receiving side going away just means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl VhciHost for ChannelHost {
    fn give_back(&self, handle: TransferHandle, transfer: Transfer, status: TransferStatus) {
        self.send(HostEvent::GiveBack {
            handle,
            transfer,
            status,
        });
    }

    fn poll_root_hub(&self) {
        self.send(HostEvent::PollRootHub);
    }

    fn resume_root_hub(&self) {
        self.send(HostEvent::ResumeRootHub);
    }
}

#[derive(Debug)]
enum Reply {
    In(Vec<u8>),
    Out(u32),
    Stall,
}

/// The emulated device together with the worker loop that serves it.
#[derive(Debug)]
pub struct LoopbackWorker {
    port: u8,
    attached: bool,
    address: u8,
    configuration: u8,
    echo: VecDeque<u8>,
    pub transfers_served: u64,
}

impl LoopbackWorker {
    /// A worker whose device is plugged into `port` (1-based) once that port is powered.
    pub fn new(port: u8) -> Self {
        Self {
            port,
            attached: false,
            address: 0,
            configuration: 0,
            echo: VecDeque::new(),
            transfers_served: 0,
        }
    }

    /// Serves work until the controller shuts down or `interrupt` fires.
    pub fn run(
        &mut self,
        vhci: &Vhci,
        timeout: FetchTimeout,
        interrupt: &FetchInterrupt,
    ) -> crate::Result<()> {
        loop {
            match vhci.fetch_work(timeout, Some(interrupt)) {
                Ok(work) => self.handle(vhci, work)?,
                Err(VhciError::NoWorkAvailable) => continue,
                Err(VhciError::Interrupted | VhciError::ShutDown) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Processes one unit of work.
    pub fn handle(&mut self, vhci: &Vhci, work: Work) -> crate::Result<()> {
        match work {
            Work::Cancel { handle } => {
                tracing::debug!(%handle, "worker dropping canceled transfer");
                let result = vhci.deliver_completion(Giveback::new(handle, TransferStatus::Canceled));
                ignore_resolved(result)
            }
            Work::PortUpdate {
                port,
                status,
                change,
                flags,
            } => self.port_update(vhci, port, status, change, flags),
            Work::ProcessTransfer(work) => {
                let handle = work.handle;
                let reply = self.process(vhci, &work)?;
                self.transfers_served += 1;
                let giveback = match reply {
                    Some(Reply::In(data)) => Giveback::with_data(handle, data),
                    Some(Reply::Out(written)) => Giveback {
                        actual_length: written,
                        ..Giveback::new(handle, TransferStatus::Success)
                    },
                    Some(Reply::Stall) => Giveback::new(handle, TransferStatus::Stall),
                    // Canceled while fetching the payload; already given back.
                    None => return Ok(()),
                };
                ignore_resolved(vhci.deliver_completion(giveback))
            }
        }
    }

    fn port_update(
        &mut self,
        vhci: &Vhci,
        port: u8,
        status: PortStatus,
        change: PortChange,
        flags: PortFlags,
    ) -> crate::Result<()> {
        tracing::debug!(
            port,
            status = status.bits(),
            change = change.bits(),
            "worker port update"
        );
        if port != self.port {
            return Ok(());
        }
        if !status.contains(PortStatus::POWER) {
            self.attached = false;
            self.address = 0;
            self.configuration = 0;
            return Ok(());
        }
        if !self.attached {
            self.attached = true;
            return vhci.report_port_event(
                port,
                PortChange::C_CONNECTION,
                PortStatus::CONNECTION | PortStatus::HIGH_SPEED,
            );
        }
        if status.contains(PortStatus::RESET) {
            self.address = 0;
            self.configuration = 0;
            return vhci.report_port_event(port, PortChange::C_RESET, PortStatus::ENABLE);
        }
        if flags.contains(PortFlags::RESUMING) {
            return vhci.report_port_event(port, PortChange::C_SUSPEND, PortStatus::empty());
        }
        Ok(())
    }

    fn process(&mut self, vhci: &Vhci, work: &TransferWork) -> crate::Result<Option<Reply>> {
        if work.address != self.address {
            return Ok(Some(Reply::Stall));
        }
        match (work.transfer_type, work.endpoint) {
            (TransferType::Control, _) => {
                let Some(setup) = work.setup else {
                    return Ok(Some(Reply::Stall));
                };
                let data = if setup.is_device_to_host() || setup.w_length == 0 {
                    Vec::new()
                } else {
                    match fetch_out(vhci, work.handle)? {
                        Some(data) => data,
                        None => return Ok(None),
                    }
                };
                Ok(Some(self.control(setup, &data)))
            }
            (TransferType::Bulk, LOOPBACK_BULK_OUT_EP) => {
                let Some(data) = fetch_out(vhci, work.handle)? else {
                    return Ok(None);
                };
                self.echo.extend(&data);
                Ok(Some(Reply::Out(data.len() as u32)))
            }
            (TransferType::Bulk, LOOPBACK_BULK_IN_EP) => {
                let len = (work.buffer_length as usize).min(self.echo.len());
                Ok(Some(Reply::In(self.echo.drain(..len).collect())))
            }
            _ => Ok(Some(Reply::Stall)),
        }
    }

    fn control(&mut self, setup: SetupPacket, data: &[u8]) -> Reply {
        let w_length = usize::from(setup.w_length);
        match (setup.bm_request_type, setup.b_request) {
            (0x80, USB_REQUEST_GET_DESCRIPTOR) => {
                let desc: &[u8] = match (setup.w_value >> 8) as u8 {
                    USB_DESCRIPTOR_TYPE_DEVICE => &LOOPBACK_DEVICE_DESCRIPTOR,
                    USB_DESCRIPTOR_TYPE_CONFIGURATION => &LOOPBACK_CONFIG_DESCRIPTOR,
                    _ => return Reply::Stall,
                };
                Reply::In(desc[..desc.len().min(w_length)].to_vec())
            }
            (0x00, USB_REQUEST_SET_ADDRESS) if setup.w_value <= 127 => {
                self.address = setup.w_value as u8;
                tracing::debug!(address = self.address, "loopback device addressed");
                Reply::Out(0)
            }
            (0x00, USB_REQUEST_SET_CONFIGURATION) if setup.w_value <= 1 => {
                self.configuration = setup.w_value as u8;
                Reply::Out(0)
            }
            _ => {
                tracing::debug!(?setup, len = data.len(), "loopback device stalls request");
                Reply::Stall
            }
        }
    }
}

/// Fetches OUT data; `None` if the transfer was canceled in the meantime.
fn fetch_out(vhci: &Vhci, handle: TransferHandle) -> crate::Result<Option<Vec<u8>>> {
    match vhci.fetch_payload(handle) {
        Ok(payload) => Ok(Some(payload.data)),
        Err(VhciError::NoData) => Ok(Some(Vec::new())),
        Err(VhciError::Canceled | VhciError::NotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Completion races with cancellation are expected; the transfer has been resolved either way.
fn ignore_resolved(result: crate::Result<()>) -> crate::Result<()> {
    match result {
        Ok(()) | Err(VhciError::Canceled | VhciError::NotFound) => Ok(()),
        Err(err) => Err(err),
    }
}
