//! Transfer data model.
//!
//! A [`Transfer`] is submitted by the kernel-side USB stack, owned by the controller while it is
//! outstanding and handed back through [`crate::VhciHost::give_back`] exactly once.

use core::fmt;
use core::num::NonZeroU64;

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU8;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU8;

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque identifier of an outstanding transfer.
///
/// Handles are never zero and are not reused while the transfer they name is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferHandle(NonZeroU64);

impl TransferHandle {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn as_raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0.get())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Device-to-host.
    In,
    /// Host-to-device.
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct TransferFlags: u16 {
        /// A short IN packet is an error rather than the end of the transfer.
        const SHORT_NOT_OK = 1 << 0;
        /// Schedule isochronous packets as soon as possible.
        const ISO_ASAP = 1 << 1;
        /// Terminate an OUT transfer that fills its last packet with a zero-length packet.
        const ZERO_PACKET = 1 << 2;
    }
}

impl_bits_serde!(TransferFlags, u16);

/// Standard 8-byte USB control request header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & 0x80) != 0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let [v0, v1] = self.w_value.to_le_bytes();
        let [i0, i1] = self.w_index.to_le_bytes();
        let [l0, l1] = self.w_length.to_le_bytes();
        [self.bm_request_type, self.b_request, v0, v1, i0, i1, l0, l1]
    }
}

/// Terminal status of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Success,
    /// Short packet on a transfer flagged [`TransferFlags::SHORT_NOT_OK`].
    ShortPacket,
    /// Endpoint stalled, or the transfer was rejected as malformed before reaching the worker.
    Stall,
    Timeout,
    Babble,
    Crc,
    BitStuff,
    Overflow,
    /// The device went away while the transfer was outstanding.
    Disconnected,
    /// The worker returned inconsistent completion data.
    ProtocolError,
    Canceled,
    Shutdown,
}

const STATUS_IN_PROGRESS: u8 = 0xff;

impl TransferStatus {
    fn code(self) -> u8 {
        match self {
            TransferStatus::Success => 0,
            TransferStatus::ShortPacket => 1,
            TransferStatus::Stall => 2,
            TransferStatus::Timeout => 3,
            TransferStatus::Babble => 4,
            TransferStatus::Crc => 5,
            TransferStatus::BitStuff => 6,
            TransferStatus::Overflow => 7,
            TransferStatus::Disconnected => 8,
            TransferStatus::ProtocolError => 9,
            TransferStatus::Canceled => 10,
            TransferStatus::Shutdown => 11,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TransferStatus::Success,
            1 => TransferStatus::ShortPacket,
            2 => TransferStatus::Stall,
            3 => TransferStatus::Timeout,
            4 => TransferStatus::Babble,
            5 => TransferStatus::Crc,
            6 => TransferStatus::BitStuff,
            7 => TransferStatus::Overflow,
            8 => TransferStatus::Disconnected,
            9 => TransferStatus::ProtocolError,
            10 => TransferStatus::Canceled,
            11 => TransferStatus::Shutdown,
            _ => return None,
        })
    }
}

/// Completion status cell that can be written exactly once.
///
/// The cell starts out "in progress". [`StatusSlot::claim`] performs a compare-and-set so that
/// when a cancellation and a worker completion race, the first writer wins and the loser
/// observes the already-claimed value.
#[derive(Debug)]
pub struct StatusSlot(AtomicU8);

impl StatusSlot {
    pub fn new() -> Self {
        Self(AtomicU8::new(STATUS_IN_PROGRESS))
    }

    /// Sets the status if it is still in progress. Returns `true` if this call won.
    pub fn claim(&self, status: TransferStatus) -> bool {
        self.0
            .compare_exchange(
                STATUS_IN_PROGRESS,
                status.code(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns the claimed status, or `None` while the transfer is still in progress.
    pub fn get(&self) -> Option<TransferStatus> {
        TransferStatus::from_code(self.0.load(Ordering::Acquire))
    }
}

impl Default for StatusSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Isochronous packet descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: Option<TransferStatus>,
}

impl IsoPacket {
    pub fn new(offset: u32, length: u32) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: None,
        }
    }
}

/// One USB request as submitted by the kernel-side stack.
#[derive(Debug)]
pub struct Transfer {
    pub address: u8,
    /// Endpoint number (0..=15), without the direction bit.
    pub endpoint: u8,
    /// Pipe direction. Control transfers take their data direction from the setup packet.
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub flags: TransferFlags,
    pub interval: u32,
    /// Declared transfer length in bytes.
    pub buffer_length: u32,
    pub buffer: Option<Vec<u8>>,
    pub setup: Option<SetupPacket>,
    pub iso_packets: Vec<IsoPacket>,
    pub actual_length: u32,
    pub error_count: u32,
    status: StatusSlot,
}

impl Transfer {
    pub fn new(
        address: u8,
        endpoint: u8,
        direction: Direction,
        transfer_type: TransferType,
        buffer_length: u32,
        buffer: Option<Vec<u8>>,
    ) -> Self {
        Self {
            address,
            endpoint,
            direction,
            transfer_type,
            flags: TransferFlags::empty(),
            interval: 0,
            buffer_length,
            buffer,
            setup: None,
            iso_packets: Vec::new(),
            actual_length: 0,
            error_count: 0,
            status: StatusSlot::new(),
        }
    }

    /// Control transfer on endpoint 0 with a buffer sized from `wLength`.
    pub fn control(address: u8, setup: SetupPacket, data: Option<Vec<u8>>) -> Self {
        let buffer_length = u32::from(setup.w_length);
        let buffer = match data {
            Some(data) => Some(data),
            None if buffer_length > 0 => Some(vec![0; buffer_length as usize]),
            None => None,
        };
        let mut transfer = Self::new(
            address,
            0,
            if setup.is_device_to_host() {
                Direction::In
            } else {
                Direction::Out
            },
            TransferType::Control,
            buffer_length,
            buffer,
        );
        transfer.setup = Some(setup);
        transfer
    }

    pub fn bulk_in(address: u8, endpoint: u8, length: u32) -> Self {
        Self::new(
            address,
            endpoint,
            Direction::In,
            TransferType::Bulk,
            length,
            Some(vec![0; length as usize]),
        )
    }

    pub fn bulk_out(address: u8, endpoint: u8, data: Vec<u8>) -> Self {
        let len = data.len() as u32;
        Self::new(
            address,
            endpoint,
            Direction::Out,
            TransferType::Bulk,
            len,
            Some(data),
        )
    }

    /// Isochronous transfer whose buffer is split into `packets` consecutive packets of
    /// `packet_length` bytes.
    pub fn isochronous(
        address: u8,
        endpoint: u8,
        direction: Direction,
        packet_length: u32,
        packets: u32,
        data: Option<Vec<u8>>,
    ) -> Self {
        let buffer_length = packet_length * packets;
        let buffer = data.unwrap_or_else(|| vec![0; buffer_length as usize]);
        let mut transfer = Self::new(
            address,
            endpoint,
            direction,
            TransferType::Isochronous,
            buffer_length,
            Some(buffer),
        );
        transfer.iso_packets = (0..packets)
            .map(|i| IsoPacket::new(i * packet_length, packet_length))
            .collect();
        transfer
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    /// Direction of the data stage as seen by the worker.
    pub fn data_direction(&self) -> Direction {
        match (self.transfer_type, self.setup) {
            (TransferType::Control, Some(setup)) if setup.is_device_to_host() => Direction::In,
            (TransferType::Control, Some(_)) => Direction::Out,
            _ => self.direction,
        }
    }

    /// Endpoint address with bit 7 set for IN pipes.
    pub fn endpoint_address(&self) -> u8 {
        match self.direction {
            Direction::In => self.endpoint | 0x80,
            Direction::Out => self.endpoint,
        }
    }

    /// Number of bytes the data stage actually moves (`wLength` for control transfers).
    pub fn data_length(&self) -> u32 {
        match (self.transfer_type, self.setup) {
            (TransferType::Control, Some(setup)) => u32::from(setup.w_length),
            _ => self.buffer_length,
        }
    }

    pub fn status(&self) -> Option<TransferStatus> {
        self.status.get()
    }

    pub(crate) fn claim_status(&self, status: TransferStatus) -> bool {
        self.status.claim(status)
    }
}


#[cfg(all(feature = "loom", test))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn concurrent_claims_have_exactly_one_winner() {
        loom::model(|| {
            let slot = Arc::new(StatusSlot::new());

            let cancel = {
                let slot = slot.clone();
                thread::spawn(move || slot.claim(TransferStatus::Canceled))
            };
            let complete = {
                let slot = slot.clone();
                thread::spawn(move || slot.claim(TransferStatus::Success))
            };

            let canceled_won = cancel.join().unwrap();
            let completed_won = complete.join().unwrap();
            assert!(canceled_won ^ completed_won);

            let expected = if canceled_won {
                TransferStatus::Canceled
            } else {
                TransferStatus::Success
            };
            assert_eq!(slot.get(), Some(expected));
        });
    }
}
