//! Work dispatcher: picks the next unit of work for the worker.
//!
//! Priority is strict: cancellations first (the worker must stop touching those buffers), then
//! port updates (round-robin so a busy port cannot starve the others), then new transfers.

use serde::{Deserialize, Serialize};

use crate::port::{PortChange, PortFlags, PortStatus};
use crate::registry::TransferQueue;
use crate::state::ControllerState;
use crate::transfer::{
    Direction, SetupPacket, Transfer, TransferFlags, TransferHandle, TransferStatus, TransferType,
};

/// One unit of work handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Work {
    /// Stop processing the transfer; answer with a completion or a payload fetch.
    Cancel { handle: TransferHandle },
    /// Current registers of a port (1-based) whose state changed.
    PortUpdate {
        port: u8,
        status: PortStatus,
        change: PortChange,
        flags: PortFlags,
    },
    /// Perform a transfer.
    ProcessTransfer(TransferWork),
}

/// Descriptor of a transfer handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferWork {
    pub handle: TransferHandle,
    pub address: u8,
    /// Endpoint address, bit 7 set for IN pipes.
    pub endpoint: u8,
    pub transfer_type: TransferType,
    pub flags: TransferFlags,
    /// Bytes to move; `wLength` for control transfers.
    pub buffer_length: u32,
    pub setup: Option<SetupPacket>,
    pub interval: u32,
    pub packet_count: u32,
}

/// Checks that a pending transfer can be handed to the worker.
fn validate(transfer: &Transfer) -> Result<(), &'static str> {
    let has_buffer = transfer.buffer.is_some();
    if transfer.transfer_type == TransferType::Control {
        let Some(setup) = transfer.setup else {
            return Err("control transfer without setup packet");
        };
        let w_length = u32::from(setup.w_length);
        if w_length > transfer.buffer_length {
            return Err("wLength exceeds transfer buffer");
        }
        if setup.is_device_to_host() {
            if w_length == 0 || !has_buffer {
                return Err("IN control transfer needs a data stage and a buffer");
            }
        } else if w_length > 0 && !has_buffer {
            return Err("OUT control data stage without buffer");
        }
    } else {
        match transfer.direction {
            Direction::In => {
                if transfer.buffer_length == 0 || !has_buffer {
                    return Err("IN transfer needs a non-empty buffer");
                }
            }
            Direction::Out => {
                if transfer.buffer_length > 0 && !has_buffer {
                    return Err("OUT transfer data without buffer");
                }
            }
        }
    }
    Ok(())
}

fn describe(handle: TransferHandle, transfer: &Transfer) -> TransferWork {
    TransferWork {
        handle,
        address: transfer.address,
        endpoint: transfer.endpoint_address(),
        transfer_type: transfer.transfer_type,
        flags: transfer.flags,
        buffer_length: transfer.data_length(),
        setup: match transfer.transfer_type {
            TransferType::Control => transfer.setup,
            _ => None,
        },
        interval: transfer.interval,
        packet_count: transfer.iso_packets.len() as u32,
    }
}

impl ControllerState {
    /// Whether a fetch would find something to report (malformed transfers count; they are
    /// consumed by the fetch that finds them).
    pub fn has_work(&self) -> bool {
        self.port_update != 0
            || self.registry.oldest(TransferQueue::CancelRequested).is_some()
            || self.registry.oldest(TransferQueue::Pending).is_some()
    }

    pub fn next_work(&mut self) -> Option<Work> {
        if let Some(handle) = self.registry.oldest(TransferQueue::CancelRequested) {
            tracing::debug!(%handle, "fetch work: cancel");
            self.registry
                .move_to(handle, TransferQueue::CancelAcknowledged);
            return Some(Work::Cancel { handle });
        }

        if let Some(work) = self.next_port_update() {
            return Some(work);
        }

        // Pending transfers left at shutdown belong to the drain.
        if self.shut_down {
            return None;
        }
        while let Some(handle) = self.registry.oldest(TransferQueue::Pending) {
            let transfer = self.registry.get(handle)?;
            if let Err(reason) = validate(transfer) {
                tracing::debug!(%handle, reason, "rejecting malformed transfer");
                self.finalize(handle, TransferStatus::Stall);
                continue;
            }
            let work = describe(handle, transfer);
            tracing::debug!(
                %handle,
                address = work.address,
                endpoint = work.endpoint,
                ty = ?work.transfer_type,
                len = work.buffer_length,
                "fetch work: process transfer"
            );
            self.registry.move_to(handle, TransferQueue::InService);
            return Some(Work::ProcessTransfer(work));
        }

        None
    }

    fn next_port_update(&mut self) -> Option<Work> {
        if self.port_update == 0 {
            return None;
        }
        let count = self.port_count();
        if self.port_sched_offset >= count {
            self.port_sched_offset = 0;
        }
        for i in 0..count {
            let idx = (i + self.port_sched_offset) % count;
            let bit = 1u32 << (idx + 1);
            if self.port_update & bit == 0 {
                continue;
            }
            self.port_update &= !bit;
            self.port_sched_offset = idx + 1;

            let port = self.ports[usize::from(idx)];
            tracing::debug!(
                port = idx + 1,
                status = port.status.bits(),
                change = port.change.bits(),
                "fetch work: port update"
            );
            return Some(Work::PortUpdate {
                port: idx + 1,
                status: port.status,
                change: port.change,
                flags: port.flags,
            });
        }
        debug_assert!(false, "port update bit set for nonexistent port");
        self.port_update = 0;
        None
    }
}
