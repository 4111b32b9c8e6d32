//! Completion and data exchange with the worker.
//!
//! The worker pulls OUT data with [`ControllerState::fetch_payload`] and hands results back with
//! [`ControllerState::deliver_completion`]. Both accept handles that have been canceled in the
//! meantime: the transfer is then given back as canceled and the call reports
//! [`VhciError::Canceled`].

use serde::{Deserialize, Serialize};

use crate::error::{CompletionError, Result, VhciError};
use crate::registry::TransferQueue;
use crate::state::ControllerState;
use crate::transfer::{Direction, Transfer, TransferHandle, TransferStatus, TransferType};

/// Per-packet result of an isochronous transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoPacketResult {
    pub status: TransferStatus,
    pub actual_length: u32,
}

/// Result of a transfer as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Giveback {
    pub handle: TransferHandle,
    pub status: TransferStatus,
    pub actual_length: u32,
    #[serde(default)]
    pub error_count: u32,
    /// One entry per packet; required for isochronous transfers.
    #[serde(default)]
    pub iso_results: Option<Vec<IsoPacketResult>>,
    /// Device-to-host data, exactly `actual_length` bytes.
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

impl Giveback {
    pub fn new(handle: TransferHandle, status: TransferStatus) -> Self {
        Self {
            handle,
            status,
            actual_length: 0,
            error_count: 0,
            iso_results: None,
            payload: None,
        }
    }

    /// Successful IN completion carrying `data`.
    pub fn with_data(handle: TransferHandle, data: Vec<u8>) -> Self {
        Self {
            actual_length: data.len() as u32,
            payload: Some(data),
            ..Self::new(handle, TransferStatus::Success)
        }
    }
}

/// Location of one isochronous packet inside the transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsoPacketData {
    pub offset: u32,
    pub length: u32,
}

/// Host-to-device data of an in-service transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub data: Vec<u8>,
    pub iso_packets: Vec<IsoPacketData>,
}

fn check_completion(
    transfer: &Transfer,
    giveback: &Giveback,
) -> std::result::Result<(), CompletionError> {
    let actual = giveback.actual_length;
    let buffer_length = transfer.buffer_length;
    let is_in = transfer.data_direction() == Direction::In;

    if transfer.transfer_type == TransferType::Isochronous {
        if is_in && actual != buffer_length {
            return Err(CompletionError::IsoActualLengthMismatch {
                actual,
                buffer_length,
            });
        }
        let results = giveback.iso_results.as_ref().map_or(0, Vec::len);
        if results != transfer.iso_packets.len() {
            return Err(CompletionError::IsoPacketCountMismatch {
                expected: transfer.iso_packets.len(),
                actual: results,
            });
        }
    } else if actual > buffer_length {
        return Err(CompletionError::ActualLengthExceedsBuffer {
            actual,
            buffer_length,
        });
    }

    match (is_in, &giveback.payload) {
        (true, None) if actual > 0 => Err(CompletionError::MissingPayload { actual }),
        (true, Some(payload)) if payload.len() != actual as usize => {
            Err(CompletionError::PayloadLengthMismatch {
                payload: payload.len(),
                actual,
            })
        }
        (false, Some(_)) => Err(CompletionError::UnexpectedPayload),
        _ => Ok(()),
    }
}

fn apply_completion(transfer: &mut Transfer, giveback: Giveback) {
    if let Some(payload) = giveback.payload {
        if !payload.is_empty() {
            let buffer = transfer.buffer.get_or_insert_with(Vec::new);
            if buffer.len() < payload.len() {
                buffer.resize(payload.len(), 0);
            }
            buffer[..payload.len()].copy_from_slice(&payload);
        }
    }
    if let Some(results) = giveback.iso_results {
        for (packet, result) in transfer.iso_packets.iter_mut().zip(results) {
            packet.status = Some(result.status);
            packet.actual_length = result.actual_length;
        }
    }
    transfer.actual_length = giveback.actual_length;
    transfer.error_count = giveback.error_count;
}

impl ControllerState {
    /// Finds a transfer the worker may still complete: in service first, then the cancel queues.
    fn lookup_for_worker(&self, handle: TransferHandle) -> Result<TransferQueue> {
        match self.registry.queue_of(handle) {
            Some(queue @ (TransferQueue::InService
            | TransferQueue::CancelAcknowledged
            | TransferQueue::CancelRequested)) => Ok(queue),
            Some(TransferQueue::Pending) | None => Err(VhciError::NotFound),
        }
    }

    pub fn deliver_completion(&mut self, giveback: Giveback) -> Result<()> {
        let handle = giveback.handle;
        let queue = self.lookup_for_worker(handle)?;
        let Some(transfer) = self.registry.get_mut(handle) else {
            return Err(VhciError::NotFound);
        };

        let canceled = queue.is_cancel();
        if let Err(err) = check_completion(transfer, &giveback) {
            tracing::warn!(%handle, error = %err, "rejecting invalid completion");
            let status = if canceled {
                TransferStatus::Canceled
            } else {
                TransferStatus::ProtocolError
            };
            self.finalize(handle, status);
            return Err(err.into());
        }

        // Once canceled, the worker's own status no longer counts.
        let status = if canceled {
            TransferStatus::Canceled
        } else {
            giveback.status
        };
        apply_completion(transfer, giveback);
        self.finalize(handle, status);

        if canceled {
            tracing::debug!(%handle, "completion for canceled transfer");
            return Err(VhciError::Canceled);
        }
        Ok(())
    }

    pub fn fetch_payload(&mut self, handle: TransferHandle) -> Result<Payload> {
        let queue = self.lookup_for_worker(handle)?;
        if queue.is_cancel() {
            // The worker has now seen the cancellation; the transfer can go back.
            self.finalize(handle, TransferStatus::Canceled);
            return Err(VhciError::Canceled);
        }
        let transfer = self.registry.get(handle).ok_or(VhciError::NotFound)?;

        let len = transfer.data_length() as usize;
        let is_in = transfer.data_direction() == Direction::In;
        let iso_packets = transfer
            .iso_packets
            .iter()
            .map(|p| IsoPacketData {
                offset: p.offset,
                length: p.length,
            })
            .collect();

        if transfer.transfer_type != TransferType::Isochronous
            && (is_in || len == 0 || transfer.buffer.is_none())
        {
            return Err(VhciError::NoData);
        }

        let data = match (&transfer.buffer, is_in) {
            (Some(buffer), false) => buffer.get(..len).unwrap_or(buffer.as_slice()).to_vec(),
            _ => Vec::new(),
        };
        tracing::trace!(%handle, len = data.len(), "fetch payload");
        Ok(Payload { data, iso_packets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::{Direction, SetupPacket};

    fn in_service(st: &mut ControllerState, transfer: Transfer) -> TransferHandle {
        let handle = st.registry.insert(transfer);
        st.registry.move_to(handle, TransferQueue::InService);
        handle
    }

    #[test]
    fn in_completion_copies_payload() {
        let mut st = ControllerState::new(1);
        let h = in_service(&mut st, Transfer::bulk_in(1, 1, 8));

        st.deliver_completion(Giveback::with_data(h, vec![1, 2, 3]))
            .unwrap();
        let finished = st.take_effects().finished;
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, TransferStatus::Success);
        assert_eq!(finished[0].transfer.actual_length, 3);
        assert_eq!(
            finished[0].transfer.buffer.as_deref(),
            Some(&[1, 2, 3, 0, 0, 0, 0, 0][..])
        );
    }

    #[test]
    fn invalid_completion_is_still_given_back() {
        let mut st = ControllerState::new(1);
        let h = in_service(&mut st, Transfer::bulk_in(1, 1, 4));

        let err = st
            .deliver_completion(Giveback::with_data(h, vec![0; 5]))
            .unwrap_err();
        assert_eq!(
            err,
            VhciError::Completion(CompletionError::ActualLengthExceedsBuffer {
                actual: 5,
                buffer_length: 4
            })
        );
        let finished = st.take_effects().finished;
        assert_eq!(finished[0].status, TransferStatus::ProtocolError);
        assert!(st.registry.is_empty());
    }

    #[test]
    fn out_completion_rejects_payload() {
        let mut st = ControllerState::new(1);
        let h = in_service(&mut st, Transfer::bulk_out(1, 2, vec![9; 4]));
        let mut giveback = Giveback::new(h, TransferStatus::Success);
        giveback.actual_length = 4;
        giveback.payload = Some(vec![9; 4]);
        assert_eq!(
            st.deliver_completion(giveback),
            Err(VhciError::Completion(CompletionError::UnexpectedPayload))
        );
    }

    #[test]
    fn canceled_transfer_keeps_canceled_status() {
        let mut st = ControllerState::new(1);
        let h = in_service(&mut st, Transfer::bulk_in(1, 1, 4));
        st.registry.move_to(h, TransferQueue::CancelAcknowledged);
        assert_eq!(st.registry.get(h).unwrap().status(), None);

        assert_eq!(
            st.deliver_completion(Giveback::with_data(h, vec![7; 4])),
            Err(VhciError::Canceled)
        );
        let finished = st.take_effects().finished;
        assert_eq!(finished[0].status, TransferStatus::Canceled);
        assert_eq!(finished[0].transfer.actual_length, 4);
    }

    #[test]
    fn iso_completion_checks_packet_results() {
        let mut st = ControllerState::new(1);
        let h = in_service(
            &mut st,
            Transfer::isochronous(1, 3, Direction::In, 4, 2, None),
        );
        let mut giveback = Giveback::with_data(h, vec![0xaa; 8]);
        giveback.iso_results = Some(vec![IsoPacketResult {
            status: TransferStatus::Success,
            actual_length: 4,
        }]);
        assert_eq!(
            st.deliver_completion(giveback),
            Err(VhciError::Completion(
                CompletionError::IsoPacketCountMismatch {
                    expected: 2,
                    actual: 1
                }
            ))
        );

        let h = in_service(
            &mut st,
            Transfer::isochronous(1, 3, Direction::In, 4, 2, None),
        );
        let mut giveback = Giveback::with_data(h, vec![0xaa; 8]);
        giveback.iso_results = Some(vec![
            IsoPacketResult {
                status: TransferStatus::Success,
                actual_length: 4,
            },
            IsoPacketResult {
                status: TransferStatus::Crc,
                actual_length: 1,
            },
        ]);
        giveback.error_count = 1;
        st.deliver_completion(giveback).unwrap();
        let finished = st.take_effects().finished;
        let transfer = &finished.last().unwrap().transfer;
        assert_eq!(transfer.error_count, 1);
        assert_eq!(transfer.iso_packets[1].status, Some(TransferStatus::Crc));
        assert_eq!(transfer.iso_packets[1].actual_length, 1);
    }

    #[test]
    fn fetch_payload_returns_out_data() {
        let mut st = ControllerState::new(1);
        let setup = SetupPacket {
            bm_request_type: 0x21,
            b_request: 0x09,
            w_value: 0x0200,
            w_index: 0,
            w_length: 3,
        };
        let h = in_service(&mut st, Transfer::control(1, setup, Some(vec![1, 2, 3, 4])));
        let payload = st.fetch_payload(h).unwrap();
        assert_eq!(payload.data, vec![1, 2, 3]);
        assert!(payload.iso_packets.is_empty());

        let h = in_service(&mut st, Transfer::bulk_in(1, 1, 8));
        assert_eq!(st.fetch_payload(h), Err(VhciError::NoData));

        let h = in_service(
            &mut st,
            Transfer::isochronous(1, 3, Direction::In, 16, 2, None),
        );
        let payload = st.fetch_payload(h).unwrap();
        assert!(payload.data.is_empty());
        assert_eq!(
            payload.iso_packets,
            vec![
                IsoPacketData {
                    offset: 0,
                    length: 16
                },
                IsoPacketData {
                    offset: 16,
                    length: 16
                }
            ]
        );
    }

    #[test]
    fn fetch_payload_for_canceled_transfer_gives_it_back() {
        let mut st = ControllerState::new(1);
        let h = in_service(&mut st, Transfer::bulk_out(1, 2, vec![1; 4]));
        st.registry.move_to(h, TransferQueue::CancelRequested);

        assert_eq!(st.fetch_payload(h), Err(VhciError::Canceled));
        let finished = st.take_effects().finished;
        assert_eq!(finished[0].status, TransferStatus::Canceled);
        assert_eq!(st.fetch_payload(h), Err(VhciError::NotFound));
    }

    #[test]
    fn pending_transfer_is_not_visible_to_worker() {
        let mut st = ControllerState::new(1);
        let h = st.registry.insert(Transfer::bulk_out(1, 2, vec![1; 4]));
        assert_eq!(st.fetch_payload(h), Err(VhciError::NotFound));
        assert_eq!(
            st.deliver_completion(Giveback::new(h, TransferStatus::Success)),
            Err(VhciError::NotFound)
        );
    }
}
