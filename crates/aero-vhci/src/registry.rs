//! Transfer registry.
//!
//! Every outstanding transfer lives in a single map keyed by its handle. The entry records which
//! of the four lifecycle queues the transfer currently belongs to; a secondary ordered index
//! `(queue, sequence)` gives FIFO order within each queue. Moving a transfer between queues
//! rewrites its tag and index key, so membership is exclusive by construction.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::transfer::{Transfer, TransferHandle, TransferStatus};

/// Lifecycle queue a transfer currently occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferQueue {
    /// Submitted, not yet fetched by the worker.
    Pending,
    /// Handed to the worker, no completion yet.
    InService,
    /// Canceled by the kernel stack while in service; the worker has not been told yet.
    CancelRequested,
    /// The worker has been told about the cancellation but has not acknowledged it yet.
    CancelAcknowledged,
}

impl TransferQueue {
    /// Drain order used on shutdown.
    pub const ALL: [TransferQueue; 4] = [
        TransferQueue::Pending,
        TransferQueue::InService,
        TransferQueue::CancelRequested,
        TransferQueue::CancelAcknowledged,
    ];

    pub fn is_cancel(self) -> bool {
        matches!(
            self,
            TransferQueue::CancelRequested | TransferQueue::CancelAcknowledged
        )
    }
}

/// Number of transfers per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSummary {
    pub pending: usize,
    pub in_service: usize,
    pub cancel_requested: usize,
    pub cancel_acknowledged: usize,
}

impl QueueSummary {
    pub fn total(&self) -> usize {
        self.pending + self.in_service + self.cancel_requested + self.cancel_acknowledged
    }
}

#[derive(Debug)]
struct Entry {
    transfer: Transfer,
    queue: TransferQueue,
    seq: u64,
}

/// A transfer that has been unlinked from the registry and is ready to be given back.
#[derive(Debug)]
pub(crate) struct Finished {
    pub handle: TransferHandle,
    pub transfer: Transfer,
    pub status: TransferStatus,
}

#[derive(Debug)]
pub(crate) struct TransferRegistry {
    next_handle: u64,
    next_seq: u64,
    entries: HashMap<TransferHandle, Entry>,
    order: BTreeMap<(TransferQueue, u64), TransferHandle>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            next_seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn alloc_handle(&mut self) -> TransferHandle {
        loop {
            let raw = self.next_handle;
            self.next_handle = self.next_handle.wrapping_add(1).max(1);
            if let Some(handle) = TransferHandle::from_raw(raw) {
                if !self.entries.contains_key(&handle) {
                    return handle;
                }
            }
        }
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Adds a transfer to the tail of the pending queue.
    pub fn insert(&mut self, transfer: Transfer) -> TransferHandle {
        let handle = self.alloc_handle();
        let seq = self.alloc_seq();
        self.order.insert((TransferQueue::Pending, seq), handle);
        self.entries.insert(
            handle,
            Entry {
                transfer,
                queue: TransferQueue::Pending,
                seq,
            },
        );
        handle
    }

    pub fn queue_of(&self, handle: TransferHandle) -> Option<TransferQueue> {
        self.entries.get(&handle).map(|e| e.queue)
    }

    pub fn get(&self, handle: TransferHandle) -> Option<&Transfer> {
        self.entries.get(&handle).map(|e| &e.transfer)
    }

    pub fn get_mut(&mut self, handle: TransferHandle) -> Option<&mut Transfer> {
        self.entries.get_mut(&handle).map(|e| &mut e.transfer)
    }

    /// Moves a transfer to the tail of `queue`. Returns `false` if the handle is unknown.
    pub fn move_to(&mut self, handle: TransferHandle, queue: TransferQueue) -> bool {
        let seq = self.alloc_seq();
        let Some(entry) = self.entries.get_mut(&handle) else {
            return false;
        };
        let removed = self.order.remove(&(entry.queue, entry.seq));
        debug_assert_eq!(removed, Some(handle), "queue index out of sync");
        entry.queue = queue;
        entry.seq = seq;
        self.order.insert((queue, seq), handle);
        true
    }

    /// Oldest transfer in `queue`.
    pub fn oldest(&self, queue: TransferQueue) -> Option<TransferHandle> {
        self.order
            .range((queue, 0)..=(queue, u64::MAX))
            .next()
            .map(|(_, handle)| *handle)
    }

    pub fn len(&self, queue: TransferQueue) -> usize {
        self.order.range((queue, 0)..=(queue, u64::MAX)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> QueueSummary {
        QueueSummary {
            pending: self.len(TransferQueue::Pending),
            in_service: self.len(TransferQueue::InService),
            cancel_requested: self.len(TransferQueue::CancelRequested),
            cancel_acknowledged: self.len(TransferQueue::CancelAcknowledged),
        }
    }

    /// Claims `status` (unless a status was already claimed) and unlinks the transfer.
    ///
    /// The returned status is whatever the transfer ended up with, which may differ from
    /// `status` if a cancellation got there first.
    pub fn finish(&mut self, handle: TransferHandle, status: TransferStatus) -> Option<Finished> {
        let entry = self.entries.remove(&handle)?;
        let removed = self.order.remove(&(entry.queue, entry.seq));
        debug_assert_eq!(removed, Some(handle), "queue index out of sync");

        let transfer = entry.transfer;
        transfer.claim_status(status);
        let status = transfer.status().unwrap_or(status);
        Some(Finished {
            handle,
            transfer,
            status,
        })
    }
}
