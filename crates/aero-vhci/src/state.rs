//! Controller state guarded by the single controller lock.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VhciError};
use crate::hub::hub_bitmap_len;
use crate::port::{Port, PortChange, PortStatus};
use crate::registry::{Finished, TransferQueue, TransferRegistry};
use crate::transfer::{Transfer, TransferHandle, TransferStatus};

/// The frame counter is 11 bits wide, like the USB SOF frame number.
const FRAME_NUMBER_MASK: u16 = 0x07ff;

/// Root hub run state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RootHubState {
    Reset,
    Suspended,
    Running,
}

/// Side effects accumulated while the lock is held and carried out after it is released.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub finished: Vec<Finished>,
    pub wake_workers: bool,
    pub poll_root_hub: bool,
    pub resume_root_hub: bool,
}

#[derive(Debug)]
pub(crate) struct ControllerState {
    pub ports: Vec<Port>,
    /// Bit `n` set: port `n` (1-based) has a change the worker has not been told about.
    pub port_update: u32,
    /// Zero-based port the round-robin scan starts from.
    pub port_sched_offset: u8,
    pub registry: TransferRegistry,
    pub rh_state: RootHubState,
    pub hw_accessible: bool,
    pub shut_down: bool,
    pub frame_number: u16,
    pub effects: Effects,
}

impl ControllerState {
    pub fn new(port_count: u8) -> Self {
        Self {
            ports: vec![Port::new(); usize::from(port_count)],
            port_update: 0,
            port_sched_offset: 0,
            registry: TransferRegistry::new(),
            rh_state: RootHubState::Running,
            hw_accessible: true,
            shut_down: false,
            frame_number: 0,
            effects: Effects::default(),
        }
    }

    pub fn port_count(&self) -> u8 {
        // Bounded by `MAX_PORTS` at construction.
        self.ports.len() as u8
    }

    /// Maps a 1-based port number to a port, rejecting 0 and out-of-range values.
    pub fn port_mut(&mut self, port: u16) -> Option<&mut Port> {
        let idx = usize::from(port).checked_sub(1)?;
        self.ports.get_mut(idx)
    }

    /// Records that the worker must be told about `port` (1-based) and wakes it.
    pub fn mark_port_update(&mut self, port: u8) {
        debug_assert!((1..=self.port_count()).contains(&port));
        self.port_update |= 1 << port;
        self.effects.wake_workers = true;
    }

    pub fn any_port_change(&self) -> bool {
        self.ports.iter().any(|p| !p.change.is_empty())
    }

    /// Unlinks a transfer and queues its give-back for after the lock is released.
    pub fn finalize(&mut self, handle: TransferHandle, status: TransferStatus) -> bool {
        match self.registry.finish(handle, status) {
            Some(finished) => {
                tracing::debug!(
                    %handle,
                    status = ?finished.status,
                    actual_length = finished.transfer.actual_length,
                    "giving back transfer"
                );
                self.effects.finished.push(finished);
                true
            }
            None => false,
        }
    }

    pub fn take_effects(&mut self) -> Effects {
        std::mem::take(&mut self.effects)
    }

    pub fn submit(&mut self, transfer: Transfer) -> Result<TransferHandle> {
        if self.shut_down {
            return Err(VhciError::ShutDown);
        }
        let declared = transfer.buffer_length as usize;
        match &transfer.buffer {
            None if declared > 0 => {
                return Err(VhciError::InvalidArgument(
                    "non-empty transfer without a buffer",
                ))
            }
            Some(buffer) if buffer.len() < declared => {
                return Err(VhciError::InvalidArgument(
                    "buffer shorter than declared length",
                ))
            }
            _ => {}
        }
        let address = transfer.address;
        let endpoint = transfer.endpoint_address();
        let handle = self.registry.insert(transfer);
        tracing::debug!(%handle, address, endpoint, "transfer enqueued");
        self.effects.wake_workers = true;
        Ok(handle)
    }

    pub fn cancel(&mut self, handle: TransferHandle) -> Result<()> {
        match self.registry.queue_of(handle) {
            None => Err(VhciError::NotFound),
            Some(TransferQueue::Pending) => {
                tracing::debug!(%handle, "canceling pending transfer");
                self.finalize(handle, TransferStatus::Canceled);
                Ok(())
            }
            Some(TransferQueue::InService) => {
                // The status is decided when the worker answers or the controller shuts down.
                tracing::debug!(%handle, "canceling transfer in service");
                self.registry
                    .move_to(handle, TransferQueue::CancelRequested);
                self.effects.wake_workers = true;
                Ok(())
            }
            Some(TransferQueue::CancelRequested | TransferQueue::CancelAcknowledged) => Ok(()),
        }
    }

    /// Gives back the oldest transfer of `queue` with a shutdown status. Returns `false` once the
    /// queue is empty.
    pub fn shutdown_one(&mut self, queue: TransferQueue) -> bool {
        match self.registry.oldest(queue) {
            Some(handle) => self.finalize(handle, TransferStatus::Shutdown),
            None => false,
        }
    }

    pub fn report_port_event(
        &mut self,
        port: u8,
        change: PortChange,
        status: PortStatus,
    ) -> Result<()> {
        let target = self
            .port_mut(u16::from(port))
            .ok_or(VhciError::InvalidArgument("port out of range"))?;
        target.apply_event(change, status)?;
        tracing::debug!(
            port,
            change = change.bits(),
            status = target.status.bits(),
            "port event applied"
        );
        self.mark_port_update(port);
        self.effects.poll_root_hub = true;
        Ok(())
    }

    pub fn status_bitmap_len(&self) -> usize {
        hub_bitmap_len(self.port_count())
    }

    /// Fills `buf` with the root-hub change bitmap (bit `n` = port `n`). Returns whether any port
    /// has an unacknowledged change.
    pub fn poll_status(&mut self, buf: &mut [u8]) -> bool {
        let len = self.status_bitmap_len().min(buf.len());
        buf[..len].fill(0);
        if !self.hw_accessible {
            return false;
        }

        let mut any = false;
        for (idx, port) in self.ports.iter().enumerate() {
            if port.change.is_empty() {
                continue;
            }
            let bit = idx + 1;
            if let Some(byte) = buf[..len].get_mut(bit / 8) {
                *byte |= 1 << (bit % 8);
            }
            any = true;
        }

        if self.rh_state == RootHubState::Suspended {
            self.effects.resume_root_hub = true;
        }
        any
    }

    /// Suspends every enabled port and moves the root hub to [`RootHubState::Suspended`].
    pub fn bus_suspend(&mut self) {
        for idx in 0..self.port_count() {
            if self.ports[usize::from(idx)].bus_suspend() {
                tracing::debug!(port = idx + 1, "port suspended");
                self.mark_port_update(idx + 1);
            }
        }
        self.rh_state = RootHubState::Suspended;
    }

    pub fn bus_resume(&mut self) -> Result<()> {
        if !self.hw_accessible {
            tracing::warn!("root hub resume while the controller is suspended");
            return Err(VhciError::NotReady);
        }
        self.rh_state = RootHubState::Running;
        Ok(())
    }

    pub fn suspend_controller(&mut self) -> Result<()> {
        if self.rh_state == RootHubState::Running {
            tracing::warn!("controller suspend while the root hub is running");
            return Err(VhciError::Busy);
        }
        self.hw_accessible = false;
        Ok(())
    }

    pub fn resume_controller(&mut self) {
        self.hw_accessible = true;
        self.effects.poll_root_hub = true;
    }

    pub fn tick_1ms(&mut self) {
        self.frame_number = self.frame_number.wrapping_add(1) & FRAME_NUMBER_MASK;
    }
}
