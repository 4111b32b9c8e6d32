//! The virtual host controller: one lock, one wait condition, and the host callbacks.
//!
//! Every entry point takes the controller lock for its whole duration. Give-backs and root-hub
//! notifications collected while the lock is held are delivered to the [`VhciHost`] after it has
//! been released, so a host may submit new transfers from inside `give_back`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::completion::{Giveback, Payload};
use crate::config::VhciConfig;
use crate::dispatch::Work;
use crate::error::{Result, VhciError};
use crate::port::{Port, PortChange, PortStatus};
use crate::registry::{QueueSummary, TransferQueue};
use crate::state::{ControllerState, Effects, RootHubState};
use crate::transfer::{Transfer, TransferHandle, TransferStatus};

/// Callbacks into the kernel-side USB stack.
pub trait VhciHost: Send + Sync {
    /// Returns a finished transfer to its submitter. Called exactly once per transfer, without
    /// the controller lock held.
    fn give_back(&self, handle: TransferHandle, transfer: Transfer, status: TransferStatus);

    /// A root-hub status poll is due.
    fn poll_root_hub(&self);

    /// The suspended root hub should be resumed.
    fn resume_root_hub(&self) {}
}

/// How long [`Vhci::fetch_work`] may wait for work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchTimeout {
    Immediate,
    Bounded(Duration),
    Unbounded,
}

impl FetchTimeout {
    pub const MAX_WAIT: Duration = Duration::from_millis(1000);

    /// Wait used by callers that do not pass an explicit timeout.
    pub const DEFAULT: FetchTimeout = FetchTimeout::Bounded(Duration::from_millis(100));

    /// Maps a millisecond count: zero polls, positive values wait (capped at
    /// [`FetchTimeout::MAX_WAIT`]), negative values wait forever.
    pub fn from_millis(ms: i16) -> Self {
        match ms {
            0 => FetchTimeout::Immediate,
            ms if ms < 0 => FetchTimeout::Unbounded,
            ms => FetchTimeout::bounded(Duration::from_millis(ms as u64)),
        }
    }

    pub fn bounded(wait: Duration) -> Self {
        if wait.is_zero() {
            FetchTimeout::Immediate
        } else {
            FetchTimeout::Bounded(wait.min(Self::MAX_WAIT))
        }
    }
}

impl Default for FetchTimeout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

struct Shared {
    state: Mutex<ControllerState>,
    work_ready: Condvar,
    host: Arc<dyn VhciHost>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Interrupts a blocked [`Vhci::fetch_work`] from another thread.
///
/// Triggering wakes every waiter; the fetch that observes the trigger consumes it and fails with
/// [`VhciError::Interrupted`].
#[derive(Clone)]
pub struct FetchInterrupt {
    flag: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl FetchInterrupt {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        // Taking the lock orders the flag store against a waiter that has checked the flag but
        // not started waiting yet.
        drop(self.shared.lock());
        self.shared.work_ready.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for FetchInterrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchInterrupt")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Handle to a running virtual host controller. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Vhci {
    shared: Arc<Shared>,
    port_count: u8,
}

impl std::fmt::Debug for Vhci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vhci")
            .field("port_count", &self.port_count)
            .finish_non_exhaustive()
    }
}

impl Vhci {
    pub fn start(config: &VhciConfig, host: Arc<dyn VhciHost>) -> Result<Self> {
        config.validate()?;
        tracing::info!(ports = config.port_count, "starting virtual host controller");
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState::new(config.port_count)),
                work_ready: Condvar::new(),
                host,
            }),
            port_count: config.port_count,
        })
    }

    pub fn port_count(&self) -> u8 {
        self.port_count
    }

    fn run_effects(&self, effects: Effects) {
        let Effects {
            finished,
            wake_workers,
            poll_root_hub,
            resume_root_hub,
        } = effects;
        if wake_workers {
            self.shared.work_ready.notify_all();
        }
        let host = &self.shared.host;
        for done in finished {
            host.give_back(done.handle, done.transfer, done.status);
        }
        if resume_root_hub {
            host.resume_root_hub();
        }
        if poll_root_hub {
            host.poll_root_hub();
        }
    }

    /// Runs `f` under the controller lock, then carries out the effects it queued.
    fn with_state<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
        let (result, effects) = {
            let mut state = self.shared.lock();
            let result = f(&mut state);
            (result, state.take_effects())
        };
        self.run_effects(effects);
        result
    }

    // Kernel-side entry points.

    pub fn submit(&self, transfer: Transfer) -> Result<TransferHandle> {
        self.with_state(|st| st.submit(transfer))
    }

    /// Cancels a transfer. A transfer the worker already owns is given back once the worker has
    /// acknowledged the cancellation.
    pub fn cancel(&self, handle: TransferHandle) -> Result<()> {
        self.with_state(|st| st.cancel(handle))
    }

    /// Bytes needed by [`Vhci::poll_status`].
    pub fn status_bitmap_len(&self) -> usize {
        crate::hub::hub_bitmap_len(self.port_count)
    }

    pub fn poll_status(&self, buf: &mut [u8]) -> bool {
        self.with_state(|st| st.poll_status(buf))
    }

    pub fn hub_control(&self, request: crate::hub::HubRequest) -> Result<Vec<u8>> {
        self.with_state(|st| st.hub_control(request))
    }

    pub fn frame_number(&self) -> u16 {
        self.shared.lock().frame_number
    }

    pub fn tick_1ms(&self) {
        self.shared.lock().tick_1ms();
    }

    pub fn bus_suspend(&self) -> Result<()> {
        self.with_state(|st| {
            st.bus_suspend();
            Ok(())
        })
    }

    pub fn bus_resume(&self) -> Result<()> {
        self.with_state(|st| st.bus_resume())
    }

    pub fn suspend_controller(&self) -> Result<()> {
        self.with_state(|st| st.suspend_controller())
    }

    pub fn resume_controller(&self) {
        self.with_state(|st| st.resume_controller());
    }

    pub fn root_hub_state(&self) -> RootHubState {
        self.shared.lock().rh_state
    }

    pub fn queue_summary(&self) -> QueueSummary {
        self.shared.lock().registry.summary()
    }

    /// Snapshot of a port's registers (1-based).
    pub fn port(&self, port: u8) -> Option<Port> {
        self.shared.lock().port_mut(u16::from(port)).copied()
    }

    /// Gives back every outstanding transfer with [`TransferStatus::Shutdown`] and refuses new
    /// submissions.
    ///
    /// The lock is dropped around each give-back; callers must make sure nothing submits
    /// concurrently.
    pub fn shutdown(&self) {
        self.with_state(|st| {
            st.shut_down = true;
            st.effects.wake_workers = true;
        });
        let mut drained = 0usize;
        for queue in TransferQueue::ALL {
            while self.with_state(|st| st.shutdown_one(queue)) {
                drained += 1;
            }
        }
        tracing::info!(drained, "virtual host controller shut down");
    }

    pub fn stop(&self) {
        self.shutdown();
        self.with_state(|st| st.rh_state = RootHubState::Reset);
    }

    // Worker-side entry points.

    pub fn new_interrupt(&self) -> FetchInterrupt {
        FetchInterrupt {
            flag: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns the next unit of work, waiting according to `timeout` (bounded waits are capped at
    /// [`FetchTimeout::MAX_WAIT`]).
    ///
    /// Fails with [`VhciError::NoWorkAvailable`] when the wait runs out, with
    /// [`VhciError::Interrupted`] when `interrupt` is triggered first, and with
    /// [`VhciError::ShutDown`] once the controller is shut down and drained.
    pub fn fetch_work(
        &self,
        timeout: FetchTimeout,
        interrupt: Option<&FetchInterrupt>,
    ) -> Result<Work> {
        let deadline = match timeout {
            FetchTimeout::Bounded(wait) => {
                Some(Instant::now() + wait.min(FetchTimeout::MAX_WAIT))
            }
            FetchTimeout::Immediate | FetchTimeout::Unbounded => None,
        };

        let mut state = self.shared.lock();
        let outcome = loop {
            if let Some(work) = state.next_work() {
                break Ok(work);
            }
            if !state.effects.finished.is_empty() {
                // Malformed transfers were stalled; their submitters must not wait on us.
                let effects = state.take_effects();
                drop(state);
                self.run_effects(effects);
                state = self.shared.lock();
                continue;
            }
            if state.shut_down {
                break Err(VhciError::ShutDown);
            }
            if interrupt.is_some_and(FetchInterrupt::take) {
                break Err(VhciError::Interrupted);
            }
            match (timeout, deadline) {
                (FetchTimeout::Immediate, _) => break Err(VhciError::NoWorkAvailable),
                (_, Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Err(VhciError::NoWorkAvailable);
                    }
                    state = self
                        .shared
                        .work_ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
                (_, None) => {
                    state = self
                        .shared
                        .work_ready
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        };
        let effects = state.take_effects();
        drop(state);
        self.run_effects(effects);
        outcome
    }

    pub fn fetch_payload(&self, handle: TransferHandle) -> Result<Payload> {
        self.with_state(|st| st.fetch_payload(handle))
    }

    pub fn deliver_completion(&self, giveback: Giveback) -> Result<()> {
        self.with_state(|st| st.deliver_completion(giveback))
    }

    /// Applies a worker-observed port transition (device connected, reset finished, ...).
    pub fn report_port_event(
        &self,
        port: u8,
        change: PortChange,
        status: PortStatus,
    ) -> Result<()> {
        self.with_state(|st| st.report_port_event(port, change, status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_timeout_from_millis() {
        assert_eq!(FetchTimeout::from_millis(0), FetchTimeout::Immediate);
        assert_eq!(FetchTimeout::from_millis(-5), FetchTimeout::Unbounded);
        assert_eq!(
            FetchTimeout::from_millis(250),
            FetchTimeout::Bounded(Duration::from_millis(250))
        );
        assert_eq!(
            FetchTimeout::from_millis(i16::MAX),
            FetchTimeout::Bounded(FetchTimeout::MAX_WAIT)
        );
        assert_eq!(FetchTimeout::default(), FetchTimeout::DEFAULT);
    }
}
