//! Root-hub port registers.
//!
//! Each port carries the standard USB 2.0 hub `wPortStatus` / `wPortChange` words (hub class
//! section 11.24.2.7) plus driver-private flags. Change bits are latched: they are set by status
//! transitions or worker-reported events and cleared only through an explicit acknowledgment
//! (`ClearPortFeature(C_*)`), except where a transition below says otherwise.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VhciError};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PortStatus: u16 {
        const CONNECTION = 0x0001;
        const ENABLE = 0x0002;
        const SUSPEND = 0x0004;
        const OVERCURRENT = 0x0008;
        const RESET = 0x0010;
        const POWER = 0x0100;
        const LOW_SPEED = 0x0200;
        const HIGH_SPEED = 0x0400;
        const TEST = 0x0800;
        const INDICATOR = 0x1000;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PortChange: u16 {
        const C_CONNECTION = 0x0001;
        const C_ENABLE = 0x0002;
        const C_SUSPEND = 0x0004;
        const C_OVERCURRENT = 0x0008;
        const C_RESET = 0x0010;
    }
}

bitflags! {
    /// Driver-private port state that is not part of the USB status word.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PortFlags: u8 {
        /// Resume signalling requested by `ClearPortFeature(PORT_SUSPEND)`; the worker finishes it
        /// by reporting a suspend change.
        const RESUMING = 0x01;
    }
}

impl_bits_serde!(PortStatus, u16);
impl_bits_serde!(PortChange, u16);
impl_bits_serde!(PortFlags, u8);

/// Largest number of root-hub ports; port `n` occupies bit `n` of a 32-bit update mask.
pub const MAX_PORTS: u8 = 31;

/// Snapshot of one port's registers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub status: PortStatus,
    pub change: PortChange,
    pub flags: PortFlags,
}

impl Port {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_powered(&self) -> bool {
        self.status.contains(PortStatus::POWER)
    }

    /// `ClearPortFeature(PORT_SUSPEND)`: starts resume signalling. The status word is left alone
    /// until the worker reports the suspend change.
    pub(crate) fn request_resume(&mut self) -> bool {
        if !self.status.contains(PortStatus::SUSPEND) {
            return false;
        }
        self.flags |= PortFlags::RESUMING;
        true
    }

    /// `ClearPortFeature(PORT_POWER)`. Only over-current state survives a power-off.
    pub(crate) fn power_off(&mut self) -> bool {
        if !self.is_powered() {
            return false;
        }
        self.status &= PortStatus::OVERCURRENT;
        self.change &= PortChange::C_OVERCURRENT;
        self.flags.remove(PortFlags::RESUMING);
        true
    }

    /// `ClearPortFeature(PORT_ENABLE)`. Disabling also drops suspend, and clears the enable and
    /// suspend change bits together with it.
    pub(crate) fn disable(&mut self) -> bool {
        if !self.status.contains(PortStatus::ENABLE) {
            return false;
        }
        self.status.remove(PortStatus::ENABLE | PortStatus::SUSPEND);
        self.change.remove(PortChange::C_ENABLE | PortChange::C_SUSPEND);
        self.flags.remove(PortFlags::RESUMING);
        true
    }

    /// `SetPortFeature(PORT_SUSPEND)`: only an enabled, not yet suspended port can be suspended.
    pub(crate) fn suspend(&mut self) -> bool {
        if !self.status.contains(PortStatus::ENABLE) || self.status.contains(PortStatus::SUSPEND)
        {
            return false;
        }
        self.status.insert(PortStatus::SUSPEND);
        true
    }

    /// Suspend as part of a bus-wide suspend. Unlike the port feature request this also cancels a
    /// pending resume.
    pub(crate) fn bus_suspend(&mut self) -> bool {
        if !self.suspend() {
            return false;
        }
        self.flags.remove(PortFlags::RESUMING);
        true
    }

    /// `SetPortFeature(PORT_POWER)`.
    pub(crate) fn power_on(&mut self) -> bool {
        if self.is_powered() {
            return false;
        }
        self.status.insert(PortStatus::POWER);
        true
    }

    /// `SetPortFeature(PORT_RESET)`: requires a connected device and no reset already in
    /// progress. Everything but power, connection, speed and over-current is cleared.
    pub(crate) fn start_reset(&mut self) -> bool {
        if !self.status.contains(PortStatus::CONNECTION) || self.status.contains(PortStatus::RESET)
        {
            return false;
        }
        self.status &= PortStatus::POWER
            | PortStatus::CONNECTION
            | PortStatus::LOW_SPEED
            | PortStatus::HIGH_SPEED
            | PortStatus::OVERCURRENT;
        self.status.insert(PortStatus::RESET);
        self.flags.remove(PortFlags::RESUMING);
        true
    }

    pub(crate) fn set_change(&mut self, change: PortChange) -> bool {
        if self.change.contains(change) {
            return false;
        }
        self.change.insert(change);
        true
    }

    pub(crate) fn clear_change(&mut self, change: PortChange) -> bool {
        if !self.change.intersects(change) {
            return false;
        }
        self.change.remove(change);
        true
    }

    /// Applies a worker-reported port event.
    ///
    /// `change` names the single transition being reported (or `C_RESET | C_ENABLE` for a reset
    /// that failed to enable the port); `status` carries the new values of the relevant status
    /// bits.
    pub(crate) fn apply_event(&mut self, change: PortChange, status: PortStatus) -> Result<()> {
        let valid_change = change == PortChange::C_CONNECTION
            || change == PortChange::C_ENABLE
            || change == PortChange::C_SUSPEND
            || change == PortChange::C_OVERCURRENT
            || change == PortChange::C_RESET
            || change == PortChange::C_RESET | PortChange::C_ENABLE;
        if !valid_change {
            return Err(VhciError::InvalidArgument("unsupported port change combination"));
        }
        if !self.is_powered() {
            return Err(VhciError::InvalidState("port is not powered"));
        }

        let connected = self.status.contains(PortStatus::CONNECTION);
        let resetting = self.status.contains(PortStatus::RESET);

        if change == PortChange::C_CONNECTION {
            let overcurrent = self.status & PortStatus::OVERCURRENT;
            self.change.insert(PortChange::C_CONNECTION);
            self.status = if status.contains(PortStatus::CONNECTION) {
                let speed = if status.contains(PortStatus::LOW_SPEED) {
                    PortStatus::LOW_SPEED
                } else if status.contains(PortStatus::HIGH_SPEED) {
                    PortStatus::HIGH_SPEED
                } else {
                    PortStatus::empty()
                };
                PortStatus::POWER | PortStatus::CONNECTION | speed | overcurrent
            } else {
                PortStatus::POWER | overcurrent
            };
            self.flags.remove(PortFlags::RESUMING);
        } else if change == PortChange::C_ENABLE {
            if !connected || resetting || status.contains(PortStatus::ENABLE) {
                return Err(VhciError::InvalidState(
                    "enable change needs a connected, idle port being disabled",
                ));
            }
            self.change.insert(PortChange::C_ENABLE);
            self.status.remove(PortStatus::ENABLE | PortStatus::SUSPEND);
            self.flags.remove(PortFlags::RESUMING);
        } else if change == PortChange::C_SUSPEND {
            if !connected
                || !self.status.contains(PortStatus::ENABLE)
                || resetting
                || status.contains(PortStatus::SUSPEND)
            {
                return Err(VhciError::InvalidState(
                    "suspend change needs a connected, enabled port leaving suspend",
                ));
            }
            self.flags.remove(PortFlags::RESUMING);
            self.change.insert(PortChange::C_SUSPEND);
            self.status.remove(PortStatus::SUSPEND);
        } else if change == PortChange::C_OVERCURRENT {
            self.change.insert(PortChange::C_OVERCURRENT);
            self.status.remove(PortStatus::OVERCURRENT);
            self.status |= status & PortStatus::OVERCURRENT;
        } else {
            if !connected || !resetting || status.contains(PortStatus::RESET) {
                return Err(VhciError::InvalidState(
                    "reset change needs a connected port finishing its reset",
                ));
            }
            if change.contains(PortChange::C_ENABLE) {
                if status.contains(PortStatus::ENABLE) {
                    return Err(VhciError::InvalidState(
                        "failed reset cannot leave the port enabled",
                    ));
                }
                self.change.insert(PortChange::C_ENABLE);
            } else {
                self.status |= status & PortStatus::ENABLE;
            }
            self.change.insert(PortChange::C_RESET);
            self.status.remove(PortStatus::RESET);
        }
        Ok(())
    }
}
