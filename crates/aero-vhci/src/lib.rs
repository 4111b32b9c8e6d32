//! Software-emulated USB host controller with an out-of-process worker.
//!
//! The kernel-side USB stack submits [`Transfer`]s and issues root-hub requests against a [`Vhci`];
//! a worker (the process that actually emulates or forwards the devices) pulls [`Work`] from the
//! same controller and answers with payload fetches, completions and port events:
//!
//! - [`Vhci::submit`] / [`Vhci::cancel`]: kernel-side transfer lifecycle
//! - [`Vhci::hub_control`] / [`Vhci::poll_status`]: root-hub emulation
//! - [`Vhci::fetch_work`]: cancellations first, then port updates (round-robin), then transfers
//! - [`Vhci::fetch_payload`] / [`Vhci::deliver_completion`] / [`Vhci::report_port_event`]
//!
//! Every transfer is handed back through [`VhciHost::give_back`] exactly once, whichever of
//! completion, cancellation and shutdown gets there first.

#[macro_use]
mod bits;

mod completion;
mod config;
mod controller;
mod dispatch;
mod error;
mod hub;
pub mod loopback;
mod port;
mod registry;
mod state;
mod transfer;

pub use completion::{Giveback, IsoPacketData, IsoPacketResult, Payload};
pub use config::{ConfigError, VhciConfig, DEFAULT_PORT_COUNT};
pub use controller::{FetchInterrupt, FetchTimeout, Vhci, VhciHost};
pub use dispatch::{TransferWork, Work};
pub use error::{CompletionError, Result, VhciError};
pub use hub::{hub_descriptor, HubRequest, HubRequestType};
pub use port::{Port, PortChange, PortFlags, PortStatus, MAX_PORTS};
pub use registry::{QueueSummary, TransferQueue};
pub use state::RootHubState;
pub use transfer::{
    Direction, IsoPacket, SetupPacket, StatusSlot, Transfer, TransferFlags, TransferHandle,
    TransferStatus, TransferType,
};

/// Hub class feature selectors accepted by [`HubRequest`].
pub mod feature {
    pub const C_HUB_LOCAL_POWER: u16 = 0;
    pub const C_HUB_OVER_CURRENT: u16 = 1;

    pub const PORT_CONNECTION: u16 = 0;
    pub const PORT_ENABLE: u16 = 1;
    pub const PORT_SUSPEND: u16 = 2;
    pub const PORT_OVER_CURRENT: u16 = 3;
    pub const PORT_RESET: u16 = 4;
    pub const PORT_POWER: u16 = 8;
    pub const PORT_LOW_SPEED: u16 = 9;
    pub const PORT_HIGH_SPEED: u16 = 10;
    pub const C_PORT_CONNECTION: u16 = 16;
    pub const C_PORT_ENABLE: u16 = 17;
    pub const C_PORT_SUSPEND: u16 = 18;
    pub const C_PORT_OVER_CURRENT: u16 = 19;
    pub const C_PORT_RESET: u16 = 20;
    pub const PORT_TEST: u16 = 21;
    pub const PORT_INDICATOR: u16 = 22;
}
