use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, VhciError>;

/// Errors surfaced by the virtual host controller core.
///
/// Several variants are not failures from the controller's point of view: [`VhciError::NotFound`]
/// means "already resolved by another path", [`VhciError::Canceled`] reports that a transfer was
/// finished as canceled, and [`VhciError::NoWorkAvailable`] / [`VhciError::Interrupted`] are the
/// normal exits of a work fetch that found nothing to do.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VhciError {
    /// Malformed caller input, rejected before any state change.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The handle does not name an outstanding transfer.
    #[error("transfer handle not found")]
    NotFound,

    /// Root-hub request outside the domain allowed by the hub class; reported to the USB stack as
    /// a protocol stall.
    #[error("protocol stall")]
    ProtocolStall,

    /// The transfer was (or is being) canceled by the kernel stack.
    #[error("transfer canceled")]
    Canceled,

    /// The controller has been shut down and no longer accepts transfers.
    #[error("controller is shut down")]
    ShutDown,

    /// Nothing to do before the wait ran out (or immediately, for a non-blocking fetch).
    #[error("no work available")]
    NoWorkAvailable,

    /// A blocking fetch was interrupted through its [`crate::FetchInterrupt`].
    #[error("interrupted")]
    Interrupted,

    /// The transfer carries no host-to-device data to hand out.
    #[error("transfer has no outbound data")]
    NoData,

    /// Port event that contradicts the current port state.
    #[error("invalid port state: {0}")]
    InvalidState(&'static str),

    /// The controller hardware is not accessible (controller suspended).
    #[error("controller not ready")]
    NotReady,

    /// Controller suspend requested while the root hub is still running.
    #[error("root hub is still running")]
    Busy,

    /// The worker handed back inconsistent completion data. The transfer has still been given
    /// back to its owner.
    #[error("invalid completion: {0}")]
    Completion(#[from] CompletionError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Validation failures of a worker-supplied completion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("actual length {actual} exceeds buffer length {buffer_length}")]
    ActualLengthExceedsBuffer { actual: u32, buffer_length: u32 },

    #[error("isochronous IN actual length {actual} must equal buffer length {buffer_length}")]
    IsoActualLengthMismatch { actual: u32, buffer_length: u32 },

    #[error("expected {expected} isochronous packet results, got {actual}")]
    IsoPacketCountMismatch { expected: usize, actual: usize },

    #[error("IN completion with {actual} bytes is missing its payload")]
    MissingPayload { actual: u32 },

    #[error("payload length {payload} does not match actual length {actual}")]
    PayloadLengthMismatch { payload: usize, actual: u32 },

    #[error("OUT completion must not carry a payload")]
    UnexpectedPayload,
}
