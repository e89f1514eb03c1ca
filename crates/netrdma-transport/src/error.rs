//! Error types for the RDMA connection layer.

use thiserror::Error;

/// Broad category of an [`RdmaError`], used by callers to decide between
/// retrying, discarding an endpoint, or tearing everything down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad device, port, address index or settings. Never retried.
    Configuration,
    /// Buffer allocation, pinning or bounds failures.
    Registration,
    /// Side-channel timeouts and bad side-channel contents. Retry the whole
    /// establishment with a fresh readiness cycle.
    Rendezvous,
    /// Queue-pair bring-up or use rejected. Discard the endpoint.
    Establishment,
    /// Fatal completion queue failure. Full teardown required.
    Completion,
}

/// Errors raised by the connection layer.
#[derive(Debug, Error)]
pub enum RdmaError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with it.
        reason: String,
    },

    /// The configuration turns RDMA off.
    #[error("RDMA is disabled in configuration")]
    RdmaDisabled,

    /// No device with the configured name.
    #[error("RDMA device not found: {device}")]
    DeviceNotFound {
        /// The configured device name.
        device: String,
    },

    /// The port is missing or not active.
    #[error("port {port} on {device} is not available: {reason}")]
    PortUnavailable {
        /// Device name.
        device: String,
        /// Port number.
        port: u8,
        /// Why the port cannot be used.
        reason: String,
    },

    /// The GID table has no usable entry at the configured index.
    #[error("no valid GID at index {index} on {device} port {port}")]
    InvalidAddressIndex {
        /// Device name.
        device: String,
        /// Port number.
        port: u8,
        /// Requested GID index.
        index: u8,
    },

    /// Allocating a protection domain, channel or queue failed.
    #[error("device setup failed on {device}: {reason}")]
    DeviceSetup {
        /// Device name.
        device: String,
        /// Provider error text.
        reason: String,
    },

    /// Buffer allocation or registration failed.
    #[error("memory registration of {size} bytes failed: {reason}")]
    RegistrationFailed {
        /// Requested size in bytes.
        size: usize,
        /// Provider error text.
        reason: String,
    },

    /// An access falls outside a registered region.
    #[error("range {offset}+{len} out of bounds for region of {region_len} bytes")]
    OutOfBounds {
        /// Start of the access within the region.
        offset: usize,
        /// Length of the access.
        len: usize,
        /// Size of the region.
        region_len: usize,
    },

    /// The peer did not signal readiness before the deadline.
    #[error("rendezvous timed out after {waited_ms}ms waiting for {slot}")]
    RendezvousTimeout {
        /// The slot that never became ready.
        slot: String,
        /// How long this side waited.
        waited_ms: u64,
    },

    /// Side-channel contents were truncated, corrupt or stale.
    #[error("malformed rendezvous data: {reason}")]
    MalformedRendezvousData {
        /// What failed to check out.
        reason: String,
    },

    /// Wraps I/O errors from the side channel.
    #[error("side channel I/O error: {0}")]
    SideChannel(#[from] std::io::Error),

    /// The queue pair could not be created or moved to its next state.
    #[error("connection establishment failed during {stage}: {reason}")]
    EstablishmentFailed {
        /// Step that failed, e.g. `"ready-to-receive"`.
        stage: &'static str,
        /// Provider error text.
        reason: String,
    },

    /// Work was posted to an endpoint that is not connected.
    #[error("endpoint is not connected (state: {state})")]
    NotConnected {
        /// The endpoint's state at the time.
        state: String,
    },

    /// The provider refused a work request.
    #[error("work request {wr_id} rejected: {reason}")]
    PostFailed {
        /// Caller's work request id.
        wr_id: u64,
        /// Provider error text.
        reason: String,
    },

    /// The completion queue failed. Sticky for the device context.
    #[error("completion queue error: {reason}")]
    CompletionQueueError {
        /// Provider error text.
        reason: String,
    },
}

impl RdmaError {
    /// Category used to pick a recovery strategy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RdmaError::InvalidConfig { .. }
            | RdmaError::RdmaDisabled
            | RdmaError::DeviceNotFound { .. }
            | RdmaError::PortUnavailable { .. }
            | RdmaError::InvalidAddressIndex { .. }
            | RdmaError::DeviceSetup { .. } => ErrorKind::Configuration,
            RdmaError::RegistrationFailed { .. } | RdmaError::OutOfBounds { .. } => {
                ErrorKind::Registration
            }
            RdmaError::RendezvousTimeout { .. }
            | RdmaError::MalformedRendezvousData { .. }
            | RdmaError::SideChannel(_) => ErrorKind::Rendezvous,
            RdmaError::EstablishmentFailed { .. }
            | RdmaError::NotConnected { .. }
            | RdmaError::PostFailed { .. } => ErrorKind::Establishment,
            RdmaError::CompletionQueueError { .. } => ErrorKind::Completion,
        }
    }

    /// Whether the whole establishment attempt may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Rendezvous
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        RdmaError::MalformedRendezvousData {
            reason: reason.into(),
        }
    }
}

/// Result type alias for connection-layer operations.
pub type Result<T> = std::result::Result<T, RdmaError>;
