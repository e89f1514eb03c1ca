//! Provider seam for RDMA verbs.
//!
//! Everything that touches RDMA hardware goes through [`Verbs`]. Handles are
//! plain typed identifiers; the provider owns the objects they name. The
//! software fabric in [`crate::sim`] implements this trait for hosts without
//! InfiniBand/RoCE hardware and for tests.

use std::fmt;
use std::os::unix::io::RawFd;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident($inner:ty)) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub $inner);
    };
}

handle!(
    /// An opened device.
    DeviceId(u64)
);
handle!(
    /// A protection domain.
    PdId(u64)
);
handle!(
    /// A completion channel (the notification primitive).
    ChannelId(u64)
);
handle!(
    /// A completion queue.
    CqId(u64)
);
handle!(
    /// A memory registration.
    MrId(u64)
);

/// Queue pair number, unique per fabric and exchanged with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QpNum(pub u32);

impl fmt::Display for QpNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 128-bit global identifier of a port address.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// An unset table entry.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Upper 64 bits.
    pub fn subnet_prefix(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }

    /// Lower 64 bits.
    pub fn interface_id(&self) -> u64 {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(id)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", pair[0], pair[1])?;
        }
        Ok(())
    }
}

/// Access rights granted to a registration or queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

#[allow(missing_docs)]
impl AccessFlags {
    pub const LOCAL_READ: Self = Self(1);
    pub const LOCAL_WRITE: Self = Self(2);
    pub const REMOTE_READ: Self = Self(4);
    pub const REMOTE_WRITE: Self = Self(8);
    pub const ALL: Self = Self(0xF);

    /// Every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No rights.
    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Logical state of a port. Only `Active` ports carry traffic.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Down,
    Init,
    Active,
}

/// Port attributes relevant to addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAttr {
    /// Logical port state.
    pub state: PortState,
    /// Local identifier assigned by the subnet manager.
    pub lid: u16,
    /// Active path MTU in bytes.
    pub active_mtu: u32,
    /// Number of entries in the GID table.
    pub gid_table_len: u32,
}

/// Keys and address the provider assigned to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrKeys {
    /// Handle for `dereg_mr`.
    pub id: MrId,
    /// Local key.
    pub lkey: u32,
    /// Remote key.
    pub rkey: u32,
    /// Address remote peers use to target this registration.
    pub addr: u64,
}

/// Queue pair state as tracked by the provider.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

/// Capacities requested when creating a reliable-connected queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    /// Outstanding send work requests.
    pub max_send_wr: u32,
    /// Outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Scatter/gather entries per request.
    pub max_sge: u32,
}

/// One `modify_qp` step of the RC bring-up sequence.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy)]
pub enum QpTransition {
    /// Reset to Init: bind the port and access rights.
    ToInit {
        port: u8,
        access: AccessFlags,
    },
    /// Init to ready-to-receive: bind the remote queue pair.
    ToRtr {
        port: u8,
        sgid_index: u8,
        remote_qp: QpNum,
        remote_lid: u16,
        remote_gid: Gid,
        rq_psn: u32,
        path_mtu: u32,
    },
    /// Ready-to-receive to ready-to-send: set send-side timers.
    ToRts {
        sq_psn: u32,
        timeout: u8,
        retry_cnt: u8,
        rnr_retry: u8,
    },
}

impl QpTransition {
    /// State the queue pair must be in before this step.
    pub fn from_state(&self) -> QpState {
        match self {
            QpTransition::ToInit { .. } => QpState::Reset,
            QpTransition::ToRtr { .. } => QpState::Init,
            QpTransition::ToRts { .. } => QpState::ReadyToReceive,
        }
    }

    /// State the queue pair is in after this step succeeds.
    pub fn to_state(&self) -> QpState {
        match self {
            QpTransition::ToInit { .. } => QpState::Init,
            QpTransition::ToRtr { .. } => QpState::ReadyToReceive,
            QpTransition::ToRts { .. } => QpState::ReadyToSend,
        }
    }
}

/// Work request operation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WrOpcode {
    Send,
    Recv,
    RdmaRead,
    RdmaWrite,
}

/// Local scatter/gather element of a work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    /// Registered address of the first byte.
    pub addr: u64,
    /// Bytes to transfer.
    pub length: u32,
    /// Local key of the registration holding `addr`.
    pub lkey: u32,
}

/// A one-sided work request.
#[derive(Debug, Clone, Copy)]
pub struct SendRequest {
    /// Echoed in the completion.
    pub wr_id: u64,
    /// `RdmaRead` or `RdmaWrite`.
    pub opcode: WrOpcode,
    /// Local side of the transfer.
    pub local: Sge,
    /// Peer address to read from or write to.
    pub remote_addr: u64,
    /// Peer's remote key.
    pub rkey: u32,
    /// Whether a successful request produces a completion.
    pub signaled: bool,
}

/// Provider status of a work completion.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WcStatus {
    #[default]
    Success,
    LocalLengthError,
    LocalProtectionError,
    RemoteAccessError,
    RemoteOperationError,
    RetryExceeded,
    WorkRequestFlushed,
    Other(u32),
}

/// A raw work completion as produced by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// Id from the work request.
    pub wr_id: u64,
    /// How it ended.
    pub status: WcStatus,
    /// Operation of the work request.
    pub opcode: WrOpcode,
    /// Bytes transferred; zero on failure.
    pub byte_len: u32,
    /// Queue pair the request was posted to.
    pub qp_num: QpNum,
}

/// Errors reported by a [`Verbs`] provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerbsError {
    /// No device by that name.
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// Port number out of range for the device.
    #[error("invalid port {0}")]
    InvalidPort(u8),

    /// GID index beyond the port's table.
    #[error("invalid GID index {0}")]
    InvalidGidIndex(u8),

    /// The handle names nothing the provider knows.
    #[error("unknown handle {0}")]
    UnknownHandle(String),

    /// A queue or table is full.
    #[error("resources exhausted: {0}")]
    Exhausted(String),

    /// The call is not valid in the current state.
    #[error("{op} rejected: {reason}")]
    Rejected {
        /// Verb that refused.
        op: &'static str,
        /// Why.
        reason: String,
    },

    /// The completion queue is unusable until destroyed.
    #[error("completion queue {0:?} is in a fatal error state")]
    QueueFatal(CqId),

    /// A system call failed.
    #[error("os error: {0}")]
    Os(String),
}

/// RDMA verbs used by the connection layer.
///
/// Calls never block. `get_cq_event` returns `Ok(None)` when no notification
/// is pending instead of waiting for one.
pub trait Verbs: Send + Sync + fmt::Debug {
    /// Opens a device by name.
    fn open_device(&self, name: &str) -> Result<DeviceId, VerbsError>;
    /// Closes a device. Fails while resources derived from it are live.
    fn close_device(&self, dev: DeviceId) -> Result<(), VerbsError>;
    /// Port attributes.
    fn query_port(&self, dev: DeviceId, port: u8) -> Result<PortAttr, VerbsError>;
    /// GID table entry `index` of `port`.
    fn query_gid(&self, dev: DeviceId, port: u8, index: u8) -> Result<Gid, VerbsError>;

    /// Allocates a protection domain.
    fn alloc_pd(&self, dev: DeviceId) -> Result<PdId, VerbsError>;
    /// Frees a protection domain. Fails while registrations or queue pairs use it.
    fn dealloc_pd(&self, pd: PdId) -> Result<(), VerbsError>;

    /// Creates a completion channel.
    fn create_comp_channel(&self, dev: DeviceId) -> Result<ChannelId, VerbsError>;
    /// Destroys a completion channel and closes its descriptor.
    fn destroy_comp_channel(&self, channel: ChannelId) -> Result<(), VerbsError>;
    /// Descriptor that turns readable while a notification is pending.
    fn channel_fd(&self, channel: ChannelId) -> Result<RawFd, VerbsError>;

    /// Completion queue of `depth` entries reporting into `channel`.
    fn create_cq(&self, dev: DeviceId, channel: ChannelId, depth: u32) -> Result<CqId, VerbsError>;
    /// Fails while queue pairs are attached or notifications are unacknowledged.
    fn destroy_cq(&self, cq: CqId) -> Result<(), VerbsError>;

    /// Registers `len` bytes at `addr`. The memory must stay valid until
    /// `dereg_mr` returns.
    fn reg_mr(
        &self,
        pd: PdId,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrKeys, VerbsError>;
    /// Releases a registration.
    fn dereg_mr(&self, mr: MrId) -> Result<(), VerbsError>;

    /// Reliable-connected queue pair in Reset.
    fn create_qp(&self, pd: PdId, send_cq: CqId, recv_cq: CqId, caps: QpCaps)
        -> Result<QpNum, VerbsError>;
    /// Applies one bring-up step. The queue pair must be in `transition.from_state()`.
    fn modify_qp(&self, qp: QpNum, transition: &QpTransition) -> Result<(), VerbsError>;
    /// Current state of a queue pair.
    fn query_qp_state(&self, qp: QpNum) -> Result<QpState, VerbsError>;
    /// Destroys a queue pair.
    fn destroy_qp(&self, qp: QpNum) -> Result<(), VerbsError>;

    /// Posts a one-sided request. Only valid in ReadyToSend.
    fn post_send(&self, qp: QpNum, wr: &SendRequest) -> Result<(), VerbsError>;
    /// Up to `max` completions, oldest first.
    fn poll_cq(&self, cq: CqId, max: usize) -> Result<Vec<WorkCompletion>, VerbsError>;
    /// Arms the queue so the next completion raises a channel notification.
    fn req_notify_cq(&self, cq: CqId) -> Result<(), VerbsError>;
    /// Next pending notification on `channel`, or `None`.
    fn get_cq_event(&self, channel: ChannelId) -> Result<Option<CqId>, VerbsError>;
    /// Acknowledges `count` notifications taken from `cq`.
    fn ack_cq_events(&self, cq: CqId, count: u32);
}
