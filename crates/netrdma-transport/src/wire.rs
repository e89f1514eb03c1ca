//! Side-channel record format for [`ConnectionInfo`].
//!
//! A record is a fixed header, a bincode payload and a CRC32 trailer:
//!
//! ```text
//! magic "NRCI" (4) | version u16 | payload_len u16 | payload | crc32 u32
//! ```
//!
//! All integers are little endian. The CRC covers header and payload, so a
//! reader can tell a complete record from a torn or foreign one without
//! relying on the writer's publication being atomic.

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};
use crate::memory::RegionDescriptor;
use crate::verbs::{Gid, QpNum};

/// Leading bytes of every record.
pub const MAGIC: [u8; 4] = *b"NRCI";
/// Bumped on any payload layout change.
pub const FORMAT_VERSION: u16 = 1;
/// Magic, version and payload length.
pub const HEADER_SIZE: usize = 8;
/// CRC32 of header and payload.
pub const TRAILER_SIZE: usize = 4;
/// Bincode size of [`ConnectionInfo`].
pub const PAYLOAD_SIZE: usize = 8 + 8 + 2 + 16 + 4 + 4 + 4 + 8 + 8;
/// Total length of an encoded record.
pub const RECORD_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE + TRAILER_SIZE;

/// What one side publishes so the other can connect to it and reach its
/// registered region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Nonce of the publisher's rendezvous cycle.
    pub session: u64,
    /// In an answer, the offer's `session`. Zero in an offer.
    pub peer_session: u64,
    /// Port LID.
    pub lid: u16,
    /// Port GID.
    pub gid: Gid,
    /// Queue pair the peer connects to.
    pub qp_num: QpNum,
    /// First packet sequence number this side will send.
    pub psn: u32,
    /// Remote key of the registered region.
    pub rkey: u32,
    /// Start address of the registered region.
    pub addr: u64,
    /// Length of the registered region.
    pub len: u64,
}

impl ConnectionInfo {
    /// The published region as a descriptor.
    pub fn region(&self) -> RegionDescriptor {
        RegionDescriptor {
            addr: self.addr,
            len: self.len,
            rkey: self.rkey,
        }
    }

    /// Structural checks that do not need the other side's state.
    pub fn validate(&self) -> Result<()> {
        if self.session == 0 {
            return Err(RdmaError::malformed("session nonce is zero"));
        }
        if self.qp_num.0 == 0 {
            return Err(RdmaError::malformed("queue pair number is zero"));
        }
        if self.len == 0 {
            return Err(RdmaError::malformed("memory region length is zero"));
        }
        if self.addr.checked_add(self.len).is_none() {
            return Err(RdmaError::malformed("memory region wraps the address space"));
        }
        if self.psn > 0x00ff_ffff {
            return Err(RdmaError::malformed("packet sequence number exceeds 24 bits"));
        }
        Ok(())
    }

    /// Offers carry no peer session.
    pub fn is_offer(&self) -> bool {
        self.peer_session == 0
    }
}

/// Serializes `info` into one self-validating record.
pub fn encode(info: &ConnectionInfo) -> Result<Vec<u8>> {
    let payload = bincode::serialize(info)
        .map_err(|e| RdmaError::malformed(format!("cannot encode connection info: {}", e)))?;
    debug_assert_eq!(payload.len(), PAYLOAD_SIZE);

    let mut record = Vec::with_capacity(RECORD_SIZE);
    record.extend_from_slice(&MAGIC);
    record.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    record.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    record.extend_from_slice(&payload);
    let crc = crc32fast::hash(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    Ok(record)
}

/// Parses and validates a record produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<ConnectionInfo> {
    if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(RdmaError::malformed(format!(
            "record truncated to {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(RdmaError::malformed("bad magic"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(RdmaError::malformed(format!(
            "unsupported format version {}",
            version
        )));
    }
    let payload_len = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
    if payload_len != PAYLOAD_SIZE {
        return Err(RdmaError::malformed(format!(
            "payload length {} does not match {}",
            payload_len, PAYLOAD_SIZE
        )));
    }
    let expected_len = HEADER_SIZE + payload_len + TRAILER_SIZE;
    if bytes.len() != expected_len {
        return Err(RdmaError::malformed(format!(
            "record is {} bytes, header announces {}",
            bytes.len(),
            expected_len
        )));
    }
    let body_end = HEADER_SIZE + payload_len;
    let mut trailer = [0u8; 4];
    trailer.copy_from_slice(&bytes[body_end..]);
    let expected = u32::from_le_bytes(trailer);
    let computed = crc32fast::hash(&bytes[..body_end]);
    if expected != computed {
        return Err(RdmaError::malformed(format!(
            "checksum mismatch: expected {:#010x}, computed {:#010x}",
            expected, computed
        )));
    }
    let info: ConnectionInfo = bincode::deserialize(&bytes[HEADER_SIZE..body_end])
        .map_err(|e| RdmaError::malformed(format!("cannot decode payload: {}", e)))?;
    info.validate()?;
    Ok(info)
}
