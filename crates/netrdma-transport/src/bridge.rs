//! Completion event bridge.
//!
//! Adapts the device's completion channel to a readiness-based event loop.
//! The loop registers [`CompletionBridge`]'s descriptor for read readiness
//! and calls [`CompletionBridge::drain_events`] each time it fires.
//!
//! A drain acknowledges every pending notification, empties the completion
//! queue in batches, re-arms notification and polls once more, so a
//! completion that lands between the last poll and the re-arm is still
//! reported rather than waiting for the next one to wake the loop.

use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::device::DeviceContext;
use crate::error::{RdmaError, Result};
use crate::verbs::{CqId, VerbsError, WcStatus, WorkCompletion, WrOpcode};

/// Outcome of one finished work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Finished normally.
    Success,
    /// Local buffer too short for the transfer.
    LocalLengthError,
    /// Local key or access rights rejected.
    LocalProtectionError,
    /// Remote key, bounds or access rights rejected.
    RemoteAccessError,
    /// The peer could not carry out the operation.
    RemoteOperationError,
    /// Transport retries ran out; the peer is unreachable.
    RetryExceeded,
    /// Flushed because the queue pair entered the error state.
    Flushed,
    /// Any other provider status code.
    Other(u32),
}

impl CompletionStatus {
    /// True only for [`CompletionStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

impl From<WcStatus> for CompletionStatus {
    fn from(status: WcStatus) -> Self {
        match status {
            WcStatus::Success => CompletionStatus::Success,
            WcStatus::LocalLengthError => CompletionStatus::LocalLengthError,
            WcStatus::LocalProtectionError => CompletionStatus::LocalProtectionError,
            WcStatus::RemoteAccessError => CompletionStatus::RemoteAccessError,
            WcStatus::RemoteOperationError => CompletionStatus::RemoteOperationError,
            WcStatus::RetryExceeded => CompletionStatus::RetryExceeded,
            WcStatus::WorkRequestFlushed => CompletionStatus::Flushed,
            WcStatus::Other(code) => CompletionStatus::Other(code),
        }
    }
}

/// Operation a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionKind {
    /// Two-sided send.
    Send,
    /// Two-sided receive.
    Receive,
    /// One-sided read from the peer.
    RdmaRead,
    /// One-sided write into the peer.
    RdmaWrite,
}

impl From<WrOpcode> for CompletionKind {
    fn from(opcode: WrOpcode) -> Self {
        match opcode {
            WrOpcode::Send => CompletionKind::Send,
            WrOpcode::Recv => CompletionKind::Receive,
            WrOpcode::RdmaRead => CompletionKind::RdmaRead,
            WrOpcode::RdmaWrite => CompletionKind::RdmaWrite,
        }
    }
}

/// One finished hardware operation, reported once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Id the caller gave the work request.
    pub wr_id: u64,
    /// Bytes transferred.
    pub byte_len: u32,
    /// How it ended.
    pub status: CompletionStatus,
    /// Which operation it was.
    pub kind: CompletionKind,
}

impl From<WorkCompletion> for CompletionRecord {
    fn from(wc: WorkCompletion) -> Self {
        Self {
            wr_id: wc.wr_id,
            byte_len: wc.byte_len,
            status: wc.status.into(),
            kind: wc.opcode.into(),
        }
    }
}

/// Readiness adapter over a device context's completion channel.
#[derive(Debug, Clone)]
pub struct CompletionBridge {
    ctx: DeviceContext,
}

impl CompletionBridge {
    pub(crate) fn new(ctx: DeviceContext) -> Self {
        Self { ctx }
    }

    /// True once a fatal queue error has been reported.
    pub fn is_failed(&self) -> bool {
        self.ctx.cq_failed()
    }

    /// Collects every completion available right now. Never blocks.
    ///
    /// A spurious call returns an empty vector. After a fatal queue error
    /// every call fails with [`RdmaError::CompletionQueueError`].
    pub fn drain_events(&self) -> Result<Vec<CompletionRecord>> {
        if self.ctx.cq_failed() {
            return Err(RdmaError::CompletionQueueError {
                reason: "completion queue already failed, re-establish the connection".to_string(),
            });
        }
        let verbs = self.ctx.verbs();
        let cq = self.ctx.cq();

        let mut events = 0u32;
        while let Some(event_cq) = verbs
            .get_cq_event(self.ctx.channel())
            .map_err(|e| self.fail(e))?
        {
            if event_cq != cq {
                // Acked against the queue that raised it; its completions
                // belong to whoever polls that queue.
                trace!(?event_cq, "notification for foreign completion queue");
                verbs.ack_cq_events(event_cq, 1);
                continue;
            }
            events += 1;
        }
        if events > 0 {
            verbs.ack_cq_events(cq, events);
        }

        let mut records = Vec::new();
        self.poll_into(cq, &mut records)?;
        verbs.req_notify_cq(cq).map_err(|e| self.fail(e))?;
        self.poll_into(cq, &mut records)?;

        debug!(events, completions = records.len(), "drained completion events");
        Ok(records)
    }

    fn poll_into(&self, cq: CqId, records: &mut Vec<CompletionRecord>) -> Result<()> {
        let batch = self.ctx.config().drain_batch.max(1);
        loop {
            let polled = self
                .ctx
                .verbs()
                .poll_cq(cq, batch)
                .map_err(|e| self.fail(e))?;
            let n = polled.len();
            records.extend(polled.into_iter().map(CompletionRecord::from));
            if n < batch {
                return Ok(());
            }
        }
    }

    fn fail(&self, e: VerbsError) -> RdmaError {
        self.ctx.mark_cq_failed();
        error!(device = self.ctx.device_name(), error = %e, "completion queue failed");
        RdmaError::CompletionQueueError {
            reason: e.to_string(),
        }
    }

    /// Adds the descriptor to an existing epoll instance for read readiness.
    pub fn register_epoll(&self, epfd: RawFd, token: u64) -> Result<()> {
        self.epoll_ctl(epfd, libc::EPOLL_CTL_ADD, token)
    }

    /// Removes the descriptor from `epfd`.
    pub fn deregister_epoll(&self, epfd: RawFd) -> Result<()> {
        self.epoll_ctl(epfd, libc::EPOLL_CTL_DEL, 0)
    }

    fn epoll_ctl(&self, epfd: RawFd, op: libc::c_int, token: u64) -> Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        // SAFETY: event is a valid epoll_event for the duration of the call.
        let ret = unsafe { libc::epoll_ctl(epfd, op, self.as_raw_fd(), &mut event) };
        if ret < 0 {
            return Err(RdmaError::DeviceSetup {
                device: self.ctx.device_name().to_string(),
                reason: format!("epoll_ctl on fd {}: {}", epfd, io::Error::last_os_error()),
            });
        }
        Ok(())
    }
}

impl AsRawFd for CompletionBridge {
    fn as_raw_fd(&self) -> RawFd {
        self.ctx.channel_fd()
    }
}

impl AsFd for CompletionBridge {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the descriptor is owned by the completion channel, which
        // lives as long as the context this bridge holds.
        unsafe { BorrowedFd::borrow_raw(self.ctx.channel_fd()) }
    }
}
