//! One side of an RDMA connection: a reliable-connected queue pair and its
//! lifecycle state.

use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, warn};

use crate::device::DeviceContext;
use crate::error::{RdmaError, Result};
use crate::memory::MemoryRegion;
use crate::verbs::{AccessFlags, QpCaps, QpNum, QpTransition, SendRequest, Sge, WrOpcode};
use crate::wire::ConnectionInfo;

const PATH_MTU: u32 = 1024;
const ACK_TIMEOUT: u8 = 14;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY: u8 = 7;
const PSN_MASK: u32 = 0x00ff_ffff;

/// Lifecycle of an endpoint. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Queue pair created and in Init.
    Init,
    /// Bound to the peer; can receive but not send.
    ReadyToReceive,
    /// Ready to send. Work may be posted.
    Connected,
    /// A transition or the completion queue failed.
    Error,
    /// Queue pair destroyed.
    Closed,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointState::Init => "init",
            EndpointState::ReadyToReceive => "ready-to-receive",
            EndpointState::Connected => "connected",
            EndpointState::Error => "error",
            EndpointState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the rendezvous an endpoint played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Published the offer and waited for an answer.
    Listener,
    /// Read the offer and answered it.
    Connector,
}

/// A queue pair owned by one side of a connection.
pub struct ConnectionEndpoint {
    ctx: DeviceContext,
    role: Role,
    address: SocketAddr,
    qp: QpNum,
    state: EndpointState,
    local: ConnectionInfo,
    remote: Option<ConnectionInfo>,
    destroyed: bool,
}

impl fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("role", &self.role)
            .field("address", &self.address)
            .field("qp", &self.qp)
            .field("state", &self.state)
            .field("remote_qp", &self.remote.map(|r| r.qp_num))
            .finish()
    }
}

impl ConnectionEndpoint {
    /// Creates a queue pair on `ctx`, moves it to Init, and builds the info
    /// this side will publish for `region`.
    pub(crate) fn create(
        ctx: &DeviceContext,
        role: Role,
        address: SocketAddr,
        region: &MemoryRegion,
        session: u64,
    ) -> Result<Self> {
        let verbs = ctx.verbs();
        let caps = QpCaps {
            max_send_wr: ctx.config().max_send_wr,
            max_recv_wr: 1,
            max_sge: 1,
        };
        let qp = verbs
            .create_qp(ctx.pd(), ctx.cq(), ctx.cq(), caps)
            .map_err(|e| RdmaError::EstablishmentFailed {
                stage: "create",
                reason: e.to_string(),
            })?;
        let init = QpTransition::ToInit {
            port: ctx.port(),
            access: AccessFlags::ALL,
        };
        if let Err(e) = verbs.modify_qp(qp, &init) {
            if let Err(destroy) = verbs.destroy_qp(qp) {
                warn!(qp = qp.0, error = %destroy, "destroying queue pair after failed init");
            }
            return Err(RdmaError::EstablishmentFailed {
                stage: "init",
                reason: e.to_string(),
            });
        }
        ctx.endpoint_opened();

        let descriptor = region.descriptor();
        let local = ConnectionInfo {
            session,
            peer_session: 0,
            lid: ctx.lid(),
            gid: ctx.gid(),
            qp_num: qp,
            psn: rand::thread_rng().gen::<u32>() & PSN_MASK,
            rkey: descriptor.rkey,
            addr: descriptor.addr,
            len: descriptor.len,
        };
        debug!(?role, qp = qp.0, psn = local.psn, "created queue pair");

        Ok(Self {
            ctx: ctx.clone(),
            role,
            address,
            qp,
            state: EndpointState::Init,
            local,
            remote: None,
            destroyed: false,
        })
    }

    /// Current state. Reads `Error` once the context's completion queue has
    /// failed, whichever endpoint the failure was observed through.
    pub fn state(&self) -> EndpointState {
        match self.state {
            EndpointState::Closed => EndpointState::Closed,
            _ if self.ctx.cq_failed() => EndpointState::Error,
            state => state,
        }
    }

    /// Listener or connector.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Queue pair number published to the peer.
    pub fn qp_num(&self) -> QpNum {
        self.qp
    }

    /// Local address for a listener, peer address for a connector.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Info this side publishes.
    pub fn local_info(&self) -> ConnectionInfo {
        self.local
    }

    /// The peer's info once ready-to-receive was reached.
    pub fn remote_info(&self) -> Option<ConnectionInfo> {
        self.remote
    }

    /// True while work may be posted.
    pub fn is_connected(&self) -> bool {
        self.state() == EndpointState::Connected
    }

    /// Drives Init → RTR → RTS against `remote`.
    pub(crate) fn establish(&mut self, remote: &ConnectionInfo) -> Result<()> {
        self.ready_to_receive(remote)?;
        self.ready_to_send()
    }

    fn ready_to_receive(&mut self, remote: &ConnectionInfo) -> Result<()> {
        if self.state() != EndpointState::Init {
            return Err(self.out_of_order("ready-to-receive"));
        }
        let rtr = QpTransition::ToRtr {
            port: self.ctx.port(),
            sgid_index: self.ctx.gid_index(),
            remote_qp: remote.qp_num,
            remote_lid: remote.lid,
            remote_gid: remote.gid,
            rq_psn: remote.psn,
            path_mtu: PATH_MTU,
        };
        self.transition("ready-to-receive", &rtr)?;
        self.remote = Some(*remote);
        if self.role == Role::Connector {
            self.local.peer_session = remote.session;
        }
        self.state = EndpointState::ReadyToReceive;
        Ok(())
    }

    fn ready_to_send(&mut self) -> Result<()> {
        if self.state() != EndpointState::ReadyToReceive {
            return Err(self.out_of_order("ready-to-send"));
        }
        let rts = QpTransition::ToRts {
            sq_psn: self.local.psn,
            timeout: ACK_TIMEOUT,
            retry_cnt: RETRY_COUNT,
            rnr_retry: RNR_RETRY,
        };
        self.transition("ready-to-send", &rts)?;
        self.state = EndpointState::Connected;
        Ok(())
    }

    fn transition(&mut self, stage: &'static str, step: &QpTransition) -> Result<()> {
        match self.ctx.verbs().modify_qp(self.qp, step) {
            Ok(()) => {
                debug!(qp = self.qp.0, stage, "queue pair transition");
                Ok(())
            }
            Err(e) => {
                self.state = EndpointState::Error;
                Err(RdmaError::EstablishmentFailed {
                    stage,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn out_of_order(&self, stage: &'static str) -> RdmaError {
        RdmaError::EstablishmentFailed {
            stage,
            reason: format!("endpoint is {}", self.state()),
        }
    }

    /// Marks the endpoint unusable after a fatal completion error.
    pub fn mark_failed(&mut self) {
        if self.state != EndpointState::Closed {
            self.state = EndpointState::Error;
        }
    }

    /// Writes `len` bytes from `region[local_offset..]` into the peer's
    /// region at `remote_offset`. Completion arrives through the bridge.
    pub fn post_write(
        &self,
        region: &MemoryRegion,
        local_offset: usize,
        remote_offset: u64,
        len: u32,
        wr_id: u64,
    ) -> Result<()> {
        self.post(WrOpcode::RdmaWrite, region, local_offset, remote_offset, len, wr_id)
    }

    /// Reads `len` bytes from the peer's region at `remote_offset` into
    /// `region[local_offset..]`.
    pub fn post_read(
        &self,
        region: &MemoryRegion,
        local_offset: usize,
        remote_offset: u64,
        len: u32,
        wr_id: u64,
    ) -> Result<()> {
        self.post(WrOpcode::RdmaRead, region, local_offset, remote_offset, len, wr_id)
    }

    fn post(
        &self,
        opcode: WrOpcode,
        region: &MemoryRegion,
        local_offset: usize,
        remote_offset: u64,
        len: u32,
        wr_id: u64,
    ) -> Result<()> {
        let state = self.state();
        let remote = match (state, self.remote) {
            (EndpointState::Connected, Some(remote)) => remote,
            _ => {
                return Err(RdmaError::NotConnected {
                    state: state.to_string(),
                })
            }
        };
        if !region.context().same_context(&self.ctx) {
            return Err(RdmaError::PostFailed {
                wr_id,
                reason: "region is registered on a different device context".to_string(),
            });
        }
        let local_end = local_offset.checked_add(len as usize);
        if local_end.map_or(true, |end| end > region.len()) {
            return Err(RdmaError::OutOfBounds {
                offset: local_offset,
                len: len as usize,
                region_len: region.len(),
            });
        }
        let remote_addr = remote
            .addr
            .checked_add(remote_offset)
            .filter(|addr| remote.region().offset_of(*addr, len as u64).is_some())
            .ok_or(RdmaError::OutOfBounds {
                offset: remote_offset as usize,
                len: len as usize,
                region_len: remote.len as usize,
            })?;

        let wr = SendRequest {
            wr_id,
            opcode,
            local: Sge {
                addr: region.addr() + local_offset as u64,
                length: len,
                lkey: region.lkey(),
            },
            remote_addr,
            rkey: remote.rkey,
            signaled: true,
        };
        self.ctx
            .verbs()
            .post_send(self.qp, &wr)
            .map_err(|e| RdmaError::PostFailed {
                wr_id,
                reason: e.to_string(),
            })?;
        debug!(qp = self.qp.0, wr_id, ?opcode, len, "posted work request");
        Ok(())
    }

    /// Destroys the queue pair.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(e) = self.ctx.verbs().destroy_qp(self.qp) {
            warn!(qp = self.qp.0, error = %e, "destroying queue pair");
        }
        self.ctx.endpoint_closed();
        self.state = EndpointState::Closed;
        debug!(qp = self.qp.0, "closed endpoint");
    }
}

impl Drop for ConnectionEndpoint {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RdmaConfig;
    use crate::sim::{SimFabric, SimFabricConfig, SimPort};
    use crate::verbs::{QpState, Verbs};
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "127.0.0.1:7471".parse().unwrap()
    }

    fn setup() -> (SimFabric, DeviceContext, MemoryRegion) {
        let fabric = SimFabric::new(SimFabricConfig::default())
            .with_device("mock0", vec![SimPort::active(1, 1)]);
        let config = RdmaConfig {
            device: "mock0".to_string(),
            shm_size: 4096,
            ..Default::default()
        };
        let ctx = DeviceContext::open(Arc::new(fabric.clone()), config).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        (fabric, ctx, region)
    }

    #[test]
    fn test_create_moves_to_init() {
        let (fabric, ctx, region) = setup();
        let ep = ConnectionEndpoint::create(&ctx, Role::Listener, addr(), &region, 42).unwrap();
        assert_eq!(ep.state(), EndpointState::Init);
        assert_eq!(fabric.query_qp_state(ep.qp_num()).unwrap(), QpState::Init);
        let info = ep.local_info();
        assert_eq!(info.session, 42);
        assert_eq!(info.peer_session, 0);
        assert_eq!(info.qp_num, ep.qp_num());
        assert_eq!(info.region(), region.descriptor());
        assert!(info.psn <= PSN_MASK);
        assert_eq!(ctx.resource_counts().endpoints, 1);
        drop(ep);
        assert_eq!(ctx.resource_counts().endpoints, 0);
        assert_eq!(fabric.live_queue_pairs(), 0);
    }

    #[test]
    fn test_loopback_establish_and_write() {
        let (fabric, ctx, region) = setup();
        let mut a = ConnectionEndpoint::create(&ctx, Role::Listener, addr(), &region, 1).unwrap();
        let mut b = ConnectionEndpoint::create(&ctx, Role::Connector, addr(), &region, 2).unwrap();
        let (info_a, info_b) = (a.local_info(), b.local_info());
        b.establish(&info_a).unwrap();
        a.establish(&info_b).unwrap();
        assert!(a.is_connected() && b.is_connected());
        assert_eq!(b.local_info().peer_session, 1);
        assert_eq!(a.local_info().peer_session, 0);
        assert_eq!(fabric.query_qp_state(a.qp_num()).unwrap(), QpState::ReadyToSend);

        region.write_at(0, b"ping").unwrap();
        a.post_write(&region, 0, 2048, 4, 9).unwrap();
        let mut out = [0u8; 4];
        region.read_at(2048, &mut out).unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn test_unknown_remote_qp_fails_establishment() {
        let (_fabric, ctx, region) = setup();
        let mut ep = ConnectionEndpoint::create(&ctx, Role::Connector, addr(), &region, 1).unwrap();
        let bogus = ConnectionInfo {
            qp_num: QpNum(9999),
            ..ep.local_info()
        };
        let err = ep.establish(&bogus).unwrap_err();
        assert!(matches!(err, RdmaError::EstablishmentFailed { stage: "ready-to-receive", .. }));
        assert!(!err.is_retryable());
        assert_eq!(ep.state(), EndpointState::Error);
        assert!(ep.establish(&bogus).is_err());
    }

    #[test]
    fn test_post_before_connected() {
        let (_fabric, ctx, region) = setup();
        let ep = ConnectionEndpoint::create(&ctx, Role::Listener, addr(), &region, 1).unwrap();
        let err = ep.post_write(&region, 0, 0, 16, 1).unwrap_err();
        assert!(matches!(err, RdmaError::NotConnected { ref state } if state == "init"));
    }

    #[test]
    fn test_post_out_of_bounds() {
        let (_fabric, ctx, region) = setup();
        let mut a = ConnectionEndpoint::create(&ctx, Role::Listener, addr(), &region, 1).unwrap();
        let mut b = ConnectionEndpoint::create(&ctx, Role::Connector, addr(), &region, 2).unwrap();
        let (info_a, info_b) = (a.local_info(), b.local_info());
        b.establish(&info_a).unwrap();
        a.establish(&info_b).unwrap();

        assert!(matches!(
            a.post_write(&region, 4090, 0, 16, 1),
            Err(RdmaError::OutOfBounds { offset: 4090, .. })
        ));
        assert!(matches!(
            a.post_read(&region, 0, 4090, 16, 2),
            Err(RdmaError::OutOfBounds { offset: 4090, region_len: 4096, .. })
        ));
        assert!(a.post_read(&region, 0, u64::MAX, 1, 3).is_err());
    }

    #[test]
    fn test_mark_failed_blocks_posting() {
        let (_fabric, ctx, region) = setup();
        let mut a = ConnectionEndpoint::create(&ctx, Role::Listener, addr(), &region, 1).unwrap();
        let mut b = ConnectionEndpoint::create(&ctx, Role::Connector, addr(), &region, 2).unwrap();
        let (info_a, info_b) = (a.local_info(), b.local_info());
        b.establish(&info_a).unwrap();
        a.establish(&info_b).unwrap();
        a.mark_failed();
        assert_eq!(a.state(), EndpointState::Error);
        assert!(matches!(
            a.post_write(&region, 0, 0, 1, 1),
            Err(RdmaError::NotConnected { .. })
        ));
        a.close();
        assert_eq!(ctx.resource_counts().endpoints, 1);
    }
}
