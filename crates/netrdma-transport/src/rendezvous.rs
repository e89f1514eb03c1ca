//! Listener/connector handshake over a [`SideChannel`].
//!
//! The listener publishes an offer and waits for an answer; the connector
//! waits for the offer, brings its queue pair up against it, and answers.
//! Each listen cycle has a fresh session nonce that the connector echoes, so
//! an answer left over from an earlier cycle is never mistaken for the
//! current one.

use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::deadline::{Backoff, Deadline};
use crate::device::DeviceContext;
use crate::endpoint::{ConnectionEndpoint, Role};
use crate::error::{RdmaError, Result};
use crate::memory::MemoryRegion;
use crate::sidechannel::{SideChannel, Slot};
use crate::wire::{self, ConnectionInfo};

fn new_session() -> u64 {
    rand::thread_rng().gen_range(1..=u64::MAX)
}

/// Offers must not echo a session.
pub fn validate_offer(info: &ConnectionInfo) -> Result<()> {
    info.validate()?;
    if !info.is_offer() {
        return Err(RdmaError::malformed(format!(
            "offer carries a peer session {:#x}",
            info.peer_session
        )));
    }
    Ok(())
}

/// Answers must echo the session of the offer they respond to.
pub fn validate_answer(info: &ConnectionInfo) -> Result<()> {
    info.validate()?;
    if info.is_offer() {
        return Err(RdmaError::malformed("answer does not echo a session"));
    }
    Ok(())
}

/// Connection establishment for one device context and registered region.
pub struct Establishment<'a> {
    ctx: &'a DeviceContext,
    region: &'a MemoryRegion,
    channel: &'a dyn SideChannel,
}

impl<'a> Establishment<'a> {
    /// Binds a context, the region to publish and the channel to rendezvous over.
    pub fn new(ctx: &'a DeviceContext, region: &'a MemoryRegion, channel: &'a dyn SideChannel) -> Self {
        Self { ctx, region, channel }
    }

    fn preflight(&self) -> Result<()> {
        if !self.ctx.config().enabled {
            return Err(RdmaError::RdmaDisabled);
        }
        if !self.region.context().same_context(self.ctx) {
            return Err(RdmaError::InvalidConfig {
                reason: "memory region is registered on a different device context".to_string(),
            });
        }
        Ok(())
    }

    fn poll_schedule(&self) -> (Deadline, Backoff) {
        let config = self.ctx.config();
        (
            Deadline::new(config.rendezvous_timeout()),
            Backoff::new(config.poll_initial(), config.poll_max()),
        )
    }

    /// Publishes this side's info and waits for a connector to answer.
    pub fn listen(&self, local: SocketAddr) -> Result<ConnectionEndpoint> {
        self.preflight()?;
        let session = new_session();
        let mut endpoint =
            ConnectionEndpoint::create(self.ctx, Role::Listener, local, self.region, session)?;

        // Anything left from an earlier cycle must be gone before the new
        // offer becomes visible.
        self.channel.retract(Slot::Offer)?;
        self.channel.retract(Slot::Answer)?;
        let record = wire::encode(&endpoint.local_info())?;
        self.channel.publish(Slot::Offer, &record)?;
        info!(
            %local,
            qp = endpoint.qp_num().0,
            session = format_args!("{:#x}", session),
            "published connection offer"
        );

        let result = self
            .await_answer(session)
            .and_then(|remote| endpoint.establish(&remote).map(|()| remote));
        self.retract_all();
        let remote = result?;

        info!(
            %local,
            qp = endpoint.qp_num().0,
            remote_qp = remote.qp_num.0,
            "listener connected"
        );
        Ok(endpoint)
    }

    /// Waits for a listener's offer, connects to it and answers.
    ///
    /// An offer whose queue pair cannot be reached is reported as
    /// [`RdmaError::MalformedRendezvousData`], so the caller can retry once a
    /// fresh listen cycle has replaced it.
    pub fn connect(&self, remote: SocketAddr) -> Result<ConnectionEndpoint> {
        self.preflight()?;
        let mut endpoint =
            ConnectionEndpoint::create(self.ctx, Role::Connector, remote, self.region, new_session())?;

        let offer = self.await_offer()?;
        endpoint.establish(&offer).map_err(|err| match err {
            // The offer outlived the listener that published it.
            RdmaError::EstablishmentFailed {
                stage: "ready-to-receive",
                reason,
            } => {
                warn!(
                    session = format_args!("{:#x}", offer.session),
                    qp = offer.qp_num.0,
                    "stale offer"
                );
                RdmaError::malformed(format!(
                    "offer for session {:#x} names an unreachable queue pair: {}",
                    offer.session, reason
                ))
            }
            other => other,
        })?;

        let answer = endpoint.local_info();
        let record = wire::encode(&answer)?;
        self.channel.publish(Slot::Answer, &record)?;
        info!(
            %remote,
            qp = endpoint.qp_num().0,
            remote_qp = offer.qp_num.0,
            "connector connected"
        );
        Ok(endpoint)
    }

    fn await_offer(&self) -> Result<ConnectionInfo> {
        let (deadline, mut backoff) = self.poll_schedule();
        loop {
            if self.channel.is_ready(Slot::Offer)? {
                let bytes = self
                    .channel
                    .read(Slot::Offer)?
                    .ok_or_else(|| RdmaError::malformed("offer is signalled but missing"))?;
                let offer = wire::decode(&bytes)?;
                validate_offer(&offer)?;
                debug!(qp = offer.qp_num.0, attempts = backoff.attempts(), "read connection offer");
                return Ok(offer);
            }
            if !deadline.sleep(&mut backoff) {
                return Err(RdmaError::RendezvousTimeout {
                    slot: Slot::Offer.to_string(),
                    waited_ms: deadline.elapsed().as_millis() as u64,
                });
            }
        }
    }

    fn await_answer(&self, session: u64) -> Result<ConnectionInfo> {
        let (deadline, mut backoff) = self.poll_schedule();
        let mut last_stale = None;
        loop {
            if self.channel.is_ready(Slot::Answer)? {
                // Missing info under a ready signal means a retract raced the
                // read; keep waiting.
                if let Some(bytes) = self.channel.read(Slot::Answer)? {
                    let answer = wire::decode(&bytes)?;
                    validate_answer(&answer)?;
                    if answer.peer_session == session {
                        debug!(qp = answer.qp_num.0, attempts = backoff.attempts(), "read connection answer");
                        return Ok(answer);
                    }
                    if last_stale != Some(answer.session) {
                        warn!(
                            expected = format_args!("{:#x}", session),
                            got = format_args!("{:#x}", answer.peer_session),
                            "ignoring stale answer"
                        );
                        last_stale = Some(answer.session);
                    }
                }
            }
            if !deadline.sleep(&mut backoff) {
                return Err(RdmaError::RendezvousTimeout {
                    slot: Slot::Answer.to_string(),
                    waited_ms: deadline.elapsed().as_millis() as u64,
                });
            }
        }
    }

    fn retract_all(&self) {
        for slot in [Slot::Offer, Slot::Answer] {
            if let Err(e) = self.channel.retract(slot) {
                warn!(%slot, error = %e, "retracting side-channel slot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RdmaConfig;
    use crate::endpoint::EndpointState;
    use crate::sidechannel::MemorySideChannel;
    use crate::sim::{SimFabric, SimFabricConfig, SimPort};
    use crate::verbs::QpNum;
    use std::sync::Arc;

    fn config() -> RdmaConfig {
        RdmaConfig {
            device: "mock0".to_string(),
            shm_size: 4096,
            rendezvous_timeout_ms: 50,
            poll_initial_ms: 1,
            poll_max_ms: 5,
            ..Default::default()
        }
    }

    fn fabric() -> SimFabric {
        SimFabric::new(SimFabricConfig::default()).with_device("mock0", vec![SimPort::active(1, 1)])
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7471".parse().unwrap()
    }

    #[test]
    fn test_validate_offer_and_answer() {
        let offer = ConnectionInfo {
            session: 1,
            peer_session: 0,
            lid: 1,
            gid: Default::default(),
            qp_num: QpNum(3),
            psn: 0,
            rkey: 1,
            addr: 0x1000,
            len: 64,
        };
        validate_offer(&offer).unwrap();
        assert!(validate_answer(&offer).is_err());
        let answer = ConnectionInfo {
            peer_session: 1,
            ..offer
        };
        validate_answer(&answer).unwrap();
        assert!(validate_offer(&answer).is_err());
    }

    #[test]
    fn test_disabled_fails_before_touching_hardware() {
        let fabric = fabric();
        let ctx = DeviceContext::open(
            Arc::new(fabric.clone()),
            RdmaConfig {
                enabled: false,
                ..config()
            },
        )
        .unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();
        let est = Establishment::new(&ctx, &region, &channel);
        assert!(matches!(est.listen(addr()), Err(RdmaError::RdmaDisabled)));
        assert!(matches!(est.connect(addr()), Err(RdmaError::RdmaDisabled)));
        assert_eq!(fabric.live_queue_pairs(), 0);
        assert!(!channel.is_ready(Slot::Offer).unwrap());
    }

    #[test]
    fn test_connect_times_out_without_listener() {
        let fabric = fabric();
        let ctx = DeviceContext::open(Arc::new(fabric.clone()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();
        let err = Establishment::new(&ctx, &region, &channel)
            .connect(addr())
            .unwrap_err();
        assert!(matches!(err, RdmaError::RendezvousTimeout { ref slot, .. } if slot == "offer"));
        assert!(err.is_retryable());
        assert_eq!(fabric.live_queue_pairs(), 0);
    }

    #[test]
    fn test_listen_timeout_retracts_offer() {
        let ctx = DeviceContext::open(Arc::new(fabric()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();
        let err = Establishment::new(&ctx, &region, &channel)
            .listen(addr())
            .unwrap_err();
        assert!(matches!(err, RdmaError::RendezvousTimeout { ref slot, .. } if slot == "answer"));
        assert!(!channel.is_ready(Slot::Offer).unwrap());
        assert_eq!(channel.read(Slot::Offer).unwrap(), None);
    }

    #[test]
    fn test_connect_rejects_garbage_offer() {
        let fabric = fabric();
        let ctx = DeviceContext::open(Arc::new(fabric.clone()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();
        channel.plant(Slot::Offer, b"NRCI\x01\x00".to_vec());
        let err = Establishment::new(&ctx, &region, &channel)
            .connect(addr())
            .unwrap_err();
        assert!(matches!(err, RdmaError::MalformedRendezvousData { .. }));
        assert!(!channel.is_ready(Slot::Answer).unwrap());
        assert_eq!(fabric.live_queue_pairs(), 0);
    }

    #[test]
    fn test_connect_on_dead_offer_is_retryable() {
        let fabric = fabric();
        let ctx = DeviceContext::open(Arc::new(fabric.clone()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();
        let dead = ConnectionInfo {
            session: 0x77,
            peer_session: 0,
            lid: ctx.lid(),
            gid: ctx.gid(),
            qp_num: QpNum(31337),
            psn: 0,
            rkey: region.rkey(),
            addr: region.addr(),
            len: 4096,
        };
        channel.plant(Slot::Offer, wire::encode(&dead).unwrap());

        let err = Establishment::new(&ctx, &region, &channel)
            .connect(addr())
            .unwrap_err();
        assert!(matches!(err, RdmaError::MalformedRendezvousData { .. }), "{:?}", err);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("0x77"));
        assert_eq!(fabric.live_queue_pairs(), 0);
    }

    #[test]
    fn test_connect_rejects_signalled_but_missing_offer() {
        let ctx = DeviceContext::open(Arc::new(fabric()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let channel = crate::sidechannel::FileSideChannel::new(
            dir.path().join("x.info"),
            dir.path().join("x.ready"),
        );
        std::fs::write(dir.path().join("x.ready"), b"1").unwrap();
        let err = Establishment::new(&ctx, &region, &channel)
            .connect(addr())
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_listener_ignores_stale_answer() {
        let fabric = fabric();
        let ctx = DeviceContext::open(Arc::new(fabric.clone()), config()).unwrap();
        let region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();

        // An answer to some other offer shows up after the slots were reset.
        let planter = channel.clone();
        let stale = ConnectionInfo {
            session: 5,
            peer_session: 0xdead,
            lid: 1,
            gid: ctx.gid(),
            qp_num: QpNum(1),
            psn: 0,
            rkey: region.rkey(),
            addr: region.addr(),
            len: 4096,
        };
        let handle = std::thread::spawn(move || {
            while !planter.is_ready(Slot::Offer).unwrap() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            planter.publish(Slot::Answer, &wire::encode(&stale).unwrap()).unwrap();
        });
        let err = Establishment::new(&ctx, &region, &channel)
            .listen(addr())
            .unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, RdmaError::RendezvousTimeout { .. }));
        assert_eq!(fabric.live_queue_pairs(), 0);
    }

    #[test]
    fn test_loopback_listen_connect() {
        let fabric = fabric();
        let ctx = DeviceContext::open(
            Arc::new(fabric.clone()),
            RdmaConfig {
                rendezvous_timeout_ms: 5_000,
                ..config()
            },
        )
        .unwrap();
        let listener_region = MemoryRegion::register(&ctx, 4096).unwrap();
        let listener_desc = listener_region.descriptor();
        let connector_region = MemoryRegion::register(&ctx, 4096).unwrap();
        let channel = MemorySideChannel::new();

        std::thread::scope(|s| {
            let (ctx_ref, channel_ref) = (&ctx, &channel);
            let listener = s.spawn(move || {
                let ep = Establishment::new(ctx_ref, &listener_region, channel_ref).listen(addr());
                (ep, listener_region)
            });
            let connector = Establishment::new(&ctx, &connector_region, &channel)
                .connect(addr())
                .unwrap();
            let (listener, _region) = listener.join().unwrap();
            let listener = listener.unwrap();

            assert_eq!(listener.state(), EndpointState::Connected);
            assert_eq!(connector.state(), EndpointState::Connected);
            let offer = listener.local_info();
            let answer = connector.local_info();
            assert_eq!(answer.peer_session, offer.session);
            assert_eq!(connector.remote_info().unwrap().region(), listener_desc);
            assert_eq!(listener.remote_info().unwrap().region(), connector_region.descriptor());
        });
        assert!(!channel.is_ready(Slot::Offer).unwrap());
        assert!(!channel.is_ready(Slot::Answer).unwrap());
    }
}
