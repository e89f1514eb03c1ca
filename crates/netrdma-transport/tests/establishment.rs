//! Listener/connector establishment over in-memory and file side channels.

mod common;

use std::fs;
use std::time::{Duration, Instant};

use common::{addr, config, connect_pair, fabric, init_tracing, open, wait_until};
use netrdma_transport::sidechannel::{FileSideChannel, MemorySideChannel};
use netrdma_transport::verbs::{QpNum, QpState, Verbs, WcStatus};
use netrdma_transport::wire::{self, ConnectionInfo};
use netrdma_transport::{
    CompletionKind, CompletionRecord, CompletionStatus, EndpointState, Establishment, RdmaError,
    SideChannel, SimFabricConfig, Slot,
};
use tempfile::TempDir;

fn scenario_fabric() -> netrdma_transport::SimFabric {
    fabric(SimFabricConfig {
        first_qp_num: 7,
        qp_num_stride: 2,
        first_rkey: 0xAB,
        first_addr: 0x1000,
        ..Default::default()
    })
}

#[test]
fn test_listen_connect_scenario() {
    init_tracing();
    let fabric = scenario_fabric();
    let channel = MemorySideChannel::new();

    let (ctx, region) = open(&fabric, config(5_000));
    let listener_channel = channel.clone();
    let listener = std::thread::spawn(move || {
        let endpoint = Establishment::new(&ctx, &region, &listener_channel)
            .listen(addr())
            .unwrap();
        (ctx, region, endpoint)
    });

    assert!(wait_until(Duration::from_secs(5), || channel
        .is_ready(Slot::Offer)
        .unwrap()));
    let offer = wire::decode(&channel.read(Slot::Offer).unwrap().unwrap()).unwrap();
    assert_eq!(offer.qp_num, QpNum(7));
    assert_eq!(offer.rkey, 0xAB);
    assert_eq!(offer.addr, 0x1000);
    assert_eq!(offer.len, 4096);
    assert_eq!(offer.peer_session, 0);

    let (cctx, cregion) = open(&fabric, config(5_000));
    let connector = Establishment::new(&cctx, &cregion, &channel)
        .connect(addr())
        .unwrap();
    let (lctx, _lregion, listener) = listener.join().unwrap();

    assert_eq!(connector.qp_num(), QpNum(9));
    assert_eq!(connector.state(), EndpointState::Connected);
    assert_eq!(listener.state(), EndpointState::Connected);
    assert_eq!(listener.remote_info().unwrap().qp_num, QpNum(9));
    assert_eq!(listener.remote_info().unwrap().peer_session, offer.session);
    assert_eq!(connector.remote_info().unwrap(), offer);
    assert_eq!(fabric.query_qp_state(QpNum(7)).unwrap(), QpState::ReadyToSend);
    assert_eq!(fabric.query_qp_state(QpNum(9)).unwrap(), QpState::ReadyToSend);

    // The exchange was consumed.
    assert!(!channel.is_ready(Slot::Offer).unwrap());
    assert!(!channel.is_ready(Slot::Answer).unwrap());

    let bridge = lctx.completion_bridge();
    fabric
        .inject_completion(QpNum(7), 1, 128, WcStatus::Success)
        .unwrap();
    assert_eq!(
        bridge.drain_events().unwrap(),
        vec![CompletionRecord {
            wr_id: 1,
            byte_len: 128,
            status: CompletionStatus::Success,
            kind: CompletionKind::Send,
        }]
    );
    assert!(bridge.drain_events().unwrap().is_empty());
}

#[test]
fn test_connect_without_listener_times_out() {
    init_tracing();
    let fabric = fabric(SimFabricConfig::default());
    let (ctx, region) = open(&fabric, config(150));
    let channel = MemorySideChannel::new();

    let start = Instant::now();
    let err = Establishment::new(&ctx, &region, &channel)
        .connect(addr())
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        RdmaError::RendezvousTimeout { ref slot, waited_ms } => {
            assert_eq!(slot, "offer");
            assert!(waited_ms >= 150);
        }
        ref other => panic!("expected timeout, got {:?}", other),
    }
    assert!(err.is_retryable());
    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(fabric.live_queue_pairs(), 0);
}

#[test]
fn test_truncated_info_file_is_malformed() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(1_000);
    cfg.info_file = dir.path().join("netrdma.info");
    cfg.ready_file = dir.path().join("netrdma.ready");

    let fabric = fabric(SimFabricConfig::default());
    let (ctx, region) = open(&fabric, cfg.clone());

    let record = wire::encode(&ConnectionInfo {
        session: 3,
        peer_session: 0,
        lid: 1,
        gid: ctx.gid(),
        qp_num: QpNum(1),
        psn: 0,
        rkey: region.rkey(),
        addr: region.addr(),
        len: 4096,
    })
    .unwrap();
    fs::write(&cfg.info_file, &record[..record.len() - 5]).unwrap();
    fs::write(&cfg.ready_file, b"1").unwrap();

    let channel = FileSideChannel::from_config(&cfg);
    let err = Establishment::new(&ctx, &region, &channel)
        .connect(addr())
        .unwrap_err();
    assert!(matches!(err, RdmaError::MalformedRendezvousData { .. }), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(fabric.live_queue_pairs(), 0);
    assert!(!channel.is_ready(Slot::Answer).unwrap());
}

#[test]
fn test_file_channel_end_to_end() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(5_000);
    cfg.info_file = dir.path().join("c.info");
    cfg.ready_file = dir.path().join("c.ready");
    let fabric = fabric(SimFabricConfig::default());

    let (lctx, lregion) = open(&fabric, cfg.clone());
    let listener_cfg = cfg.clone();
    let listener = std::thread::spawn(move || {
        let channel = FileSideChannel::from_config(&listener_cfg);
        let endpoint = Establishment::new(&lctx, &lregion, &channel)
            .listen(addr())
            .unwrap();
        (lctx, lregion, endpoint)
    });

    let (cctx, cregion) = open(&fabric, cfg.clone());
    let channel = FileSideChannel::from_config(&cfg);
    let connector = Establishment::new(&cctx, &cregion, &channel)
        .connect(addr())
        .unwrap();
    let (_lctx, _lregion, listener) = listener.join().unwrap();

    assert!(connector.is_connected());
    assert!(listener.is_connected());
    assert_eq!(
        listener.remote_info().unwrap().peer_session,
        listener.local_info().session
    );
    // Every slot file is gone once the listener consumed the answer.
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_relisten_resets_stale_offer() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut cfg = config(5_000);
    cfg.info_file = dir.path().join("s.info");
    cfg.ready_file = dir.path().join("s.ready");
    let fabric = fabric(SimFabricConfig::default());

    // Files left by an earlier run whose queue pair no longer exists.
    let (cctx, cregion) = open(&fabric, cfg.clone());
    let stale = ConnectionInfo {
        session: 0x5757,
        peer_session: 0,
        lid: 1,
        gid: cctx.gid(),
        qp_num: QpNum(4242),
        psn: 0,
        rkey: 1,
        addr: 0x1000,
        len: 4096,
    };
    let channel = FileSideChannel::from_config(&cfg);
    channel.publish(Slot::Offer, &wire::encode(&stale).unwrap()).unwrap();

    // Picking that up connects to nothing, and the connector may retry.
    let err = Establishment::new(&cctx, &cregion, &channel)
        .connect(addr())
        .unwrap_err();
    assert!(matches!(err, RdmaError::MalformedRendezvousData { .. }), "{:?}", err);
    assert!(err.is_retryable());
    assert_eq!(cctx.resource_counts().endpoints, 0);
    assert!(!channel.is_ready(Slot::Answer).unwrap());

    // A fresh listen cycle replaces it before anyone can read it again.
    let (lctx, lregion) = open(&fabric, cfg.clone());
    let listener_cfg = cfg.clone();
    let listener = std::thread::spawn(move || {
        let channel = FileSideChannel::from_config(&listener_cfg);
        let endpoint = Establishment::new(&lctx, &lregion, &channel)
            .listen(addr())
            .unwrap();
        (lctx, lregion, endpoint)
    });
    assert!(wait_until(Duration::from_secs(5), || {
        channel
            .read(Slot::Offer)
            .ok()
            .flatten()
            .and_then(|bytes| wire::decode(&bytes).ok())
            .map_or(false, |info| info.session != stale.session)
    }));

    let connector = Establishment::new(&cctx, &cregion, &channel)
        .connect(addr())
        .unwrap();
    let (_lctx, _lregion, listener) = listener.join().unwrap();
    assert_ne!(connector.remote_info().unwrap().qp_num, stale.qp_num);
    assert_eq!(connector.remote_info().unwrap().session, listener.local_info().session);
    assert!(listener.is_connected());
}

#[test]
fn test_rdma_write_and_read_between_peers() {
    init_tracing();
    let fabric = fabric(SimFabricConfig::default());
    let (listener, connector) = connect_pair(&fabric, config(5_000));

    connector.region.write_at(0, b"hello, peer").unwrap();
    connector
        .endpoint
        .post_write(&connector.region, 0, 512, 11, 100)
        .unwrap();
    let records = connector.ctx.completion_bridge().drain_events().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].wr_id, 100);
    assert_eq!(records[0].kind, CompletionKind::RdmaWrite);
    assert!(records[0].status.is_success());

    let mut out = [0u8; 11];
    listener.region.read_at(512, &mut out).unwrap();
    assert_eq!(&out, b"hello, peer");

    listener.region.write_at(1024, b"reply").unwrap();
    connector
        .endpoint
        .post_read(&connector.region, 2048, 1024, 5, 101)
        .unwrap();
    let records = connector.ctx.completion_bridge().drain_events().unwrap();
    assert_eq!(records[0].kind, CompletionKind::RdmaRead);
    let mut out = [0u8; 5];
    connector.region.read_at(2048, &mut out).unwrap();
    assert_eq!(&out, b"reply");

    let stats = fabric.stats();
    assert_eq!(stats.bytes_written, 11);
    assert_eq!(stats.bytes_read, 5);
}

#[test]
fn test_resources_released_after_teardown() {
    init_tracing();
    let fabric = fabric(SimFabricConfig::default());
    let (listener, connector) = connect_pair(&fabric, config(5_000));
    assert_eq!(fabric.live_queue_pairs(), 2);
    assert_eq!(listener.ctx.resource_counts().total(), 2);

    for side in [listener, connector] {
        let common::Side {
            ctx,
            region,
            endpoint,
        } = side;
        endpoint.close();
        region.deregister().unwrap();
        assert_eq!(ctx.resource_counts().total(), 0);
        ctx.close();
    }
    assert_eq!(fabric.live_queue_pairs(), 0);
    assert_eq!(fabric.live_memory_regions(), 0);
    assert_eq!(fabric.open_devices(), 0);
}
