//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use netrdma_transport::{
    ConnectionEndpoint, DeviceContext, Establishment, MemoryRegion, MemorySideChannel, RdmaConfig,
    RdmaError, SideChannel, SimFabric, SimFabricConfig, SimPort, Slot,
};
use tracing_subscriber::EnvFilter;

pub const DEVICE: &str = "mock0";

/// Installs a test-friendly subscriber once; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn addr() -> SocketAddr {
    "10.0.0.1:7471".parse().unwrap()
}

pub fn fabric(config: SimFabricConfig) -> SimFabric {
    SimFabric::new(config).with_device(DEVICE, vec![SimPort::active(1, 1)])
}

pub fn config(timeout_ms: u64) -> RdmaConfig {
    RdmaConfig {
        device: DEVICE.to_string(),
        port: 1,
        gid_index: 0,
        shm_size: 4096,
        rendezvous_timeout_ms: timeout_ms,
        poll_initial_ms: 1,
        poll_max_ms: 10,
        ..Default::default()
    }
}

pub fn open(fabric: &SimFabric, config: RdmaConfig) -> (DeviceContext, MemoryRegion) {
    let size = config.shm_size;
    let ctx = DeviceContext::open(Arc::new(fabric.clone()), config).unwrap();
    let region = MemoryRegion::register(&ctx, size).unwrap();
    (ctx, region)
}

/// One side of an established connection.
pub struct Side {
    pub ctx: DeviceContext,
    pub region: MemoryRegion,
    pub endpoint: ConnectionEndpoint,
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Runs a listener on its own thread and a connector on this one. The
/// connector side is only opened once the offer is visible, so the listener
/// always gets the first queue pair and region numbers.
pub fn connect_pair(fabric: &SimFabric, config: RdmaConfig) -> (Side, Side) {
    let channel = MemorySideChannel::new();
    let (ctx, region) = open(fabric, config.clone());
    let listener_channel = channel.clone();
    let handle = std::thread::spawn(move || {
        let endpoint = Establishment::new(&ctx, &region, &listener_channel).listen(addr())?;
        Ok::<_, RdmaError>(Side {
            ctx,
            region,
            endpoint,
        })
    });

    assert!(wait_until(Duration::from_secs(5), || channel
        .is_ready(Slot::Offer)
        .unwrap()));
    let (ctx, region) = open(fabric, config);
    let endpoint = Establishment::new(&ctx, &region, &channel)
        .connect(addr())
        .unwrap();
    let listener = handle.join().unwrap().unwrap();
    (
        listener,
        Side {
            ctx,
            region,
            endpoint,
        },
    )
}
