//! Process-level RDMA transport.
//!
//! [`RdmaTransport`] ties the pieces together the way an owning process uses
//! them: open the device and register the shared buffer at startup, call
//! [`listen`](RdmaTransport::listen) or [`connect`](RdmaTransport::connect)
//! once, register [`as_raw_fd`](RdmaTransport::as_raw_fd) with the event loop,
//! and call [`drain_events`](RdmaTransport::drain_events) whenever it fires.

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use tracing::info;

use crate::bridge::{CompletionBridge, CompletionRecord};
use crate::config::RdmaConfig;
use crate::device::DeviceContext;
use crate::endpoint::ConnectionEndpoint;
use crate::error::{RdmaError, Result};
use crate::memory::MemoryRegion;
use crate::rendezvous::Establishment;
use crate::sidechannel::{FileSideChannel, SideChannel};
use crate::verbs::Verbs;

/// RDMA transport owning the device context, the shared region, the side
/// channel and at most one live endpoint.
pub struct RdmaTransport {
    // Field order is teardown order.
    endpoint: Option<ConnectionEndpoint>,
    region: MemoryRegion,
    bridge: CompletionBridge,
    ctx: DeviceContext,
    channel: Box<dyn SideChannel>,
}

impl std::fmt::Debug for RdmaTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaTransport")
            .field("ctx", &self.ctx)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl RdmaTransport {
    /// Opens the configured device and registers `config.shm_size` bytes.
    ///
    /// Fails with [`RdmaError::RdmaDisabled`] without touching hardware when
    /// `config.enabled` is false.
    pub fn new(
        verbs: Arc<dyn Verbs>,
        config: RdmaConfig,
        channel: Box<dyn SideChannel>,
    ) -> Result<Self> {
        if !config.enabled {
            return Err(RdmaError::RdmaDisabled);
        }
        let shm_size = config.shm_size;
        let ctx = DeviceContext::open(verbs, config)?;
        let region = MemoryRegion::register(&ctx, shm_size)?;
        let bridge = ctx.completion_bridge();
        Ok(Self {
            endpoint: None,
            region,
            bridge,
            ctx,
            channel,
        })
    }

    /// Like [`new`](Self::new), rendezvousing through the configured files.
    pub fn with_file_channel(verbs: Arc<dyn Verbs>, config: RdmaConfig) -> Result<Self> {
        let channel = FileSideChannel::from_config(&config);
        Self::new(verbs, config, Box::new(channel))
    }

    /// Runs the listener role. A previous endpoint is closed first.
    pub fn listen(&mut self, local: SocketAddr) -> Result<&ConnectionEndpoint> {
        self.close_endpoint();
        let endpoint =
            Establishment::new(&self.ctx, &self.region, self.channel.as_ref()).listen(local)?;
        Ok(&*self.endpoint.insert(endpoint))
    }

    /// Runs the connector role. A previous endpoint is closed first.
    pub fn connect(&mut self, remote: SocketAddr) -> Result<&ConnectionEndpoint> {
        self.close_endpoint();
        let endpoint =
            Establishment::new(&self.ctx, &self.region, self.channel.as_ref()).connect(remote)?;
        Ok(&*self.endpoint.insert(endpoint))
    }

    /// Non-blocking drain; see [`CompletionBridge::drain_events`]. A fatal
    /// queue error also puts the endpoint in the error state.
    pub fn drain_events(&mut self) -> Result<Vec<CompletionRecord>> {
        let result = self.bridge.drain_events();
        if let Err(RdmaError::CompletionQueueError { .. }) = result {
            if let Some(endpoint) = self.endpoint.as_mut() {
                endpoint.mark_failed();
            }
        }
        result
    }

    /// Posts an RDMA WRITE from the shared region into the peer's region.
    pub fn post_write(
        &self,
        local_offset: usize,
        remote_offset: u64,
        len: u32,
        wr_id: u64,
    ) -> Result<()> {
        self.connected()?
            .post_write(&self.region, local_offset, remote_offset, len, wr_id)
    }

    /// Posts an RDMA READ from the peer's region into the shared region.
    pub fn post_read(
        &self,
        local_offset: usize,
        remote_offset: u64,
        len: u32,
        wr_id: u64,
    ) -> Result<()> {
        self.connected()?
            .post_read(&self.region, local_offset, remote_offset, len, wr_id)
    }

    fn connected(&self) -> Result<&ConnectionEndpoint> {
        self.endpoint.as_ref().ok_or_else(|| RdmaError::NotConnected {
            state: "no endpoint".to_string(),
        })
    }

    /// The endpoint of the last successful `listen` or `connect`.
    pub fn endpoint(&self) -> Option<&ConnectionEndpoint> {
        self.endpoint.as_ref()
    }

    /// The shared region, registered at construction.
    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    /// The device context the transport opened.
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Bridge over the context's completion channel.
    pub fn bridge(&self) -> &CompletionBridge {
        &self.bridge
    }

    fn close_endpoint(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close();
        }
    }

    /// Closes the endpoint, deregisters the region and closes the context.
    pub fn shutdown(self) -> Result<()> {
        let Self {
            endpoint,
            region,
            bridge,
            ctx,
            channel: _,
        } = self;
        if let Some(endpoint) = endpoint {
            endpoint.close();
        }
        region.deregister()?;
        drop(bridge);
        info!(device = ctx.device_name(), "RDMA transport shut down");
        ctx.close();
        Ok(())
    }
}

impl AsRawFd for RdmaTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.bridge.as_raw_fd()
    }
}
