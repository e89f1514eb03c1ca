//! Device context: the root owner of every hardware resource.
//!
//! Opening a context selects the device, port and GID index from the
//! configuration, allocates the protection domain, and creates the completion
//! channel plus the one completion queue that all queue pairs of this
//! context report into. Memory regions and endpoints keep a cloned handle and
//! are counted, so `close` can refuse to pull resources out from under them.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::bridge::CompletionBridge;
use crate::config::RdmaConfig;
use crate::error::{RdmaError, Result};
use crate::verbs::{ChannelId, CqId, DeviceId, Gid, PdId, PortState, Verbs, VerbsError};

/// Live resources derived from a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    /// Registered memory regions.
    pub regions: usize,
    /// Queue pairs not yet closed.
    pub endpoints: usize,
}

impl ResourceCounts {
    /// Everything that must be released before `close`.
    pub fn total(&self) -> usize {
        self.regions + self.endpoints
    }
}

struct ContextInner {
    verbs: Arc<dyn Verbs>,
    config: RdmaConfig,
    device: DeviceId,
    pd: PdId,
    channel: ChannelId,
    cq: CqId,
    channel_fd: RawFd,
    lid: u16,
    gid: Gid,
    live_regions: AtomicUsize,
    live_endpoints: AtomicUsize,
    cq_failed: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let steps: [(&str, std::result::Result<(), VerbsError>); 4] = [
            ("destroy_cq", self.verbs.destroy_cq(self.cq)),
            ("destroy_comp_channel", self.verbs.destroy_comp_channel(self.channel)),
            ("dealloc_pd", self.verbs.dealloc_pd(self.pd)),
            ("close_device", self.verbs.close_device(self.device)),
        ];
        for (op, result) in steps {
            if let Err(e) = result {
                warn!(device = %self.config.device, op, error = %e, "device teardown step failed");
            }
        }
        info!(device = %self.config.device, port = self.config.port, "closed RDMA device");
    }
}

/// Handle to an opened RDMA device. Clones share the same hardware objects.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.inner.config.device)
            .field("port", &self.inner.config.port)
            .field("gid_index", &self.inner.config.gid_index)
            .field("lid", &self.inner.lid)
            .field("resources", &self.resource_counts())
            .finish()
    }
}

impl DeviceContext {
    /// Opens `config.device`, checks the port is active and the GID index is
    /// populated, and allocates the protection domain and completion
    /// resources.
    pub fn open(verbs: Arc<dyn Verbs>, config: RdmaConfig) -> Result<Self> {
        config.validate()?;
        let name = config.device.clone();
        let setup = |e: VerbsError| RdmaError::DeviceSetup {
            device: name.clone(),
            reason: e.to_string(),
        };

        let device = verbs.open_device(&name).map_err(|e| match e {
            VerbsError::NoSuchDevice(_) => RdmaError::DeviceNotFound {
                device: name.clone(),
            },
            other => setup(other),
        })?;

        // Partially opened resources are released in reverse order on any
        // failure below.
        let mut opened = Partial {
            verbs: verbs.as_ref(),
            device,
            pd: None,
            channel: None,
            cq: None,
            armed: true,
        };

        let port = verbs
            .query_port(device, config.port)
            .map_err(|e| RdmaError::PortUnavailable {
                device: name.clone(),
                port: config.port,
                reason: e.to_string(),
            })?;
        if port.state != PortState::Active {
            return Err(RdmaError::PortUnavailable {
                device: name.clone(),
                port: config.port,
                reason: format!("port state is {:?}", port.state),
            });
        }
        let gid = verbs
            .query_gid(device, config.port, config.gid_index)
            .map_err(|_| RdmaError::InvalidAddressIndex {
                device: name.clone(),
                port: config.port,
                index: config.gid_index,
            })?;

        let pd = verbs.alloc_pd(device).map_err(setup)?;
        opened.pd = Some(pd);
        let channel = verbs.create_comp_channel(device).map_err(setup)?;
        opened.channel = Some(channel);
        let channel_fd = verbs.channel_fd(channel).map_err(setup)?;
        let cq = verbs
            .create_cq(device, channel, config.cq_depth)
            .map_err(setup)?;
        opened.cq = Some(cq);
        verbs.req_notify_cq(cq).map_err(setup)?;
        opened.armed = false;
        drop(opened);

        info!(
            device = %name,
            port = config.port,
            gid_index = config.gid_index,
            lid = port.lid,
            gid = %gid,
            "opened RDMA device"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                verbs,
                config,
                device,
                pd,
                channel,
                cq,
                channel_fd,
                lid: port.lid,
                gid,
                live_regions: AtomicUsize::new(0),
                live_endpoints: AtomicUsize::new(0),
                cq_failed: AtomicBool::new(false),
            }),
        })
    }

    /// Releases the context.
    ///
    /// # Panics
    ///
    /// Panics if any memory region or endpoint derived from this context is
    /// still alive.
    pub fn close(self) {
        let counts = self.resource_counts();
        if counts.total() != 0 {
            panic!(
                "DeviceContext::close on {} with {} live regions and {} live endpoints",
                self.inner.config.device, counts.regions, counts.endpoints
            );
        }
        if Arc::strong_count(&self.inner) > 1 {
            debug!(
                device = %self.inner.config.device,
                "close deferred until remaining handles are dropped"
            );
        }
    }

    /// Settings the context was opened with.
    pub fn config(&self) -> &RdmaConfig {
        &self.inner.config
    }

    /// Configured device name.
    pub fn device_name(&self) -> &str {
        &self.inner.config.device
    }

    /// Port the context is bound to.
    pub fn port(&self) -> u8 {
        self.inner.config.port
    }

    /// GID table index used for addressing.
    pub fn gid_index(&self) -> u8 {
        self.inner.config.gid_index
    }

    /// Local identifier of the port.
    pub fn lid(&self) -> u16 {
        self.inner.lid
    }

    /// Port GID at the configured index.
    pub fn gid(&self) -> Gid {
        self.inner.gid
    }

    /// Snapshot of the live regions and endpoints.
    pub fn resource_counts(&self) -> ResourceCounts {
        ResourceCounts {
            regions: self.inner.live_regions.load(Ordering::Acquire),
            endpoints: self.inner.live_endpoints.load(Ordering::Acquire),
        }
    }

    /// The adapter between this context's completion channel and an
    /// external readiness-based event loop.
    pub fn completion_bridge(&self) -> CompletionBridge {
        CompletionBridge::new(self.clone())
    }

    pub(crate) fn verbs(&self) -> &dyn Verbs {
        self.inner.verbs.as_ref()
    }

    pub(crate) fn pd(&self) -> PdId {
        self.inner.pd
    }

    pub(crate) fn cq(&self) -> CqId {
        self.inner.cq
    }

    pub(crate) fn channel(&self) -> ChannelId {
        self.inner.channel
    }

    pub(crate) fn channel_fd(&self) -> RawFd {
        self.inner.channel_fd
    }

    pub(crate) fn cq_failed(&self) -> bool {
        self.inner.cq_failed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_cq_failed(&self) {
        self.inner.cq_failed.store(true, Ordering::Release);
    }

    pub(crate) fn same_context(&self, other: &DeviceContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn region_opened(&self) {
        self.inner.live_regions.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn region_closed(&self) {
        self.inner.live_regions.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn endpoint_opened(&self) {
        self.inner.live_endpoints.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn endpoint_closed(&self) {
        self.inner.live_endpoints.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Resources opened so far by `DeviceContext::open`, released on drop unless
/// disarmed.
struct Partial<'a> {
    verbs: &'a dyn Verbs,
    device: DeviceId,
    pd: Option<PdId>,
    channel: Option<ChannelId>,
    cq: Option<CqId>,
    armed: bool,
}

impl Drop for Partial<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(cq) = self.cq.take() {
            let _ = self.verbs.destroy_cq(cq);
        }
        if let Some(channel) = self.channel.take() {
            let _ = self.verbs.destroy_comp_channel(channel);
        }
        if let Some(pd) = self.pd.take() {
            let _ = self.verbs.dealloc_pd(pd);
        }
        let _ = self.verbs.close_device(self.device);
    }
}
