//! RDMA simulation for testing without hardware.
//!
//! [`SimFabric`] implements [`Verbs`] in software: devices and ports,
//! protection domains, memory registrations with keys, reliable-connected
//! queue pairs that enforce the RESET → INIT → RTR → RTS order, one-sided
//! READ/WRITE between registered regions, and completion channels whose
//! readiness is a real Linux `eventfd`, so an epoll/tokio loop can wait on
//! simulated completions exactly as it would on hardware.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::verbs::{
    AccessFlags, ChannelId, CqId, DeviceId, Gid, MrId, MrKeys, PdId, PortAttr, PortState, QpCaps,
    QpNum, QpState, QpTransition, SendRequest, Verbs, VerbsError, WcStatus, WorkCompletion,
    WrOpcode,
};

const PAGE_SIZE: u64 = 4096;

/// Knobs for identifier allocation and limits in the simulated fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// Number handed to the first queue pair.
    pub first_qp_num: u32,
    /// Distance between consecutive queue pair numbers.
    pub qp_num_stride: u32,
    /// Remote key handed to the first registration.
    pub first_rkey: u32,
    /// Address handed to the first registration.
    pub first_addr: u64,
    /// Largest single registration accepted.
    pub max_mr_size: usize,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            first_qp_num: 1,
            qp_num_stride: 1,
            first_rkey: 0x100,
            first_addr: 0x1000,
            max_mr_size: 1 << 30,
        }
    }
}

/// Counters for data movement through the fabric.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FabricStats {
    /// Work requests that completed successfully.
    pub operations_completed: u64,
    /// Work requests that completed with an error.
    pub operations_failed: u64,
    /// Bytes moved by successful RDMA writes.
    pub bytes_written: u64,
    /// Bytes moved by successful RDMA reads.
    pub bytes_read: u64,
}

/// A port of a simulated device.
#[derive(Debug, Clone)]
pub struct SimPort {
    /// Port number, starting at 1.
    pub num: u8,
    /// Logical state.
    pub state: PortState,
    /// Local identifier.
    pub lid: u16,
    /// GID table.
    pub gids: Vec<Gid>,
}

impl SimPort {
    /// An active port with a link-local GID derived from its LID at index 0.
    pub fn active(num: u8, lid: u16) -> Self {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[14..].copy_from_slice(&lid.to_be_bytes());
        Self {
            num,
            state: PortState::Active,
            lid,
            gids: vec![Gid(raw)],
        }
    }

    /// A port that is down and has no addresses.
    pub fn down(num: u8) -> Self {
        Self {
            num,
            state: PortState::Down,
            lid: 0,
            gids: Vec::new(),
        }
    }
}

struct MrPtr(*mut u8);

// SAFETY: the pointer is only dereferenced under the fabric lock, and the
// registrant keeps the memory alive until `dereg_mr` returns.
unsafe impl Send for MrPtr {}

struct SimMr {
    pd: PdId,
    ptr: MrPtr,
    len: usize,
    access: AccessFlags,
    keys: MrKeys,
}

impl SimMr {
    fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        let start = addr.checked_sub(self.keys.addr)?;
        let end = start.checked_add(len)?;
        if end > self.len as u64 {
            return None;
        }
        Some(start as usize)
    }
}

struct SimChannel {
    dev: DeviceId,
    fd: OwnedFd,
    pending: VecDeque<CqId>,
}

struct SimCq {
    dev: DeviceId,
    channel: ChannelId,
    depth: usize,
    entries: VecDeque<WorkCompletion>,
    armed: bool,
    fatal: bool,
    unacked_events: u32,
}

struct SimQp {
    dev: DeviceId,
    pd: PdId,
    send_cq: CqId,
    recv_cq: CqId,
    state: QpState,
    remote: Option<QpNum>,
    caps: QpCaps,
}

struct FabricState {
    config: SimFabricConfig,
    catalog: HashMap<String, Vec<SimPort>>,
    devices: HashMap<DeviceId, String>,
    pds: HashMap<PdId, DeviceId>,
    channels: HashMap<ChannelId, SimChannel>,
    cqs: HashMap<CqId, SimCq>,
    mrs: HashMap<MrId, SimMr>,
    qps: HashMap<QpNum, SimQp>,
    next_handle: u64,
    next_qp_num: u32,
    next_key: u32,
    next_addr: u64,
    stats: FabricStats,
}

impl FabricState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn ports(&self, dev: DeviceId) -> Result<&[SimPort], VerbsError> {
        let name = self
            .devices
            .get(&dev)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", dev)))?;
        self.catalog
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| VerbsError::NoSuchDevice(name.clone()))
    }

    fn port(&self, dev: DeviceId, port: u8) -> Result<&SimPort, VerbsError> {
        self.ports(dev)?
            .iter()
            .find(|p| p.num == port)
            .ok_or(VerbsError::InvalidPort(port))
    }

    fn mr_by_lkey(&self, lkey: u32) -> Option<&SimMr> {
        self.mrs.values().find(|mr| mr.keys.lkey == lkey)
    }

    fn mr_by_rkey(&self, rkey: u32) -> Option<&SimMr> {
        self.mrs.values().find(|mr| mr.keys.rkey == rkey)
    }

    /// Queues a completion and raises the channel notification if armed.
    fn complete(&mut self, cq_id: CqId, wc: WorkCompletion) {
        let Some(cq) = self.cqs.get_mut(&cq_id) else {
            return;
        };
        if cq.fatal {
            return;
        }
        let overrun = cq.entries.len() >= cq.depth;
        if overrun {
            debug!(cq = ?cq_id, depth = cq.depth, "completion queue overrun");
        } else {
            cq.entries.push_back(wc);
        }
        let notify = std::mem::take(&mut cq.armed).then_some(cq.channel);
        if overrun {
            self.fail_cq(cq_id);
        }
        if let Some(channel) = notify.and_then(|id| self.channels.get_mut(&id)) {
            channel.pending.push_back(cq_id);
            eventfd_signal(channel.fd.as_raw_fd());
        }
    }

    /// Marks a queue fatal. Queue pairs reporting into it drop to Error, so
    /// later posts are refused instead of completing into nothing.
    fn fail_cq(&mut self, cq_id: CqId) {
        if let Some(cq) = self.cqs.get_mut(&cq_id) {
            cq.fatal = true;
        }
        for qp in self
            .qps
            .values_mut()
            .filter(|qp| qp.send_cq == cq_id || qp.recv_cq == cq_id)
        {
            qp.state = QpState::Error;
        }
    }

    /// Runs a one-sided operation against the peer's registration.
    fn execute(&mut self, qp_num: QpNum, wr: &SendRequest) -> WcStatus {
        let Some(remote_pd) = self
            .qps
            .get(&qp_num)
            .and_then(|qp| qp.remote)
            .and_then(|remote| self.qps.get(&remote))
            .map(|remote| remote.pd)
        else {
            return WcStatus::RetryExceeded;
        };
        let Some(local) = self.mr_by_lkey(wr.local.lkey) else {
            return WcStatus::LocalProtectionError;
        };
        let Some(local_off) = local.offset_of(wr.local.addr, wr.local.length as u64) else {
            return WcStatus::LocalLengthError;
        };
        let Some(remote) = self.mr_by_rkey(wr.rkey) else {
            return WcStatus::RemoteAccessError;
        };
        if remote.pd != remote_pd {
            return WcStatus::RemoteAccessError;
        }
        let Some(remote_off) = remote.offset_of(wr.remote_addr, wr.local.length as u64) else {
            return WcStatus::RemoteAccessError;
        };
        let len = wr.local.length as usize;

        match wr.opcode {
            WrOpcode::RdmaWrite => {
                if !remote.access.contains(AccessFlags::REMOTE_WRITE) {
                    return WcStatus::RemoteAccessError;
                }
                // SAFETY: both ranges were bounds-checked against live
                // registrations; ptr::copy tolerates overlap on loopback.
                unsafe {
                    std::ptr::copy(local.ptr.0.add(local_off), remote.ptr.0.add(remote_off), len);
                }
                self.stats.bytes_written += len as u64;
            }
            WrOpcode::RdmaRead => {
                if !remote.access.contains(AccessFlags::REMOTE_READ)
                    || !local.access.contains(AccessFlags::LOCAL_WRITE)
                {
                    return WcStatus::RemoteAccessError;
                }
                // SAFETY: as above.
                unsafe {
                    std::ptr::copy(remote.ptr.0.add(remote_off), local.ptr.0.add(local_off), len);
                }
                self.stats.bytes_read += len as u64;
            }
            WrOpcode::Send | WrOpcode::Recv => return WcStatus::RemoteOperationError,
        }
        WcStatus::Success
    }
}

/// Shared in-process fabric. Clones refer to the same devices and queues, so
/// two device contexts opened on it can connect to each other.
#[derive(Clone)]
pub struct SimFabric {
    inner: Arc<Mutex<FabricState>>,
}

impl std::fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SimFabric")
            .field("devices", &state.catalog.keys().collect::<Vec<_>>())
            .field("queue_pairs", &state.qps.len())
            .field("memory_regions", &state.mrs.len())
            .finish()
    }
}

impl SimFabric {
    /// An empty fabric with no devices.
    pub fn new(config: SimFabricConfig) -> Self {
        let state = FabricState {
            next_qp_num: config.first_qp_num,
            next_key: config.first_rkey,
            next_addr: config.first_addr,
            config,
            catalog: HashMap::new(),
            devices: HashMap::new(),
            pds: HashMap::new(),
            channels: HashMap::new(),
            cqs: HashMap::new(),
            mrs: HashMap::new(),
            qps: HashMap::new(),
            next_handle: 0,
            stats: FabricStats::default(),
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Adds a device to the catalog, replacing one with the same name.
    pub fn add_device(&self, name: &str, ports: Vec<SimPort>) {
        self.inner.lock().catalog.insert(name.to_string(), ports);
    }

    /// Builder form of [`SimFabric::add_device`].
    pub fn with_device(self, name: &str, ports: Vec<SimPort>) -> Self {
        self.add_device(name, ports);
        self
    }

    /// Changes a port's state, e.g. to simulate a link going down.
    pub fn set_port_state(&self, device: &str, port: u8, state: PortState) -> bool {
        let mut fabric = self.inner.lock();
        let Some(ports) = fabric.catalog.get_mut(device) else {
            return false;
        };
        match ports.iter_mut().find(|p| p.num == port) {
            Some(p) => {
                p.state = state;
                true
            }
            None => false,
        }
    }

    /// Delivers a completion on the send queue of `qp` as if hardware had
    /// finished a work request.
    pub fn inject_completion(
        &self,
        qp: QpNum,
        wr_id: u64,
        byte_len: u32,
        status: WcStatus,
    ) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let cq = fabric
            .qps
            .get(&qp)
            .map(|q| q.send_cq)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))?;
        let wc = WorkCompletion {
            wr_id,
            status,
            opcode: WrOpcode::Send,
            byte_len,
            qp_num: qp,
        };
        fabric.complete(cq, wc);
        Ok(())
    }

    /// Puts the completion queue serving `qp` into a fatal state and raises
    /// its notification so the owning event loop notices.
    pub fn inject_queue_error(&self, qp: QpNum) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let cq_id = fabric
            .qps
            .get(&qp)
            .map(|q| q.send_cq)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))?;
        let channel_id = fabric
            .cqs
            .get(&cq_id)
            .map(|cq| cq.channel)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", cq_id)))?;
        fabric.fail_cq(cq_id);
        if let Some(channel) = fabric.channels.get_mut(&channel_id) {
            channel.pending.push_back(cq_id);
            eventfd_signal(channel.fd.as_raw_fd());
        }
        Ok(())
    }

    /// Registrations not yet released.
    pub fn live_memory_regions(&self) -> usize {
        self.inner.lock().mrs.len()
    }

    /// Queue pairs not yet destroyed.
    pub fn live_queue_pairs(&self) -> usize {
        self.inner.lock().qps.len()
    }

    /// Device handles currently open.
    pub fn open_devices(&self) -> usize {
        self.inner.lock().devices.len()
    }

    /// Snapshot of the data-movement counters.
    pub fn stats(&self) -> FabricStats {
        self.inner.lock().stats.clone()
    }
}

impl Verbs for SimFabric {
    fn open_device(&self, name: &str) -> Result<DeviceId, VerbsError> {
        let mut fabric = self.inner.lock();
        if !fabric.catalog.contains_key(name) {
            return Err(VerbsError::NoSuchDevice(name.to_string()));
        }
        let dev = DeviceId(fabric.handle());
        fabric.devices.insert(dev, name.to_string());
        debug!(device = name, handle = dev.0, "opened simulated device");
        Ok(dev)
    }

    fn close_device(&self, dev: DeviceId) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let busy = fabric.pds.values().any(|d| *d == dev)
            || fabric.channels.values().any(|c| c.dev == dev)
            || fabric.cqs.values().any(|c| c.dev == dev);
        if busy {
            return Err(VerbsError::Rejected {
                op: "close_device",
                reason: "device still has live resources".to_string(),
            });
        }
        fabric
            .devices
            .remove(&dev)
            .map(|_| ())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", dev)))
    }

    fn query_port(&self, dev: DeviceId, port: u8) -> Result<PortAttr, VerbsError> {
        let fabric = self.inner.lock();
        let p = fabric.port(dev, port)?;
        Ok(PortAttr {
            state: p.state,
            lid: p.lid,
            active_mtu: 4096,
            gid_table_len: p.gids.len() as u32,
        })
    }

    fn query_gid(&self, dev: DeviceId, port: u8, index: u8) -> Result<Gid, VerbsError> {
        let fabric = self.inner.lock();
        let p = fabric.port(dev, port)?;
        match p.gids.get(index as usize) {
            Some(gid) if !gid.is_zero() => Ok(*gid),
            _ => Err(VerbsError::InvalidGidIndex(index)),
        }
    }

    fn alloc_pd(&self, dev: DeviceId) -> Result<PdId, VerbsError> {
        let mut fabric = self.inner.lock();
        if !fabric.devices.contains_key(&dev) {
            return Err(VerbsError::UnknownHandle(format!("{:?}", dev)));
        }
        let pd = PdId(fabric.handle());
        fabric.pds.insert(pd, dev);
        Ok(pd)
    }

    fn dealloc_pd(&self, pd: PdId) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let busy =
            fabric.mrs.values().any(|mr| mr.pd == pd) || fabric.qps.values().any(|qp| qp.pd == pd);
        if busy {
            return Err(VerbsError::Rejected {
                op: "dealloc_pd",
                reason: "protection domain still has registrations or queue pairs".to_string(),
            });
        }
        fabric
            .pds
            .remove(&pd)
            .map(|_| ())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", pd)))
    }

    fn create_comp_channel(&self, dev: DeviceId) -> Result<ChannelId, VerbsError> {
        let fd = new_eventfd().map_err(|e| VerbsError::Os(e.to_string()))?;
        let mut fabric = self.inner.lock();
        if !fabric.devices.contains_key(&dev) {
            return Err(VerbsError::UnknownHandle(format!("{:?}", dev)));
        }
        let channel = ChannelId(fabric.handle());
        fabric.channels.insert(
            channel,
            SimChannel {
                dev,
                fd,
                pending: VecDeque::new(),
            },
        );
        Ok(channel)
    }

    fn destroy_comp_channel(&self, channel: ChannelId) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        if fabric.cqs.values().any(|cq| cq.channel == channel) {
            return Err(VerbsError::Rejected {
                op: "destroy_comp_channel",
                reason: "completion queues still attached".to_string(),
            });
        }
        fabric
            .channels
            .remove(&channel)
            .map(|_| ())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", channel)))
    }

    fn channel_fd(&self, channel: ChannelId) -> Result<RawFd, VerbsError> {
        let fabric = self.inner.lock();
        fabric
            .channels
            .get(&channel)
            .map(|c| c.fd.as_raw_fd())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", channel)))
    }

    fn create_cq(&self, dev: DeviceId, channel: ChannelId, depth: u32) -> Result<CqId, VerbsError> {
        let mut fabric = self.inner.lock();
        if depth == 0 {
            return Err(VerbsError::Rejected {
                op: "create_cq",
                reason: "depth must be non-zero".to_string(),
            });
        }
        if !fabric.channels.contains_key(&channel) {
            return Err(VerbsError::UnknownHandle(format!("{:?}", channel)));
        }
        let cq = CqId(fabric.handle());
        fabric.cqs.insert(
            cq,
            SimCq {
                dev,
                channel,
                depth: depth as usize,
                entries: VecDeque::new(),
                armed: false,
                fatal: false,
                unacked_events: 0,
            },
        );
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqId) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        if fabric
            .qps
            .values()
            .any(|qp| qp.send_cq == cq || qp.recv_cq == cq)
        {
            return Err(VerbsError::Rejected {
                op: "destroy_cq",
                reason: "queue pairs still attached".to_string(),
            });
        }
        if fabric.cqs.get(&cq).map_or(false, |q| q.unacked_events > 0) {
            return Err(VerbsError::Rejected {
                op: "destroy_cq",
                reason: "notifications not acknowledged".to_string(),
            });
        }
        let removed = fabric
            .cqs
            .remove(&cq)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", cq)))?;
        if let Some(channel) = fabric.channels.get_mut(&removed.channel) {
            channel.pending.retain(|pending| *pending != cq);
        }
        Ok(())
    }

    fn reg_mr(
        &self,
        pd: PdId,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> Result<MrKeys, VerbsError> {
        let mut fabric = self.inner.lock();
        if !fabric.pds.contains_key(&pd) {
            return Err(VerbsError::UnknownHandle(format!("{:?}", pd)));
        }
        if addr.is_null() || len == 0 {
            return Err(VerbsError::Rejected {
                op: "reg_mr",
                reason: "empty or null buffer".to_string(),
            });
        }
        if len > fabric.config.max_mr_size {
            return Err(VerbsError::Exhausted(format!(
                "registration of {} bytes exceeds {} byte limit",
                len, fabric.config.max_mr_size
            )));
        }
        let id = MrId(fabric.handle());
        let rkey = fabric.next_key;
        fabric.next_key = fabric.next_key.wrapping_add(1);
        let mr_addr = fabric.next_addr;
        let span = (len as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        fabric.next_addr = mr_addr + span + PAGE_SIZE;
        let keys = MrKeys {
            id,
            lkey: rkey | 0x4000_0000,
            rkey,
            addr: mr_addr,
        };
        fabric.mrs.insert(
            id,
            SimMr {
                pd,
                ptr: MrPtr(addr),
                len,
                access,
                keys,
            },
        );
        trace!(mr = id.0, rkey, addr = mr_addr, len, "registered memory");
        Ok(keys)
    }

    fn dereg_mr(&self, mr: MrId) -> Result<(), VerbsError> {
        self.inner
            .lock()
            .mrs
            .remove(&mr)
            .map(|_| ())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", mr)))
    }

    fn create_qp(
        &self,
        pd: PdId,
        send_cq: CqId,
        recv_cq: CqId,
        caps: QpCaps,
    ) -> Result<QpNum, VerbsError> {
        let mut fabric = self.inner.lock();
        let dev = *fabric
            .pds
            .get(&pd)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", pd)))?;
        for cq in [send_cq, recv_cq] {
            if !fabric.cqs.contains_key(&cq) {
                return Err(VerbsError::UnknownHandle(format!("{:?}", cq)));
            }
        }
        if caps.max_send_wr == 0 {
            return Err(VerbsError::Rejected {
                op: "create_qp",
                reason: "max_send_wr must be non-zero".to_string(),
            });
        }
        let qp = QpNum(fabric.next_qp_num);
        fabric.next_qp_num = fabric.next_qp_num.wrapping_add(fabric.config.qp_num_stride);
        fabric.qps.insert(
            qp,
            SimQp {
                dev,
                pd,
                send_cq,
                recv_cq,
                state: QpState::Reset,
                remote: None,
                caps,
            },
        );
        Ok(qp)
    }

    fn modify_qp(&self, qp: QpNum, transition: &QpTransition) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let (state, dev) = fabric
            .qps
            .get(&qp)
            .map(|q| (q.state, q.dev))
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))?;
        if state != transition.from_state() {
            return Err(VerbsError::Rejected {
                op: "modify_qp",
                reason: format!(
                    "cannot move from {:?} to {:?}",
                    state,
                    transition.to_state()
                ),
            });
        }
        let mut remote = None;
        match transition {
            QpTransition::ToInit { port, .. } => {
                let p = fabric.port(dev, *port)?;
                if p.state != PortState::Active {
                    return Err(VerbsError::Rejected {
                        op: "modify_qp",
                        reason: format!("port {} is not active", port),
                    });
                }
            }
            QpTransition::ToRtr {
                remote_qp,
                remote_lid,
                ..
            } => {
                let Some(peer) = fabric.qps.get(remote_qp) else {
                    return Err(VerbsError::Rejected {
                        op: "modify_qp",
                        reason: format!("remote queue pair {} does not exist", remote_qp),
                    });
                };
                if peer.state == QpState::Error {
                    return Err(VerbsError::Rejected {
                        op: "modify_qp",
                        reason: format!("remote queue pair {} is in error", remote_qp),
                    });
                }
                let peer_lids: Vec<u16> = fabric.ports(peer.dev)?.iter().map(|p| p.lid).collect();
                if *remote_lid != 0 && !peer_lids.contains(remote_lid) {
                    return Err(VerbsError::Rejected {
                        op: "modify_qp",
                        reason: format!("no port with lid {} behind qp {}", remote_lid, remote_qp),
                    });
                }
                remote = Some(*remote_qp);
            }
            QpTransition::ToRts { .. } => {}
        }
        if let Some(q) = fabric.qps.get_mut(&qp) {
            q.state = transition.to_state();
            if remote.is_some() {
                q.remote = remote;
            }
        }
        debug!(qp = qp.0, state = ?transition.to_state(), "queue pair transitioned");
        Ok(())
    }

    fn query_qp_state(&self, qp: QpNum) -> Result<QpState, VerbsError> {
        self.inner
            .lock()
            .qps
            .get(&qp)
            .map(|q| q.state)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))
    }

    fn destroy_qp(&self, qp: QpNum) -> Result<(), VerbsError> {
        self.inner
            .lock()
            .qps
            .remove(&qp)
            .map(|_| ())
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))
    }

    fn post_send(&self, qp: QpNum, wr: &SendRequest) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let (state, send_cq, caps) = fabric
            .qps
            .get(&qp)
            .map(|q| (q.state, q.send_cq, q.caps))
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", qp)))?;
        if state != QpState::ReadyToSend {
            return Err(VerbsError::Rejected {
                op: "post_send",
                reason: format!("queue pair is in {:?}", state),
            });
        }
        if !matches!(wr.opcode, WrOpcode::RdmaWrite | WrOpcode::RdmaRead) {
            return Err(VerbsError::Rejected {
                op: "post_send",
                reason: format!("{:?} is not supported by the simulated fabric", wr.opcode),
            });
        }
        let outstanding = fabric
            .cqs
            .get(&send_cq)
            .map(|cq| cq.entries.len())
            .unwrap_or(0);
        if outstanding >= caps.max_send_wr as usize {
            return Err(VerbsError::Exhausted("send queue is full".to_string()));
        }

        let status = fabric.execute(qp, wr);
        if status == WcStatus::Success {
            fabric.stats.operations_completed += 1;
        } else {
            fabric.stats.operations_failed += 1;
            // RC queue pairs drop to the error state on a failed request.
            if let Some(q) = fabric.qps.get_mut(&qp) {
                q.state = QpState::Error;
            }
        }
        if wr.signaled || status != WcStatus::Success {
            let wc = WorkCompletion {
                wr_id: wr.wr_id,
                status,
                opcode: wr.opcode,
                byte_len: if status == WcStatus::Success {
                    wr.local.length
                } else {
                    0
                },
                qp_num: qp,
            };
            fabric.complete(send_cq, wc);
        }
        Ok(())
    }

    fn poll_cq(&self, cq: CqId, max: usize) -> Result<Vec<WorkCompletion>, VerbsError> {
        let mut fabric = self.inner.lock();
        let queue = fabric
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", cq)))?;
        if queue.fatal {
            return Err(VerbsError::QueueFatal(cq));
        }
        let n = max.min(queue.entries.len());
        Ok(queue.entries.drain(..n).collect())
    }

    fn req_notify_cq(&self, cq: CqId) -> Result<(), VerbsError> {
        let mut fabric = self.inner.lock();
        let queue = fabric
            .cqs
            .get_mut(&cq)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", cq)))?;
        if queue.fatal {
            return Err(VerbsError::QueueFatal(cq));
        }
        queue.armed = true;
        Ok(())
    }

    fn get_cq_event(&self, channel: ChannelId) -> Result<Option<CqId>, VerbsError> {
        let mut fabric = self.inner.lock();
        let ch = fabric
            .channels
            .get_mut(&channel)
            .ok_or_else(|| VerbsError::UnknownHandle(format!("{:?}", channel)))?;
        let event = ch.pending.pop_front();
        if ch.pending.is_empty() {
            eventfd_clear(ch.fd.as_raw_fd());
        }
        if let Some(cq) = event {
            if let Some(queue) = fabric.cqs.get_mut(&cq) {
                queue.unacked_events += 1;
            }
        }
        Ok(event)
    }

    fn ack_cq_events(&self, cq: CqId, count: u32) {
        if let Some(queue) = self.inner.lock().cqs.get_mut(&cq) {
            queue.unacked_events = queue.unacked_events.saturating_sub(count);
        }
    }
}

fn new_eventfd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd has no memory-safety preconditions.
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn eventfd_signal(fd: RawFd) {
    let one: u64 = 1;
    // SAFETY: fd is a live eventfd, the buffer is 8 valid bytes.
    let ret = unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        // A saturated counter is already readable.
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!("completion channel signal failed: {}", err);
        }
    }
}

fn eventfd_clear(fd: RawFd) {
    let mut counter: u64 = 0;
    // SAFETY: fd is a live eventfd, the buffer is 8 writable bytes.
    let ret = unsafe { libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!("completion channel drain failed: {}", err);
        }
    }
}
