//! Process-wide state of the software fabric.
//!
//! Every handle in [`super`] is an id into the tables kept here. All access
//! goes through [`fabric()`], so operations are serialized the way a single
//! HCA serializes doorbells.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;

use crate::error::{Error, ShimResult};
use crate::types::*;

use super::{DeviceConfig, FailPoint, JournalEntry, ResourceKind};

pub(crate) const DEFAULT_DEVICE: &str = "soft_0";
pub(crate) const FIRST_QPN: u32 = 0x100;

lazy_static::lazy_static! {
    static ref FABRIC: Mutex<Fabric> = Mutex::new(Fabric::new());
}

/// A panic on another thread must not wedge every later verbs call.
pub(crate) fn fabric() -> MutexGuard<'static, Fabric> {
    FABRIC.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct SoftPort {
    pub lid: u16,
    pub state: u32,
    pub link_layer: u8,
    pub active_mtu: Mtu,
    pub gids: Vec<Gid>,
}

pub(crate) struct SoftDevice {
    pub name: String,
    pub ports: Vec<SoftPort>,
    pub fail_points: Vec<FailPoint>,
    pub journal: Vec<JournalEntry>,
}

impl SoftDevice {
    fn new(index: usize, config: DeviceConfig) -> Self {
        let link_layer = if config.roce {
            LINK_LAYER_ETHERNET
        } else {
            LINK_LAYER_INFINIBAND
        };
        let ports = (1..=config.ports)
            .map(|port| SoftPort {
                // RoCE ports have no LID; everything goes through the GRH.
                lid: if config.roce {
                    0
                } else {
                    ((index as u16 + 1) << 4) | port as u16
                },
                state: PORT_ACTIVE,
                link_layer,
                active_mtu: Mtu::Mtu1024,
                gids: (0..config.gids_per_port)
                    .map(|gid_idx| soft_gid(index, port, gid_idx))
                    .collect(),
            })
            .collect();
        Self {
            name: config.name,
            ports,
            fail_points: config.fail_points,
            journal: Vec::new(),
        }
    }

    pub fn port(&self, port_num: u8) -> Option<&SoftPort> {
        if port_num == 0 {
            return None;
        }
        self.ports.get(port_num as usize - 1)
    }

    pub fn should_fail(&self, point: FailPoint) -> bool {
        self.fail_points.contains(&point)
    }
}

/// Link-local GID, unique per (device, port, index).
fn soft_gid(dev: usize, port: u8, gid_idx: u8) -> Gid {
    let mut raw = [0u8; 16];
    raw[0] = 0xfe;
    raw[1] = 0x80;
    raw[8] = 0x02;
    raw[11] = 0xff;
    raw[12] = 0xfe;
    raw[13] = dev as u8;
    raw[14] = port;
    raw[15] = gid_idx;
    Gid(raw)
}

pub(crate) struct SoftContext {
    pub dev: usize,
}

pub(crate) struct SoftPd {
    pub dev: usize,
    pub ctx: u64,
}

pub(crate) struct SoftCq {
    pub dev: usize,
    pub ctx: u64,
    pub depth: usize,
    pub entries: VecDeque<WorkCompletion>,
}

pub(crate) struct SoftMr {
    pub dev: usize,
    pub pd: u64,
    pub addr: u64,
    pub len: u64,
    pub lkey: u32,
    pub rkey: u32,
    pub access: AccessFlags,
}

impl SoftMr {
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= self.addr + self.len)
    }
}

pub(crate) struct SoftQp {
    pub dev: usize,
    pub pd: u64,
    pub send_cq: u64,
    pub recv_cq: u64,
    pub cap: QpCap,
    pub sq_sig_all: bool,
    pub attr: QpAttr,
    pub recv_queue: VecDeque<RecvWr>,
    pub sq_inflight: u32,
}

#[derive(Default)]
pub(crate) struct Fabric {
    pub devices: Vec<SoftDevice>,
    pub contexts: HashMap<u64, SoftContext>,
    pub pds: HashMap<u64, SoftPd>,
    pub cqs: HashMap<u64, SoftCq>,
    pub mrs: HashMap<u64, SoftMr>,
    pub qps: HashMap<u32, SoftQp>,
    next_id: u64,
    next_qpn: u32,
}

impl Fabric {
    fn new() -> Self {
        let mut fabric = Self {
            next_id: 1,
            next_qpn: FIRST_QPN,
            ..Default::default()
        };
        fabric
            .devices
            .push(SoftDevice::new(0, DeviceConfig::new(DEFAULT_DEVICE)));
        fabric
    }

    pub fn install(&mut self, config: DeviceConfig) -> ShimResult<()> {
        if config.ports == 0 || config.gids_per_port == 0 {
            return Err(Error::EINVAL);
        }
        if self.devices.iter().any(|d| d.name == config.name) {
            return Err(Error::EEXIST);
        }
        let index = self.devices.len();
        self.devices.push(SoftDevice::new(index, config));
        Ok(())
    }

    pub fn device(&self, dev: usize) -> ShimResult<&SoftDevice> {
        self.devices.get(dev).ok_or(Error::ENODEV)
    }

    fn fail_point(&self, dev: usize, point: FailPoint) -> ShimResult<()> {
        if self.device(dev)?.should_fail(point) {
            log::debug!("soft fabric: injected failure at {:?}", point);
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    fn record(&mut self, dev: usize, entry: JournalEntry) {
        if let Some(device) = self.devices.get_mut(dev) {
            device.journal.push(entry);
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_key(&self, rng: &mut impl Rng, taken: u32) -> u32 {
        loop {
            let key: u32 = rng.gen_range(1..=u32::MAX);
            if key != taken && !self.mrs.values().any(|mr| mr.lkey == key || mr.rkey == key) {
                return key;
            }
        }
    }

    pub fn open_context(&mut self, dev: usize) -> ShimResult<u64> {
        self.fail_point(dev, FailPoint::OpenDevice)?;
        let id = self.alloc_id();
        self.contexts.insert(id, SoftContext { dev });
        self.record(dev, JournalEntry::Create(ResourceKind::Context));
        Ok(id)
    }

    pub fn close_context(&mut self, id: u64) {
        if let Some(ctx) = self.contexts.remove(&id) {
            let in_use = self.pds.values().any(|pd| pd.ctx == id)
                || self.cqs.values().any(|cq| cq.ctx == id);
            if in_use {
                log::error!("soft fabric: context {} closed with live children", id);
                self.record(ctx.dev, JournalEntry::Leak(ResourceKind::Context));
            }
            self.record(ctx.dev, JournalEntry::Destroy(ResourceKind::Context));
        }
    }

    pub fn context_dev(&self, ctx: u64) -> ShimResult<usize> {
        self.contexts.get(&ctx).map(|c| c.dev).ok_or(Error::EINVAL)
    }

    pub fn alloc_pd(&mut self, ctx: u64) -> ShimResult<u64> {
        let dev = self.context_dev(ctx)?;
        self.fail_point(dev, FailPoint::AllocPd)?;
        let id = self.alloc_id();
        self.pds.insert(id, SoftPd { dev, ctx });
        self.record(dev, JournalEntry::Create(ResourceKind::Pd));
        Ok(id)
    }

    pub fn dealloc_pd(&mut self, id: u64) {
        if let Some(pd) = self.pds.remove(&id) {
            let in_use = self.mrs.values().any(|mr| mr.pd == id)
                || self.qps.values().any(|qp| qp.pd == id);
            if in_use {
                log::error!("soft fabric: PD {} deallocated while still referenced", id);
                self.record(pd.dev, JournalEntry::Leak(ResourceKind::Pd));
            }
            self.record(pd.dev, JournalEntry::Destroy(ResourceKind::Pd));
        }
    }

    pub fn create_cq(&mut self, ctx: u64, depth: u32) -> ShimResult<u64> {
        let dev = self.context_dev(ctx)?;
        self.fail_point(dev, FailPoint::CreateCq)?;
        if depth == 0 {
            return Err(Error::EINVAL);
        }
        let id = self.alloc_id();
        self.cqs.insert(
            id,
            SoftCq {
                dev,
                ctx,
                depth: depth as usize,
                entries: VecDeque::new(),
            },
        );
        self.record(dev, JournalEntry::Create(ResourceKind::Cq));
        Ok(id)
    }

    pub fn destroy_cq(&mut self, id: u64) {
        if let Some(cq) = self.cqs.remove(&id) {
            if self.qps.values().any(|qp| qp.send_cq == id || qp.recv_cq == id) {
                log::error!("soft fabric: CQ {} destroyed while a QP still uses it", id);
                self.record(cq.dev, JournalEntry::Leak(ResourceKind::Cq));
            }
            self.record(cq.dev, JournalEntry::Destroy(ResourceKind::Cq));
        }
    }

    pub fn register_mr(
        &mut self,
        pd: u64,
        addr: u64,
        len: u64,
        access: AccessFlags,
    ) -> ShimResult<(u64, u32, u32)> {
        let dev = self.pds.get(&pd).map(|p| p.dev).ok_or(Error::EINVAL)?;
        self.fail_point(dev, FailPoint::RegMr)?;
        if addr == 0 {
            return Err(Error::EFAULT);
        }
        // remote write/atomic without local write is rejected by verbs
        let needs_local = AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_ATOMIC;
        if access.intersects(needs_local) && !access.contains(AccessFlags::LOCAL_WRITE) {
            return Err(Error::EINVAL);
        }
        let mut rng = rand::thread_rng();
        let lkey = self.alloc_key(&mut rng, 0);
        let rkey = self.alloc_key(&mut rng, lkey);
        let id = self.alloc_id();
        self.mrs.insert(
            id,
            SoftMr {
                dev,
                pd,
                addr,
                len,
                lkey,
                rkey,
                access,
            },
        );
        self.record(dev, JournalEntry::Create(ResourceKind::Mr));
        Ok((id, lkey, rkey))
    }

    pub fn deregister_mr(&mut self, id: u64) {
        if let Some(mr) = self.mrs.remove(&id) {
            self.record(mr.dev, JournalEntry::Destroy(ResourceKind::Mr));
        }
    }

    pub fn create_qp(
        &mut self,
        pd: u64,
        send_cq: u64,
        recv_cq: u64,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> ShimResult<u32> {
        let dev = self.pds.get(&pd).map(|p| p.dev).ok_or(Error::EINVAL)?;
        if !self.cqs.contains_key(&send_cq) || !self.cqs.contains_key(&recv_cq) {
            return Err(Error::EINVAL);
        }
        self.fail_point(dev, FailPoint::CreateQp)?;
        if cap.max_send_wr == 0 && cap.max_recv_wr == 0 {
            return Err(Error::EINVAL);
        }
        if cap.max_send_sge > 1 || cap.max_recv_sge > 1 {
            // one SGE per request is all the engine moves
            return Err(Error::EINVAL);
        }
        let qpn = self.next_qpn;
        self.next_qpn = self.next_qpn.wrapping_add(1).max(FIRST_QPN);
        self.qps.insert(
            qpn,
            SoftQp {
                dev,
                pd,
                send_cq,
                recv_cq,
                cap: *cap,
                sq_sig_all,
                attr: QpAttr::default(),
                recv_queue: VecDeque::new(),
                sq_inflight: 0,
            },
        );
        self.record(dev, JournalEntry::Create(ResourceKind::Qp));
        Ok(qpn)
    }

    pub fn destroy_qp(&mut self, qpn: u32) {
        if let Some(qp) = self.qps.remove(&qpn) {
            self.record(qp.dev, JournalEntry::Destroy(ResourceKind::Qp));
        }
    }

    /// Pushes a completion; an overrun CQ drops the entry like a real
    /// CQ overflow would lose it.
    pub fn push_cqe(&mut self, cq: u64, wc: WorkCompletion) {
        match self.cqs.get_mut(&cq) {
            Some(cq) if cq.entries.len() < cq.depth => cq.entries.push_back(wc),
            Some(_) => log::error!("soft fabric: CQ {} overrun, dropped wr_id {}", cq, wc.wr_id),
            None => log::warn!("soft fabric: completion for destroyed CQ {}", cq),
        }
    }

    pub fn poll_cq(&mut self, cq: u64, out: &mut [WorkCompletion]) -> ShimResult<usize> {
        let entries = &mut self.cqs.get_mut(&cq).ok_or(Error::EINVAL)?.entries;
        let mut n = 0;
        let mut retired = Vec::new();
        while n < out.len() {
            match entries.pop_front() {
                Some(wc) => {
                    if wc.opcode != WcOpcode::Recv {
                        retired.push(wc.qp_num);
                    }
                    out[n] = wc;
                    n += 1;
                }
                None => break,
            }
        }
        for qpn in retired {
            if let Some(qp) = self.qps.get_mut(&qpn) {
                qp.sq_inflight = qp.sq_inflight.saturating_sub(1);
            }
        }
        Ok(n)
    }

    pub fn query_port(&self, ctx: u64, port_num: u8) -> ShimResult<PortAttr> {
        let device = self.device(self.context_dev(ctx)?)?;
        let port = device.port(port_num).ok_or(Error::EINVAL)?;
        Ok(PortAttr {
            state: port.state,
            lid: port.lid,
            link_layer: port.link_layer,
            active_mtu: port.active_mtu as u32,
            gid_tbl_len: port.gids.len() as i32,
        })
    }

    pub fn query_gid(&self, ctx: u64, port_num: u8, index: u8) -> ShimResult<Gid> {
        let dev = self.context_dev(ctx)?;
        self.fail_point(dev, FailPoint::QueryGid)?;
        let port = self.device(dev)?.port(port_num).ok_or(Error::EINVAL)?;
        port.gids.get(index as usize).copied().ok_or(Error::EINVAL)
    }
}
