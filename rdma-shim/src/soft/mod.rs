//! Software RC fabric.
//!
//! Emulates one or more HCAs inside the process: ports with LIDs and GID
//! tables, PDs, CQs, MRs with lkey/rkey checking, and RC QPs that walk the
//! verbs state machine. Two QPs connected through it behave like two QPs on
//! a real fabric, including RNR and access errors.
//!
//! A device named `soft_0` with a single InfiniBand port always exists.
//! Tests may install more devices with [`install_device`], optionally armed
//! with [`FailPoint`]s, and inspect resource lifetimes with [`journal`].

mod engine;
mod fabric;

use crate::error::{Error, ShimResult};
use crate::types::*;

use fabric::fabric;

/// Operation that an installed device is told to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    OpenDevice,
    AllocPd,
    CreateCq,
    RegMr,
    CreateQp,
    QueryGid,
    PostRecv,
    /// Reject the transition into the given state.
    ModifyQp(QpState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Context,
    Pd,
    Cq,
    Mr,
    Qp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    Create(ResourceKind),
    Destroy(ResourceKind),
    /// The resource was released while another one still referenced it.
    Leak(ResourceKind),
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub ports: u8,
    pub gids_per_port: u8,
    /// Ethernet link layer: no LIDs, GRH mandatory.
    pub roce: bool,
    pub fail_points: Vec<FailPoint>,
}

impl DeviceConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ports: 1,
            gids_per_port: 2,
            roce: false,
            fail_points: Vec::new(),
        }
    }

    pub fn roce(mut self) -> Self {
        self.roce = true;
        self
    }

    pub fn fail_at(mut self, point: FailPoint) -> Self {
        self.fail_points.push(point);
        self
    }
}

/// Adds a device to the fabric. Names must be unique.
pub fn install_device(config: DeviceConfig) -> ShimResult<()> {
    fabric().install(config)
}

/// Create/destroy history of every resource opened on device `name`.
pub fn journal(name: &str) -> Vec<JournalEntry> {
    fabric()
        .devices
        .iter()
        .find(|d| d.name == name)
        .map(|d| d.journal.clone())
        .unwrap_or_default()
}

pub struct DeviceList {
    devices: Vec<RawDevice>,
}

impl DeviceList {
    pub fn query() -> ShimResult<Self> {
        let devices = fabric()
            .devices
            .iter()
            .enumerate()
            .map(|(index, d)| RawDevice {
                index,
                name: d.name.clone(),
            })
            .collect();
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[RawDevice] {
        &self.devices
    }
}

#[derive(Debug, Clone)]
pub struct RawDevice {
    index: usize,
    name: String,
}

impl RawDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open(&self) -> ShimResult<RawContext> {
        let id = fabric().open_context(self.index)?;
        Ok(RawContext { id })
    }
}

#[derive(Debug)]
pub struct RawContext {
    id: u64,
}

impl RawContext {
    pub fn query_port(&self, port_num: u8) -> ShimResult<PortAttr> {
        fabric().query_port(self.id, port_num)
    }

    pub fn query_gid(&self, port_num: u8, index: u8) -> ShimResult<Gid> {
        fabric().query_gid(self.id, port_num, index)
    }
}

impl Drop for RawContext {
    fn drop(&mut self) {
        fabric().close_context(self.id);
    }
}

#[derive(Debug)]
pub struct RawPd {
    id: u64,
}

impl RawPd {
    pub fn alloc(ctx: &RawContext) -> ShimResult<Self> {
        let id = fabric().alloc_pd(ctx.id)?;
        Ok(Self { id })
    }
}

impl Drop for RawPd {
    fn drop(&mut self) {
        fabric().dealloc_pd(self.id);
    }
}

#[derive(Debug)]
pub struct RawCq {
    id: u64,
}

impl RawCq {
    pub fn create(ctx: &RawContext, cqe: u32) -> ShimResult<Self> {
        let id = fabric().create_cq(ctx.id, cqe)?;
        Ok(Self { id })
    }

    /// Moves up to `wcs.len()` completions into `wcs`, returning the count.
    pub fn poll(&self, wcs: &mut [WorkCompletion]) -> ShimResult<usize> {
        fabric().poll_cq(self.id, wcs)
    }
}

impl Drop for RawCq {
    fn drop(&mut self) {
        fabric().destroy_cq(self.id);
    }
}

#[derive(Debug)]
pub struct RawMr {
    id: u64,
    lkey: u32,
    rkey: u32,
}

impl RawMr {
    /// # Safety
    ///
    /// `addr..addr+len` must stay valid until the returned handle is dropped;
    /// peers may read and write it at any time while registered.
    pub unsafe fn register(
        pd: &RawPd,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> ShimResult<Self> {
        if addr.is_null() {
            return Err(Error::EFAULT);
        }
        let (id, lkey, rkey) = fabric().register_mr(pd.id, addr as u64, len as u64, access)?;
        Ok(Self { id, lkey, rkey })
    }

    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }
}

impl Drop for RawMr {
    fn drop(&mut self) {
        fabric().deregister_mr(self.id);
    }
}

#[derive(Debug)]
pub struct RawQp {
    qpn: u32,
}

impl RawQp {
    pub fn create_rc(
        pd: &RawPd,
        send_cq: &RawCq,
        recv_cq: &RawCq,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> ShimResult<Self> {
        let qpn = fabric().create_qp(pd.id, send_cq.id, recv_cq.id, cap, sq_sig_all)?;
        Ok(Self { qpn })
    }

    pub fn qp_num(&self) -> u32 {
        self.qpn
    }

    pub fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> ShimResult<()> {
        fabric().modify_qp(self.qpn, attr, mask)
    }

    pub fn query_state(&self) -> ShimResult<QpState> {
        fabric().query_qp_state(self.qpn)
    }

    pub fn post_send(&self, wr: &SendWr) -> ShimResult<()> {
        fabric().post_send(self.qpn, wr)
    }

    pub fn post_recv(&self, wr: &RecvWr) -> ShimResult<()> {
        fabric().post_recv(self.qpn, wr)
    }
}

impl Drop for RawQp {
    fn drop(&mut self) {
        fabric().destroy_qp(self.qpn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::wc_status::*;

    struct Side {
        buf: Box<[u8]>,
        qp: RawQp,
        mr: RawMr,
        cq: RawCq,
        _pd: RawPd,
        ctx: RawContext,
    }

    fn open(name: &str) -> RawContext {
        let list = DeviceList::query().unwrap();
        let dev = list.devices().iter().find(|d| d.name() == name).unwrap();
        dev.open().unwrap()
    }

    fn side(name: &str, len: usize) -> Side {
        let ctx = open(name);
        let pd = RawPd::alloc(&ctx).unwrap();
        let cq = RawCq::create(&ctx, 4).unwrap();
        let mut buf = vec![0u8; len].into_boxed_slice();
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        let mr = unsafe { RawMr::register(&pd, buf.as_mut_ptr(), len, access).unwrap() };
        let cap = QpCap {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        };
        let qp = RawQp::create_rc(&pd, &cq, &cq, &cap, true).unwrap();
        Side {
            buf,
            qp,
            mr,
            cq,
            _pd: pd,
            ctx,
        }
    }

    fn connect(side: &Side, peer: &Side, grh: Option<GlobalRoute>) {
        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            qp_access_flags: AccessFlags::LOCAL_WRITE
                | AccessFlags::REMOTE_READ
                | AccessFlags::REMOTE_WRITE,
            ..Default::default()
        };
        side.qp.modify(&init, QpAttrMask::INIT_REQUIRED).unwrap();
        let peer_lid = peer.ctx.query_port(1).unwrap().lid;
        let rtr = QpAttr {
            qp_state: QpState::Rtr,
            path_mtu: Mtu::Mtu256,
            dest_qp_num: peer.qp.qp_num(),
            max_dest_rd_atomic: 1,
            min_rnr_timer: 0x12,
            ah_attr: AhAttr {
                dlid: peer_lid,
                port_num: 1,
                grh,
                ..Default::default()
            },
            ..Default::default()
        };
        side.qp.modify(&rtr, QpAttrMask::RTR_REQUIRED).unwrap();
        let rts = QpAttr {
            qp_state: QpState::Rts,
            timeout: 0x12,
            retry_cnt: 6,
            max_rd_atomic: 1,
            ..Default::default()
        };
        side.qp.modify(&rts, QpAttrMask::RTS_REQUIRED).unwrap();
    }

    fn poll_one(cq: &RawCq) -> WorkCompletion {
        let mut wc = [WorkCompletion::default()];
        assert_eq!(cq.poll(&mut wc).unwrap(), 1);
        wc[0]
    }

    fn write_wr(from: &Side, to: &Side, remote_offset: u64, len: u32) -> SendWr {
        SendWr {
            wr_id: 7,
            opcode: WrOpcode::RdmaWrite,
            sge: Sge {
                addr: from.buf.as_ptr() as u64,
                length: len,
                lkey: from.mr.lkey(),
            },
            signaled: true,
            rdma: Some(RdmaTarget {
                remote_addr: to.buf.as_ptr() as u64 + remote_offset,
                rkey: to.mr.rkey(),
            }),
        }
    }

    #[test]
    fn default_device_exists() {
        let list = DeviceList::query().unwrap();
        assert_eq!(list.devices()[0].name(), "soft_0");
        let ctx = list.devices()[0].open().unwrap();
        let port = ctx.query_port(1).unwrap();
        assert_eq!(port.state, PORT_ACTIVE);
        assert_ne!(port.lid, 0);
        assert!(ctx.query_port(2).is_err());
        assert!(ctx.query_gid(1, 0).unwrap().raw()[0] == 0xfe);
    }

    #[test]
    fn rdma_write_lands_in_peer_buffer() {
        let mut a = side("soft_0", 16);
        let b = side("soft_0", 16);
        connect(&a, &b, None);
        connect(&b, &a, None);

        a.buf.copy_from_slice(b"0123456789abcdef");
        a.qp.post_send(&write_wr(&a, &b, 0, 16)).unwrap();
        let wc = poll_one(&a.cq);
        assert_eq!(wc.status, SUCCESS);
        assert_eq!(wc.opcode, WcOpcode::RdmaWrite);
        assert_eq!(&b.buf[..], b"0123456789abcdef");
    }

    #[test]
    fn out_of_bounds_write_is_remote_access_error() {
        let a = side("soft_0", 16);
        let b = side("soft_0", 16);
        connect(&a, &b, None);
        connect(&b, &a, None);

        a.qp.post_send(&write_wr(&a, &b, 1, 16)).unwrap();
        let wc = poll_one(&a.cq);
        assert_eq!(wc.status, REM_ACCESS_ERR);
        assert_eq!(wc.vendor_err, 0x13);
        assert_eq!(a.qp.query_state().unwrap(), QpState::Err);
    }

    #[test]
    fn send_without_receive_exhausts_rnr() {
        let a = side("soft_0", 8);
        let b = side("soft_0", 8);
        connect(&a, &b, None);
        connect(&b, &a, None);

        let mut wr = write_wr(&a, &b, 0, 8);
        wr.opcode = WrOpcode::Send;
        wr.rdma = None;
        a.qp.post_send(&wr).unwrap();
        assert_eq!(poll_one(&a.cq).status, RNR_RETRY_EXC_ERR);
    }

    #[test]
    fn send_queue_capacity_is_enforced() {
        let a = side("soft_0", 8);
        let b = side("soft_0", 8);
        connect(&a, &b, None);
        connect(&b, &a, None);

        a.qp.post_send(&write_wr(&a, &b, 0, 8)).unwrap();
        assert_eq!(a.qp.post_send(&write_wr(&a, &b, 0, 8)), Err(Error::ENOMEM));
        poll_one(&a.cq);
        a.qp.post_send(&write_wr(&a, &b, 0, 8)).unwrap();
    }

    #[test]
    fn rts_before_rtr_is_rejected() {
        let a = side("soft_0", 8);
        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        a.qp.modify(&init, QpAttrMask::INIT_REQUIRED).unwrap();
        let rts = QpAttr {
            qp_state: QpState::Rts,
            ..Default::default()
        };
        assert_eq!(a.qp.modify(&rts, QpAttrMask::RTS_REQUIRED), Err(Error::EINVAL));
        assert_eq!(a.qp.query_state().unwrap(), QpState::Init);
    }

    #[test]
    fn roce_requires_grh() {
        install_device(DeviceConfig::new("soft_roce_test").roce()).unwrap();
        let a = side("soft_roce_test", 8);
        let b = side("soft_roce_test", 8);
        let init = QpAttr {
            qp_state: QpState::Init,
            port_num: 1,
            ..Default::default()
        };
        a.qp.modify(&init, QpAttrMask::INIT_REQUIRED).unwrap();
        let rtr = QpAttr {
            qp_state: QpState::Rtr,
            dest_qp_num: b.qp.qp_num(),
            ah_attr: AhAttr {
                port_num: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(a.qp.modify(&rtr, QpAttrMask::RTR_REQUIRED).is_err());

        let grh = GlobalRoute {
            dgid: b.ctx.query_gid(1, 0).unwrap(),
            hop_limit: 1,
            ..Default::default()
        };
        let rtr = QpAttr {
            ah_attr: AhAttr {
                port_num: 1,
                grh: Some(grh),
                ..Default::default()
            },
            ..rtr
        };
        a.qp.modify(&rtr, QpAttrMask::RTR_REQUIRED).unwrap();
    }

    #[test]
    fn journal_records_leaks() {
        install_device(DeviceConfig::new("soft_journal_test")).unwrap();
        let ctx = open("soft_journal_test");
        let pd = RawPd::alloc(&ctx).unwrap();
        drop(ctx);
        drop(pd);
        assert_eq!(
            journal("soft_journal_test"),
            vec![
                JournalEntry::Create(ResourceKind::Context),
                JournalEntry::Create(ResourceKind::Pd),
                JournalEntry::Leak(ResourceKind::Context),
                JournalEntry::Destroy(ResourceKind::Context),
                JournalEntry::Destroy(ResourceKind::Pd),
            ]
        );
    }

    #[test]
    fn fail_points_reject_creation() {
        install_device(DeviceConfig::new("soft_fail_test").fail_at(FailPoint::CreateCq)).unwrap();
        let ctx = open("soft_fail_test");
        assert!(RawPd::alloc(&ctx).is_ok());
        assert_eq!(RawCq::create(&ctx, 1).unwrap_err(), Error::EINVAL);
        assert_eq!(
            install_device(DeviceConfig::new("soft_fail_test")).unwrap_err(),
            Error::EEXIST
        );
    }
}
