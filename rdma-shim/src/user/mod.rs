//! libibverbs backend.

use std::ffi::CStr;
use std::os::raw::c_int;
use std::ptr;
use std::sync::Arc;

use ibverbs_sys as ffi;
use ffi::{ibv_access_flags, ibv_qp_attr_mask, ibv_qp_state, ibv_qp_type, ibv_send_flags, ibv_wr_opcode};

use crate::error::{Error, ShimResult};
use crate::types::*;

fn check(rc: c_int) -> ShimResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::from_errno(rc))
    }
}

fn to_ffi_state(state: QpState) -> ibv_qp_state::Type {
    match state {
        QpState::Reset => ibv_qp_state::IBV_QPS_RESET,
        QpState::Init => ibv_qp_state::IBV_QPS_INIT,
        QpState::Rtr => ibv_qp_state::IBV_QPS_RTR,
        QpState::Rts => ibv_qp_state::IBV_QPS_RTS,
        QpState::Sqd => ibv_qp_state::IBV_QPS_SQD,
        QpState::Sqe => ibv_qp_state::IBV_QPS_SQE,
        QpState::Err => ibv_qp_state::IBV_QPS_ERR,
        QpState::Unknown => ibv_qp_state::IBV_QPS_UNKNOWN,
    }
}

fn to_ffi_mtu(mtu: Mtu) -> ffi::ibv_mtu {
    match mtu {
        Mtu::Mtu256 => ffi::IBV_MTU_256,
        Mtu::Mtu512 => ffi::IBV_MTU_512,
        Mtu::Mtu1024 => ffi::IBV_MTU_1024,
        Mtu::Mtu2048 => ffi::IBV_MTU_2048,
        Mtu::Mtu4096 => ffi::IBV_MTU_4096,
    }
}

fn to_ffi_opcode(op: WrOpcode) -> ibv_wr_opcode::Type {
    match op {
        WrOpcode::RdmaWrite => ibv_wr_opcode::IBV_WR_RDMA_WRITE,
        WrOpcode::Send => ibv_wr_opcode::IBV_WR_SEND,
        WrOpcode::RdmaRead => ibv_wr_opcode::IBV_WR_RDMA_READ,
    }
}

fn to_ffi_access(access: AccessFlags) -> ibv_access_flags {
    let mut flags = ibv_access_flags(0);
    if access.contains(AccessFlags::LOCAL_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if access.contains(AccessFlags::REMOTE_ATOMIC) {
        flags = flags | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    flags
}

struct ListInner {
    list: *mut *mut ffi::ibv_device,
}

impl Drop for ListInner {
    fn drop(&mut self) {
        unsafe { ffi::ibv_free_device_list(self.list) };
    }
}

unsafe impl Send for ListInner {}
unsafe impl Sync for ListInner {}

pub struct DeviceList {
    devices: Vec<RawDevice>,
}

impl DeviceList {
    pub fn query() -> ShimResult<Self> {
        let mut num_devices: c_int = 0;
        let list = unsafe { ffi::ibv_get_device_list(&mut num_devices as *mut _) };
        if list.is_null() {
            return Err(Error::last_os_error());
        }
        let inner = Arc::new(ListInner { list });
        let devices = (0..num_devices.max(0) as usize)
            .map(|i| {
                let dev = unsafe { *list.add(i) };
                let name = unsafe {
                    let name = ffi::ibv_get_device_name(dev);
                    if name.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(name).to_string_lossy().into_owned()
                    }
                };
                RawDevice {
                    dev,
                    name,
                    _list: inner.clone(),
                }
            })
            .collect();
        Ok(Self { devices })
    }

    pub fn devices(&self) -> &[RawDevice] {
        &self.devices
    }
}

#[derive(Clone)]
pub struct RawDevice {
    dev: *mut ffi::ibv_device,
    name: String,
    _list: Arc<ListInner>,
}

unsafe impl Send for RawDevice {}
unsafe impl Sync for RawDevice {}

impl RawDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn open(&self) -> ShimResult<RawContext> {
        let ctx = unsafe { ffi::ibv_open_device(self.dev) };
        if ctx.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(RawContext { ctx })
    }
}

pub struct RawContext {
    ctx: *mut ffi::ibv_context,
}

unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}

impl RawContext {
    pub fn query_port(&self, port_num: u8) -> ShimResult<PortAttr> {
        let mut attr = ffi::ibv_port_attr::default();
        check(unsafe {
            ffi::ibv_query_port(self.ctx, port_num, &mut attr as *mut ffi::ibv_port_attr as *mut _)
        })?;
        Ok(PortAttr {
            state: attr.state as u32,
            lid: attr.lid,
            link_layer: attr.link_layer,
            active_mtu: attr.active_mtu as u32,
            gid_tbl_len: attr.gid_tbl_len,
        })
    }

    pub fn query_gid(&self, port_num: u8, index: u8) -> ShimResult<Gid> {
        let mut gid: ffi::ibv_gid = unsafe { std::mem::zeroed() };
        check(unsafe { ffi::ibv_query_gid(self.ctx, port_num, index as c_int, &mut gid) })?;
        Ok(Gid(unsafe { gid.raw }))
    }
}

impl Drop for RawContext {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_close_device(self.ctx) };
        if rc != 0 {
            log::error!("ibv_close_device failed: {}", Error::from_errno(rc));
        }
    }
}

pub struct RawPd {
    pd: *mut ffi::ibv_pd,
}

unsafe impl Send for RawPd {}
unsafe impl Sync for RawPd {}

impl RawPd {
    pub fn alloc(ctx: &RawContext) -> ShimResult<Self> {
        let pd = unsafe { ffi::ibv_alloc_pd(ctx.ctx) };
        if pd.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { pd })
    }
}

impl Drop for RawPd {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if rc != 0 {
            log::error!("ibv_dealloc_pd failed: {}", Error::from_errno(rc));
        }
    }
}

pub struct RawCq {
    cq: *mut ffi::ibv_cq,
}

unsafe impl Send for RawCq {}
unsafe impl Sync for RawCq {}

impl RawCq {
    pub fn create(ctx: &RawContext, cqe: u32) -> ShimResult<Self> {
        let cq = unsafe {
            ffi::ibv_create_cq(
                ctx.ctx,
                cqe as c_int,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        if cq.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { cq })
    }

    pub fn poll(&self, wcs: &mut [WorkCompletion]) -> ShimResult<usize> {
        let mut raw = vec![ffi::ibv_wc::default(); wcs.len()];
        let n = unsafe {
            let ctx = (*self.cq).context;
            let ops = &mut (*ctx).ops;
            let poll_cq = ops.poll_cq.as_mut().ok_or(Error::EINVAL)?;
            poll_cq(self.cq, raw.len() as c_int, raw.as_mut_ptr())
        };
        if n < 0 {
            return Err(Error::from_errno(n));
        }
        for (dst, wc) in wcs.iter_mut().zip(raw.iter()).take(n as usize) {
            let (status, vendor_err) = wc.error().unwrap_or((0, 0));
            *dst = WorkCompletion {
                wr_id: wc.wr_id(),
                status: status as u32,
                opcode: WcOpcode::from_raw(wc.opcode() as u32).unwrap_or_default(),
                vendor_err,
                byte_len: wc.len() as u32,
                qp_num: wc.qp_num,
            };
        }
        Ok(n as usize)
    }
}

impl Drop for RawCq {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_destroy_cq(self.cq) };
        if rc != 0 {
            log::error!("ibv_destroy_cq failed: {}", Error::from_errno(rc));
        }
    }
}

pub struct RawMr {
    mr: *mut ffi::ibv_mr,
}

unsafe impl Send for RawMr {}
unsafe impl Sync for RawMr {}

impl RawMr {
    /// # Safety
    ///
    /// `addr..addr+len` must stay valid until the returned handle is dropped;
    /// the NIC may read and write it at any time while registered.
    pub unsafe fn register(
        pd: &RawPd,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> ShimResult<Self> {
        let mr = ffi::ibv_reg_mr(pd.pd, addr as *mut _, len, to_ffi_access(access).0 as c_int);
        if mr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { mr })
    }

    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr).rkey }
    }
}

impl Drop for RawMr {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_dereg_mr(self.mr) };
        if rc != 0 {
            log::error!("ibv_dereg_mr failed: {}", Error::from_errno(rc));
        }
    }
}

pub struct RawQp {
    qp: *mut ffi::ibv_qp,
}

unsafe impl Send for RawQp {}
unsafe impl Sync for RawQp {}

impl RawQp {
    pub fn create_rc(
        pd: &RawPd,
        send_cq: &RawCq,
        recv_cq: &RawCq,
        cap: &QpCap,
        sq_sig_all: bool,
    ) -> ShimResult<Self> {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = sq_sig_all as c_int;
        attr.send_cq = send_cq.cq;
        attr.recv_cq = recv_cq.cq;
        attr.cap.max_send_wr = cap.max_send_wr;
        attr.cap.max_recv_wr = cap.max_recv_wr;
        attr.cap.max_send_sge = cap.max_send_sge;
        attr.cap.max_recv_sge = cap.max_recv_sge;
        attr.cap.max_inline_data = cap.max_inline_data;

        let qp = unsafe { ffi::ibv_create_qp(pd.pd, &mut attr as *mut _) };
        if qp.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(Self { qp })
    }

    pub fn qp_num(&self) -> u32 {
        unsafe { (*self.qp).qp_num }
    }

    pub fn modify(&self, attr: &QpAttr, mask: QpAttrMask) -> ShimResult<()> {
        let mut raw: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };
        raw.qp_state = to_ffi_state(attr.qp_state);
        raw.path_mtu = to_ffi_mtu(attr.path_mtu);
        raw.qp_access_flags = to_ffi_access(attr.qp_access_flags).0;
        raw.pkey_index = attr.pkey_index;
        raw.port_num = attr.port_num;
        raw.dest_qp_num = attr.dest_qp_num;
        raw.rq_psn = attr.rq_psn;
        raw.sq_psn = attr.sq_psn;
        raw.max_rd_atomic = attr.max_rd_atomic;
        raw.max_dest_rd_atomic = attr.max_dest_rd_atomic;
        raw.min_rnr_timer = attr.min_rnr_timer;
        raw.timeout = attr.timeout;
        raw.retry_cnt = attr.retry_cnt;
        raw.rnr_retry = attr.rnr_retry;

        let ah = &attr.ah_attr;
        raw.ah_attr.dlid = ah.dlid;
        raw.ah_attr.sl = ah.sl;
        raw.ah_attr.src_path_bits = ah.src_path_bits;
        raw.ah_attr.port_num = ah.port_num;
        if let Some(grh) = ah.grh {
            raw.ah_attr.is_global = 1;
            raw.ah_attr.grh.dgid.raw = grh.dgid.0;
            raw.ah_attr.grh.flow_label = grh.flow_label;
            raw.ah_attr.grh.sgid_index = grh.sgid_index;
            raw.ah_attr.grh.hop_limit = grh.hop_limit;
            raw.ah_attr.grh.traffic_class = grh.traffic_class;
        }

        let mask = ibv_qp_attr_mask(mask.bits());
        check(unsafe { ffi::ibv_modify_qp(self.qp, &mut raw, mask.0 as c_int) })
    }

    pub fn query_state(&self) -> ShimResult<QpState> {
        let mut attr: ffi::ibv_qp_attr = unsafe { std::mem::zeroed() };
        let mut init_attr: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        check(unsafe {
            ffi::ibv_query_qp(
                self.qp,
                &mut attr,
                ibv_qp_attr_mask::IBV_QP_STATE.0 as c_int,
                &mut init_attr,
            )
        })?;
        Ok(QpState::from_raw(attr.qp_state as u32))
    }

    pub fn post_send(&self, wr: &SendWr) -> ShimResult<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;
        raw.opcode = to_ffi_opcode(wr.opcode);
        if wr.signaled {
            raw.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        if let Some(target) = wr.rdma {
            raw.wr.rdma.remote_addr = target.remote_addr;
            raw.wr.rdma.rkey = target.rkey;
        }

        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
        check(unsafe {
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let post_send = ops.post_send.as_mut().ok_or(Error::EINVAL)?;
            post_send(self.qp, &mut raw as *mut _, &mut bad_wr as *mut _)
        })
    }

    pub fn post_recv(&self, wr: &RecvWr) -> ShimResult<()> {
        let mut sge = ffi::ibv_sge {
            addr: wr.sge.addr,
            length: wr.sge.length,
            lkey: wr.sge.lkey,
        };
        let mut raw: ffi::ibv_recv_wr = unsafe { std::mem::zeroed() };
        raw.wr_id = wr.wr_id;
        raw.sg_list = &mut sge;
        raw.num_sge = 1;

        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();
        check(unsafe {
            let ctx = (*self.qp).context;
            let ops = &mut (*ctx).ops;
            let post_recv = ops.post_recv.as_mut().ok_or(Error::EINVAL)?;
            post_recv(self.qp, &mut raw as *mut _, &mut bad_wr as *mut _)
        })
    }
}

impl Drop for RawQp {
    fn drop(&mut self) {
        let rc = unsafe { ffi::ibv_destroy_qp(self.qp) };
        if rc != 0 {
            log::error!("ibv_destroy_qp failed: {}", Error::from_errno(rc));
        }
    }
}
