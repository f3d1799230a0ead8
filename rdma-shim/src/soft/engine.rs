//! QP state machine and RC transfer engine of the software fabric.
//!
//! Transfers execute synchronously inside `post_send`; the completion is
//! queued on the CQs exactly as the HCA would report it.

use crate::error::{Error, ShimResult};
use crate::types::wc_status::*;
use crate::types::*;

use super::fabric::{Fabric, SoftQp};
use super::FailPoint;

/// mlx5 CQE syndromes, reported as `vendor_err`.
mod syndrome {
    pub const LOCAL_LENGTH: u32 = 0x01;
    pub const LOCAL_PROT: u32 = 0x04;
    pub const WR_FLUSHED: u32 = 0x05;
    pub const REMOTE_INVAL_REQ: u32 = 0x12;
    pub const REMOTE_ACCESS: u32 = 0x13;
    pub const TRANSPORT_RETRY_EXC: u32 = 0x15;
    pub const RNR_RETRY_EXC: u32 = 0x16;
}

fn required_mask(from: QpState, to: QpState) -> Option<QpAttrMask> {
    match (from, to) {
        (QpState::Reset, QpState::Init) => Some(QpAttrMask::INIT_REQUIRED),
        (QpState::Init, QpState::Rtr) => Some(QpAttrMask::RTR_REQUIRED),
        (QpState::Rtr, QpState::Rts) => Some(QpAttrMask::RTS_REQUIRED),
        (_, QpState::Reset) | (_, QpState::Err) => Some(QpAttrMask::STATE),
        _ => None,
    }
}

fn apply_masked(dst: &mut QpAttr, src: &QpAttr, mask: QpAttrMask) {
    if mask.contains(QpAttrMask::ACCESS_FLAGS) {
        dst.qp_access_flags = src.qp_access_flags;
    }
    if mask.contains(QpAttrMask::PKEY_INDEX) {
        dst.pkey_index = src.pkey_index;
    }
    if mask.contains(QpAttrMask::PORT) {
        dst.port_num = src.port_num;
    }
    if mask.contains(QpAttrMask::AV) {
        dst.ah_attr = src.ah_attr;
    }
    if mask.contains(QpAttrMask::PATH_MTU) {
        dst.path_mtu = src.path_mtu;
    }
    if mask.contains(QpAttrMask::TIMEOUT) {
        dst.timeout = src.timeout;
    }
    if mask.contains(QpAttrMask::RETRY_CNT) {
        dst.retry_cnt = src.retry_cnt;
    }
    if mask.contains(QpAttrMask::RNR_RETRY) {
        dst.rnr_retry = src.rnr_retry;
    }
    if mask.contains(QpAttrMask::RQ_PSN) {
        dst.rq_psn = src.rq_psn;
    }
    if mask.contains(QpAttrMask::MAX_QP_RD_ATOMIC) {
        dst.max_rd_atomic = src.max_rd_atomic;
    }
    if mask.contains(QpAttrMask::MIN_RNR_TIMER) {
        dst.min_rnr_timer = src.min_rnr_timer;
    }
    if mask.contains(QpAttrMask::SQ_PSN) {
        dst.sq_psn = src.sq_psn;
    }
    if mask.contains(QpAttrMask::MAX_DEST_RD_ATOMIC) {
        dst.max_dest_rd_atomic = src.max_dest_rd_atomic;
    }
    if mask.contains(QpAttrMask::DEST_QPN) {
        dst.dest_qp_num = src.dest_qp_num;
    }
    dst.qp_state = src.qp_state;
}

impl Fabric {
    fn qp(&self, qpn: u32) -> ShimResult<&SoftQp> {
        self.qps.get(&qpn).ok_or(Error::EINVAL)
    }

    pub fn query_qp_state(&self, qpn: u32) -> ShimResult<QpState> {
        Ok(self.qp(qpn)?.attr.qp_state)
    }

    pub fn modify_qp(&mut self, qpn: u32, attr: &QpAttr, mask: QpAttrMask) -> ShimResult<()> {
        let qp = self.qp(qpn)?;
        if !mask.contains(QpAttrMask::STATE) {
            return Err(Error::EINVAL);
        }
        let from = qp.attr.qp_state;
        let to = attr.qp_state;
        let required = required_mask(from, to).ok_or_else(|| {
            log::debug!("soft fabric: QP {:#x} illegal transition {:?} -> {:?}", qpn, from, to);
            Error::EINVAL
        })?;
        if !mask.contains(required) {
            log::debug!(
                "soft fabric: QP {:#x} {:?} -> {:?} missing attrs {:#x}",
                qpn,
                from,
                to,
                required.bits() & !mask.bits()
            );
            return Err(Error::EINVAL);
        }

        let device = self.device(qp.dev)?;
        if device.should_fail(FailPoint::ModifyQp(to)) {
            log::debug!("soft fabric: injected failure at {:?}", FailPoint::ModifyQp(to));
            return Err(Error::EINVAL);
        }
        if mask.contains(QpAttrMask::PORT) && device.port(attr.port_num).is_none() {
            return Err(Error::EINVAL);
        }
        if mask.contains(QpAttrMask::PKEY_INDEX) && attr.pkey_index != 0 {
            // single-entry P_Key table
            return Err(Error::EINVAL);
        }
        if mask.contains(QpAttrMask::DEST_QPN) && attr.dest_qp_num == 0 {
            return Err(Error::EINVAL);
        }
        if mask.contains(QpAttrMask::AV) {
            let port = device.port(attr.ah_attr.port_num).ok_or(Error::EINVAL)?;
            match attr.ah_attr.grh {
                Some(grh) if grh.sgid_index as usize >= port.gids.len() => {
                    return Err(Error::EINVAL)
                }
                None if port.link_layer == LINK_LAYER_ETHERNET => {
                    log::debug!("soft fabric: RoCE port needs a GRH in the address vector");
                    return Err(Error::EINVAL);
                }
                _ => {}
            }
        }

        let mut updated = qp.attr;
        apply_masked(&mut updated, attr, mask);
        log::debug!("soft fabric: QP {:#x} {:?} -> {:?}", qpn, from, to);
        match to {
            QpState::Reset => {
                let qp = self.qps.get_mut(&qpn).ok_or(Error::EINVAL)?;
                qp.attr = QpAttr::default();
                qp.recv_queue.clear();
                qp.sq_inflight = 0;
            }
            QpState::Err => self.move_to_error(qpn),
            _ => {
                let qp = self.qps.get_mut(&qpn).ok_or(Error::EINVAL)?;
                qp.attr = updated;
            }
        }
        Ok(())
    }

    /// Flushes outstanding receives, as the HCA does on entering ERR.
    fn move_to_error(&mut self, qpn: u32) {
        let (recv_cq, flushed) = match self.qps.get_mut(&qpn) {
            Some(qp) => {
                qp.attr.qp_state = QpState::Err;
                (qp.recv_cq, qp.recv_queue.drain(..).collect::<Vec<_>>())
            }
            None => return,
        };
        for wr in flushed {
            self.push_cqe(
                recv_cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status: WR_FLUSH_ERR,
                    opcode: WcOpcode::Recv,
                    vendor_err: syndrome::WR_FLUSHED,
                    byte_len: 0,
                    qp_num: qpn,
                },
            );
        }
    }

    pub fn post_recv(&mut self, qpn: u32, wr: &RecvWr) -> ShimResult<()> {
        let dev = self.qp(qpn)?.dev;
        if self.device(dev)?.should_fail(FailPoint::PostRecv) {
            log::debug!("soft fabric: injected failure at {:?}", FailPoint::PostRecv);
            return Err(Error::ENOMEM);
        }
        let qp = self.qps.get_mut(&qpn).ok_or(Error::EINVAL)?;
        match qp.attr.qp_state {
            QpState::Reset | QpState::Err | QpState::Unknown => return Err(Error::EINVAL),
            _ => {}
        }
        if qp.recv_queue.len() >= qp.cap.max_recv_wr as usize {
            return Err(Error::ENOMEM);
        }
        qp.recv_queue.push_back(*wr);
        Ok(())
    }

    /// Checks that `sge` is covered by an MR of `pd` registered under `lkey`.
    fn local_sge_ok(&self, pd: u64, sge: &Sge, need: AccessFlags) -> bool {
        self.mrs.values().any(|mr| {
            mr.pd == pd
                && mr.lkey == sge.lkey
                && mr.access.contains(need)
                && mr.covers(sge.addr, sge.length as u64)
        })
    }

    fn remote_mr_ok(&self, peer: &SoftQp, target: &RdmaTarget, len: u64, need: AccessFlags) -> bool {
        peer.attr.qp_access_flags.contains(need)
            && self.mrs.values().any(|mr| {
                mr.dev == peer.dev
                    && mr.pd == peer.pd
                    && mr.rkey == target.rkey
                    && mr.access.contains(need)
                    && mr.covers(target.remote_addr, len)
            })
    }

    /// Whether `from`'s address vector reaches the port `to` is bound to.
    fn reaches(&self, from: &SoftQp, to: &SoftQp) -> bool {
        let port = match self
            .devices
            .get(to.dev)
            .and_then(|d| d.port(to.attr.port_num))
        {
            Some(port) => port,
            None => return false,
        };
        let ah = &from.attr.ah_attr;
        match ah.grh {
            Some(grh) => port.gids.contains(&grh.dgid),
            None => port.link_layer == LINK_LAYER_INFINIBAND && ah.dlid == port.lid,
        }
    }

    /// Resolves the responder of `qpn`, or `None` if the packet would never
    /// be acknowledged.
    fn route(&self, qpn: u32) -> Option<u32> {
        let local = self.qps.get(&qpn)?;
        let peer_qpn = local.attr.dest_qp_num;
        let peer = self.qps.get(&peer_qpn)?;
        let ready = matches!(peer.attr.qp_state, QpState::Rtr | QpState::Rts);
        if ready
            && peer.attr.dest_qp_num == qpn
            && self.reaches(local, peer)
            && self.reaches(peer, local)
        {
            Some(peer_qpn)
        } else {
            None
        }
    }

    pub fn post_send(&mut self, qpn: u32, wr: &SendWr) -> ShimResult<()> {
        let qp = self.qp(qpn)?;
        if qp.attr.qp_state != QpState::Rts {
            return Err(Error::EINVAL);
        }
        if qp.sq_inflight >= qp.cap.max_send_wr {
            return Err(Error::ENOMEM);
        }
        if wr.opcode != WrOpcode::Send && wr.rdma.is_none() {
            return Err(Error::EINVAL);
        }
        let signaled = wr.signaled || qp.sq_sig_all;
        let send_cq = qp.send_cq;

        let (status, vendor_err) = self.execute(qpn, wr);
        if status != SUCCESS {
            log::debug!(
                "soft fabric: QP {:#x} wr_id {} failed: {}",
                qpn,
                wr.wr_id,
                status_str(status)
            );
        }
        if signaled || status != SUCCESS {
            if let Some(qp) = self.qps.get_mut(&qpn) {
                qp.sq_inflight += 1;
            }
            self.push_cqe(
                send_cq,
                WorkCompletion {
                    wr_id: wr.wr_id,
                    status,
                    opcode: wr.opcode.into(),
                    vendor_err,
                    byte_len: if status == SUCCESS { wr.sge.length } else { 0 },
                    qp_num: qpn,
                },
            );
        }
        if status != SUCCESS {
            self.move_to_error(qpn);
        }
        Ok(())
    }

    /// Runs one request to completion; returns the requester's status.
    fn execute(&mut self, qpn: u32, wr: &SendWr) -> (u32, u32) {
        let qp = match self.qps.get(&qpn) {
            Some(qp) => qp,
            None => return (LOC_QP_OP_ERR, 0),
        };
        let local_need = match wr.opcode {
            WrOpcode::RdmaRead => AccessFlags::LOCAL_WRITE,
            _ => AccessFlags::empty(),
        };
        if !self.local_sge_ok(qp.pd, &wr.sge, local_need) {
            return (LOC_PROT_ERR, syndrome::LOCAL_PROT);
        }
        let peer_qpn = match self.route(qpn) {
            Some(peer) => peer,
            None => return (RETRY_EXC_ERR, syndrome::TRANSPORT_RETRY_EXC),
        };
        let peer = match self.qps.get(&peer_qpn) {
            Some(peer) => peer,
            None => return (RETRY_EXC_ERR, syndrome::TRANSPORT_RETRY_EXC),
        };
        let len = wr.sge.length as u64;

        match (wr.opcode, wr.rdma) {
            (WrOpcode::RdmaWrite, Some(target)) => {
                if !self.remote_mr_ok(peer, &target, len, AccessFlags::REMOTE_WRITE) {
                    return (REM_ACCESS_ERR, syndrome::REMOTE_ACCESS);
                }
                // SAFETY: both ranges lie inside registered MRs, whose owners
                // keep the memory alive until deregistration.
                unsafe { copy_bytes(wr.sge.addr, target.remote_addr, len) };
                (SUCCESS, 0)
            }
            (WrOpcode::RdmaRead, Some(target)) => {
                if !self.remote_mr_ok(peer, &target, len, AccessFlags::REMOTE_READ) {
                    return (REM_ACCESS_ERR, syndrome::REMOTE_ACCESS);
                }
                // SAFETY: see above.
                unsafe { copy_bytes(target.remote_addr, wr.sge.addr, len) };
                (SUCCESS, 0)
            }
            (WrOpcode::Send, _) => self.deliver(peer_qpn, wr),
            _ => (LOC_QP_OP_ERR, 0),
        }
    }

    fn deliver(&mut self, peer_qpn: u32, wr: &SendWr) -> (u32, u32) {
        let (recv, peer_pd, recv_cq, rnr_retry) = match self.qps.get_mut(&peer_qpn) {
            Some(peer) => (
                peer.recv_queue.pop_front(),
                peer.pd,
                peer.recv_cq,
                peer.attr.rnr_retry,
            ),
            None => return (RETRY_EXC_ERR, syndrome::TRANSPORT_RETRY_EXC),
        };
        let recv = match recv {
            Some(recv) => recv,
            None => {
                log::debug!(
                    "soft fabric: QP {:#x} has no posted receive (rnr_retry {})",
                    peer_qpn,
                    rnr_retry
                );
                return (RNR_RETRY_EXC_ERR, syndrome::RNR_RETRY_EXC);
            }
        };

        let mut wc = WorkCompletion {
            wr_id: recv.wr_id,
            status: SUCCESS,
            opcode: WcOpcode::Recv,
            vendor_err: 0,
            byte_len: wr.sge.length,
            qp_num: peer_qpn,
        };
        let result = if recv.sge.length < wr.sge.length {
            wc.status = LOC_LEN_ERR;
            wc.vendor_err = syndrome::LOCAL_LENGTH;
            wc.byte_len = 0;
            (REM_INV_REQ_ERR, syndrome::REMOTE_INVAL_REQ)
        } else if !self.local_sge_ok(peer_pd, &recv.sge, AccessFlags::LOCAL_WRITE) {
            wc.status = LOC_PROT_ERR;
            wc.vendor_err = syndrome::LOCAL_PROT;
            wc.byte_len = 0;
            (REM_OP_ERR, 0)
        } else {
            // SAFETY: both SGEs were validated against registered MRs.
            unsafe { copy_bytes(wr.sge.addr, recv.sge.addr, wr.sge.length as u64) };
            (SUCCESS, 0)
        };

        self.push_cqe(recv_cq, wc);
        if wc.status != SUCCESS {
            self.move_to_error(peer_qpn);
        }
        result
    }
}

/// # Safety
///
/// `src..src+len` and `dst..dst+len` must be valid, live allocations.
unsafe fn copy_bytes(src: u64, dst: u64, len: u64) {
    if len == 0 {
        return;
    }
    core::ptr::copy(src as usize as *const u8, dst as usize as *mut u8, len as usize);
}
