use rdma_shim::{AhAttr, Gid, GlobalRoute, QpAttr, QpAttrMask, QpState};

use crate::consts::*;
use crate::queue_pairs::{QueuePair, QueuePairStatus};
use crate::HandshakeError;

/// How the remote port is addressed in the RTR address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// Route by the destination LID only (InfiniBand fabrics).
    Local,
    /// Attach a GRH routed by the destination GID, sourced from
    /// the local GID at `sgid_index` (required on RoCE).
    Global { sgid_index: u8 },
}

impl AddressMode {
    pub fn from_gid_idx(gid_idx: Option<u8>) -> Self {
        match gid_idx {
            Some(sgid_index) => AddressMode::Global { sgid_index },
            None => AddressMode::Local,
        }
    }
}

impl QueuePair {
    fn modify_or_log(
        &self,
        attr: &QpAttr,
        mask: QpAttrMask,
        target: QueuePairStatus,
    ) -> Result<(), HandshakeError> {
        self.inner_qp.modify(attr, mask).map_err(|err| {
            crate::log::error!("failed to modify QP state to {}", target);
            HandshakeError::Transition {
                target,
                source: err,
            }
        })
    }

    /// RESET -> INIT
    ///
    /// Attributes modified:
    /// - qp_state : INIT
    /// - pkey_index, port_num, qp_access_flags : from the QP's `RcAttributes`
    pub fn modify_to_init(&self) -> Result<(), HandshakeError> {
        let attr = QpAttr {
            qp_state: QpState::Init,
            port_num: self.attrs.port_num,
            pkey_index: self.attrs.pkey_index,
            qp_access_flags: self.attrs.access,
            ..Default::default()
        };
        self.modify_or_log(&attr, QpAttrMask::INIT_REQUIRED, QueuePairStatus::Init)?;
        crate::log::debug!("QP state was change to INIT");
        Ok(())
    }

    /// INIT -> RTR
    ///
    /// Param:
    /// - `remote_qpn`: remote qp's queue pair number
    /// - `dlid`: lid of the remote port
    /// - `dgid`: gid of the remote port, used only by `AddressMode::Global`
    ///
    /// The receive PSN always starts at 0.
    pub fn modify_to_rtr(
        &self,
        remote_qpn: u32,
        dlid: u16,
        dgid: Gid,
        mode: AddressMode,
    ) -> Result<(), HandshakeError> {
        let grh = match mode {
            AddressMode::Local => None,
            AddressMode::Global { sgid_index } => Some(GlobalRoute {
                dgid,
                flow_label: 0,
                sgid_index,
                hop_limit: RC_HOP_LIMIT,
                traffic_class: 0,
            }),
        };

        let attr = QpAttr {
            qp_state: QpState::Rtr,
            path_mtu: self.attrs.path_mtu,
            dest_qp_num: remote_qpn,
            rq_psn: 0,
            max_dest_rd_atomic: self.attrs.max_rd_atomic,
            min_rnr_timer: self.attrs.min_rnr_timer,
            ah_attr: AhAttr {
                dlid,
                sl: 0,
                src_path_bits: 0,
                port_num: self.attrs.port_num,
                grh,
            },
            ..Default::default()
        };
        self.modify_or_log(
            &attr,
            QpAttrMask::RTR_REQUIRED,
            QueuePairStatus::ReadyToRecv,
        )?;
        crate::log::debug!("QP state was change to RTR");
        Ok(())
    }

    /// RTR -> RTS
    ///
    /// The send PSN always starts at 0, matching the remote `rq_psn`.
    pub fn modify_to_rts(&self) -> Result<(), HandshakeError> {
        let attr = QpAttr {
            qp_state: QpState::Rts,
            timeout: self.attrs.timeout,
            retry_cnt: self.attrs.retry_count,
            rnr_retry: self.attrs.rnr_retry,
            sq_psn: 0,
            max_rd_atomic: self.attrs.max_rd_atomic,
            ..Default::default()
        };
        self.modify_or_log(
            &attr,
            QpAttrMask::RTS_REQUIRED,
            QueuePairStatus::ReadyToSend,
        )?;
        crate::log::debug!("QP state was change to RTS");
        Ok(())
    }
}
