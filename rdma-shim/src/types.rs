//! Plain data types shared by both backends.
//!
//! Numeric values match `<infiniband/verbs.h>` so the user backend can pass
//! them through unchanged.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Memory region / queue pair access rights.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const LOCAL_WRITE = 1;
        const REMOTE_WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_ATOMIC = 1 << 3;
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Which fields of a [`QpAttr`] a `modify` call applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QpAttrMask: u32 {
        const STATE = 1;
        const ACCESS_FLAGS = 1 << 3;
        const PKEY_INDEX = 1 << 4;
        const PORT = 1 << 5;
        const AV = 1 << 7;
        const PATH_MTU = 1 << 8;
        const TIMEOUT = 1 << 9;
        const RETRY_CNT = 1 << 10;
        const RNR_RETRY = 1 << 11;
        const RQ_PSN = 1 << 12;
        const MAX_QP_RD_ATOMIC = 1 << 13;
        const MIN_RNR_TIMER = 1 << 15;
        const SQ_PSN = 1 << 16;
        const MAX_DEST_RD_ATOMIC = 1 << 17;
        const DEST_QPN = 1 << 20;
    }
}

impl QpAttrMask {
    /// Attributes the RESET->INIT transition of an RC QP requires.
    pub const INIT_REQUIRED: Self = Self::STATE
        .union(Self::PKEY_INDEX)
        .union(Self::PORT)
        .union(Self::ACCESS_FLAGS);

    /// Attributes the INIT->RTR transition of an RC QP requires.
    pub const RTR_REQUIRED: Self = Self::STATE
        .union(Self::AV)
        .union(Self::PATH_MTU)
        .union(Self::DEST_QPN)
        .union(Self::RQ_PSN)
        .union(Self::MAX_DEST_RD_ATOMIC)
        .union(Self::MIN_RNR_TIMER);

    /// Attributes the RTR->RTS transition of an RC QP requires.
    pub const RTS_REQUIRED: Self = Self::STATE
        .union(Self::TIMEOUT)
        .union(Self::RETRY_CNT)
        .union(Self::RNR_RETRY)
        .union(Self::SQ_PSN)
        .union(Self::MAX_QP_RD_ATOMIC);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u32)]
pub enum QpState {
    #[default]
    Reset = 0,
    Init = 1,
    Rtr = 2,
    Rts = 3,
    Sqd = 4,
    Sqe = 5,
    Err = 6,
    Unknown = 7,
}

impl QpState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            6 => QpState::Err,
            _ => QpState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u32)]
pub enum Mtu {
    #[default]
    Mtu256 = 1,
    Mtu512 = 2,
    Mtu1024 = 3,
    Mtu2048 = 4,
    Mtu4096 = 5,
}

impl Mtu {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Mtu::Mtu256),
            2 => Some(Mtu::Mtu512),
            3 => Some(Mtu::Mtu1024),
            4 => Some(Mtu::Mtu2048),
            5 => Some(Mtu::Mtu4096),
            _ => None,
        }
    }

    pub fn bytes(&self) -> usize {
        128 << (*self as u32)
    }
}

/// Opcode of a send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WrOpcode {
    RdmaWrite = 0,
    Send = 2,
    RdmaRead = 4,
}

/// Opcode reported by a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(u32)]
pub enum WcOpcode {
    #[default]
    Send = 0,
    RdmaWrite = 1,
    RdmaRead = 2,
    Recv = 128,
}

impl WcOpcode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(WcOpcode::Send),
            1 => Some(WcOpcode::RdmaWrite),
            2 => Some(WcOpcode::RdmaRead),
            128 => Some(WcOpcode::Recv),
            _ => None,
        }
    }
}

impl From<WrOpcode> for WcOpcode {
    fn from(op: WrOpcode) -> Self {
        match op {
            WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
            WrOpcode::Send => WcOpcode::Send,
            WrOpcode::RdmaRead => WcOpcode::RdmaRead,
        }
    }
}

/// Work completion status codes (`enum ibv_wc_status`).
pub mod wc_status {
    pub const SUCCESS: u32 = 0;
    pub const LOC_LEN_ERR: u32 = 1;
    pub const LOC_QP_OP_ERR: u32 = 2;
    pub const LOC_PROT_ERR: u32 = 4;
    pub const WR_FLUSH_ERR: u32 = 5;
    pub const REM_INV_REQ_ERR: u32 = 9;
    pub const REM_ACCESS_ERR: u32 = 10;
    pub const REM_OP_ERR: u32 = 11;
    pub const RETRY_EXC_ERR: u32 = 12;
    pub const RNR_RETRY_EXC_ERR: u32 = 13;

    pub fn status_str(status: u32) -> &'static str {
        match status {
            SUCCESS => "success",
            LOC_LEN_ERR => "local length error",
            LOC_QP_OP_ERR => "local QP operation error",
            LOC_PROT_ERR => "local protection error",
            WR_FLUSH_ERR => "Work Request Flushed Error",
            REM_INV_REQ_ERR => "remote invalid request error",
            REM_ACCESS_ERR => "remote access error",
            REM_OP_ERR => "remote operation error",
            RETRY_EXC_ERR => "transport retry counter exceeded",
            RNR_RETRY_EXC_ERR => "RNR retry counter exceeded",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: u32,
    pub opcode: WcOpcode,
    pub vendor_err: u32,
    pub byte_len: u32,
    pub qp_num: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == wc_status::SUCCESS
    }
}

/// 16-byte global identifier, kept in wire (network) order.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub const fn zeroed() -> Self {
        Gid([0; 16])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn raw(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

impl From<[u8; 16]> for Gid {
    fn from(raw: [u8; 16]) -> Self {
        Gid(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortAttr {
    pub state: u32,
    pub lid: u16,
    pub link_layer: u8,
    pub active_mtu: u32,
    pub gid_tbl_len: i32,
}

/// Port state reported by `query_port` (`IBV_PORT_ACTIVE`).
pub const PORT_ACTIVE: u32 = 4;

/// Link layer values (`IBV_LINK_LAYER_*`).
pub const LINK_LAYER_INFINIBAND: u8 = 1;
pub const LINK_LAYER_ETHERNET: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpCap {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalRoute {
    pub dgid: Gid,
    pub flow_label: u32,
    pub sgid_index: u8,
    pub hop_limit: u8,
    pub traffic_class: u8,
}

/// Address vector of the remote end (`struct ibv_ah_attr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AhAttr {
    pub dlid: u16,
    pub sl: u8,
    pub src_path_bits: u8,
    pub port_num: u8,
    pub grh: Option<GlobalRoute>,
}

/// Subset of `struct ibv_qp_attr` an RC connection touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpAttr {
    pub qp_state: QpState,
    pub path_mtu: Mtu,
    pub qp_access_flags: AccessFlags,
    pub pkey_index: u16,
    pub port_num: u8,
    pub ah_attr: AhAttr,
    pub dest_qp_num: u32,
    pub rq_psn: u32,
    pub sq_psn: u32,
    pub max_rd_atomic: u8,
    pub max_dest_rd_atomic: u8,
    pub min_rnr_timer: u8,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

/// One scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdmaTarget {
    pub remote_addr: u64,
    pub rkey: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub sge: Sge,
    pub signaled: bool,
    pub rdma: Option<RdmaTarget>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_match_verbs_bits() {
        assert_eq!(QpAttrMask::INIT_REQUIRED.bits(), 0x39);
        assert_eq!(QpAttrMask::RTR_REQUIRED.bits(), 0x12_9181);
        assert_eq!(QpAttrMask::RTS_REQUIRED.bits(), 0x1_2e01);
        assert!(QpAttrMask::RTR_REQUIRED.contains(QpAttrMask::AV | QpAttrMask::DEST_QPN));
        assert!(!QpAttrMask::INIT_REQUIRED.contains(QpAttrMask::AV));
    }

    #[test]
    fn access_flags_default_to_none() {
        assert!(AccessFlags::default().is_empty());
        let rw = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        assert!(rw.contains(AccessFlags::REMOTE_WRITE));
        assert!(!rw.contains(AccessFlags::REMOTE_READ));
        assert_eq!(rw.bits(), 0x3);
    }

    #[test]
    fn gid_display() {
        let mut raw = [0u8; 16];
        raw[0] = 0xfe;
        raw[1] = 0x80;
        raw[15] = 0x01;
        let gid = Gid(raw);
        assert_eq!(
            gid.to_string(),
            "fe:80:00:00:00:00:00:00:00:00:00:00:00:00:00:01"
        );
        assert!(!gid.is_zero());
        assert!(Gid::zeroed().is_zero());
    }

    #[test]
    fn mtu_sizes() {
        assert_eq!(Mtu::Mtu256.bytes(), 256);
        assert_eq!(Mtu::Mtu4096.bytes(), 4096);
        assert_eq!(Mtu::from_raw(3), Some(Mtu::Mtu1024));
        assert_eq!(Mtu::from_raw(9), None);
    }
}
