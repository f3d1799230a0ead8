use std::ops::Range;

use rdma_shim::{RdmaTarget, SendWr, Sge, WrOpcode};

use crate::memory_region::MemoryRegion;
use crate::queue_pairs::QueuePair;
use crate::DatapathError;

// reliable connection post send requests
impl QueuePair {
    /// Post a one-sided RDMA write work request to the send queue.
    ///
    /// Param:
    /// - `mr`: Reference to MemoryRegion holding the data to write.
    /// - `range`: Specify which range of mr to write. Index the mr in byte dimension.
    /// - `signaled`: Whether signaled while post send write
    /// - `raddr`: Beginning address of remote side to write.
    /// - `rkey`: Remote memory region key
    #[inline]
    pub fn post_send_write(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        raddr: u64,
        rkey: u32,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        self.post_send_inner(
            WrOpcode::RdmaWrite,
            mr,
            range,
            Some(RdmaTarget {
                remote_addr: raddr,
                rkey,
            }),
            signaled,
            wr_id,
        )
    }

    /// Post a one-sided RDMA read work request to the send queue.
    ///
    /// Param:
    /// - `mr`: Reference to MemoryRegion to store the data read from the remote side.
    /// - `range`: Specify which range of mr to fill. Index the mr in byte dimension.
    /// - `signaled`: Whether signaled while post send read
    /// - `raddr`: Beginning address of remote side to read.
    /// - `rkey`: Remote memory region key
    #[inline]
    pub fn post_send_read(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        raddr: u64,
        rkey: u32,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        self.post_send_inner(
            WrOpcode::RdmaRead,
            mr,
            range,
            Some(RdmaTarget {
                remote_addr: raddr,
                rkey,
            }),
            signaled,
            wr_id,
        )
    }

    /// Post a two-sided send work request. It consumes one receive
    /// request posted by the remote QP.
    #[inline]
    pub fn post_send_send(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        signaled: bool,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        self.post_send_inner(WrOpcode::Send, mr, range, None, signaled, wr_id)
    }

    #[inline]
    fn post_send_inner(
        &self,
        opcode: WrOpcode,
        mr: &MemoryRegion,
        range: Range<u64>,
        rdma: Option<RdmaTarget>,
        signaled: bool,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        let wr = SendWr {
            wr_id,
            opcode,
            sge: Sge {
                addr: mr.get_virt_addr() + range.start,
                length: range.end.saturating_sub(range.start) as u32,
                lkey: mr.lkey().0,
            },
            signaled,
            rdma,
        };
        self.inner_qp
            .post_send(&wr)
            .map_err(DatapathError::PostSendError)
    }
}
