use std::ops::Range;
use std::sync::Arc;

use rdma_shim::{QpState, RawQp, RecvWr, Sge, WorkCompletion};

use crate::context::ProtectionDomain;
use crate::memory_region::MemoryRegion;
use crate::{CompletionQueue, DatapathError};

/// Queue pair builders
pub mod builder;
pub use builder::{QueuePairBuilder, RcAttributes};

/// RESET -> INIT -> RTR -> RTS transitions of an RC queue pair
mod handshake;
pub use handshake::AddressMode;

/// post-send operation implementations
mod operations;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QueuePairStatus {
    Reset = QpState::Reset as u32,
    Init = QpState::Init as u32,
    ReadyToRecv = QpState::Rtr as u32,
    ReadyToSend = QpState::Rts as u32,
    // There is some other fields, but seems not necessary
    Error = QpState::Err as u32,
}

impl From<QpState> for QueuePairStatus {
    fn from(state: QpState) -> Self {
        match state {
            QpState::Reset => QueuePairStatus::Reset,
            QpState::Init => QueuePairStatus::Init,
            QpState::Rtr => QueuePairStatus::ReadyToRecv,
            QpState::Rts => QueuePairStatus::ReadyToSend,
            _ => QueuePairStatus::Error,
        }
    }
}

impl core::fmt::Display for QueuePairStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            QueuePairStatus::Reset => "RESET",
            QueuePairStatus::Init => "INIT",
            QueuePairStatus::ReadyToRecv => "RTR",
            QueuePairStatus::ReadyToSend => "RTS",
            QueuePairStatus::Error => "ERR",
        };
        f.write_str(name)
    }
}

/// Abstraction for a reliable-connection queue pair.
/// A QueuePair must be brought up before it is able to post_send & poll_cq
pub struct QueuePair {
    inner_qp: RawQp,

    /// send and recv CQ may be the same one
    send_cq: Arc<CompletionQueue>,
    _recv_cq: Arc<CompletionQueue>,

    _pd: Arc<ProtectionDomain>,

    /// used by the handshake
    attrs: RcAttributes,
}

unsafe impl Send for QueuePair {}
unsafe impl Sync for QueuePair {}

impl QueuePair {
    /// query the current status of the QP
    pub fn status(&self) -> Result<QueuePairStatus, crate::ControlpathError> {
        self.inner_qp
            .query_state()
            .map(QueuePairStatus::from)
            .map_err(|err| crate::ControlpathError::QueryError("QP status", err))
    }

    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.inner_qp.qp_num()
    }

    #[inline]
    pub fn attributes(&self) -> &RcAttributes {
        &self.attrs
    }

    /// Post a work request to the receive queue of the queue pair, add it to the tail of the
    /// receive queue without context switch. The RDMA device will take one
    /// of those Work Requests as soon as an incoming opcode to that QP consumes a Receive
    /// Request.
    ///
    /// The parameter `range` indexes the input memory region, treats it as
    /// a byte array and manipulates the memory in byte unit.
    ///
    /// Please refer to
    /// [RDMAmojo](https://www.rdmamojo.com/2013/02/02/ibv_post_recv/) for more information.
    pub fn post_recv(
        &self,
        mr: &MemoryRegion,
        range: Range<u64>,
        wr_id: u64,
    ) -> Result<(), DatapathError> {
        let wr = RecvWr {
            wr_id,
            sge: Sge {
                addr: mr.get_virt_addr() + range.start,
                length: range.end.saturating_sub(range.start) as u32,
                lkey: mr.lkey().0,
            },
        };
        self.inner_qp
            .post_recv(&wr)
            .map_err(DatapathError::PostRecvError)
    }

    /// Poll send_cq. Returned slice length is 0 if no work completion polled
    #[inline]
    pub fn poll_send_cq<'c>(
        &self,
        completions: &'c mut [WorkCompletion],
    ) -> Result<&'c mut [WorkCompletion], DatapathError> {
        self.send_cq.poll(completions)
    }
}

impl core::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueuePair")
            .field("qp_num", &format_args!("{:#x}", self.qp_num()))
            .field("port_num", &self.attrs.port_num)
            .field("status", &self.status().ok())
            .finish()
    }
}
