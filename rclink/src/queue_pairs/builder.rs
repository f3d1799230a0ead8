use std::sync::Arc;

use rdma_shim::{AccessFlags, Mtu, QpCap, RawQp};

use crate::consts::*;
use crate::context::ProtectionDomain;
use crate::memory_region::MemoryRegion;
use crate::queue_pairs::QueuePair;
use crate::{CompletionQueue, ControlpathError};

/// Attributes an RC queue pair carries from creation into its bring-up.
///
/// The defaults are the ones both peers must agree on: MTU 256, PSNs
/// starting at 0, one outstanding RDMA read each way and no RNR retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcAttributes {
    pub port_num: u8,
    pub pkey_index: u16,
    pub access: AccessFlags,
    pub path_mtu: Mtu,
    /// ACK timeout exponent, `4.096 usec * 2 ^ timeout`
    pub timeout: u8,
    pub retry_count: u8,
    pub rnr_retry: u8,
    pub min_rnr_timer: u8,
    pub max_rd_atomic: u8,
}

impl Default for RcAttributes {
    fn default() -> Self {
        Self {
            port_num: DEFAULT_IB_PORT,
            pkey_index: 0,
            access: MemoryRegion::default_access(),
            path_mtu: Mtu::Mtu256,
            timeout: RC_TIMEOUT,
            retry_count: RC_RETRY_COUNT,
            rnr_retry: RC_RNR_RETRY,
            min_rnr_timer: RC_MIN_RNR_TIMER,
            max_rd_atomic: RC_MAX_RD_ATOMIC,
        }
    }
}

/// Builder for reliable-connection queue pairs.
///
/// A fresh builder describes a one-message ping-pong connection: a single
/// outstanding work request per queue, one scatter/gather element, and a
/// completion for every send.
pub struct QueuePairBuilder {
    pd: Arc<ProtectionDomain>,
    cap: QpCap,
    attrs: RcAttributes,
}

impl QueuePairBuilder {
    pub fn new(pd: &Arc<ProtectionDomain>) -> Self {
        Self {
            pd: pd.clone(),
            cap: QpCap {
                max_send_wr: 1,
                max_recv_wr: 1,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            attrs: RcAttributes::default(),
        }
    }

    /// Physical port the QP is bound to at INIT and routes through at RTR.
    pub fn set_port_num(&mut self, port_num: u8) -> &mut Self {
        self.attrs.port_num = port_num;
        self
    }

    /// Queue capacities. The device may refuse anything beyond 1/1 WR
    /// and one SGE.
    pub fn set_cap(&mut self, cap: QpCap) -> &mut Self {
        self.cap = cap;
        self
    }

    /// Create the QP in RESET. `send_cq` and `recv_cq` may be the same queue.
    ///
    /// # Errors:
    /// - `CreationError` : the device rejected the QP
    pub fn build_rc(
        &self,
        send_cq: &Arc<CompletionQueue>,
        recv_cq: &Arc<CompletionQueue>,
    ) -> Result<QueuePair, ControlpathError> {
        let inner_qp = RawQp::create_rc(
            self.pd.raw(),
            send_cq.raw(),
            recv_cq.raw(),
            &self.cap,
            true,
        )
        .map_err(|err| {
            crate::log::error!("failed to create QP");
            ControlpathError::CreationError("QP", err)
        })?;

        crate::log::info!("QP was created, QP number={:#x}", inner_qp.qp_num());

        Ok(QueuePair {
            inner_qp,
            send_cq: send_cq.clone(),
            _recv_cq: recv_cq.clone(),
            _pd: self.pd.clone(),
            attrs: self.attrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueuePairStatus;

    fn pd_and_cq() -> (Arc<ProtectionDomain>, Arc<CompletionQueue>) {
        let ctx = crate::UDriver::create()
            .expect("failed to query device")
            .find(None)
            .expect("no rdma device available")
            .open_context()
            .expect("failed to create RDMA context");
        let pd = ProtectionDomain::new(&ctx).unwrap();
        let cq = Arc::new(CompletionQueue::create(&ctx, CQ_DEPTH).unwrap());
        (pd, cq)
    }

    #[test]
    fn create_rc() {
        let (pd, cq) = pd_and_cq();

        let qp = QueuePairBuilder::new(&pd).build_rc(&cq, &cq).unwrap();
        assert_ne!(qp.qp_num(), 0);
        assert_eq!(qp.status().unwrap(), QueuePairStatus::Reset);

        let attrs = qp.attributes();
        assert_eq!(attrs.port_num, 1);
        assert_eq!(attrs.path_mtu, Mtu::Mtu256);
        assert_eq!(attrs.timeout, 0x12);
        assert_eq!(attrs.retry_count, 6);
        assert_eq!(attrs.rnr_retry, 0);
        assert_eq!(attrs.max_rd_atomic, 1);
    }

    #[test]
    fn port_is_carried_to_the_qp() {
        let (pd, cq) = pd_and_cq();
        let mut builder = QueuePairBuilder::new(&pd);
        builder.set_port_num(2);
        assert_eq!(builder.build_rc(&cq, &cq).unwrap().attributes().port_num, 2);
    }

    #[test]
    fn multi_sge_is_rejected() {
        let (pd, cq) = pd_and_cq();
        let mut builder = QueuePairBuilder::new(&pd);
        builder.set_cap(QpCap {
            max_send_wr: 1,
            max_recv_wr: 1,
            max_send_sge: 4,
            max_recv_sge: 1,
            max_inline_data: 0,
        });
        assert!(builder.build_rc(&cq, &cq).is_err());
    }
}
