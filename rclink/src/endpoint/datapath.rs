use std::time::Instant;

use rdma_shim::WorkCompletion;

use super::{RcEndpoint, WorkKind};
use crate::DatapathError;

/// All work requests on the connection carry the same id.
const WR_ID: u64 = 0;

impl RcEndpoint {
    /// Post one signaled work request covering the whole buffer.
    ///
    /// RDMA reads and writes target the buffer the peer published during
    /// negotiation.
    pub fn post_send(&self, kind: WorkKind) -> Result<(), DatapathError> {
        let mr = self.res.mr()?;
        let qp = self.res.qp()?;
        let range = 0..mr.capacity() as u64;

        let ret = match kind {
            WorkKind::Send => qp.post_send_send(mr, range, true, WR_ID),
            WorkKind::RdmaRead | WorkKind::RdmaWrite => {
                let remote = self.remote.as_ref().ok_or(DatapathError::NotConnected)?;
                if kind == WorkKind::RdmaRead {
                    qp.post_send_read(mr, range, true, remote.addr, remote.rkey, WR_ID)
                } else {
                    qp.post_send_write(mr, range, true, remote.addr, remote.rkey, WR_ID)
                }
            }
        };

        match &ret {
            Ok(()) => crate::log::info!("{} Request was posted", kind),
            Err(err) => crate::log::error!("failed to post SR: {}", err),
        }
        ret
    }

    /// Post one receive covering the whole buffer.
    pub fn post_receive(&self) -> Result<(), DatapathError> {
        let mr = self.res.mr()?;
        let qp = self.res.qp()?;
        match qp.post_recv(mr, 0..mr.capacity() as u64, WR_ID) {
            Ok(()) => {
                crate::log::info!("Receive Request was posted");
                Ok(())
            }
            Err(err) => {
                crate::log::error!("failed to post RR: {}", err);
                Err(err)
            }
        }
    }

    /// Spin on the CQ for a single completion, at most `poll_timeout`.
    ///
    /// A missing completion (`TimeoutError`) and an unsuccessful one
    /// (`CompletionError`) are reported apart.
    pub fn poll_completion(&self) -> Result<WorkCompletion, DatapathError> {
        let cq = self.res.cq()?;
        let timeout = self.config.poll_timeout();
        let mut wcs = [WorkCompletion::default(); 1];

        let start = Instant::now();
        loop {
            if !cq.poll(&mut wcs)?.is_empty() {
                break;
            }
            if start.elapsed() >= timeout {
                crate::log::error!("completion wasn't found in the CQ after timeout");
                return Err(DatapathError::TimeoutError(timeout));
            }
            core::hint::spin_loop();
        }

        let wc = wcs[0];
        crate::log::info!("completion was found in CQ with status {:#x}", wc.status);
        if !wc.is_success() {
            crate::log::error!(
                "got bad completion with status: {:#x}, vendor syndrome: {:#x}",
                wc.status,
                wc.vendor_err
            );
            return Err(DatapathError::CompletionError {
                status: wc.status,
                vendor_err: wc.vendor_err,
                wr_id: wc.wr_id,
            });
        }
        Ok(wc)
    }
}
