use rdma_shim::Gid;

use super::RcEndpoint;
use crate::comm_manager::ConnectionMetadata;
use crate::consts::SYNC_AFTER_RTS;
use crate::{AddressMode, HandshakeError};

impl RcEndpoint {
    /// Trade metadata with the peer and walk the QP to RTS.
    ///
    /// The steps must run in this order on both sides:
    /// 1. build the local record (GID only with global addressing)
    /// 2. exchange records
    /// 3. RESET -> INIT
    /// 4. pre-post a receive, on the receiving side only
    /// 5. INIT -> RTR against the peer's record
    /// 6. RTR -> RTS
    /// 7. one-byte barrier, so neither side posts before both are in RTS
    pub(super) fn negotiate(&mut self) -> Result<(), HandshakeError> {
        let ib_port = self.config.ib_port;
        let mode = AddressMode::from_gid_idx(self.config.gid_idx);

        let gid = match mode {
            AddressMode::Global { sgid_index } => self
                .res
                .ctx()
                .ok_or(HandshakeError::Released)?
                .query_gid(ib_port, sgid_index)
                .map_err(|err| {
                    crate::log::error!(
                        "could not get gid for port {}, index {}",
                        ib_port,
                        sgid_index
                    );
                    HandshakeError::LocalGid(ib_port, sgid_index, err)
                })?,
            AddressMode::Local => Gid::zeroed(),
        };

        let local = {
            let mr = self.res.mr().map_err(|_| HandshakeError::Released)?;
            let qp = self.res.qp().map_err(|_| HandshakeError::Released)?;
            ConnectionMetadata {
                addr: mr.get_virt_addr(),
                rkey: mr.rkey().0,
                qp_num: qp.qp_num(),
                lid: self.res.port_attr().lid,
                gid,
            }
        };
        crate::log::info!("Local LID = {:#x}", local.lid);

        let raw = self
            .res
            .channel()
            .and_then(|ch| ch.sync_exchange(&local.encode(), ConnectionMetadata::WIRE_SIZE))
            .map_err(|err| {
                crate::log::error!("failed to exchange connection data between sides");
                HandshakeError::Exchange(err)
            })?;
        let remote = ConnectionMetadata::decode_slice(&raw).ok_or_else(|| {
            HandshakeError::Exchange(crate::CMError::Exchange(
                raw.len(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "short metadata record"),
            ))
        })?;

        crate::log::info!("Remote address = {:#x}", remote.addr);
        crate::log::info!("Remote rkey = {:#x}", remote.rkey);
        crate::log::info!("Remote QP number = {:#x}", remote.qp_num);
        crate::log::info!("Remote LID = {:#x}", remote.lid);
        if let AddressMode::Global { .. } = mode {
            crate::log::info!("Remote GID = {}", remote.gid);
        }
        self.remote = Some(remote);

        let qp = self.res.qp().map_err(|_| HandshakeError::Released)?;
        qp.modify_to_init()?;

        if self.config.receiving_side {
            self.post_receive().map_err(|err| {
                crate::log::error!("failed to post RR");
                HandshakeError::PrePostRecv(err)
            })?;
        }

        let qp = self.res.qp().map_err(|_| HandshakeError::Released)?;
        qp.modify_to_rtr(remote.qp_num, remote.lid, remote.gid, mode)?;
        qp.modify_to_rts()?;
        crate::log::info!("QP state was change to RTS");

        self.sync(SYNC_AFTER_RTS).map_err(|err| {
            crate::log::error!("sync error after QPs are were moved to RTS");
            HandshakeError::Barrier(err)
        })
    }
}
