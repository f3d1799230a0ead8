//! Out-of-band bootstrap.
//!
//! Before any RDMA traffic flows, the two peers trade a fixed-size
//! [`ConnectionMetadata`] record over a plain TCP stream ([`OobChannel`]),
//! and later use the same stream for 1-byte barriers.

use rdma_shim::Gid;

pub use crate::CMError;

mod channel;
pub use channel::{OobChannel, OobListener};

/// What a peer needs to reach our buffer and queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionMetadata {
    /// Buffer address
    pub addr: u64,
    /// Remote key
    pub rkey: u32,
    /// QP number
    pub qp_num: u32,
    /// LID of the IB port
    pub lid: u16,
    /// GID; all zero when LID addressing is used
    pub gid: Gid,
}

impl ConnectionMetadata {
    /// Size of the record on the wire, no padding.
    pub const WIRE_SIZE: usize = 8 + 4 + 4 + 2 + 16;

    /// Numeric fields in network byte order, then the raw GID bytes.
    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_be_bytes());
        out[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        out[12..16].copy_from_slice(&self.qp_num.to_be_bytes());
        out[16..18].copy_from_slice(&self.lid.to_be_bytes());
        out[18..34].copy_from_slice(self.gid.raw());
        out
    }

    pub fn decode(raw: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut addr = [0u8; 8];
        let mut rkey = [0u8; 4];
        let mut qp_num = [0u8; 4];
        let mut lid = [0u8; 2];
        let mut gid = [0u8; 16];
        addr.copy_from_slice(&raw[0..8]);
        rkey.copy_from_slice(&raw[8..12]);
        qp_num.copy_from_slice(&raw[12..16]);
        lid.copy_from_slice(&raw[16..18]);
        gid.copy_from_slice(&raw[18..34]);
        Self {
            addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes(rkey),
            qp_num: u32::from_be_bytes(qp_num),
            lid: u16::from_be_bytes(lid),
            gid: Gid::from(gid),
        }
    }

    /// Decode from a slice that must be exactly one record long.
    pub fn decode_slice(raw: &[u8]) -> Option<Self> {
        let raw: &[u8; Self::WIRE_SIZE] = raw.try_into().ok()?;
        Some(Self::decode(raw))
    }
}
