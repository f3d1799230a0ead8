use crate::comm_manager::ConnectionMetadata;
use crate::resources::{EndpointResources, Rendezvous};
use crate::{CMError, Config, DatapathError, MemoryRegion, OobListener, QueuePair, RcError};

/// Connection bring-up on top of prepared resources
mod negotiate;

/// post & poll
mod datapath;

/// Kind of a send-queue work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Send,
    RdmaRead,
    RdmaWrite,
}

impl core::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            WorkKind::Send => "Send",
            WorkKind::RdmaRead => "RDMA Read",
            WorkKind::RdmaWrite => "RDMA Write",
        })
    }
}

/// One side of a connected RC pair.
///
/// Owns its [`EndpointResources`]; the peer's [`ConnectionMetadata`] is kept
/// after negotiation to address RDMA reads and writes.
#[derive(Debug)]
pub struct RcEndpoint {
    res: EndpointResources,
    remote: Option<ConnectionMetadata>,
    config: Config,
}

impl RcEndpoint {
    /// Create the resources, meet the peer as `config` says, and bring the
    /// QP up to RTS.
    pub fn connect(config: &Config) -> Result<Self, RcError> {
        Self::establish(config, Rendezvous::from_config(config))
    }

    /// Listener role on an already bound socket.
    pub fn accept(config: &Config, listener: OobListener) -> Result<Self, RcError> {
        Self::establish(config, Rendezvous::Accept(listener))
    }

    pub fn establish(config: &Config, rendezvous: Rendezvous) -> Result<Self, RcError> {
        let res = EndpointResources::create(config, rendezvous)?;
        let mut endpoint = Self {
            res,
            remote: None,
            config: config.clone(),
        };
        endpoint.negotiate()?;
        Ok(endpoint)
    }

    /// The peer's metadata, once negotiation got that far.
    #[inline]
    pub fn remote_props(&self) -> Option<&ConnectionMetadata> {
        self.remote.as_ref()
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn resources(&self) -> &EndpointResources {
        &self.res
    }

    pub fn buffer(&self) -> Result<&MemoryRegion, DatapathError> {
        self.res.mr()
    }

    pub fn qp(&self) -> Result<&QueuePair, DatapathError> {
        self.res.qp()
    }

    /// One-byte barrier with the peer.
    pub fn sync(&mut self, tag: u8) -> Result<(), CMError> {
        self.res.channel()?.barrier(tag)
    }

    /// Release all resources now. Later data path calls fail with
    /// `NotConnected`; calling this again does nothing.
    pub fn teardown(&mut self) {
        self.res.teardown();
    }
}
