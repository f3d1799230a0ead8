use std::sync::Arc;

use rdma_shim::PortAttr;

use crate::consts::CQ_DEPTH;
use crate::{
    CMError, CompletionQueue, Config, Context, DatapathError, MemoryRegion, OobChannel,
    OobListener, ProtectionDomain, QueuePair, QueuePairBuilder, RcError, UDriver,
};

/// How the out-of-band stream to the peer comes into being.
#[derive(Debug)]
pub enum Rendezvous {
    /// Actively connect to a listening peer.
    Connect { host: String, port: u16 },
    /// Bind `port` and accept exactly one peer.
    Listen { port: u16 },
    /// Accept one peer on an already bound listener.
    Accept(OobListener),
}

impl Rendezvous {
    pub fn from_config(config: &Config) -> Self {
        match &config.server_name {
            Some(host) => Rendezvous::Connect {
                host: host.clone(),
                port: config.tcp_port,
            },
            None => Rendezvous::Listen {
                port: config.tcp_port,
            },
        }
    }

    fn establish(self) -> Result<OobChannel, CMError> {
        match self {
            Rendezvous::Connect { host, port } => OobChannel::connect(Some(&host), port),
            Rendezvous::Listen { port } => OobChannel::connect(None, port),
            Rendezvous::Accept(listener) => listener.accept(),
        }
    }
}

/// Everything one peer owns for its side of the connection.
///
/// Creation order is context, PD, CQ, memory region (with its buffer),
/// QP, and finally the out-of-band channel. [`teardown`](Self::teardown)
/// releases whatever exists in exactly the reverse order; it is called on
/// drop and on any creation failure, and may be called any number of times.
pub struct EndpointResources {
    pub(crate) ctx: Option<Arc<Context>>,
    pub(crate) pd: Option<Arc<ProtectionDomain>>,
    pub(crate) cq: Option<Arc<CompletionQueue>>,
    pub(crate) mr: Option<MemoryRegion>,
    pub(crate) qp: Option<QueuePair>,
    pub(crate) channel: Option<OobChannel>,
    pub(crate) port_attr: PortAttr,
}

impl EndpointResources {
    fn empty() -> Self {
        Self {
            ctx: None,
            pd: None,
            cq: None,
            mr: None,
            qp: None,
            channel: None,
            port_attr: PortAttr::default(),
        }
    }

    pub fn create(config: &Config, rendezvous: Rendezvous) -> Result<Self, RcError> {
        config.validate()?;
        let mut res = Self::empty();
        // on failure `res` drops here and releases what was built
        res.build(config, rendezvous)?;
        Ok(res)
    }

    fn build(&mut self, config: &Config, rendezvous: Rendezvous) -> Result<(), RcError> {
        crate::log::info!("searching for IB devices in host");
        let driver = UDriver::create()?;
        let dev = driver.find(config.dev_name.as_deref())?;

        let ctx = dev.open_context()?;
        self.ctx = Some(ctx.clone());

        self.port_attr = ctx.get_port_attr(config.ib_port).map_err(|err| {
            crate::log::error!("ibv_query_port on port {} failed", config.ib_port);
            err
        })?;

        let pd = ProtectionDomain::new(&ctx)?;
        self.pd = Some(pd.clone());

        let cq = Arc::new(CompletionQueue::create(&ctx, CQ_DEPTH)?);
        self.cq = Some(cq.clone());

        self.mr = Some(MemoryRegion::new(
            &pd,
            config.msg_size,
            MemoryRegion::default_access(),
        )?);

        // one CQ serves both queues
        let mut builder = QueuePairBuilder::new(&pd);
        builder.set_port_num(config.ib_port);
        self.qp = Some(builder.build_rc(&cq, &cq)?);

        self.channel = Some(rendezvous.establish()?);
        Ok(())
    }

    /// Release every resource that exists, newest first.
    pub fn teardown(&mut self) {
        if let Some(channel) = self.channel.take() {
            crate::log::debug!("closing TCP connection with {}", channel.peer_addr());
        }
        if let Some(qp) = self.qp.take() {
            crate::log::debug!("destroying QP {:#x}", qp.qp_num());
        }
        if self.mr.take().is_some() {
            crate::log::debug!("deregistering MR");
        }
        if self.cq.take().is_some() {
            crate::log::debug!("destroying CQ");
        }
        if self.pd.take().is_some() {
            crate::log::debug!("deallocating PD");
        }
        if self.ctx.take().is_some() {
            crate::log::debug!("closing device context");
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.ctx.is_none()
            && self.pd.is_none()
            && self.cq.is_none()
            && self.mr.is_none()
            && self.qp.is_none()
            && self.channel.is_none()
    }

    #[inline]
    pub fn port_attr(&self) -> &PortAttr {
        &self.port_attr
    }

    pub fn ctx(&self) -> Option<&Arc<Context>> {
        self.ctx.as_ref()
    }

    pub fn mr(&self) -> Result<&MemoryRegion, DatapathError> {
        self.mr.as_ref().ok_or(DatapathError::NotConnected)
    }

    pub fn qp(&self) -> Result<&QueuePair, DatapathError> {
        self.qp.as_ref().ok_or(DatapathError::NotConnected)
    }

    pub fn cq(&self) -> Result<&Arc<CompletionQueue>, DatapathError> {
        self.cq.as_ref().ok_or(DatapathError::NotConnected)
    }

    pub fn channel(&mut self) -> Result<&mut OobChannel, CMError> {
        self.channel.as_mut().ok_or_else(|| {
            CMError::Exchange(
                0,
                std::io::Error::new(std::io::ErrorKind::NotConnected, "channel is closed"),
            )
        })
    }
}

impl Drop for EndpointResources {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl core::fmt::Debug for EndpointResources {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EndpointResources")
            .field("ctx", &self.ctx.is_some())
            .field("pd", &self.pd.is_some())
            .field("cq", &self.cq.is_some())
            .field("mr", &self.mr)
            .field("qp", &self.qp)
            .field("channel", &self.channel.as_ref().map(OobChannel::peer_addr))
            .finish()
    }
}
