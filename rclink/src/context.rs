use std::sync::Arc;

use rdma_shim::{Gid, PortAttr, RawContext, RawPd};

use crate::device::DeviceRef;
use crate::ControlpathError;

/// An opened device.
///
/// Every resource created from a context keeps an `Arc` to it, so the
/// context is closed only after all of them are gone.
#[derive(Debug)]
pub struct Context {
    inner: RawContext,
    dev: DeviceRef,
}

pub type ContextRef = Arc<Context>;

impl Context {
    pub fn new(dev: &DeviceRef) -> Result<Arc<Self>, ControlpathError> {
        let inner = dev.raw().open().map_err(|err| {
            crate::log::error!("failed to open device {}", dev.name());
            ControlpathError::ContextError("open device", err)
        })?;
        Ok(Arc::new(Self {
            inner,
            dev: dev.clone(),
        }))
    }

    #[inline]
    pub fn get_dev_ref(&self) -> &DeviceRef {
        &self.dev
    }

    pub fn get_port_attr(&self, port_num: u8) -> Result<PortAttr, ControlpathError> {
        self.inner
            .query_port(port_num)
            .map_err(|err| ControlpathError::QueryError("port attr", err))
    }

    pub fn query_gid(&self, port_num: u8, gid_index: u8) -> Result<Gid, ControlpathError> {
        self.inner
            .query_gid(port_num, gid_index)
            .map_err(|err| ControlpathError::QueryError("gid", err))
    }

    pub(crate) fn raw(&self) -> &RawContext {
        &self.inner
    }
}

/// Protection domain. MRs and QPs created from the same PD may work together.
#[derive(Debug)]
pub struct ProtectionDomain {
    inner: RawPd,
    ctx: Arc<Context>,
}

impl ProtectionDomain {
    pub fn new(ctx: &Arc<Context>) -> Result<Arc<Self>, ControlpathError> {
        let inner =
            RawPd::alloc(ctx.raw()).map_err(|err| ControlpathError::CreationError("PD", err))?;
        Ok(Arc::new(Self {
            inner,
            ctx: ctx.clone(),
        }))
    }

    #[inline]
    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn raw(&self) -> &RawPd {
        &self.inner
    }
}
