use std::sync::Arc;

use rdma_shim::RawDevice;

use crate::context::Context;

#[derive(Debug)]
pub struct Device {
    inner: RawDevice,
}

pub type DeviceRef = Arc<Device>;

impl Device {
    pub(crate) fn new(inner: RawDevice) -> Self {
        Self { inner }
    }

    pub fn open_context(self: &DeviceRef) -> Result<Arc<Context>, crate::ControlpathError> {
        Context::new(self)
    }

    pub fn name(&self) -> String {
        self.inner.name().to_string()
    }

    /// return the raw handle of the device
    pub(crate) fn raw(&self) -> &RawDevice {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_device_name() {
        let udriver = crate::UDriver::create().unwrap();
        let dev_ref = udriver.get_dev(0).unwrap();
        assert!(!dev_ref.name().is_empty());

        for i in 0..udriver.iter().len() {
            let dev = udriver.get_dev(i).unwrap();
            dev.open_context().unwrap();
        }
    }
}
