use std::sync::Arc;

use rdma_shim::DeviceList;

use crate::device::{Device, DeviceRef};
use crate::ControlpathError;

/// UDriver abstracts the RDMA device lists on this machine
pub struct UDriver {
    rnics: Vec<DeviceRef>,
}

pub type UDriverRef = Arc<UDriver>;

impl UDriver {
    pub fn devices(&self) -> &Vec<DeviceRef> {
        &self.rnics
    }

    /// Query the device lists on this machine, and recorded in the UDriver
    ///
    /// An empty list is an error: there is nothing to open.
    pub fn create() -> Result<UDriverRef, ControlpathError> {
        let list = DeviceList::query()
            .map_err(|err| ControlpathError::QueryError("device list", err))?;

        let rnics: Vec<DeviceRef> = list
            .devices()
            .iter()
            .cloned()
            .map(|raw| Arc::new(Device::new(raw)))
            .collect();

        if rnics.is_empty() {
            crate::log::error!("failed to get IB devices list");
            return Err(ControlpathError::NoDevice("<any>".to_string()));
        }
        crate::log::info!("found {} device(s)", rnics.len());

        Ok(Arc::new(Self { rnics }))
    }

    /// return the overall wrapped devices
    pub fn iter(&self) -> core::slice::Iter<'_, DeviceRef> {
        self.rnics.iter()
    }

    /// get a specific device accroding to the index of the device list
    pub fn get_dev(&self, index: usize) -> Option<&DeviceRef> {
        self.rnics.get(index)
    }

    /// Find a device by name, or the first one when `name` is `None`.
    pub fn find(&self, name: Option<&str>) -> Result<&DeviceRef, ControlpathError> {
        match name {
            None => {
                let dev = self
                    .rnics
                    .first()
                    .ok_or_else(|| ControlpathError::NoDevice("<any>".to_string()))?;
                crate::log::info!("device not specified, using first one found: {}", dev.name());
                Ok(dev)
            }
            Some(name) => self
                .rnics
                .iter()
                .find(|dev| dev.name() == name)
                .ok_or_else(|| ControlpathError::NoDevice(name.to_string())),
        }
    }
}

impl core::fmt::Debug for UDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("User-space RDMA device list")
            .field("num_devices", &self.rnics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_rdma() {
        let driver = UDriver::create().unwrap();
        assert!(!driver.devices().is_empty());
        assert_eq!(driver.iter().len(), driver.devices().len());
        assert!(driver.get_dev(0).is_some());
    }

    #[test]
    fn find_by_name() {
        let driver = UDriver::create().unwrap();
        let first = driver.find(None).unwrap();
        assert_eq!(first.name(), driver.get_dev(0).unwrap().name());
        assert_eq!(driver.find(Some(&first.name())).unwrap().name(), first.name());
        assert!(matches!(
            driver.find(Some("no_such_dev")),
            Err(ControlpathError::NoDevice(_))
        ));
    }
}
