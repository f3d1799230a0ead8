use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use rdma_shim::{AccessFlags, RawMr};

use crate::context::ProtectionDomain;
use crate::ControlpathError;

/// Zero-filled heap memory with a stable address.
///
/// The remote side may touch the bytes at any time while registered, so the
/// memory lives outside of any Rust-visible slice ownership.
struct Buffer {
    data: NonNull<u8>,
    layout: Layout,
}

impl Buffer {
    fn zeroed(capacity: usize) -> Result<Self, ControlpathError> {
        if capacity == 0 {
            return Err(ControlpathError::InvalidArg("MR size"));
        }
        let layout = Layout::from_size_align(capacity, 64)
            .map_err(|_| ControlpathError::InvalidArg("MR size"))?;
        let data = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(
            ControlpathError::CreationError("MR buffer", rdma_shim::Error::ENOMEM),
        )?;
        Ok(Self { data, layout })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
    }
}

/// A memory region that abstracts the memory used by RDMA
///
/// The region owns its buffer: registration happens right after the
/// allocation, and the buffer is only released after deregistration
/// (fields drop in declaration order).
///
/// # Examples
///
/// ``` text,ignore
///        let ctx = crate::UDriver::create()?.find(None)?.open_context()?;
///        let pd = crate::ProtectionDomain::new(&ctx)?;
///        let mr = crate::MemoryRegion::new(&pd, 1024, MemoryRegion::default_access())?;
///        mr.write_bytes(0, b"hello")?;
/// ```
pub struct MemoryRegion {
    mr: RawMr,
    buf: Buffer,
    capacity: usize,
    access: AccessFlags,
    _pd: Arc<ProtectionDomain>,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalKey(pub u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteKey(pub u32);

impl MemoryRegion {
    /// Local write plus remote read and write.
    pub fn default_access() -> AccessFlags {
        AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE
    }

    pub fn new(
        pd: &Arc<ProtectionDomain>,
        capacity: usize,
        access: AccessFlags,
    ) -> Result<Self, ControlpathError> {
        let buf = Buffer::zeroed(capacity)?;
        let mr = unsafe { RawMr::register(pd.raw(), buf.data.as_ptr(), capacity, access) }
            .map_err(|err| {
                crate::log::error!("ibv_reg_mr failed with mr_flags={:?}", access);
                ControlpathError::CreationError("MR", err)
            })?;

        crate::log::debug!(
            "MR was registered with addr={:#x}, lkey={:#x}, rkey={:#x}, flags={:?}",
            buf.data.as_ptr() as u64,
            mr.lkey(),
            mr.rkey(),
            access
        );

        Ok(Self {
            mr,
            buf,
            capacity,
            access,
            _pd: pd.clone(),
        })
    }

    #[inline]
    pub fn get_virt_addr(&self) -> u64 {
        self.buf.data.as_ptr() as u64
    }

    #[inline]
    pub fn rkey(&self) -> RemoteKey {
        RemoteKey(self.mr.rkey())
    }

    #[inline]
    pub fn lkey(&self) -> LocalKey {
        LocalKey(self.mr.lkey())
    }

    #[inline]
    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Total size of the memory region
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), ControlpathError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(ControlpathError::InvalidArg("MR range")),
        }
    }

    /// Copy `data` into the region starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<(), ControlpathError> {
        self.check_range(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.buf.data.as_ptr().add(offset),
                data.len(),
            )
        };
        Ok(())
    }

    /// Snapshot `len` bytes of the region starting at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, ControlpathError> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.buf.data.as_ptr().add(offset),
                out.as_mut_ptr(),
                len,
            )
        };
        Ok(out)
    }

    /// Store `msg` as a NUL-terminated string at the head of the region.
    ///
    /// Long messages are cut to fit, keeping room for the terminator.
    pub fn write_message(&self, msg: &str) -> Result<(), ControlpathError> {
        let bytes = msg.as_bytes();
        let n = bytes.len().min(self.capacity - 1);
        self.write_bytes(0, &bytes[..n])?;
        self.write_bytes(n, &[0])
    }

    /// Load the NUL-terminated string at the head of the region.
    pub fn read_message(&self) -> String {
        match self.read_bytes(0, self.capacity) {
            Ok(raw) => crate::utils::nul_terminated_to_string(&raw),
            Err(_) => String::new(),
        }
    }
}

impl core::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("addr", &format_args!("{:#x}", self.get_virt_addr()))
            .field("capacity", &self.capacity)
            .field("lkey", &self.lkey().0)
            .field("rkey", &self.rkey().0)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pd() -> Arc<ProtectionDomain> {
        let ctx = crate::UDriver::create()
            .expect("failed to query device")
            .find(None)
            .expect("no rdma device available")
            .open_context()
            .expect("failed to create RDMA context");
        ProtectionDomain::new(&ctx).unwrap()
    }

    #[test]
    fn test_mr_basic() {
        let pd = pd();
        let mr = MemoryRegion::new(&pd, 1024, MemoryRegion::default_access()).unwrap();
        assert_eq!(mr.capacity(), 1024);
        assert_ne!(mr.get_virt_addr(), 0);
        assert_ne!(mr.lkey().0, 0);
        assert_ne!(mr.rkey().0, 0);
        assert_eq!(mr.read_bytes(0, 1024).unwrap(), vec![0u8; 1024]);
    }

    #[test]
    fn bounds_are_checked() {
        let mr = MemoryRegion::new(&pd(), 16, MemoryRegion::default_access()).unwrap();
        mr.write_bytes(8, &[1; 8]).unwrap();
        assert!(mr.write_bytes(9, &[1; 8]).is_err());
        assert!(mr.read_bytes(usize::MAX, 2).is_err());
        assert_eq!(mr.read_bytes(8, 8).unwrap(), vec![1; 8]);
    }

    #[test]
    fn messages_are_nul_terminated() {
        let mr = MemoryRegion::new(&pd(), 8, MemoryRegion::default_access()).unwrap();
        mr.write_message("hi").unwrap();
        assert_eq!(mr.read_message(), "hi");

        mr.write_message("far too long").unwrap();
        assert_eq!(mr.read_message(), "far too");
        assert_eq!(mr.read_bytes(7, 1).unwrap(), vec![0]);
    }

    #[test]
    fn zero_size_or_bad_access_fails() {
        let pd = pd();
        assert!(MemoryRegion::new(&pd, 0, MemoryRegion::default_access()).is_err());
        assert!(MemoryRegion::new(&pd, 64, AccessFlags::REMOTE_WRITE).is_err());
    }
}
