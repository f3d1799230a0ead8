//! Verbs-shaped hardware interface used by `rclink`.
//!
//! Exactly one backend is compiled in:
//! - `soft` (default): an in-process RC fabric, used for tests and local runs.
//! - `user`: libibverbs through `ibverbs-sys`.
//!
//! Both backends expose the same handle types (`DeviceList`, `RawContext`,
//! `RawPd`, `RawCq`, `RawMr`, `RawQp`). Handles release their resource on drop;
//! keeping dependent handles alive in the right order is the caller's job.

#[cfg(all(feature = "soft", feature = "user"))]
compile_error!("features `rdma-shim/soft` and `rdma-shim/user` are mutually exclusive");

#[cfg(not(any(feature = "soft", feature = "user")))]
compile_error!("one of the features `rdma-shim/soft` or `rdma-shim/user` must be enabled");

pub mod error;
pub mod types;

pub use error::{Error, ShimResult};
pub use types::*;

#[cfg(feature = "soft")]
pub mod soft;

#[cfg(feature = "soft")]
pub use soft::{DeviceList, RawContext, RawCq, RawDevice, RawMr, RawPd, RawQp};

#[cfg(feature = "user")]
pub mod user;

#[cfg(feature = "user")]
pub use user::{DeviceList, RawContext, RawCq, RawDevice, RawMr, RawPd, RawQp};

pub use log;
