use core::num::TryFromIntError;

use libc::c_int;

/// A negative errno, following the kernel convention the verbs calls use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error(pub c_int);

impl Error {
    pub const EINVAL: Self = Error(-(libc::EINVAL as c_int));
    pub const ENOMEM: Self = Error(-(libc::ENOMEM as c_int));
    pub const EFAULT: Self = Error(-(libc::EFAULT as c_int));
    pub const EAGAIN: Self = Error(-(libc::EAGAIN as c_int));
    pub const EBUSY: Self = Error(-(libc::EBUSY as c_int));
    pub const ENODEV: Self = Error(-(libc::ENODEV as c_int));
    pub const EEXIST: Self = Error(-(libc::EEXIST as c_int));

    /// Verbs return either `-errno` or `errno`; both map to the same error.
    pub fn from_errno(errno: c_int) -> Error {
        Error(-errno.abs())
    }

    /// Errno left behind by a verbs call that returned a null handle.
    pub fn last_os_error() -> Error {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Error::from_errno(errno)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut ::core::fmt::Formatter) -> core::fmt::Result {
        match -self.0 {
            libc::EINVAL => write!(fmt, "EINVAL"),
            libc::ENOMEM => write!(fmt, "ENOMEM"),
            libc::EFAULT => write!(fmt, "EFAULT"),
            libc::EAGAIN => write!(fmt, "EAGAIN"),
            libc::EBUSY => write!(fmt, "EBUSY"),
            libc::ENODEV => write!(fmt, "ENODEV"),
            libc::EEXIST => write!(fmt, "EEXIST"),
            _ => write!(fmt, "Unknown error {}", self.0),
        }
    }
}

impl std::error::Error for Error {}

impl From<TryFromIntError> for Error {
    fn from(_: TryFromIntError) -> Error {
        Error::EINVAL
    }
}

pub type ShimResult<T> = Result<T, Error>;
