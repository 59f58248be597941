use core::fmt::{Debug, Display, Formatter, Result};

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(dead_code, clippy::upper_case_acronyms)]
/// POSIX errno
pub enum ErrorNum {
    EPERM = 1,   // Operation not permitted.
    ENOENT = 2,  // No such file or directory.
    EIO = 5,     // I/O error.
    ENOMEM = 12, // Not enough space.
    EFAULT = 14, // Bad address.
    EBUSY = 16,  // Device or resource busy.
    EEXIST = 17, // File exists.
    ENODEV = 19, // No such device.
    EINVAL = 22, // Invalid argument.
    ERANGE = 34, // Result too large.
    ENOSYS = 38, // Function not implemented.
}

impl ErrorNum {
    /// Negative errno, as returned across the C-style boundary.
    pub const fn code(self) -> i32 {
        -(self as i32)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct KernelError {
    pub num: ErrorNum,
    pub loc_line: u32,
    pub loc_col: u32,
    pub loc_file: &'static str,
    pub msg: Option<&'static str>,
}

pub type KResult<T> = core::result::Result<T, KernelError>;

impl KernelError {
    #[track_caller]
    pub fn new(num: ErrorNum, msg: Option<&'static str>) -> Self {
        let loc = core::panic::Location::caller();
        Self {
            num,
            loc_line: loc.line(),
            loc_col: loc.column(),
            loc_file: loc.file(),
            msg,
        }
    }
}

impl Debug for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "[{}:{}:{}] {:?}",
            self.loc_file, self.loc_line, self.loc_col, self.num
        )?;
        if let Some(msg) = self.msg {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl Display for KernelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        Debug::fmt(self, f)
    }
}

/// Builds a [`KernelError`] tagged with the caller's source location.
#[macro_export]
macro_rules! kerr {
    ($num:ident) => {
        $crate::error::KernelError::new($crate::error::ErrorNum::$num, None)
    };
    ($num:ident, $msg:expr) => {
        $crate::error::KernelError::new($crate::error::ErrorNum::$num, Some($msg))
    };
}
