use std::ffi::c_int;
use thiserror::Error;

/// A kernel error number, as returned (negated) by the kernel primitives the hook drives.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("errno {0}")]
pub struct Errno(pub c_int);

impl Errno {
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);

    /// Interpret a kernel style return value, where anything negative is `-errno`.
    pub fn from_ret(ret: c_int) -> Result<(), Errno> {
        if ret < 0 {
            Err(Errno(-ret))
        } else {
            Ok(())
        }
    }

    /// The negative value a kernel entry point would return for this error.
    pub fn to_ret(self) -> c_int {
        -self.0
    }
}

/// Everything that can go wrong while installing or removing the ioctl hook.
///
/// Per-call failures never show up here: a call either reaches the registered module, or
/// the module decides what the caller observes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The module, its ioctl handler or its context was missing at init.
    #[error("invalid argument: missing {0}")]
    InvalidArgument(&'static str),

    /// None of the name variants of the entry point resolved to an address.
    #[error("no variant of `{base}` could be resolved, tried: {}", .tried.join(", "))]
    SymbolNotFound {
        /// The logical name, e.g. `ioctl`
        base: String,
        /// Every real symbol name that was looked up, in order
        tried: Vec<String>,
    },

    /// Registering the trace filter or the trace function failed. Any step that already
    /// succeeded has been undone.
    #[error("{step}() failed: {errno}")]
    RedirectionSetupFailed { step: &'static str, errno: Errno },

    /// Unregistering failed while removing the hook. Only ever logged.
    #[error("{step}() failed during removal: {errno}")]
    RedirectionTeardownFailed { step: &'static str, errno: Errno },

    /// Another ioctl hook is live; only one may exist at a time.
    #[error("an ioctl hook is already installed")]
    AlreadyInstalled,
}

impl HookError {
    /// The errno a module loader would report for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            HookError::InvalidArgument(_) => Errno::EINVAL,
            HookError::SymbolNotFound { .. } => Errno::ENOENT,
            HookError::RedirectionSetupFailed { errno, .. }
            | HookError::RedirectionTeardownFailed { errno, .. } => *errno,
            HookError::AlreadyInstalled => Errno::EBUSY,
        }
    }
}
