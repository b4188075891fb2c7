//! Kernel capability table.
//!
//! Everything that differs between kernel versions and build configurations is decided
//! once, here, when the hook is installed. Call sites only ever look at [`Capabilities`].
use crate::{ftrace::FtraceFlags, kernel::Kernel};
use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use std::{ffi::CStr, fmt, io, mem};

/// A `major.minor.patch` kernel release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// parse a release string such as `5.15.0-91-generic` or `6.1.0+`
    pub fn parse(release: &str) -> Option<Self> {
        let numeric = release
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Some(Self::new(major, minor, patch))
    }

    /// The release of the kernel this process runs on, read once through `uname(2)`.
    pub fn running() -> Result<Self> {
        static RUNNING: OnceCell<KernelVersion> = OnceCell::new();

        RUNNING
            .get_or_try_init(|| {
                let mut uts: libc::utsname = unsafe { mem::zeroed() };
                if unsafe { libc::uname(&mut uts) } != 0 {
                    return Err(io::Error::last_os_error()).context("uname failed");
                }

                let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) }.to_string_lossy();
                Self::parse(&release)
                    .with_context(|| format!("unrecognized kernel release `{}`", release))
            })
            .copied()
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How a symbol name is turned into an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// call `kallsyms_lookup_name` directly
    Kallsyms,
    /// `kallsyms_lookup_name` is no longer exported since 5.7, register a throwaway
    /// kprobe on the symbol and read back the address it resolved
    Kprobe,
}

impl LookupStrategy {
    pub fn for_version(version: KernelVersion) -> Self {
        if version >= KernelVersion::new(5, 7, 0) {
            LookupStrategy::Kprobe
        } else {
            LookupStrategy::Kallsyms
        }
    }
}

/// How the kernel passes arguments to a syscall implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// `CONFIG_ARCH_HAS_SYSCALL_WRAPPER`: a single `const struct pt_regs *`
    PtRegs,
    /// plain C arguments `(fd, cmd, arg)`
    Direct,
}

/// Capabilities resolved once per install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: KernelVersion,
    pub lookup: LookupStrategy,
    pub convention: CallingConvention,
    pub ftrace_flags: FtraceFlags,
}

impl Capabilities {
    pub fn new(version: KernelVersion, has_syscall_wrapper: bool) -> Self {
        Self {
            version,
            lookup: LookupStrategy::for_version(version),
            convention: if has_syscall_wrapper {
                CallingConvention::PtRegs
            } else {
                CallingConvention::Direct
            },
            // RECURSION_SAFE was renamed to RECURSION in 5.11, the bit stayed the same
            ftrace_flags: FtraceFlags::SAVE_REGS | FtraceFlags::RECURSION | FtraceFlags::IPMODIFY,
        }
    }

    pub fn detect<K: Kernel + ?Sized>(kernel: &K) -> Self {
        Self::new(kernel.version(), kernel.has_syscall_wrapper())
    }
}
