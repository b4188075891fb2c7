use crate::regs::PtRegs;
use std::{
    ffi::{c_long, c_uint, c_ulong},
    fmt,
    mem::transmute,
    ops::Deref,
};

pub(crate) type RegsIoctlFn = unsafe extern "C" fn(*const PtRegs) -> c_long;
pub(crate) type DirectIoctlFn = unsafe extern "C" fn(c_uint, c_uint, c_ulong) -> c_long;

/// The arguments of one `ioctl(fd, cmd, arg)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoctlArgs {
    pub fd: c_uint,
    pub cmd: c_uint,
    pub arg: c_ulong,
}

impl IoctlArgs {
    pub fn new(fd: c_uint, cmd: c_uint, arg: c_ulong) -> Self {
        Self { fd, cmd, arg }
    }

    pub(crate) fn from_regs(regs: &PtRegs) -> Self {
        Self {
            fd: regs.arg0() as c_uint,
            cmd: regs.arg1() as c_uint,
            arg: regs.arg2() as c_ulong,
        }
    }
}

#[derive(Clone, Copy)]
enum Original<'a> {
    Regs { ioctl: RegsIoctlFn, regs: &'a PtRegs },
    Direct(DirectIoctlFn),
}

/// An intercepted ioctl call.
///
/// Dereferences to the call's [`IoctlArgs`]. [`IoctlCall::pass_through`] runs the original
/// kernel implementation with the caller's arguments. The call only lives as long as the
/// intercepted syscall, so it can't be kept around after the module returns.
pub struct IoctlCall<'a> {
    args: IoctlArgs,
    original: Original<'a>,
}

impl<'a> IoctlCall<'a> {
    /// # Safety
    /// `original` must be the address of the hooked `(const struct pt_regs *)` entry point.
    pub(crate) unsafe fn with_regs(original: usize, regs: &'a PtRegs) -> Self {
        Self {
            args: IoctlArgs::from_regs(regs),
            original: Original::Regs {
                ioctl: transmute::<usize, RegsIoctlFn>(original),
                regs,
            },
        }
    }

    /// # Safety
    /// `original` must be the address of the hooked `(fd, cmd, arg)` entry point.
    pub(crate) unsafe fn direct(original: usize, args: IoctlArgs) -> Self {
        Self {
            args,
            original: Original::Direct(transmute::<usize, DirectIoctlFn>(original)),
        }
    }

    pub fn args(&self) -> IoctlArgs {
        self.args
    }

    /// call the real ioctl and return its result untouched
    pub fn pass_through(&self) -> c_long {
        match self.original {
            // the original register snapshot is handed over as is
            Original::Regs { ioctl, regs } => unsafe { ioctl(regs) },
            Original::Direct(ioctl) => unsafe {
                ioctl(self.args.fd, self.args.cmd, self.args.arg)
            },
        }
    }
}

impl Deref for IoctlCall<'_> {
    type Target = IoctlArgs;

    fn deref(&self) -> &Self::Target {
        &self.args
    }
}

impl fmt::Debug for IoctlCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IoctlCall").field(&self.args).finish()
    }
}
