//! ioctl_hook is a lib based on `ftrace` that intercepts the Linux `ioctl` entry point from
//! inside the kernel and hands every call to a registered module.
//! It currently only supports `x86_64` architecture.
//!
//! # Usage
//! Write a function whose signature is `fn(&Ctx, &IoctlCall, Dev) -> c_long`, mark it as
//! `#[ioctl_module]`, and install it.
//!
//! ```rust,ignore
//! #[ioctl_module]
//! fn smi(ctx: &Containers, call: &IoctlCall<'_>, dev: Dev) -> c_long {
//!     if dev.major() != NVIDIA_MAJOR {
//!         return real!();
//!     }
//!
//!     // do something before the real ioctl, checking the command, logging, etc.
//!
//!     let ret = real!();
//!
//!     // do something after, rewriting what the caller will read back..
//!     ret
//! }
//!
//! hook::init(kernel, Some(&smi), Some(Arc::new(containers)))?;
//! ```
//!
//! # Extra Info
//!
//! ## Finding the entry point
//! Depending on the architecture and on `CONFIG_ARCH_HAS_SYSCALL_WRAPPER`, the kernel
//! exports the implementation as `__x64_sys_ioctl`, `__ia32_sys_ioctl`, `__se_sys_ioctl`,
//! `__do_sys_ioctl` or `sys_ioctl`. They are tried in that order. Since 5.7
//! `kallsyms_lookup_name` isn't exported any more, so a kprobe is registered on each
//! candidate just to read back its address.
//!
//! ## Redirection
//! An ftrace callback with `SAVE_REGS | RECURSION | IPMODIFY` is filtered on the entry
//! point and rewrites the saved instruction pointer to the replacement. Calls made from this
//! module's own code are left alone, which is how [`IoctlCall::pass_through`] reaches the
//! original.
//!
//! ## Kernel primitives
//! Everything the hook needs from the kernel goes through the [`Kernel`] trait, implemented
//! by the loader that links this crate into a module.
//!
pub use call::{IoctlArgs, IoctlCall};
pub use caps::{Capabilities, CallingConvention, KernelVersion, LookupStrategy};
pub use dev::Dev;
pub use error::{Errno, HookError};
pub use fd::{FdTable, FileRef, Inode};
pub use ftrace::{
    FtraceFlags, FtraceFunc, FtraceHook, FtraceOps, FtraceRegs, OriginalSlot, Tracer,
};
pub use hook::{init, is_installed, teardown, IoctlFn, IoctlHook, Module, IOCTL_SYSCALL};
/// A proc-macro that turns a rust fn into an ioctl [`Module`].
///
/// See more details in the crate docs.
pub use ioctl_attr::ioctl_module;
pub use kernel::{CodeRegion, Kernel};
pub use regs::PtRegs;
pub use symbol::{Kallsyms, Kprobe, Resolved, SymbolResolver, SymbolTable, SYSCALL_PREFIXES};

mod call;
mod caps;
mod dev;
mod dispatch;
mod error;
pub mod fd;
mod ftrace;
pub mod hook;
mod kernel;
mod regs;
pub mod symbol;

/// Calls the original ioctl from inside an `#[ioctl_module]` function.
///
/// `#[ioctl_module]` rewrites it to `call.pass_through()`, anywhere else it is an error.
#[macro_export]
macro_rules! real {
    () => {
        compile_error!("real!() can only be used inside an #[ioctl_module] function")
    };
}
