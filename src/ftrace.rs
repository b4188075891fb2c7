//! `ftrace` based redirection of a single kernel function.
//!
//! The hook registers an ftrace callback filtered on the entry point's address. The
//! callback rewrites the saved instruction pointer so the traced function returns into the
//! replacement instead, unless the call comes from this module itself: that is how the
//! replacement reaches the original without bouncing back into itself.
use crate::{
    error::HookError,
    kernel::{CodeRegion, Kernel},
    regs::PtRegs,
    symbol::SymbolResolver,
    Errno,
};
use bitflags::bitflags;
use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info};

bitflags! {
    /// `FTRACE_OPS_FL_*`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FtraceFlags: u32 {
        /// the callback gets a full `pt_regs`
        const SAVE_REGS = 1 << 2;
        /// `RECURSION_SAFE` before 5.11
        const RECURSION = 1 << 4;
        /// the callback may change `regs.ip`
        const IPMODIFY = 1 << 12;
    }
}

/// `ftrace_func_t`
pub type FtraceFunc =
    fn(ip: usize, parent_ip: usize, ops: &FtraceOps, fregs: &mut FtraceRegs<'_>);

/// Register state handed to an ftrace callback.
///
/// Since 5.11 callbacks receive `struct ftrace_regs`, which only carries a full `pt_regs`
/// when the ops asked for [`FtraceFlags::SAVE_REGS`].
pub struct FtraceRegs<'r> {
    regs: Option<&'r mut PtRegs>,
}

impl<'r> FtraceRegs<'r> {
    pub fn new(regs: &'r mut PtRegs) -> Self {
        Self { regs: Some(regs) }
    }

    pub fn without_regs() -> Self {
        Self { regs: None }
    }

    /// `ftrace_get_regs`
    pub fn get_regs(&mut self) -> Option<&mut PtRegs> {
        self.regs.as_deref_mut()
    }
}

/// `struct ftrace_ops`, plus what the callback needs to decide where to go.
///
/// The kernel keys registrations by the address of the ops, so it must not move between
/// `ftrace_set_filter_ip` and `unregister_ftrace_function`.
#[derive(Clone, Default)]
pub struct FtraceOps {
    func: Option<FtraceFunc>,
    flags: FtraceFlags,
    target: usize,
    region: CodeRegion,
}

impl Default for FtraceFlags {
    fn default() -> Self {
        FtraceFlags::empty()
    }
}

impl fmt::Debug for FtraceOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtraceOps")
            .field("func", &self.func.map(|func| func as usize))
            .field("flags", &self.flags)
            .field("target", &format_args!("{:#x}", self.target))
            .field("region", &self.region)
            .finish()
    }
}

impl FtraceOps {
    pub fn flags(&self) -> FtraceFlags {
        self.flags
    }

    /// run the callback as the ftrace trampoline would
    pub fn call(&self, ip: usize, parent_ip: usize, fregs: &mut FtraceRegs<'_>) {
        if let Some(func) = self.func {
            func(ip, parent_ip, self, fregs);
        }
    }
}

/// The ftrace registration API.
pub trait Tracer {
    /// `ftrace_set_filter_ip`: add `ip` to the filter of `ops`, or drop it if `remove`
    fn ftrace_set_filter_ip(
        &self,
        ops: &FtraceOps,
        ip: usize,
        remove: bool,
        reset: bool,
    ) -> Result<(), Errno>;

    fn register_ftrace_function(&self, ops: &FtraceOps) -> Result<(), Errno>;

    fn unregister_ftrace_function(&self, ops: &FtraceOps) -> Result<(), Errno>;
}

/// Where the original function can be called once the hook is installed. 0 otherwise.
pub type OriginalSlot = Arc<AtomicUsize>;

fn ftrace_thunk(_ip: usize, parent_ip: usize, ops: &FtraceOps, fregs: &mut FtraceRegs<'_>) {
    let Some(regs) = fregs.get_regs() else {
        return;
    };

    // calls coming out of this module, the pass-through in particular, must reach the
    // original function
    if !ops.region.contains(parent_ip) {
        regs.ip = ops.target as u64;
    }
}

/// One ftrace hook: the traced function, its replacement and the ops tying them together.
#[derive(Debug)]
pub struct FtraceHook {
    name: String,
    function: usize,
    original: OriginalSlot,
    address: usize,
    ops: FtraceOps,
}

impl FtraceHook {
    pub fn new(function: usize, original: OriginalSlot) -> Self {
        Self {
            name: String::new(),
            function,
            original,
            address: 0,
            ops: FtraceOps::default(),
        }
    }

    /// the real symbol name, once resolved
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.address
    }

    fn resolve<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        resolver: &SymbolResolver,
        base: &str,
    ) -> Result<(), HookError> {
        let resolved = resolver.resolve(kernel, base)?;
        self.name = resolved.name;
        self.address = resolved.address;
        self.original.store(self.address, Ordering::Release);
        Ok(())
    }

    /// Resolve `base` and redirect it to the replacement function.
    ///
    /// Nothing stays registered when this fails.
    pub fn install<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        resolver: &SymbolResolver,
        base: &str,
        flags: FtraceFlags,
    ) -> Result<(), HookError> {
        self.resolve(kernel, resolver, base)?;

        self.ops = FtraceOps {
            func: Some(ftrace_thunk),
            flags,
            target: self.function,
            region: kernel.this_module(),
        };

        if let Err(errno) = kernel.ftrace_set_filter_ip(&self.ops, self.address, false, false) {
            error!("ftrace_set_filter_ip() failed: {}", errno);
            self.original.store(0, Ordering::Release);
            return Err(HookError::RedirectionSetupFailed {
                step: "ftrace_set_filter_ip",
                errno,
            });
        }

        if let Err(errno) = kernel.register_ftrace_function(&self.ops) {
            error!("register_ftrace_function() failed: {}", errno);
            if let Err(errno) = kernel.ftrace_set_filter_ip(&self.ops, self.address, true, false) {
                error!("ftrace_set_filter_ip() failed while unwinding: {}", errno);
            }
            self.original.store(0, Ordering::Release);
            return Err(HookError::RedirectionSetupFailed {
                step: "register_ftrace_function",
                errno,
            });
        }

        debug!(
            "{} @ {:#x} redirected to {:#x}",
            self.name, self.address, self.function
        );
        Ok(())
    }

    /// Undo [`FtraceHook::install`]. Failures are logged and returned, removal carries on
    /// regardless.
    pub fn remove<K: Kernel + ?Sized>(&mut self, kernel: &K) -> Vec<HookError> {
        let mut errors = Vec::new();

        if let Err(errno) = kernel.unregister_ftrace_function(&self.ops) {
            let err = HookError::RedirectionTeardownFailed {
                step: "unregister_ftrace_function",
                errno,
            };
            error!("{}", err);
            errors.push(err);
        }

        if let Err(errno) = kernel.ftrace_set_filter_ip(&self.ops, self.address, true, false) {
            let err = HookError::RedirectionTeardownFailed {
                step: "ftrace_set_filter_ip",
                errno,
            };
            error!("{}", err);
            errors.push(err);
        }

        self.original.store(0, Ordering::Release);
        info!("{} @ {:#x} restored", self.name, self.address);
        errors
    }
}
