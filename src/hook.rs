//! Installing and removing the ioctl hook.
//!
//! [`IoctlHook`] is the owned handle: it is installed once and torn down exactly once,
//! when it is consumed or dropped. [`init`] and [`teardown`] keep that handle in a
//! process-wide slot for loaders that only have a load and an unload callback.
use crate::{
    call::IoctlCall,
    caps::Capabilities,
    dev::Dev,
    dispatch::{self, Binding, Dispatch},
    error::HookError,
    ftrace::FtraceHook,
    kernel::Kernel,
    symbol::SymbolResolver,
};
use parking_lot::{const_mutex, Mutex};
use std::{
    ffi::c_long,
    mem,
    sync::{atomic::AtomicUsize, Arc},
};
use tracing::{info, warn};

/// the logical name of the hooked entry point
pub const IOCTL_SYSCALL: &str = "ioctl";

/// A module's ioctl handler.
///
/// It gets the module's context, the intercepted call and the device behind the call's file
/// descriptor ([`Dev::UNKNOWN`] if there is none), and its return value is what the caller
/// of `ioctl` sees.
pub type IoctlFn<C> = fn(&C, &IoctlCall<'_>, Dev) -> c_long;

/// A module that wants to see ioctl calls.
pub struct Module<C: 'static> {
    pub name: &'static str,
    pub ioctl: Option<IoctlFn<C>>,
}

/// A live ioctl hook.
pub struct IoctlHook {
    kernel: Arc<dyn Kernel>,
    ftrace: Box<FtraceHook>,
}

impl IoctlHook {
    /// Bind `module` to `ctx` and redirect the kernel's ioctl entry point to it.
    ///
    /// Only one hook may be live in a process, installing a second one fails with
    /// [`HookError::AlreadyInstalled`].
    pub fn install<C: Send + Sync + 'static>(
        kernel: Arc<dyn Kernel>,
        module: Option<&'static Module<C>>,
        ctx: Option<Arc<C>>,
    ) -> Result<Self, HookError> {
        let binding = Binding::new(module, ctx)?;
        let name = binding.module();
        let caps = Capabilities::detect(&*kernel);
        info!(
            "{}: installing ioctl hook, kernel {} ({:?}, {:?})",
            name, caps.version, caps.lookup, caps.convention
        );

        let original = Arc::new(AtomicUsize::new(0));
        dispatch::publish(Box::new(Dispatch::new(
            kernel.clone(),
            binding,
            original.clone(),
        )))?;

        let mut ftrace = Box::new(FtraceHook::new(
            dispatch::replacement(caps.convention),
            original,
        ));
        let resolver = SymbolResolver::new(caps.lookup);
        if let Err(e) = ftrace.install(&*kernel, &resolver, IOCTL_SYSCALL, caps.ftrace_flags) {
            dispatch::retract();
            return Err(e);
        }

        info!("{}: ioctl hook installed on {}", name, ftrace.name());
        Ok(Self { kernel, ftrace })
    }

    /// the real symbol that got hooked, e.g. `__x64_sys_ioctl`
    pub fn symbol(&self) -> &str {
        self.ftrace.name()
    }

    pub fn address(&self) -> usize {
        self.ftrace.address()
    }

    /// Remove the hook. Errors are logged, the entry point is given back regardless.
    ///
    /// Blocks until calls already inside the module's handler have returned, so it must not
    /// be called from the handler itself.
    pub fn teardown(self) {
        drop(self)
    }
}

impl Drop for IoctlHook {
    fn drop(&mut self) {
        let errors = self.ftrace.remove(&*self.kernel);
        dispatch::retract();
        if errors.is_empty() {
            info!("ioctl hook removed");
        } else {
            warn!("ioctl hook removed with {} error(s)", errors.len());
        }
    }
}

enum HookState {
    Uninitialized,
    Installed(IoctlHook),
    Removed,
}

static STATE: Mutex<HookState> = const_mutex(HookState::Uninitialized);

/// Install the process-wide ioctl hook.
pub fn init<C: Send + Sync + 'static>(
    kernel: Arc<dyn Kernel>,
    module: Option<&'static Module<C>>,
    ctx: Option<Arc<C>>,
) -> Result<(), HookError> {
    let mut state = STATE.lock();
    if let HookState::Installed(_) = *state {
        return Err(HookError::AlreadyInstalled);
    }

    *state = HookState::Installed(IoctlHook::install(kernel, module, ctx)?);
    Ok(())
}

/// Remove the process-wide ioctl hook installed by [`init`].
pub fn teardown() {
    let mut state = STATE.lock();
    match mem::replace(&mut *state, HookState::Removed) {
        HookState::Installed(hook) => hook.teardown(),
        HookState::Uninitialized => {
            warn!("teardown without init");
            *state = HookState::Uninitialized;
        }
        HookState::Removed => warn!("ioctl hook already removed"),
    }
}

/// whether an ioctl hook is live, installed through [`init`] or [`IoctlHook::install`]
pub fn is_installed() -> bool {
    dispatch::is_live()
}
