//! The replacement entry points and the state they dispatch through.
//!
//! Only one hook can be live, so the binding is published through a single atomic
//! pointer. Intercepted calls only ever load it; install and teardown swap it. Every call
//! holds an `InFlight` guard while it uses the binding, and teardown waits for all of
//! them to return before freeing it.
use crate::{
    call::{IoctlArgs, IoctlCall},
    caps::CallingConvention,
    dev::Dev,
    error::HookError,
    fd,
    ftrace::OriginalSlot,
    hook::Module,
    kernel::Kernel,
    regs::PtRegs,
};
use std::{
    ffi::{c_long, c_uint, c_ulong},
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, info};

type Handler = Box<dyn Fn(&IoctlCall<'_>, Dev) -> c_long + Send + Sync>;

/// A module's ioctl handler bound to the context it is called with.
pub(crate) struct Binding {
    module: &'static str,
    handler: Handler,
}

impl Binding {
    pub(crate) fn new<C: Send + Sync + 'static>(
        module: Option<&'static Module<C>>,
        ctx: Option<Arc<C>>,
    ) -> Result<Self, HookError> {
        let module = module.ok_or(HookError::InvalidArgument("module"))?;
        let ioctl = module.ioctl.ok_or(HookError::InvalidArgument("module ioctl handler"))?;
        let ctx = ctx.ok_or(HookError::InvalidArgument("module context"))?;

        Ok(Self {
            module: module.name,
            handler: Box::new(move |call, dev| ioctl(&*ctx, call, dev)),
        })
    }

    pub(crate) fn module(&self) -> &'static str {
        self.module
    }
}

pub(crate) struct Dispatch {
    kernel: Arc<dyn Kernel>,
    binding: Binding,
    original: OriginalSlot,
}

impl Dispatch {
    pub(crate) fn new(kernel: Arc<dyn Kernel>, binding: Binding, original: OriginalSlot) -> Self {
        Self {
            kernel,
            binding,
            original,
        }
    }

    fn original(&self) -> Option<usize> {
        match self.original.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    fn dispatch(&self, call: &IoctlCall<'_>) -> c_long {
        let dev = fd::rdev(&*self.kernel, call.fd);
        debug!(
            "{}: ioctl fd = {}, cmd = {:#x}, arg = {:#x}, dev = {}",
            self.binding.module, call.fd, call.cmd, call.arg, dev
        );
        (self.binding.handler)(call, dev)
    }
}

static ACTIVE: AtomicPtr<Dispatch> = AtomicPtr::new(ptr::null_mut());

/// calls that may still hold a reference to the published dispatch
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Marks one intercepted call as running until dropped.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Make `dispatch` the target of intercepted calls. Fails if another one is live.
pub(crate) fn publish(dispatch: Box<Dispatch>) -> Result<(), HookError> {
    let raw = Box::into_raw(dispatch);
    ACTIVE
        .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| {
            drop(unsafe { Box::from_raw(raw) });
            HookError::AlreadyInstalled
        })
}

/// Drop the live dispatch once no call is using it any more.
///
/// The redirection must already be unregistered, and this must not be called from a
/// module's handler: it would wait for itself.
pub(crate) fn retract() {
    let raw = ACTIVE.swap(ptr::null_mut(), Ordering::SeqCst);
    if raw.is_null() {
        return;
    }

    if IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        info!("waiting for in-flight ioctl calls to return");
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
    }
    drop(unsafe { Box::from_raw(raw) });
}

pub(crate) fn is_live() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

/// The live dispatch and the original entry point, valid as long as the guard is held.
fn active() -> Option<(InFlight, &'static Dispatch, usize)> {
    // entering before the load: once retract() has swapped the pointer out, a call either
    // sees null here or is already counted
    let guard = InFlight::enter();
    let dispatch = unsafe { ACTIVE.load(Ordering::SeqCst).as_ref() }?;
    let original = dispatch.original()?;
    Some((guard, dispatch, original))
}

const REFUSED: c_long = -(libc::ENOSYS as c_long);

/// replacement for `asmlinkage long sys_ioctl(const struct pt_regs *regs)`
extern "C" fn hooked_ioctl_regs(regs: *const PtRegs) -> c_long {
    let (Some((_in_flight, dispatch, original)), Some(regs)) =
        (active(), unsafe { regs.as_ref() })
    else {
        return REFUSED;
    };

    let call = unsafe { IoctlCall::with_regs(original, regs) };
    dispatch.dispatch(&call)
}

/// replacement for
/// `asmlinkage long sys_ioctl(unsigned int fd, unsigned int cmd, unsigned long arg)`
extern "C" fn hooked_ioctl(fd: c_uint, cmd: c_uint, arg: c_ulong) -> c_long {
    let Some((_in_flight, dispatch, original)) = active() else {
        return REFUSED;
    };

    let call = unsafe { IoctlCall::direct(original, IoctlArgs::new(fd, cmd, arg)) };
    dispatch.dispatch(&call)
}

/// the address ftrace should send intercepted calls to
pub(crate) fn replacement(convention: CallingConvention) -> usize {
    match convention {
        CallingConvention::PtRegs => hooked_ioctl_regs as usize,
        CallingConvention::Direct => hooked_ioctl as usize,
    }
}
