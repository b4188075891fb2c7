//! A simulated kernel for driving the hook from user space.
//!
//! Symbols point at real functions in this binary. Those entry points run every ftrace
//! callback filtered on them before their body, the way `__fentry__` does, whoever calls
//! them: a user process through [`SimKernel::ioctl_from`] or the hook passing a call
//! through. The fd table counts every reference it hands out.
#![allow(dead_code)]

use ioctl_hook::{
    CodeRegion, Dev, Errno, FdTable, FileRef, FtraceFlags, FtraceOps, FtraceRegs, Inode,
    IoctlCall, Kallsyms, Kernel, KernelVersion, Kprobe, PtRegs, SymbolTable, Tracer,
};
use parking_lot::{const_mutex, Mutex, MutexGuard};
use std::{
    cell::Cell,
    collections::HashMap,
    ffi::{c_long, c_uint, c_ulong},
    mem::transmute,
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// a return address in user space, far from any module
pub const USER_IP: usize = 0x0000_7f3a_1c20_4410;

pub const NVIDIA_CTL: Dev = Dev::new(195, 255);
pub const NVIDIA0: Dev = Dev::new(195, 0);

fn pass_through_addr() -> usize {
    IoctlCall::<'static>::pass_through as fn(&IoctlCall<'static>) -> c_long as usize
}

/// The hook's module as the kernel sees it: a code region around the crate's pass-through.
pub fn module() -> CodeRegion {
    CodeRegion::new(pass_through_addr(), 0x100)
}

/// where a call into the entry point returns to when the hook makes it
pub fn hook_caller() -> usize {
    pass_through_addr() + 0x10
}

/// integration tests share one hook per process, so they run one at a time
pub fn serial() -> MutexGuard<'static, ()> {
    static SERIAL: Mutex<()> = const_mutex(());
    SERIAL.lock()
}

static ORIGINAL_CALLS: AtomicUsize = AtomicUsize::new(0);

pub fn original_calls() -> usize {
    ORIGINAL_CALLS.load(Ordering::SeqCst)
}

/// what the real `sys_ioctl` answers for these arguments
pub fn expected(fd: c_uint, cmd: c_uint, arg: c_ulong) -> c_long {
    if fd >= 1024 {
        return -(libc::EBADF as c_long);
    }
    (fd as c_long)
        .wrapping_mul(1_000_003)
        .wrapping_add((cmd as c_long).wrapping_mul(31))
        .wrapping_add(arg as c_long)
}

thread_local! {
    /// the kernel this thread is running a syscall in
    static CURRENT: Cell<*const SimKernel> = const { Cell::new(ptr::null()) };
    /// return address of the next call into the entry point, taken when it is entered
    static PARENT_IP: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Runs the callbacks traced on the entry point. Returns where execution continues if one
/// of them moved it.
fn fentry(regs: &mut PtRegs) -> Option<usize> {
    // nobody set a return address: the hook itself is calling
    let parent_ip = PARENT_IP.with(Cell::take).unwrap_or_else(hook_caller);
    let kernel = unsafe { CURRENT.with(Cell::get).as_ref() }?;
    kernel.trace(parent_ip, regs)
}

extern "C" fn sim_sys_ioctl_regs(regs: *const PtRegs) -> c_long {
    let mut regs = unsafe { *regs };
    match fentry(&mut regs) {
        Some(target) => unsafe { transmute::<usize, RegsEntry>(target)(&regs) },
        None => {
            ORIGINAL_CALLS.fetch_add(1, Ordering::SeqCst);
            expected(regs.di as c_uint, regs.si as c_uint, regs.dx as c_ulong)
        }
    }
}

extern "C" fn sim_sys_ioctl(fd: c_uint, cmd: c_uint, arg: c_ulong) -> c_long {
    let mut regs = syscall_regs(fd, cmd, arg);
    match fentry(&mut regs) {
        Some(target) => unsafe { transmute::<usize, DirectEntry>(target)(fd, cmd, arg) },
        None => {
            ORIGINAL_CALLS.fetch_add(1, Ordering::SeqCst);
            expected(fd, cmd, arg)
        }
    }
}

fn syscall_regs(fd: c_uint, cmd: c_uint, arg: c_ulong) -> PtRegs {
    let mut regs = PtRegs::default();
    regs.set_arg0(fd as u64);
    regs.set_arg1(cmd as u64);
    regs.set_arg2(arg as u64);
    regs
}

type RegsEntry = unsafe extern "C" fn(*const PtRegs) -> c_long;
type DirectEntry = unsafe extern "C" fn(c_uint, c_uint, c_ulong) -> c_long;

fn ops_key(ops: &FtraceOps) -> usize {
    ops as *const FtraceOps as usize
}

#[derive(Default)]
struct Faults {
    filter: Option<Errno>,
    register: Option<Errno>,
    unregister: Option<Errno>,
}

pub struct SimKernel {
    version: KernelVersion,
    syscall_wrapper: bool,
    symbols: Kallsyms,
    entry: usize,
    filters: Mutex<Vec<(usize, usize)>>,
    registered: Mutex<Vec<(usize, FtraceOps)>>,
    faults: Mutex<Faults>,
    files: Mutex<HashMap<c_uint, Option<Inode>>>,
    pub fdgets: AtomicUsize,
    pub fdputs: AtomicUsize,
    pub kprobes_registered: AtomicUsize,
    pub kprobes_unregistered: AtomicUsize,
    /// ftrace callback invocations
    pub traced: AtomicUsize,
}

impl SimKernel {
    /// A kernel exporting its ioctl implementation as `symbol`. Pass `None` for a kernel
    /// without any known ioctl symbol.
    pub fn new(version: KernelVersion, syscall_wrapper: bool, symbol: Option<&str>) -> Self {
        let entry = if syscall_wrapper {
            sim_sys_ioctl_regs as usize
        } else {
            sim_sys_ioctl as usize
        };

        let mut symbols = Kallsyms::parse(
            "ffffffff81000000 T _stext\n\
             ffffffff8134b2c0 T __x64_sys_read\n\
             0000000000000000 T __x64_sys_write\n",
        );
        if let Some(symbol) = symbol {
            symbols.insert(symbol, entry);
        }

        Self {
            version,
            syscall_wrapper,
            symbols,
            entry,
            filters: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            files: Mutex::new(HashMap::new()),
            fdgets: AtomicUsize::new(0),
            fdputs: AtomicUsize::new(0),
            kprobes_registered: AtomicUsize::new(0),
            kprobes_unregistered: AtomicUsize::new(0),
            traced: AtomicUsize::new(0),
        }
    }

    /// 5.15 on x86_64: syscall wrappers, no exported `kallsyms_lookup_name`
    pub fn modern() -> Arc<Self> {
        Arc::new(Self::new(
            KernelVersion::new(5, 15, 0),
            true,
            Some("__x64_sys_ioctl"),
        ))
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn open(&self, fd: c_uint, rdev: Dev) {
        self.files.lock().insert(fd, Some(Inode { rdev }));
    }

    /// a file without an inode
    pub fn open_anon(&self, fd: c_uint) {
        self.files.lock().insert(fd, None);
    }

    pub fn fail_filter(&self, errno: Errno) {
        self.faults.lock().filter = Some(errno);
    }

    pub fn fail_register(&self, errno: Errno) {
        self.faults.lock().register = Some(errno);
    }

    pub fn fail_unregister(&self, errno: Errno) {
        self.faults.lock().unregister = Some(errno);
    }

    pub fn filter_count(&self) -> usize {
        self.filters.lock().len()
    }

    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn registered_flags(&self) -> Vec<FtraceFlags> {
        self.registered
            .lock()
            .iter()
            .map(|(_, ops)| ops.flags())
            .collect()
    }

    /// `ioctl(fd, cmd, arg)` issued by a user process
    pub fn ioctl(&self, fd: c_uint, cmd: c_uint, arg: c_ulong) -> c_long {
        self.ioctl_from(USER_IP, fd, cmd, arg)
    }

    /// Call the ioctl entry point from `parent_ip`.
    pub fn ioctl_from(&self, parent_ip: usize, fd: c_uint, cmd: c_uint, arg: c_ulong) -> c_long {
        let outer = CURRENT.with(|current| current.replace(self as *const SimKernel));
        PARENT_IP.with(|ip| ip.set(Some(parent_ip)));
        let ret = if self.syscall_wrapper {
            sim_sys_ioctl_regs(&syscall_regs(fd, cmd, arg))
        } else {
            sim_sys_ioctl(fd, cmd, arg)
        };
        CURRENT.with(|current| current.set(outer));
        ret
    }

    /// Run every callback filtered on the entry point, as the ftrace trampoline would.
    fn trace(&self, parent_ip: usize, regs: &mut PtRegs) -> Option<usize> {
        regs.ip = self.entry as u64;
        let callbacks = {
            let filters = self.filters.lock();
            self.registered
                .lock()
                .iter()
                .filter(|(key, _)| filters.contains(&(*key, self.entry)))
                .map(|(_, ops)| ops.clone())
                .collect::<Vec<_>>()
        };
        for ops in &callbacks {
            let mut fregs = if ops.flags().contains(FtraceFlags::SAVE_REGS) {
                FtraceRegs::new(&mut *regs)
            } else {
                FtraceRegs::without_regs()
            };
            ops.call(self.entry, parent_ip, &mut fregs);
            self.traced.fetch_add(1, Ordering::SeqCst);
        }

        match regs.ip as usize {
            ip if ip == self.entry => None,
            target => Some(target),
        }
    }

    pub fn balanced_fds(&self) -> bool {
        self.fdgets.load(Ordering::SeqCst) == self.fdputs.load(Ordering::SeqCst)
    }
}

impl SymbolTable for SimKernel {
    fn kallsyms_lookup_name(&self, name: &str) -> usize {
        // no longer exported
        if self.version >= KernelVersion::new(5, 7, 0) {
            return 0;
        }
        self.symbols.kallsyms_lookup_name(name)
    }

    fn register_kprobe(&self, kp: &mut Kprobe) -> Result<(), Errno> {
        self.symbols.register_kprobe(kp)?;
        self.kprobes_registered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unregister_kprobe(&self, kp: &mut Kprobe) {
        self.symbols.unregister_kprobe(kp);
        self.kprobes_unregistered.fetch_add(1, Ordering::SeqCst);
    }
}

impl Tracer for SimKernel {
    fn ftrace_set_filter_ip(
        &self,
        ops: &FtraceOps,
        ip: usize,
        remove: bool,
        reset: bool,
    ) -> Result<(), Errno> {
        let key = ops_key(ops);
        if !remove {
            if let Some(errno) = self.faults.lock().filter {
                return Err(errno);
            }
        }

        let mut filters = self.filters.lock();
        if reset {
            filters.retain(|(k, _)| *k != key);
        }
        if remove {
            let before = filters.len();
            filters.retain(|entry| *entry != (key, ip));
            if filters.len() == before {
                return Err(Errno::EINVAL);
            }
        } else {
            filters.push((key, ip));
        }
        Ok(())
    }

    fn register_ftrace_function(&self, ops: &FtraceOps) -> Result<(), Errno> {
        if let Some(errno) = self.faults.lock().register {
            return Err(errno);
        }

        let key = ops_key(ops);
        let mut registered = self.registered.lock();
        if registered.iter().any(|(k, _)| *k == key) {
            return Err(Errno::EBUSY);
        }
        registered.push((key, ops.clone()));
        Ok(())
    }

    fn unregister_ftrace_function(&self, ops: &FtraceOps) -> Result<(), Errno> {
        let key = ops_key(ops);
        let mut registered = self.registered.lock();
        if let Some(errno) = self.faults.lock().unregister {
            return Err(errno);
        }
        let before = registered.len();
        registered.retain(|(k, _)| *k != key);
        if registered.len() == before {
            return Err(Errno::ENODEV);
        }
        Ok(())
    }
}

impl FdTable for SimKernel {
    fn fdget(&self, fd: c_uint) -> Option<FileRef> {
        let inode = *self.files.lock().get(&fd)?;
        self.fdgets.fetch_add(1, Ordering::SeqCst);
        Some(FileRef::new(fd as usize, inode))
    }

    fn fdput(&self, _file: FileRef) {
        self.fdputs.fetch_add(1, Ordering::SeqCst);
    }
}

impl Kernel for SimKernel {
    fn version(&self) -> KernelVersion {
        self.version
    }

    fn has_syscall_wrapper(&self) -> bool {
        self.syscall_wrapper
    }

    fn this_module(&self) -> CodeRegion {
        module()
    }
}
