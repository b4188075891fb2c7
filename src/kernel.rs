use crate::{caps::KernelVersion, fd::FdTable, ftrace::Tracer, symbol::SymbolTable};

/// The kernel primitives the hook is built on.
///
/// A module loader implements this on top of the real kernel (`kallsyms_lookup_name`,
/// `register_kprobe`, the `ftrace` API, `fdget`/`fdput`), tests implement it on top of a
/// simulated kernel.
pub trait Kernel: SymbolTable + Tracer + FdTable + Send + Sync {
    /// `LINUX_VERSION_CODE` of the running kernel
    fn version(&self) -> KernelVersion;

    /// whether `CONFIG_ARCH_HAS_SYSCALL_WRAPPER` is set
    fn has_syscall_wrapper(&self) -> bool;

    /// The code region of the module the hook lives in (`THIS_MODULE`).
    fn this_module(&self) -> CodeRegion;
}

/// A half-open range `[start, start + size)` of code addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeRegion {
    pub start: usize,
    pub size: usize,
}

impl CodeRegion {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    /// same test as the kernel's `within_module`
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr - self.start < self.size
    }
}
