//! Runtime resolution of kernel symbol addresses.
//!
//! The ioctl entry point is exported under different names depending on the architecture
//! and on how the kernel wraps syscalls, so the resolver walks a list of prefixes until one
//! of them names a real symbol.
use crate::{caps::LookupStrategy, error::HookError, Errno};
use anyhow::{Context, Result};
use std::{collections::HashMap, fs::read_to_string, path::Path};
use tracing::{debug, error, info};

/// Real symbol prefixes, most specific first.
pub const SYSCALL_PREFIXES: &[&str] = &[
    // x86_64 syscall wrappers, 4.17+
    "__x64_sys_",
    // ia32 compat wrappers
    "__ia32_sys_",
    "__se_sys_",
    "__do_sys_",
    // no syscall wrappers
    "sys_",
];

/// The symbol lookup primitives a kernel offers.
pub trait SymbolTable {
    /// `kallsyms_lookup_name`, returns 0 if the symbol is unknown
    fn kallsyms_lookup_name(&self, name: &str) -> usize;

    /// `register_kprobe`, on success the probe's address is filled in
    fn register_kprobe(&self, kp: &mut Kprobe) -> Result<(), Errno>;

    fn unregister_kprobe(&self, kp: &mut Kprobe);
}

/// A kprobe that is only ever registered to learn the address of its symbol.
#[derive(Debug)]
pub struct Kprobe {
    symbol_name: String,
    addr: usize,
}

impl Kprobe {
    pub fn new(symbol_name: &str) -> Self {
        Self {
            symbol_name: symbol_name.to_owned(),
            addr: 0,
        }
    }

    pub fn symbol_name(&self) -> &str {
        &self.symbol_name
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// called by the kernel side of `register_kprobe`
    pub fn set_addr(&mut self, addr: usize) {
        self.addr = addr;
    }
}

/// look up a single symbol name, 0 if it does not exist
pub fn lookup_name<S: SymbolTable + ?Sized>(
    symbols: &S,
    strategy: LookupStrategy,
    name: &str,
) -> usize {
    match strategy {
        LookupStrategy::Kallsyms => symbols.kallsyms_lookup_name(name),
        LookupStrategy::Kprobe => {
            let mut kp = Kprobe::new(name);
            if symbols.register_kprobe(&mut kp).is_err() {
                return 0;
            }
            let addr = kp.addr();
            symbols.unregister_kprobe(&mut kp);
            addr
        }
    }
}

/// A symbol name together with the address it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub address: usize,
}

/// Resolves a logical syscall name (`ioctl`) to the address of its implementation.
#[derive(Debug, Clone)]
pub struct SymbolResolver {
    strategy: LookupStrategy,
    prefixes: &'static [&'static str],
}

impl SymbolResolver {
    pub fn new(strategy: LookupStrategy) -> Self {
        Self {
            strategy,
            prefixes: SYSCALL_PREFIXES,
        }
    }

    pub fn resolve<S: SymbolTable + ?Sized>(
        &self,
        symbols: &S,
        base: &str,
    ) -> Result<Resolved, HookError> {
        let mut tried = Vec::with_capacity(self.prefixes.len());
        for prefix in self.prefixes {
            let name = format!("{}{}", prefix, base);
            let address = lookup_name(symbols, self.strategy, &name);
            debug!("lookup {} -> {:#x}", name, address);
            if address != 0 {
                info!("found syscall: {} @ {:#x}", name, address);
                return Ok(Resolved { name, address });
            }
            tried.push(name);
        }

        error!("could not resolve any variant of {}: {:?}", base, tried);
        Err(HookError::SymbolNotFound {
            base: base.to_owned(),
            tried,
        })
    }
}

/// A symbol table in `/proc/kallsyms` format.
///
/// Lines look like `ffffffff8123a0b0 T __x64_sys_ioctl`, optionally followed by the
/// `[module]` a symbol belongs to. Readers without `CAP_SYSLOG` see every address as 0,
/// such symbols are kept but never resolve.
#[derive(Debug, Clone, Default)]
pub struct Kallsyms {
    symbols: HashMap<String, usize>,
}

impl Kallsyms {
    pub fn parse(text: &str) -> Self {
        let mut kallsyms = Self::default();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr), Some(_kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(addr) = usize::from_str_radix(addr, 16) else {
                continue;
            };
            // first definition wins, like kallsyms_lookup_name
            kallsyms.symbols.entry(name.to_owned()).or_insert(addr);
        }

        kallsyms
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = read_to_string(path)
            .with_context(|| format!("read symbol table {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Define `name`, replacing any earlier definition. Unlike a parsed table, where the
    /// first definition wins, this is how a caller overrides an entry.
    pub fn insert(&mut self, name: &str, addr: usize) {
        self.symbols.insert(name.to_owned(), addr);
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied().filter(|addr| *addr != 0)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolTable for Kallsyms {
    fn kallsyms_lookup_name(&self, name: &str) -> usize {
        self.get(name).unwrap_or_default()
    }

    fn register_kprobe(&self, kp: &mut Kprobe) -> Result<(), Errno> {
        let addr = self.get(kp.symbol_name()).ok_or(Errno::ENOENT)?;
        kp.set_addr(addr);
        Ok(())
    }

    fn unregister_kprobe(&self, _kp: &mut Kprobe) {}
}
