//! Kernel and per-process symbol caches: resolve an instruction pointer
//! to a `(module, symbol, offset)` triple.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::elf;
use crate::proc;
use crate::Pid;

const KERNEL_MODULE: &str = "[kernel]";

/// A resolved address: the module it falls in, the enclosing symbol when
/// one exists, and the remaining offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub module: String,
    pub name: Option<String>,
    pub offset: u64,
}

/// Contract shared by the kernel and per-process caches.
pub trait SymbolCache {
    /// Rebuild or complete the cache from its backing source.
    fn refresh(&mut self);

    /// Resolve an address within the cache's scope.
    fn resolve_addr(&mut self, addr: u64) -> Option<SymbolInfo>;
}

/// Select the cache for a scope: a process cache for `Some(pid)`, the
/// kernel cache otherwise.
pub fn resolver(pid: Option<Pid>) -> Box<dyn SymbolCache> {
    match pid {
        Some(pid) => Box::new(ProcessCache::new(pid)),
        None => Box::new(KernelCache::new()),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KernelSymbol {
    addr: u64,
    name: String,
}

/// Kernel symbol table, built lazily from the running kernel and kept
/// sorted by address for predecessor lookup.
#[derive(Default)]
pub struct KernelCache {
    syms: Vec<KernelSymbol>,
    built: bool,
}

impl KernelCache {
    pub fn new() -> KernelCache {
        KernelCache::default()
    }

    /// Build a cache from a pre-captured symbol table instead of the
    /// running kernel.
    pub fn from_symbols<I>(symbols: I) -> KernelCache
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut syms: Vec<_> = symbols
            .into_iter()
            .map(|(name, addr)| KernelSymbol { addr, name })
            .collect();

        syms.sort_by_key(|sym| sym.addr);

        KernelCache { syms, built: true }
    }

    // A failed fill leaves the table empty and re-attemptable.
    fn ensure_built(&mut self) {
        if self.built {
            return;
        }

        let mut syms = vec![];

        let loaded = proc::for_each_ksym(|name, addr| {
            syms.push(KernelSymbol { addr, name: name.to_owned() });
        });

        match loaded {
            Ok(()) => {
                syms.sort_by_key(|sym| sym.addr);
                self.syms = syms;
                self.built = true;
            }
            Err(err) => debug!(%err, "could not enumerate kernel symbols"),
        }
    }
}

impl SymbolCache for KernelCache {
    fn refresh(&mut self) {
        self.ensure_built();
    }

    fn resolve_addr(&mut self, addr: u64) -> Option<SymbolInfo> {
        self.ensure_built();

        if self.syms.is_empty() {
            return None;
        }

        // Immediate predecessor: the last symbol at or below the query.
        let idx = self.syms.partition_point(|sym| sym.addr <= addr);
        let sym = &self.syms[idx.checked_sub(1)?];

        Some(SymbolInfo {
            module: KERNEL_MODULE.to_owned(),
            name: Some(sym.name.clone()),
            offset: addr - sym.addr,
        })
    }
}

#[derive(Clone, Debug)]
struct ModuleSymbol {
    name: String,
    start: u64,
    size: u64,
    #[allow(dead_code)]
    flags: u8,
}

// One executable mapping of the process, with its symbol table loaded on
// first lookup against it.
struct Module {
    path: PathBuf,
    start: u64,
    end: u64,
    shared_object: bool,
    syms: Option<Vec<ModuleSymbol>>,
}

impl Module {
    fn new(path: &Path, start: u64, end: u64) -> Module {
        Module {
            path: path.to_owned(),
            start,
            end,
            shared_object: false,
            syms: None,
        }
    }

    // Lazy one-shot fill; a failed load stays unfilled and is retried on
    // the next query.
    fn load_sym_table(&mut self) {
        if self.syms.is_some() {
            return;
        }

        self.shared_object = match elf::is_shared_object(&self.path) {
            Ok(shared) => shared,
            Err(_) => self.path.to_string_lossy().contains(".so"),
        };

        let mut syms = vec![];

        let loaded = elf::for_each_sym(&self.path, |name, start, size, flags| {
            syms.push(ModuleSymbol { name: name.to_owned(), start, size, flags });
        });

        match loaded {
            Ok(()) => self.syms = Some(syms),
            Err(err) => {
                debug!(path = %self.path.display(), %err, "could not load module symbols");
            }
        }
    }

    fn resolve(&mut self, addr: u64) -> SymbolInfo {
        self.load_sym_table();

        // Shared objects are mapped at an arbitrary base; queries against
        // them are module-relative.
        let offset = if self.shared_object { addr - self.start } else { addr };
        let module = self.path.display().to_string();

        if let Some(syms) = &self.syms {
            for sym in syms {
                if offset >= sym.start && offset <= sym.start + sym.size {
                    return SymbolInfo {
                        module,
                        name: Some(sym.name.clone()),
                        offset: offset - sym.start,
                    };
                }
            }
        }

        // No enclosing symbol: module-relative resolution still counts.
        SymbolInfo { module, name: None, offset }
    }
}

/// Symbol cache over one process's executable mappings, with per-module
/// symbol tables loaded on demand.
pub struct ProcessCache {
    pid: Pid,
    modules: Vec<Module>,
}

impl ProcessCache {
    /// The module list is built at construction; [`SymbolCache::refresh`]
    /// rebuilds it.
    pub fn new(pid: Pid) -> ProcessCache {
        let mut cache = ProcessCache { pid, modules: vec![] };
        cache.refresh();
        cache
    }
}

impl SymbolCache for ProcessCache {
    fn refresh(&mut self) {
        self.modules.clear();

        let mut modules = vec![];

        let listed = proc::for_each_module(self.pid, |path, start, end| {
            modules.push(Module::new(path, start, end));
        });

        match listed {
            Ok(()) => self.modules = modules,
            Err(err) => debug!(pid = %self.pid, %err, "could not enumerate process modules"),
        }
    }

    fn resolve_addr(&mut self, addr: u64) -> Option<SymbolInfo> {
        let module = self
            .modules
            .iter_mut()
            .find(|module| addr >= module.start && addr <= module.end)?;

        Some(module.resolve(addr))
    }
}
