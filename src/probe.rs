//! The probe model: USDT notes grouped into probes, trampoline and
//! argument-reader source emission, and activation-semaphore control.
//!
//! A [`Context`] owns the probes discovered in one binary or one live
//! process. Each [`Probe`] groups the call sites sharing a
//! `(provider, name)` identity and carries the probe's activation
//! counter, which [`Probe::enable`] and [`Probe::disable`] toggle inside
//! the target process's memory.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::args::{Argument, ArgumentParser};
use crate::elf::{self, UsdtNote};
use crate::error::{Error, Result};
use crate::proc::{self, ProcStat};
use crate::Pid;

/// One call site of a probe, with its per-site argument layout.
#[derive(Clone, Debug)]
pub struct Location {
    address: u64,
    arguments: Vec<Argument>,
}

impl Location {
    fn new(address: u64, arg_fmt: &str) -> Location {
        let mut arguments = vec![];
        let mut parser = ArgumentParser::new(arg_fmt);

        // A rejected token is dropped here; codegen later refuses the
        // location on the resulting arity mismatch instead of emitting
        // misaligned readers.
        while !parser.done() {
            if let Some(arg) = parser.parse() {
                arguments.push(arg);
            }
        }

        Location { address, arguments }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }
}

/// A USDT probe: every call site in one binary sharing a
/// `(provider, name)` identity.
pub struct Probe {
    bin_path: PathBuf,
    provider: String,
    name: String,
    semaphore: u64,
    locations: Vec<Location>,

    // One-shot memo; a failed read stays unfilled and is retried.
    in_shared_object: Cell<Option<bool>>,

    /// Resolved semaphore address per target process.
    semaphore_addrs: HashMap<Pid, u64>,

    /// Identity snapshots for the processes this tracer enabled.
    enabled: HashMap<Pid, ProcStat>,
}

impl Probe {
    pub fn new(
        bin_path: impl Into<PathBuf>,
        provider: impl Into<String>,
        name: impl Into<String>,
        semaphore: u64,
    ) -> Probe {
        Probe {
            bin_path: bin_path.into(),
            provider: provider.into(),
            name: name.into(),
            semaphore,
            locations: vec![],
            in_shared_object: Cell::new(None),
            semaphore_addrs: HashMap::new(),
            enabled: HashMap::new(),
        }
    }

    pub fn add_location(&mut self, pc: u64, arg_fmt: &str) {
        self.locations.push(Location::new(pc, arg_fmt));
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bin_path(&self) -> &Path {
        &self.bin_path
    }

    pub fn semaphore(&self) -> u64 {
        self.semaphore
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    pub fn num_arguments(&self) -> usize {
        self.locations.first().map_or(0, |loc| loc.arguments.len())
    }

    pub fn address(&self, idx: usize) -> Option<u64> {
        self.locations.get(idx).map(Location::address)
    }

    /// Whether activating this probe requires bumping a semaphore.
    pub fn need_enable(&self) -> bool {
        self.semaphore != 0
    }

    /// Whether the probe's binary is a position-independent shared
    /// object. Memoized after the first successful read.
    pub fn in_shared_object(&self) -> Result<bool> {
        if let Some(cached) = self.in_shared_object.get() {
            return Ok(cached);
        }

        let shared = elf::is_shared_object(&self.bin_path)?;
        self.in_shared_object.set(Some(shared));

        Ok(shared)
    }

    /// Translate a virtual address of the probe's binary into a run-time
    /// address. Non-shared binaries are mapped at their link address, so
    /// the value passes through; shared objects need a live process to
    /// anchor the module base.
    pub fn resolve_global_address(&self, addr: u64, pid: Option<Pid>) -> Result<u64> {
        if self.in_shared_object()? {
            let pid = pid.ok_or(Error::PidRequired)?;
            return proc::global_address_in(pid, &self.bin_path, addr);
        }

        Ok(addr)
    }

    /// Run-time address of the activation counter in `pid`, memoized per
    /// process.
    pub fn lookup_semaphore_addr(&mut self, pid: Pid) -> Result<u64> {
        if let Some(&addr) = self.semaphore_addrs.get(&pid) {
            return Ok(addr);
        }

        let addr = self.resolve_global_address(self.semaphore, Some(pid))?;
        self.semaphore_addrs.insert(pid, addr);

        Ok(addr)
    }

    // Read-modify-write of the 16-bit little-endian counter through the
    // target's memory file. The counter is unsigned; arithmetic wraps.
    fn add_to_semaphore(&mut self, pid: Pid, delta: i16) -> Result<()> {
        if self.semaphore == 0 {
            return Err(Error::NoSemaphore);
        }

        let addr = self.lookup_semaphore_addr(pid)?;

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))?;

        let mut raw = [0u8; 2];
        mem.read_exact_at(&mut raw, addr)?;

        let value = u16::from_le_bytes(raw).wrapping_add(delta as u16);
        mem.write_all_at(&value.to_le_bytes(), addr)?;

        Ok(())
    }

    /// Activate the probe in `pid` and snapshot the process identity.
    /// Enabling an already-enabled pid is a no-op.
    pub fn enable(&mut self, pid: Pid) -> Result<()> {
        if self.enabled.contains_key(&pid) {
            debug!(%pid, probe = %self.name, "probe already enabled");
            return Ok(());
        }

        self.add_to_semaphore(pid, 1)?;
        self.enabled.insert(pid, ProcStat::new(pid));

        Ok(())
    }

    /// Deactivate the probe in `pid`. The decrement is skipped when the
    /// process is gone or was replaced since enable; the snapshot is
    /// dropped either way.
    pub fn disable(&mut self, pid: Pid) -> Result<()> {
        let stat = self.enabled.remove(&pid).ok_or(Error::NotEnabled { pid })?;

        let result = if stat.is_stale() {
            debug!(%pid, probe = %self.name, "process replaced, skipping semaphore decrement");
            Ok(())
        } else {
            self.add_to_semaphore(pid, -1)
        };

        self.semaphore_addrs.remove(&pid);

        result
    }

    /// `ctype` of the widest descriptor for argument slot `n` across all
    /// locations; ties go to the first occurrence.
    pub fn largest_arg_type(&self, n: usize) -> &'static str {
        let mut largest: Option<&Argument> = None;

        for location in &self.locations {
            if let Some(candidate) = location.arguments.get(n) {
                if largest.map_or(true, |cur| candidate.arg_size().abs() > cur.arg_size().abs()) {
                    largest = Some(candidate);
                }
            }
        }

        largest.map_or("uint64_t", Argument::ctype)
    }

    // A location that dropped an argument during parsing would misalign
    // the readers; refuse to emit for it.
    fn check_arity(&self) -> Result<usize> {
        let expected = self.num_arguments();

        for location in &self.locations {
            if location.arguments.len() != expected {
                return Err(Error::ArgumentCount {
                    pc: location.address,
                    expected,
                    found: location.arguments.len(),
                });
            }
        }

        Ok(expected)
    }

    /// Emit one single-line thunk per location, forwarding into a shared
    /// handler with the location's index.
    pub fn usdt_thunks(&self, prefix: &str) -> String {
        assert!(!self.locations.is_empty());

        let mut out = String::new();

        for i in 0..self.locations.len() {
            out.push_str(&format!(
                "int {prefix}_thunk_{i}(struct pt_regs *ctx) {{ return {prefix}(ctx, {i}); }}\n"
            ));
        }

        out
    }

    /// Emit the `_bpf_readarg_<name>_<n>` reader functions. With a single
    /// location the reader is straight-line; with several, each location's
    /// assignment is guarded by a comparison of `ctx->ip` against the
    /// location's run-time address.
    pub fn usdt_getarg(&self, pid: Option<Pid>) -> Result<String> {
        let arg_count = self.check_arity()?;

        if arg_count == 0 {
            return Ok(String::new());
        }

        let mut out = String::new();
        out.push_str("#include <uapi/linux/ptrace.h>\n");

        for n in 0..arg_count {
            let ctype = self.largest_arg_type(n);

            out.push_str(&format!(
                "static inline {ctype} _bpf_readarg_{}_{}(struct pt_regs *ctx) {{\n  \
                 {ctype} result = 0x0;\n",
                self.name,
                n + 1,
            ));

            if let [location] = self.locations.as_slice() {
                out.push_str("  ");
                location.arguments[n].assign_to_local(&mut out, "result", &self.bin_path, pid)?;
                out.push('\n');
            } else {
                for location in &self.locations {
                    let global = self.resolve_global_address(location.address, pid)?;

                    out.push_str(&format!("  if (ctx->ip == {global:#x}ULL) {{ "));
                    location.arguments[n].assign_to_local(&mut out, "result", &self.bin_path, pid)?;
                    out.push_str(" }\n");
                }
            }

            out.push_str("  return result;\n}\n");
        }

        Ok(out)
    }

    /// Alternative emitter: declare one `argN` local per slot, then guard
    /// each location's assignments behind its `__loc_id`.
    pub fn usdt_cases(&self, pid: Option<Pid>) -> Result<String> {
        let arg_count = self.check_arity()?;

        let mut out = String::new();

        for n in 0..arg_count {
            out.push_str(&format!("{} arg{} = 0;\n", self.largest_arg_type(n), n + 1));
        }

        for (loc_id, location) in self.locations.iter().enumerate() {
            out.push_str(&format!("if (__loc_id == {loc_id}) {{\n"));

            for (n, arg) in location.arguments.iter().enumerate() {
                out.push_str("  ");
                arg.assign_to_local(&mut out, &format!("arg{}", n + 1), &self.bin_path, pid)?;
                out.push('\n');
            }

            out.push_str("}\n");
        }

        Ok(out)
    }
}

/// The probes discovered in one binary or one live process.
pub struct Context {
    probes: Vec<Probe>,
    pid: Option<Pid>,
    loaded: bool,
}

impl Context {
    /// Scan a binary for USDT probes. The name is resolved like a shell
    /// command name first, then as a shared-object name.
    pub fn from_binary(bin_path: &str) -> Context {
        let mut context = Context { probes: vec![], pid: None, loaded: false };

        let Some(path) = resolve_bin_path(bin_path) else {
            debug!(%bin_path, "could not resolve binary path");
            return context;
        };

        let mut probes = vec![];

        match elf::for_each_usdt(&path, |path, note| add_probe_to(&mut probes, path, note)) {
            Ok(()) => context.loaded = true,
            Err(err) => debug!(path = %path.display(), %err, "USDT scan failed"),
        }

        context.probes = probes;
        context
    }

    /// Scan every executable module mapped into a live process. Probe
    /// discovery order follows module enumeration order, then note order
    /// within each module.
    pub fn from_pid(pid: Pid) -> Context {
        let mut context = Context { probes: vec![], pid: Some(pid), loaded: false };

        let mut probes = vec![];

        let scanned = proc::for_each_module(pid, |module, _begin, _end| {
            // A module that fails to scan is skipped; the process-level
            // enumeration decides whether the context loaded.
            let result =
                elf::for_each_usdt(module, |path, note| add_probe_to(&mut probes, path, note));

            if let Err(err) = result {
                debug!(module = %module.display(), %err, "skipping unscannable module");
            }
        });

        match scanned {
            Ok(()) => context.loaded = true,
            Err(err) => debug!(%pid, %err, "module enumeration failed"),
        }

        context.probes = probes;
        context
    }

    /// Group a freshly parsed note into this context's probes.
    pub fn add_probe(&mut self, bin_path: &Path, note: &UsdtNote) {
        add_probe_to(&mut self.probes, bin_path, note);
    }

    /// Whether the construction-time scan succeeded.
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn num_probes(&self) -> usize {
        self.probes.len()
    }

    /// Find a probe by name; the first match in discovery order wins.
    pub fn get(&self, probe_name: &str) -> Option<&Probe> {
        self.probes.iter().find(|probe| probe.name == probe_name)
    }

    pub fn get_mut(&mut self, probe_name: &str) -> Option<&mut Probe> {
        self.probes.iter_mut().find(|probe| probe.name == probe_name)
    }

    /// Index of a probe by name; the first match wins.
    pub fn get_idx(&self, probe_name: &str) -> Option<usize> {
        self.probes.iter().position(|probe| probe.name == probe_name)
    }
}

// Append the note to the probe with the same `(provider, name)`, or start
// a new one. The first note's semaphore wins; later notes only contribute
// locations.
fn add_probe_to(probes: &mut Vec<Probe>, bin_path: &Path, note: &UsdtNote) {
    let found = probes
        .iter_mut()
        .find(|probe| probe.provider == note.provider && probe.name == note.name);

    match found {
        Some(probe) => probe.add_location(note.pc, &note.arg_fmt),
        None => {
            let mut probe =
                Probe::new(bin_path, note.provider.as_str(), note.name.as_str(), note.semaphore);
            probe.add_location(note.pc, &note.arg_fmt);
            probes.push(probe);
        }
    }
}

fn resolve_bin_path(name: &str) -> Option<PathBuf> {
    proc::which(name).or_else(|| proc::which_shared_object(name))
}
