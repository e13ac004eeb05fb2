//! Discovery, inspection, and activation of USDT probes.
//!
//! USDT probes are statically compiled tracepoints: a binary records each
//! probe site in an ELF note, together with a format string describing
//! where the probe's arguments live at that site, and an optional 16-bit
//! activation counter in its writable data. Tracers consume the notes to
//! find probe addresses, generate the code that reads arguments out of a
//! register context, and bump the counter so the traced program takes the
//! tracepoint's slow path.
//!
//! A [`Context`] scans one binary or one live process and exposes the
//! probes found there. [`Probe::usdt_thunks`] and [`Probe::usdt_getarg`]
//! emit the trampoline and argument-reader source a downstream compiler
//! consumes; [`Probe::enable`] and [`Probe::disable`] toggle a probe's
//! semaphore inside a target process. Two [`syms::SymbolCache`]
//! implementations map kernel and user-space instruction pointers back to
//! `(module, symbol, offset)` triples.

pub mod args;
pub mod elf;
pub mod error;
pub mod probe;
pub mod proc;
pub mod syms;

#[doc(inline)]
pub use args::{Argument, ArgumentParser, Operand};

#[doc(inline)]
pub use elf::UsdtNote;

#[doc(inline)]
pub use error::Error;

#[doc(inline)]
pub use probe::{Context, Location, Probe};

#[doc(inline)]
pub use proc::ProcStat;

#[doc(inline)]
pub use syms::{KernelCache, ProcessCache, SymbolCache, SymbolInfo};

pub use nix::unistd::Pid;
