use std::io;
use std::path::PathBuf;

use crate::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not parse ELF image = {path:?}")]
    Elf {
        path: PathBuf,
        source: goblin::error::Error,
    },

    #[error("Malformed symbol section in ELF image = {path:?}")]
    SymbolSection { path: PathBuf },

    #[error("No loadable segment in ELF image = {path:?}")]
    NoLoadSegment { path: PathBuf },

    #[error("Module = {path:?} is not mapped executable in pid = {pid}")]
    ModuleNotMapped { path: PathBuf, pid: Pid },

    #[error("Resolving an address in a shared object requires a target process")]
    PidRequired,

    #[error("Could not resolve symbol = {name} in ELF image = {path:?}")]
    SymbolNotFound { name: String, path: PathBuf },

    #[error("Probe location at {pc:#x} has {found} arguments, expected {expected}")]
    ArgumentCount {
        pc: u64,
        expected: usize,
        found: usize,
    },

    #[error("Probe has no semaphore to toggle")]
    NoSemaphore,

    #[error("Probe was not enabled for pid = {pid}")]
    NotEnabled { pid: Pid },

    #[error("Input/output error")]
    InputOutput(#[from] io::Error),
}
