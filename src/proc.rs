//! Process-side inspection: binary and shared-object path resolution,
//! executable mappings, kernel symbols, and process identity snapshots.

use std::env;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::elf;
use crate::error::{Error, Result};
use crate::Pid;

/// Resolve a binary name the way a shell would: names containing `/` are
/// taken as-is when they denote a regular executable file, anything else
/// is searched across the `PATH` entries in order.
pub fn which(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_exe(&path).then_some(path);
    }

    let path_var = env::var_os("PATH")?;

    for dir in env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }

        let candidate = dir.join(name);

        if is_exe(&candidate) {
            return Some(candidate);
        }
    }

    None
}

/// Resolve a bare library name (`"c"`, `"pthread"`) to a shared-object
/// path through the dynamic-linker cache. Names containing `/` are
/// returned unchanged.
pub fn which_shared_object(libname: &str) -> Option<PathBuf> {
    if libname.contains('/') {
        return Some(PathBuf::from(libname));
    }

    let soname = format!("lib{libname}.so");

    shared_libraries()?
        .iter()
        .find(|lib| lib.name.starts_with(&soname) && matches_abi(lib.flags))
        .map(|lib| lib.path.clone())
}

/// Invoke `callback` with `(path, begin, end)` for every executable,
/// file-backed mapping of the process. Synthetic mappings (`[heap]`,
/// `[vdso]`, ...) are excluded.
pub fn for_each_module<F>(pid: Pid, mut callback: F) -> Result<()>
where
    F: FnMut(&Path, u64, u64),
{
    let maps = File::open(format!("/proc/{pid}/maps"))?;

    for line in BufReader::new(maps).lines() {
        let line = line?;

        if let Some((begin, end, path)) = parse_maps_line(&line) {
            callback(Path::new(path), begin, end);
        }
    }

    Ok(())
}

/// Invoke `callback` with `(name, addr)` for every kernel symbol. The
/// first line of the symbol file is skipped; names are cut at the first
/// whitespace, dropping any module annotation.
pub fn for_each_ksym<F>(mut callback: F) -> Result<()>
where
    F: FnMut(&str, u64),
{
    let file = File::open("/proc/kallsyms")?;
    let mut lines = BufReader::new(file).lines();

    lines.next().transpose()?;

    for line in lines {
        let line = line?;
        let mut fields = line.split_whitespace();

        let (Some(addr), Some(_kind), Some(name)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };

        let Ok(addr) = u64::from_str_radix(addr, 16) else {
            continue;
        };

        callback(name, addr);
    }

    Ok(())
}

/// Resolve `(module, symname)` to `(module_path, offset)`, where `offset`
/// is relative to the module's load address. A non-zero `addr` is used as
/// the symbol value directly, skipping the lookup. Returns `None` when
/// the module cannot be located or the symbol does not resolve.
pub fn resolve_symname(module: &str, symname: &str, addr: u64) -> Option<(PathBuf, u64)> {
    let path = if module.contains('/') {
        PathBuf::from(module)
    } else {
        which_shared_object(module)?
    };

    let load_addr = match elf::load_address(&path) {
        Ok(load_addr) => load_addr,
        Err(err) => {
            debug!(%err, "could not read module load address");
            return None;
        }
    };

    let value = if addr != 0 {
        addr
    } else {
        match elf::find_symbol(&path, symname, None, None) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                debug!(%err, "symbol lookup failed");
                return None;
            }
        }
    };

    if value == 0 {
        return None;
    }

    Some((path, value - load_addr))
}

/// Translate a virtual address of `path`'s image into the address space
/// of `pid`: the first executable mapping of the module anchors the
/// image's load address.
pub fn global_address_in(pid: Pid, path: &Path, addr: u64) -> Result<u64> {
    let mut mapped_at = None;

    for_each_module(pid, |module, begin, _end| {
        if mapped_at.is_none() && module == path {
            mapped_at = Some(begin);
        }
    })?;

    let Some(mapped_at) = mapped_at else {
        return Err(Error::ModuleNotMapped { path: path.into(), pid });
    };

    let load_addr = elf::load_address(path)?;

    Ok(mapped_at.wrapping_sub(load_addr).wrapping_add(addr))
}

/// Snapshot of a process's identity, taken when a probe is enabled and
/// consulted on disable to avoid poking a reused pid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcStat {
    pid: Pid,
    start_time: Option<u64>,
}

impl ProcStat {
    pub fn new(pid: Pid) -> ProcStat {
        let start_time = match start_time(pid) {
            Ok(start_time) => Some(start_time),
            Err(err) => {
                debug!(%pid, %err, "could not snapshot process start time");
                None
            }
        };

        ProcStat { pid, start_time }
    }

    /// A snapshot is stale when the process no longer exists, or exists
    /// with a different start time than was recorded.
    pub fn is_stale(&self) -> bool {
        match start_time(self.pid) {
            Ok(now) => Some(now) != self.start_time,
            Err(_) => true,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }
}

// Field 22 of /proc/<pid>/stat. The comm field may contain spaces and
// parentheses, so fields are counted from the last ')'.
fn start_time(pid: Pid) -> Result<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat"))?;

    let after_comm = match stat.rfind(')') {
        Some(i) => &stat[i + 1..],
        None => stat.as_str(),
    };

    after_comm
        .split_whitespace()
        .nth(19)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData).into())
}

fn is_exe(path: &Path) -> bool {
    if access(path, AccessFlags::X_OK).is_err() {
        return false;
    }

    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}

fn parse_maps_line(line: &str) -> Option<(u64, u64, &str)> {
    let (range, rest) = line.split_once(' ')?;
    let (perms, rest) = rest.split_once(' ')?;
    let (_offset, rest) = rest.split_once(' ')?;
    let (_dev, rest) = rest.split_once(' ')?;
    let pathname = match rest.split_once(' ') {
        Some((_inode, pathname)) => pathname.trim_start(),
        None => "",
    };

    if !perms.contains('x') || pathname.is_empty() || pathname.starts_with('[') {
        return None;
    }

    let (begin, end) = range.split_once('-')?;
    let begin = u64::from_str_radix(begin, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    Some((begin, end, pathname))
}

const LD_SO_CACHE: &str = "/etc/ld.so.cache";

const CACHE1_MAGIC: &[u8] = b"ld.so-1.7.0";
const CACHE2_MAGIC: &[u8] = b"glibc-ld.so.cache";

// Offsets per the glibc cache layouts: the old header is the 11-byte
// magic padded to 4-byte alignment plus an entry count; the new header is
// magic + version "1.1" + entry count + string table length + 5 pad words.
const CACHE1_HEADER_SIZE: usize = 16;
const CACHE1_ENTRY_SIZE: usize = 12;
const CACHE2_HEADER_SIZE: usize = 48;
const CACHE2_ENTRY_SIZE: usize = 24;

const FLAG_TYPE_MASK: i32 = 0x00ff;
const TYPE_ELF_LIBC6: i32 = 0x0003;
const FLAG_ABI_MASK: i32 = 0xff00;

/// ABI variants whose libraries are 64-bit: SPARC, IA-64, x86-64, s390,
/// PowerPC.
const ABI_LIB64: [i32; 5] = [0x0100, 0x0200, 0x0300, 0x0400, 0x0500];

#[derive(Clone, Debug, PartialEq, Eq)]
struct SharedLibrary {
    name: String,
    path: PathBuf,
    flags: i32,
}

static SHARED_LIBRARIES: OnceLock<Option<Vec<SharedLibrary>>> = OnceLock::new();

// Process-wide parse of the dynamic-linker cache. A first failure is
// terminal: subsequent calls keep answering `None` without re-reading.
fn shared_libraries() -> Option<&'static [SharedLibrary]> {
    SHARED_LIBRARIES
        .get_or_init(|| {
            let bytes = match fs::read(LD_SO_CACHE) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(%err, "could not read the dynamic-linker cache");
                    return None;
                }
            };

            let libs = parse_ld_cache(&bytes);

            if libs.is_none() {
                debug!("unrecognized dynamic-linker cache header");
            }

            libs
        })
        .as_deref()
}

fn matches_abi(flags: i32) -> bool {
    if flags & FLAG_TYPE_MASK != TYPE_ELF_LIBC6 {
        return false;
    }

    if ABI_LIB64.contains(&(flags & FLAG_ABI_MASK)) {
        return cfg!(target_pointer_width = "64");
    }

    true
}

/// Parse either cache layout. A file that starts with the old header may
/// carry a new cache right after it at the next 8-byte boundary; when the
/// file is large enough for that, the new cache is preferred.
fn parse_ld_cache(bytes: &[u8]) -> Option<Vec<SharedLibrary>> {
    if bytes.len() >= CACHE1_HEADER_SIZE && bytes.starts_with(CACHE1_MAGIC) {
        let count = read_u32_le(bytes, 12)? as usize;
        let cache1_len = align8(CACHE1_HEADER_SIZE + count * CACHE1_ENTRY_SIZE);

        if bytes.len() > cache1_len + CACHE2_HEADER_SIZE {
            parse_cache2(bytes.get(cache1_len..)?)
        } else {
            parse_cache1(bytes, count)
        }
    } else {
        parse_cache2(bytes)
    }
}

// Old layout: entries of {flags, key, value} follow the header, and the
// string offsets are relative to the end of the entry array.
fn parse_cache1(bytes: &[u8], count: usize) -> Option<Vec<SharedLibrary>> {
    let strings_base = CACHE1_HEADER_SIZE + count * CACHE1_ENTRY_SIZE;
    let mut libs = Vec::with_capacity(count);

    for i in 0..count {
        let entry = CACHE1_HEADER_SIZE + i * CACHE1_ENTRY_SIZE;

        let Some(lib) = (|| {
            let flags = read_u32_le(bytes, entry)? as i32;
            let key = strings_base + read_u32_le(bytes, entry + 4)? as usize;
            let value = strings_base + read_u32_le(bytes, entry + 8)? as usize;

            Some(SharedLibrary {
                name: cstr_at(bytes, key)?,
                path: cstr_at(bytes, value)?.into(),
                flags,
            })
        })() else {
            debug!(index = i, "dropping malformed linker-cache entry");
            continue;
        };

        libs.push(lib);
    }

    Some(libs)
}

// New layout: entries of {flags, key, value, pad, pad}, with key and
// value absolute offsets from the start of this cache.
fn parse_cache2(bytes: &[u8]) -> Option<Vec<SharedLibrary>> {
    if !bytes.starts_with(CACHE2_MAGIC) {
        return None;
    }

    let count = read_u32_le(bytes, 20)? as usize;
    let mut libs = Vec::with_capacity(count);

    for i in 0..count {
        let entry = CACHE2_HEADER_SIZE + i * CACHE2_ENTRY_SIZE;

        let Some(lib) = (|| {
            let flags = read_u32_le(bytes, entry)? as i32;
            let key = read_u32_le(bytes, entry + 4)? as usize;
            let value = read_u32_le(bytes, entry + 8)? as usize;

            Some(SharedLibrary {
                name: cstr_at(bytes, key)?,
                path: cstr_at(bytes, value)?.into(),
                flags,
            })
        })() else {
            debug!(index = i, "dropping malformed linker-cache entry");
            continue;
        };

        libs.push(lib);
    }

    Some(libs)
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;

    Some(u32::from_le_bytes(raw))
}

fn cstr_at(bytes: &[u8], offset: usize) -> Option<String> {
    let tail = bytes.get(offset..)?;
    let nul = tail.iter().position(|&b| b == 0)?;

    Some(std::str::from_utf8(&tail[..nul]).ok()?.to_owned())
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
