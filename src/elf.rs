//! Read-only inspection of ELF images: USDT note discovery, symbol lookup,
//! load addresses.
//!
//! Every operation opens the image, answers one question, and releases it
//! before returning; no state is held across calls.

use std::fs;
use std::path::Path;

use goblin::elf::{header, program_header, section_header, Elf};
use tracing::debug;

use crate::error::{Error, Result};

/// Note type used by SystemTap SDT, from `<sys/sdt.h>`.
const NT_STAPSDT: u32 = 3;

/// Note name field, including the terminating NUL the producer emits.
const STAPSDT_NOTE_NAME: &[u8] = b"stapsdt\0";

const STAPSDT_SECTION: &str = ".note.stapsdt";

/// One `.note.stapsdt` descriptor: a probe site compiled into a binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsdtNote {
    /// Program counter of the probe site.
    pub pc: u64,

    /// Link-time address of the `.stapsdt.base` section.
    pub base_addr: u64,

    /// Virtual address of the 2-byte activation counter; zero when the
    /// probe has none.
    pub semaphore: u64,

    pub provider: String,
    pub name: String,

    /// Architecture-specific argument layout string, one token per formal
    /// parameter. See [`crate::args::ArgumentParser`].
    pub arg_fmt: String,
}

impl UsdtNote {
    /// Decode a note descriptor: a fixed header of three words (32- or
    /// 64-bit per the image's class) followed by three NUL-terminated
    /// strings. The strings must consume the descriptor exactly, or the
    /// note is discarded.
    fn parse(desc: &[u8], is_64: bool, little_endian: bool) -> Option<UsdtNote> {
        let word = if is_64 { 8 } else { 4 };

        if desc.len() < word * 3 {
            return None;
        }

        let field = |i: usize| read_word(&desc[i * word..(i + 1) * word], little_endian);

        let mut rest = &desc[word * 3..];
        let provider = take_cstr(&mut rest)?;
        let name = take_cstr(&mut rest)?;
        let arg_fmt = take_cstr(&mut rest)?;

        if !rest.is_empty() {
            return None;
        }

        Some(UsdtNote {
            pc: field(0),
            base_addr: field(1),
            semaphore: field(2),
            provider,
            name,
            arg_fmt,
        })
    }
}

/// Invoke `callback` for every well-formed USDT note in the image at
/// `path`. Notes failing any predicate (type, name, descriptor layout) are
/// skipped silently.
pub fn for_each_usdt<F>(path: &Path, mut callback: F) -> Result<()>
where
    F: FnMut(&Path, &UsdtNote),
{
    let bytes = fs::read(path)?;
    let elf = parse_elf(path, &bytes)?;

    for section in &elf.section_headers {
        if section.sh_type != section_header::SHT_NOTE {
            continue;
        }

        if elf.shdr_strtab.get_at(section.sh_name) != Some(STAPSDT_SECTION) {
            continue;
        }

        let Some(data) = section_bytes(&bytes, section.sh_offset, section.sh_size) else {
            debug!(path = %path.display(), "note section lies outside the image");
            continue;
        };

        each_note_record(data, elf.little_endian, |n_type, name, desc| {
            // The name check covers both the declared length (8) and the
            // exact bytes `"stapsdt\0"`.
            if n_type != NT_STAPSDT || name != STAPSDT_NOTE_NAME {
                return;
            }

            match UsdtNote::parse(desc, elf.is_64, elf.little_endian) {
                Some(note) => callback(path, &note),
                None => debug!(path = %path.display(), "skipping malformed stapsdt descriptor"),
            }
        });
    }

    Ok(())
}

/// Look up `name` in the image's symbol and dynamic-symbol tables,
/// returning its `st_value`. `.symtab` entries are scanned before
/// `.dynsym` entries; the first match wins, and callers must not depend on
/// any other ordering. `binding` and `kind` filter on the symbol's binding
/// and type when present.
pub fn find_symbol(
    path: &Path,
    name: &str,
    binding: Option<u8>,
    kind: Option<u8>,
) -> Result<Option<u64>> {
    let bytes = fs::read(path)?;
    let elf = parse_elf(path, &bytes)?;

    check_symbol_sections(path, &elf)?;

    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];

    for (syms, strtab) in tables {
        for sym in syms.iter() {
            if strtab.get_at(sym.st_name) != Some(name) {
                continue;
            }

            if let Some(binding) = binding {
                if sym.st_bind() != binding {
                    continue;
                }
            }

            if let Some(kind) = kind {
                if sym.st_type() != kind {
                    continue;
                }
            }

            return Ok(Some(sym.st_value));
        }
    }

    Ok(None)
}

/// Invoke `callback` with `(name, st_value, st_size, st_info)` for every
/// named entry of the image's symbol and dynamic-symbol tables.
pub fn for_each_sym<F>(path: &Path, mut callback: F) -> Result<()>
where
    F: FnMut(&str, u64, u64, u8),
{
    let bytes = fs::read(path)?;
    let elf = parse_elf(path, &bytes)?;

    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];

    for (syms, strtab) in tables {
        for sym in syms.iter() {
            let Some(name) = strtab.get_at(sym.st_name) else {
                continue;
            };

            if name.is_empty() {
                continue;
            }

            callback(name, sym.st_value, sym.st_size, sym.st_info);
        }
    }

    Ok(())
}

/// Return `p_vaddr` of the image's first loadable program header.
pub fn load_address(path: &Path) -> Result<u64> {
    let bytes = fs::read(path)?;
    let elf = parse_elf(path, &bytes)?;

    for phdr in &elf.program_headers {
        if phdr.p_type == program_header::PT_LOAD {
            return Ok(phdr.p_vaddr);
        }
    }

    Err(Error::NoLoadSegment { path: path.into() })
}

/// True iff the image is a dynamic shared object (`ET_DYN`).
pub fn is_shared_object(path: &Path) -> Result<bool> {
    let bytes = fs::read(path)?;
    let elf = parse_elf(path, &bytes)?;

    Ok(elf.header.e_type == header::ET_DYN)
}

fn parse_elf<'a>(path: &Path, bytes: &'a [u8]) -> Result<Elf<'a>> {
    Elf::parse(bytes).map_err(|source| Error::Elf { path: path.into(), source })
}

// A symbol section whose entry size does not divide its size is corrupt,
// and fatal for the whole lookup.
fn check_symbol_sections(path: &Path, elf: &Elf<'_>) -> Result<()> {
    for section in &elf.section_headers {
        if section.sh_type != section_header::SHT_SYMTAB
            && section.sh_type != section_header::SHT_DYNSYM
        {
            continue;
        }

        if section.sh_entsize == 0 || section.sh_size % section.sh_entsize != 0 {
            return Err(Error::SymbolSection { path: path.into() });
        }
    }

    Ok(())
}

fn section_bytes(bytes: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let len = usize::try_from(size).ok()?;
    let end = start.checked_add(len)?;

    bytes.get(start..end)
}

/// Walk the note records in a `SHT_NOTE` section: a 12-byte header
/// (`namesz`, `descsz`, `type`), then name and descriptor, each padded to
/// 4-byte alignment. A truncated record ends the walk.
fn each_note_record<F>(data: &[u8], little_endian: bool, mut callback: F)
where
    F: FnMut(u32, &[u8], &[u8]),
{
    let mut offset = 0usize;

    while offset + 12 <= data.len() {
        let namesz = read_u32(&data[offset..], little_endian) as usize;
        let descsz = read_u32(&data[offset + 4..], little_endian) as usize;
        let n_type = read_u32(&data[offset + 8..], little_endian);

        let name_off = offset + 12;

        let Some(desc_off) = name_off.checked_add(align4(namesz)) else {
            break;
        };

        let Some(next) = desc_off.checked_add(align4(descsz)) else {
            break;
        };

        if name_off + namesz > data.len() || desc_off + descsz > data.len() {
            debug!("truncated note record, stopping note walk");
            break;
        }

        callback(
            n_type,
            &data[name_off..name_off + namesz],
            &data[desc_off..desc_off + descsz],
        );

        offset = next;
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn read_u32(bytes: &[u8], little_endian: bool) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);

    if little_endian {
        u32::from_le_bytes(raw)
    } else {
        u32::from_be_bytes(raw)
    }
}

fn read_word(bytes: &[u8], little_endian: bool) -> u64 {
    match bytes.len() {
        4 => u64::from(read_u32(bytes, little_endian)),
        _ => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);

            if little_endian {
                u64::from_le_bytes(raw)
            } else {
                u64::from_be_bytes(raw)
            }
        }
    }
}

fn take_cstr(rest: &mut &[u8]) -> Option<String> {
    let nul = rest.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&rest[..nul]).ok()?;

    *rest = &rest[nul + 1..];

    Some(s.to_owned())
}
