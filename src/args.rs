//! Parsing of USDT argument-format strings, and per-argument reader
//! emission.
//!
//! Each probe location carries a space-separated list of tokens, one per
//! formal parameter, in the x86-64 notation: `-4@%eax`, `8@$42`,
//! `8@-16(%rbp)`, `4@(%rdi,%rcx,4)`, `8@counter(%rip)`. A token names the
//! datum's signed width and where it lives at the probe site.

use std::path::Path;

use tracing::debug;

use crate::elf;
use crate::error::{Error, Result};
use crate::proc;
use crate::Pid;

/// An x86-64 register as written in an argument token, mapped to its
/// field in the `struct pt_regs` register context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Register {
    /// Name as written in assembly operands, without the `%` sigil.
    pub name: &'static str,

    /// Field name in the register-context record.
    pub field: &'static str,
}

// 64-, 32-, 16-, and 8-bit aliases all read the same context field; the
// token's size spec governs how much of it is meaningful.
const REGISTERS: &[Register] = &[
    Register { name: "rax", field: "ax" },
    Register { name: "eax", field: "ax" },
    Register { name: "ax", field: "ax" },
    Register { name: "al", field: "ax" },
    Register { name: "ah", field: "ax" },
    Register { name: "rbx", field: "bx" },
    Register { name: "ebx", field: "bx" },
    Register { name: "bx", field: "bx" },
    Register { name: "bl", field: "bx" },
    Register { name: "bh", field: "bx" },
    Register { name: "rcx", field: "cx" },
    Register { name: "ecx", field: "cx" },
    Register { name: "cx", field: "cx" },
    Register { name: "cl", field: "cx" },
    Register { name: "ch", field: "cx" },
    Register { name: "rdx", field: "dx" },
    Register { name: "edx", field: "dx" },
    Register { name: "dx", field: "dx" },
    Register { name: "dl", field: "dx" },
    Register { name: "dh", field: "dx" },
    Register { name: "rdi", field: "di" },
    Register { name: "edi", field: "di" },
    Register { name: "di", field: "di" },
    Register { name: "dil", field: "di" },
    Register { name: "rsi", field: "si" },
    Register { name: "esi", field: "si" },
    Register { name: "si", field: "si" },
    Register { name: "sil", field: "si" },
    Register { name: "rbp", field: "bp" },
    Register { name: "ebp", field: "bp" },
    Register { name: "bp", field: "bp" },
    Register { name: "bpl", field: "bp" },
    Register { name: "rsp", field: "sp" },
    Register { name: "esp", field: "sp" },
    Register { name: "sp", field: "sp" },
    Register { name: "spl", field: "sp" },
    Register { name: "rip", field: "ip" },
    Register { name: "r8", field: "r8" },
    Register { name: "r8d", field: "r8" },
    Register { name: "r8w", field: "r8" },
    Register { name: "r8b", field: "r8" },
    Register { name: "r9", field: "r9" },
    Register { name: "r9d", field: "r9" },
    Register { name: "r9w", field: "r9" },
    Register { name: "r9b", field: "r9" },
    Register { name: "r10", field: "r10" },
    Register { name: "r10d", field: "r10" },
    Register { name: "r10w", field: "r10" },
    Register { name: "r10b", field: "r10" },
    Register { name: "r11", field: "r11" },
    Register { name: "r11d", field: "r11" },
    Register { name: "r11w", field: "r11" },
    Register { name: "r11b", field: "r11" },
    Register { name: "r12", field: "r12" },
    Register { name: "r12d", field: "r12" },
    Register { name: "r12w", field: "r12" },
    Register { name: "r12b", field: "r12" },
    Register { name: "r13", field: "r13" },
    Register { name: "r13d", field: "r13" },
    Register { name: "r13w", field: "r13" },
    Register { name: "r13b", field: "r13" },
    Register { name: "r14", field: "r14" },
    Register { name: "r14d", field: "r14" },
    Register { name: "r14w", field: "r14" },
    Register { name: "r14b", field: "r14" },
    Register { name: "r15", field: "r15" },
    Register { name: "r15d", field: "r15" },
    Register { name: "r15w", field: "r15" },
    Register { name: "r15b", field: "r15" },
];

pub fn lookup_register(name: &str) -> Option<&'static Register> {
    REGISTERS.iter().find(|reg| reg.name == name)
}

/// Where one probe argument lives at its call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A constant baked into the probe site.
    Immediate(i64),

    /// The value of one register.
    Register(&'static Register),

    /// A load from `base + index * scale + displacement`.
    Deref {
        base: &'static Register,
        displacement: i64,
        index: Option<&'static Register>,
        scale: Option<u64>,
    },

    /// A load through a global symbol, written as an ip-relative operand
    /// (`ident(%rip)`). The symbol is resolved against the probe's binary
    /// at emission time.
    GlobalDeref { ident: String, displacement: i64 },
}

/// One typed argument descriptor, parsed from a single format token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Argument {
    size: i32,
    operand: Operand,
}

impl Argument {
    /// Signed size in bytes; a negative size denotes a signed datum.
    pub fn arg_size(&self) -> i32 {
        self.size
    }

    pub fn operand(&self) -> &Operand {
        &self.operand
    }

    /// C type name for the argument, derived from the size spec.
    /// Unrecognized sizes widen to unsigned 64-bit.
    pub fn ctype(&self) -> &'static str {
        match self.size {
            -1 => "int8_t",
            1 => "uint8_t",
            -2 => "int16_t",
            2 => "uint16_t",
            -4 => "int32_t",
            4 => "uint32_t",
            -8 => "int64_t",
            8 => "uint64_t",
            _ => "uint64_t",
        }
    }

    /// Append to `out` a statement that leaves the argument's value in
    /// the local named `local`, given a `struct pt_regs *ctx` in scope.
    ///
    /// Global operands are looked up in `bin_path`'s symbol tables and,
    /// when the binary is a shared object, translated into `pid`'s
    /// address space; either step failing fails the emission.
    pub fn assign_to_local(
        &self,
        out: &mut String,
        local: &str,
        bin_path: &Path,
        pid: Option<Pid>,
    ) -> Result<()> {
        let ctype = self.ctype();

        match &self.operand {
            Operand::Immediate(value) => {
                out.push_str(&format!("{local} = {value};"));
            }

            Operand::Register(reg) => {
                out.push_str(&format!("{local} = ({ctype})ctx->{};", reg.field));
            }

            Operand::Deref { base, displacement, index, scale } => {
                let index_term = match (index, scale) {
                    (Some(index), Some(scale)) => format!("ctx->{} * {scale} + ", index.field),
                    (Some(index), None) => format!("ctx->{} + ", index.field),
                    _ => String::new(),
                };

                out.push_str(&format!(
                    "{{ u64 __addr = ctx->{} + {index_term}({displacement}); \
                     {ctype} __res = 0x0; \
                     bpf_probe_read(&__res, sizeof(__res), (void *)__addr); \
                     {local} = __res; }}",
                    base.field,
                ));
            }

            Operand::GlobalDeref { ident, displacement } => {
                let vaddr = elf::find_symbol(bin_path, ident, None, None)?.ok_or_else(|| {
                    Error::SymbolNotFound { name: ident.clone(), path: bin_path.into() }
                })?;

                let addr = if elf::is_shared_object(bin_path)? {
                    let pid = pid.ok_or(Error::PidRequired)?;
                    proc::global_address_in(pid, bin_path, vaddr)?
                } else {
                    vaddr
                };

                out.push_str(&format!(
                    "{{ u64 __addr = {addr:#x}ull + ({displacement}); \
                     {ctype} __res = 0x0; \
                     bpf_probe_read(&__res, sizeof(__res), (void *)__addr); \
                     {local} = __res; }}",
                ));
            }
        }

        Ok(())
    }
}

/// Tokenizer over one probe location's argument-format string.
pub struct ArgumentParser<'a> {
    rest: &'a str,
}

impl<'a> ArgumentParser<'a> {
    pub fn new(arg_fmt: &'a str) -> ArgumentParser<'a> {
        ArgumentParser { rest: arg_fmt }
    }

    /// True when no tokens remain.
    pub fn done(&self) -> bool {
        self.rest.trim_start().is_empty()
    }

    /// Consume one token. A malformed token is skipped up to the next
    /// whitespace boundary and yields `None`; use [`ArgumentParser::done`]
    /// to distinguish that from exhaustion.
    pub fn parse(&mut self) -> Option<Argument> {
        self.rest = self.rest.trim_start();

        if self.rest.is_empty() {
            return None;
        }

        let token = match self.rest.find(char::is_whitespace) {
            Some(end) => {
                let token = &self.rest[..end];
                self.rest = &self.rest[end..];
                token
            }
            None => {
                let token = self.rest;
                self.rest = "";
                token
            }
        };

        let arg = parse_token(token);

        if arg.is_none() {
            debug!(%token, "skipping malformed argument token");
        }

        arg
    }
}

fn parse_token(token: &str) -> Option<Argument> {
    let (size, operand) = token.split_once('@')?;
    let size = i32::try_from(parse_int(size)?).ok()?;
    let operand = parse_operand(operand)?;

    Some(Argument { size, operand })
}

fn parse_operand(text: &str) -> Option<Operand> {
    if let Some(value) = text.strip_prefix('$') {
        return Some(Operand::Immediate(parse_int(value)?));
    }

    if let Some(name) = text.strip_prefix('%') {
        return Some(Operand::Register(lookup_register(name)?));
    }

    parse_memory(text)
}

// `[disp](%base[,%index[,scale]])`, or the global form `ident[disp](%reg)`.
fn parse_memory(text: &str) -> Option<Operand> {
    let open = text.find('(')?;
    let inner = text.strip_suffix(')')?.get(open + 1..)?;
    let prefix = &text[..open];

    let mut parts = inner.split(',');
    let base = lookup_register(parts.next()?.strip_prefix('%')?)?;

    let index = match parts.next() {
        Some(part) => Some(lookup_register(part.strip_prefix('%')?)?),
        None => None,
    };

    let scale = match parts.next() {
        Some(part) => Some(parse_uint(part)?),
        None => None,
    };

    if parts.next().is_some() {
        return None;
    }

    if let Some((ident, disp)) = split_ident(prefix) {
        if index.is_some() {
            return None;
        }

        let displacement = if disp.is_empty() { 0 } else { parse_int(disp)? };

        return Some(Operand::GlobalDeref { ident: ident.to_owned(), displacement });
    }

    let displacement = if prefix.is_empty() { 0 } else { parse_int(prefix)? };

    Some(Operand::Deref { base, displacement, index, scale })
}

fn split_ident(prefix: &str) -> Option<(&str, &str)> {
    let first = prefix.chars().next()?;

    if !first.is_ascii_alphabetic() && first != '_' {
        return None;
    }

    let end = prefix
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(prefix.len());

    Some((&prefix[..end], &prefix[end..]))
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.as_bytes().first()? {
        b'-' => (true, &text[1..]),
        b'+' => (false, &text[1..]),
        _ => (false, text),
    };

    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };

    Some(if negative { -value } else { value })
}

fn parse_uint(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
