//! Shared test fixtures: a builder for minimal ELF images carrying USDT
//! notes and symbol tables, written out under a tempdir.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const STB_LOCAL: u8 = 0;
pub const STB_GLOBAL: u8 = 1;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

pub fn st_info(bind: u8, kind: u8) -> u8 {
    (bind << 4) | (kind & 0xf)
}

pub struct NoteSpec {
    pub pc: u64,
    pub base_addr: u64,
    pub semaphore: u64,
    pub provider: String,
    pub name: String,
    pub arg_fmt: String,
}

pub struct SymSpec {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub info: u8,
}

/// Builder for a minimal 64-bit little-endian ELF image: one loadable
/// segment, a `.note.stapsdt` section, and a symbol table.
pub struct ElfFixture {
    pub e_type: u16,
    pub load_vaddr: u64,
    pub notes: Vec<NoteSpec>,
    pub symbols: Vec<SymSpec>,

    /// Grow `.symtab`'s size so the entry size no longer divides it.
    pub corrupt_symtab: bool,
}

impl ElfFixture {
    /// A fixed-position executable loaded at 0x400000.
    pub fn exec() -> ElfFixture {
        ElfFixture {
            e_type: ET_EXEC,
            load_vaddr: 0x400000,
            notes: vec![],
            symbols: vec![],
            corrupt_symtab: false,
        }
    }

    /// A shared object with a zero load address.
    pub fn shared() -> ElfFixture {
        ElfFixture { e_type: ET_DYN, load_vaddr: 0, ..ElfFixture::exec() }
    }

    pub fn note(
        mut self,
        provider: &str,
        name: &str,
        pc: u64,
        semaphore: u64,
        arg_fmt: &str,
    ) -> ElfFixture {
        self.notes.push(NoteSpec {
            pc,
            base_addr: 0x1000,
            semaphore,
            provider: provider.to_owned(),
            name: name.to_owned(),
            arg_fmt: arg_fmt.to_owned(),
        });
        self
    }

    pub fn symbol(mut self, name: &str, value: u64, size: u64, info: u8) -> ElfFixture {
        self.symbols.push(SymSpec { name: name.to_owned(), value, size, info });
        self
    }

    pub fn write_to(&self, dir: &Path, filename: &str) -> PathBuf {
        let path = dir.join(filename);
        fs::write(&path, self.build()).expect("write ELF fixture");
        path
    }

    pub fn build(&self) -> Vec<u8> {
        let note_data = self.build_notes();
        let (mut symtab, strtab) = self.build_symtab();

        if self.corrupt_symtab {
            symtab.push(0);
        }

        let shstrtab = b"\0.note.stapsdt\0.symtab\0.strtab\0.shstrtab\0".to_vec();

        const EHSIZE: usize = 64;
        const PHSIZE: usize = 56;
        const SHSIZE: usize = 64;

        let note_off = EHSIZE + PHSIZE;
        let symtab_off = note_off + note_data.len();
        let strtab_off = symtab_off + symtab.len();
        let shstr_off = strtab_off + strtab.len();
        let shoff = (shstr_off + shstrtab.len() + 7) & !7;

        let mut buf = vec![];

        // ELF header.
        buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.e_type.to_le_bytes());
        buf.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        buf.extend_from_slice(&(EHSIZE as u64).to_le_bytes()); // e_phoff
        buf.extend_from_slice(&(shoff as u64).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        buf.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
        buf.extend_from_slice(&(PHSIZE as u16).to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        buf.extend_from_slice(&(SHSIZE as u16).to_le_bytes());
        buf.extend_from_slice(&5u16.to_le_bytes()); // e_shnum
        buf.extend_from_slice(&4u16.to_le_bytes()); // e_shstrndx
        assert_eq!(buf.len(), EHSIZE);

        // PT_LOAD program header.
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&5u32.to_le_bytes()); // R+X
        buf.extend_from_slice(&0u64.to_le_bytes()); // p_offset
        buf.extend_from_slice(&self.load_vaddr.to_le_bytes());
        buf.extend_from_slice(&self.load_vaddr.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        buf.extend_from_slice(&0x1000u64.to_le_bytes());
        assert_eq!(buf.len(), note_off);

        buf.extend_from_slice(&note_data);
        buf.extend_from_slice(&symtab);
        buf.extend_from_slice(&strtab);
        buf.extend_from_slice(&shstrtab);
        buf.resize(shoff, 0);

        let shdr = |buf: &mut Vec<u8>,
                    name: u32,
                    sh_type: u32,
                    offset: usize,
                    size: usize,
                    link: u32,
                    entsize: u64| {
            buf.extend_from_slice(&name.to_le_bytes());
            buf.extend_from_slice(&sh_type.to_le_bytes());
            buf.extend_from_slice(&0u64.to_le_bytes()); // sh_flags
            buf.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
            buf.extend_from_slice(&(offset as u64).to_le_bytes());
            buf.extend_from_slice(&(size as u64).to_le_bytes());
            buf.extend_from_slice(&link.to_le_bytes());
            buf.extend_from_slice(&0u32.to_le_bytes()); // sh_info
            buf.extend_from_slice(&4u64.to_le_bytes()); // sh_addralign
            buf.extend_from_slice(&entsize.to_le_bytes());
        };

        // Null, .note.stapsdt, .symtab, .strtab, .shstrtab.
        buf.extend_from_slice(&[0u8; SHSIZE]);
        shdr(&mut buf, 1, 7, note_off, note_data.len(), 0, 0);
        shdr(&mut buf, 15, 2, symtab_off, symtab.len(), 3, 24);
        shdr(&mut buf, 23, 3, strtab_off, strtab.len(), 0, 0);
        shdr(&mut buf, 31, 3, shstr_off, shstrtab.len(), 0, 0);

        buf
    }

    fn build_notes(&self) -> Vec<u8> {
        let mut data = vec![];

        for note in &self.notes {
            let mut desc = vec![];
            desc.extend_from_slice(&note.pc.to_le_bytes());
            desc.extend_from_slice(&note.base_addr.to_le_bytes());
            desc.extend_from_slice(&note.semaphore.to_le_bytes());

            for s in [&note.provider, &note.name, &note.arg_fmt] {
                desc.extend_from_slice(s.as_bytes());
                desc.push(0);
            }

            data.extend_from_slice(&8u32.to_le_bytes());
            data.extend_from_slice(&(desc.len() as u32).to_le_bytes());
            data.extend_from_slice(&3u32.to_le_bytes()); // NT_STAPSDT
            data.extend_from_slice(b"stapsdt\0");
            data.extend_from_slice(&desc);
            data.resize((data.len() + 3) & !3, 0);
        }

        data
    }

    fn build_symtab(&self) -> (Vec<u8>, Vec<u8>) {
        let mut symtab = vec![0u8; 24]; // null entry
        let mut strtab = vec![0u8];

        for sym in &self.symbols {
            let name_off = strtab.len() as u32;
            strtab.extend_from_slice(sym.name.as_bytes());
            strtab.push(0);

            symtab.extend_from_slice(&name_off.to_le_bytes());
            symtab.push(sym.info);
            symtab.push(0); // st_other
            symtab.extend_from_slice(&1u16.to_le_bytes()); // st_shndx
            symtab.extend_from_slice(&sym.value.to_le_bytes());
            symtab.extend_from_slice(&sym.size.to_le_bytes());
        }

        (symtab, strtab)
    }
}
