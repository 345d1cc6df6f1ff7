//! Synthetic big-endian ELF32 and RPL images for loader tests

#![allow(dead_code)]

use flate2::write::ZlibEncoder;
use flate2::Compression;
use oc_loader::elf::{et, sht, Elf32Header, Elf32Phdr, Elf32Shdr, EM_PPC};
use oc_loader::ModuleSource;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SHF_WRITE: u32 = 0x1;
pub const SHF_ALLOC: u32 = 0x2;
pub const SHF_EXECINSTR: u32 = 0x4;
pub const SHF_DEFLATED: u32 = 0x0800_0000;

pub const TEXT: u32 = SHF_ALLOC | SHF_EXECINSTR;
pub const DATA: u32 = SHF_ALLOC | SHF_WRITE;

pub const RPL_BASE: u32 = 0x8010_0000;
/// Shift applied to a Cafe module loaded at `RPL_BASE`
pub const RPL_DELTA: u32 = RPL_BASE - 0x0200_0000;

/// Symbol table entry description; index 0 is always the null symbol
#[derive(Clone, Copy)]
pub struct Sym {
    pub name: &'static str,
    pub value: u32,
    pub size: u32,
    pub info: u8,
}

impl Sym {
    pub fn func(name: &'static str, value: u32, size: u32) -> Self {
        Self { name, value, size, info: 0x12 }
    }

    pub fn object(name: &'static str, value: u32, size: u32) -> Self {
        Self { name, value, size, info: 0x11 }
    }

    /// Cafe import stub, placed in the reserved range
    pub fn import(name: &'static str, value: u32) -> Self {
        Self { name, value, size: 0, info: 0x12 }
    }
}

struct Section {
    name: String,
    sh_type: u32,
    flags: u32,
    addr: u32,
    data: Vec<u8>,
    size: Option<u32>,
    link: u32,
    info: u32,
    entsize: u32,
}

pub struct ElfBuilder {
    cafe: bool,
    e_type: u16,
    entry: u32,
    segments: Vec<(Elf32Phdr, Vec<u8>)>,
    sections: Vec<Section>,
    imports: u32,
}

impl ElfBuilder {
    /// Cafe RPL linked at 0x02000000
    pub fn cafe() -> Self {
        Self {
            cafe: true,
            e_type: et::CAFE_RPL,
            entry: 0x0200_0000,
            segments: Vec::new(),
            sections: Vec::new(),
            imports: 0,
        }
    }

    /// Pre-linked standard executable
    pub fn executable() -> Self {
        Self {
            cafe: false,
            e_type: et::EXEC,
            entry: 0x8000_0000,
            segments: Vec::new(),
            sections: Vec::new(),
            imports: 0,
        }
    }

    pub fn entry(mut self, entry: u32) -> Self {
        self.entry = entry;
        self
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    pub fn segment(&mut self, vaddr: u32, data: &[u8], memsz: u32) {
        let phdr = Elf32Phdr {
            p_type: 1,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: data.len() as u32,
            p_memsz: memsz,
            p_flags: 7,
            p_align: 4,
            ..Default::default()
        };
        self.segments.push((phdr, data.to_vec()));
    }

    /// Add a section and return its index
    pub fn section(&mut self, name: &str, sh_type: u32, flags: u32, addr: u32, data: Vec<u8>) -> usize {
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            flags,
            addr,
            data,
            size: None,
            link: 0,
            info: 0,
            entsize: 0,
        });
        self.sections.len()
    }

    pub fn nobits(&mut self, name: &str, flags: u32, addr: u32, size: u32) -> usize {
        let index = self.section(name, sht::NOBITS, flags, addr, Vec::new());
        self.sections[index - 1].size = Some(size);
        index
    }

    /// Section stored as a 4-byte inflated size followed by a zlib stream
    pub fn deflated(&mut self, name: &str, sh_type: u32, flags: u32, addr: u32, data: &[u8]) -> usize {
        self.section(name, sh_type, flags | SHF_DEFLATED, addr, deflate(data))
    }

    /// Add `.strtab` and `.symtab`; returns the `.symtab` index.
    /// Symbol `i` of `syms` gets symbol index `i + 1`.
    pub fn symbols(&mut self, syms: &[Sym]) -> usize {
        let mut strings = vec![0u8];
        let mut table = vec![0u8; 16];
        for sym in syms {
            let name_offset = strings.len() as u32;
            strings.extend_from_slice(sym.name.as_bytes());
            strings.push(0);

            table.extend_from_slice(&name_offset.to_be_bytes());
            table.extend_from_slice(&sym.value.to_be_bytes());
            table.extend_from_slice(&sym.size.to_be_bytes());
            table.push(sym.info);
            table.push(0);
            table.extend_from_slice(&1u16.to_be_bytes());
        }

        let strtab = self.section(".strtab", sht::STRTAB, 0, 0, strings);
        let symtab = self.section(".symtab", sht::SYMTAB, 0, 0, table);
        self.sections[symtab - 1].link = strtab as u32;
        self.sections[symtab - 1].entsize = 16;
        symtab
    }

    /// Add a RELA section of `(offset, symbol index, type, addend)` entries
    pub fn rela(&mut self, target: usize, symtab: usize, entries: &[(u32, u32, u8, i32)]) -> usize {
        let mut data = Vec::new();
        for &(offset, symbol, rel_type, addend) in entries {
            data.extend_from_slice(&offset.to_be_bytes());
            data.extend_from_slice(&((symbol << 8) | rel_type as u32).to_be_bytes());
            data.extend_from_slice(&addend.to_be_bytes());
        }
        let index = self.section(".rela.text", sht::RELA, 0, 0, data);
        let s = &mut self.sections[index - 1];
        s.link = symtab as u32;
        s.info = target as u32;
        s.entsize = 12;
        index
    }

    /// Import table naming `<lib>.rpl` as a dependency
    pub fn import(&mut self, lib: &str) -> usize {
        let addr = 0xC000_0000 + self.imports * 0x100;
        self.imports += 1;
        self.section(
            &format!(".fimport_{}", lib),
            sht::RPL_IMPORTS,
            SHF_ALLOC,
            addr,
            vec![0; 16],
        )
    }

    pub fn build(&self) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");

        let phoff = Elf32Header::SIZE;
        let mut out = vec![0u8; phoff + self.segments.len() * Elf32Phdr::SIZE];

        let mut phdrs = Vec::new();
        for (phdr, data) in &self.segments {
            align4(&mut out);
            let mut phdr = *phdr;
            phdr.p_offset = out.len() as u32;
            out.extend_from_slice(data);
            phdrs.push(phdr);
        }

        let mut shdrs = vec![Elf32Shdr::default()];
        for (s, name) in self.sections.iter().zip(name_offsets) {
            align4(&mut out);
            let offset = out.len() as u32;
            out.extend_from_slice(&s.data);
            shdrs.push(Elf32Shdr {
                sh_name: name,
                sh_type: s.sh_type,
                sh_flags: s.flags,
                sh_addr: s.addr,
                sh_offset: offset,
                sh_size: s.size.unwrap_or(s.data.len() as u32),
                sh_link: s.link,
                sh_info: s.info,
                sh_addralign: 4,
                sh_entsize: s.entsize,
            });
        }

        align4(&mut out);
        shdrs.push(Elf32Shdr {
            sh_name: shstrtab_name,
            sh_type: sht::STRTAB,
            sh_offset: out.len() as u32,
            sh_size: shstrtab.len() as u32,
            ..Default::default()
        });
        out.extend_from_slice(&shstrtab);

        align4(&mut out);
        let shoff = out.len() as u32;
        for shdr in &shdrs {
            out.extend_from_slice(&shdr.to_bytes());
        }

        let mut e_ident = [0u8; 16];
        e_ident[..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 1, 2, 1]);
        if self.cafe {
            e_ident[7] = 0xCA;
            e_ident[8] = 0xFE;
        }
        let header = Elf32Header {
            e_ident,
            e_type: self.e_type,
            e_machine: EM_PPC,
            e_version: 1,
            e_entry: self.entry,
            e_phoff: if self.segments.is_empty() { 0 } else { phoff as u32 },
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: Elf32Header::SIZE as u16,
            e_phentsize: Elf32Phdr::SIZE as u16,
            e_phnum: self.segments.len() as u16,
            e_shentsize: Elf32Shdr::SIZE as u16,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: (shdrs.len() - 1) as u16,
        };

        out[..Elf32Header::SIZE].copy_from_slice(&header.to_bytes());
        for (i, phdr) in phdrs.iter().enumerate() {
            let start = phoff + i * Elf32Phdr::SIZE;
            out[start..start + Elf32Phdr::SIZE].copy_from_slice(&phdr.to_bytes());
        }
        out
    }
}

fn align4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend(encoder.finish().unwrap());
    out
}

/// Module files held in memory, found in any search directory
#[derive(Default)]
pub struct MemoryModules {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryModules {
    pub fn add(&mut self, name: &str, bytes: Vec<u8>) {
        self.files.insert(name.to_string(), bytes);
    }
}

impl ModuleSource for MemoryModules {
    fn read_module(&self, _dir: &Path, name: &str) -> Option<Vec<u8>> {
        self.files.get(name).cloned()
    }
}

pub fn search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/rpl")]
}
