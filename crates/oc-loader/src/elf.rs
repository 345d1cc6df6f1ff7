//! ELF32 big-endian structures
//!
//! Every table entry is decoded from file order into an owned value once;
//! nothing downstream touches the raw header bytes again. `to_bytes` is the
//! exact inverse of `parse` for each structure.

use bitflags::bitflags;
use oc_core::error::LoaderError;

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// `e_ident[EI_CLASS]` for 32-bit objects
pub const ELFCLASS32: u8 = 1;

/// `e_ident[EI_DATA]` for big-endian objects
pub const ELFDATA2MSB: u8 = 2;

/// `e_machine` for 32-bit PowerPC
pub const EM_PPC: u16 = 20;

/// Identification bytes marking a Cafe RPX/RPL (`e_ident[7..9]`)
pub const CAFE_MARKER: [u8; 2] = [0xCA, 0xFE];

/// Address Cafe modules are statically linked against
pub const DEFAULT_RPL_LINK_BASE: u32 = 0x0200_0000;

/// Start of the Cafe import/export linkage range
pub const RESERVED_VIRTUAL_BASE: u32 = 0xC000_0000;

/// Value substituted for imports that cannot be resolved
pub const POISON_ADDRESS: u32 = 0xDEAD_BEEF;

/// Object file types
pub mod et {
    pub const NONE: u16 = 0;
    pub const REL: u16 = 1;
    pub const EXEC: u16 = 2;
    pub const DYN: u16 = 3;
    pub const CAFE_RPL: u16 = 0xFE01;
}

/// Program header types
pub mod pt {
    pub const NULL: u32 = 0;
    pub const LOAD: u32 = 1;
}

/// Section header types
pub mod sht {
    pub const NULL: u32 = 0;
    pub const PROGBITS: u32 = 1;
    pub const SYMTAB: u32 = 2;
    pub const STRTAB: u32 = 3;
    pub const RELA: u32 = 4;
    pub const NOBITS: u32 = 8;
    pub const REL: u32 = 9;
    pub const RPL_EXPORTS: u32 = 0x8000_0001;
    pub const RPL_IMPORTS: u32 = 0x8000_0002;
}

/// Symbol types
pub const STT_NOTYPE: u8 = 0;
pub const STT_OBJECT: u8 = 1;
pub const STT_FUNC: u8 = 2;

bitflags! {
    /// Section header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SectionFlags: u32 {
        const WRITE     = 0x0000_0001;
        const ALLOC     = 0x0000_0002;
        const EXECINSTR = 0x0000_0004;
        /// Cafe: payload is a 4-byte inflated size followed by a zlib stream
        const DEFLATED  = 0x0800_0000;
    }
}

#[inline]
fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

#[inline]
fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn require(table: &'static str, data: &[u8], needed: u64) -> Result<(), LoaderError> {
    if needed > data.len() as u64 {
        return Err(LoaderError::TruncatedHeader {
            table,
            needed,
            available: data.len() as u64,
        });
    }
    Ok(())
}

/// ELF file header (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf32Header {
    pub const SIZE: usize = 52;

    /// Decode the file header. Only the identification bytes are validated
    /// here; table bounds are checked by `parse_table`.
    pub fn parse(data: &[u8]) -> Result<Self, LoaderError> {
        require("ELF header", data, Self::SIZE as u64)?;

        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[0..16]);

        if e_ident[0..4] != ELF_MAGIC {
            return Err(LoaderError::InvalidElf(format!(
                "bad magic {:02X} {:02X} {:02X} {:02X}",
                e_ident[0], e_ident[1], e_ident[2], e_ident[3]
            )));
        }
        if e_ident[4] != ELFCLASS32 {
            return Err(LoaderError::InvalidElf(format!(
                "class {} is not ELFCLASS32",
                e_ident[4]
            )));
        }
        if e_ident[5] != ELFDATA2MSB {
            return Err(LoaderError::InvalidElf(format!(
                "data encoding {} is not big-endian",
                e_ident[5]
            )));
        }

        Ok(Self {
            e_ident,
            e_type: be16(data, 16),
            e_machine: be16(data, 18),
            e_version: be32(data, 20),
            e_entry: be32(data, 24),
            e_phoff: be32(data, 28),
            e_shoff: be32(data, 32),
            e_flags: be32(data, 36),
            e_ehsize: be16(data, 40),
            e_phentsize: be16(data, 42),
            e_phnum: be16(data, 44),
            e_shentsize: be16(data, 46),
            e_shnum: be16(data, 48),
            e_shstrndx: be16(data, 50),
        })
    }

    /// Encode back into file order
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..16].copy_from_slice(&self.e_ident);
        out[16..18].copy_from_slice(&self.e_type.to_be_bytes());
        out[18..20].copy_from_slice(&self.e_machine.to_be_bytes());
        out[20..24].copy_from_slice(&self.e_version.to_be_bytes());
        out[24..28].copy_from_slice(&self.e_entry.to_be_bytes());
        out[28..32].copy_from_slice(&self.e_phoff.to_be_bytes());
        out[32..36].copy_from_slice(&self.e_shoff.to_be_bytes());
        out[36..40].copy_from_slice(&self.e_flags.to_be_bytes());
        out[40..42].copy_from_slice(&self.e_ehsize.to_be_bytes());
        out[42..44].copy_from_slice(&self.e_phentsize.to_be_bytes());
        out[44..46].copy_from_slice(&self.e_phnum.to_be_bytes());
        out[46..48].copy_from_slice(&self.e_shentsize.to_be_bytes());
        out[48..50].copy_from_slice(&self.e_shnum.to_be_bytes());
        out[50..52].copy_from_slice(&self.e_shstrndx.to_be_bytes());
        out
    }

    /// RPX/RPL images carry 0xCAFE in the OS ABI bytes
    pub fn is_cafe(&self) -> bool {
        self.e_ident[7..9] == CAFE_MARKER
    }
}

/// ELF program header (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

impl Elf32Phdr {
    pub const SIZE: usize = 32;

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            p_type: be32(buf, 0),
            p_offset: be32(buf, 4),
            p_vaddr: be32(buf, 8),
            p_paddr: be32(buf, 12),
            p_filesz: be32(buf, 16),
            p_memsz: be32(buf, 20),
            p_flags: be32(buf, 24),
            p_align: be32(buf, 28),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.p_type,
            self.p_offset,
            self.p_vaddr,
            self.p_paddr,
            self.p_filesz,
            self.p_memsz,
            self.p_flags,
            self.p_align,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        out
    }
}

/// ELF section header (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u32,
    pub sh_addr: u32,
    pub sh_offset: u32,
    pub sh_size: u32,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u32,
    pub sh_entsize: u32,
}

impl Elf32Shdr {
    pub const SIZE: usize = 40;

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            sh_name: be32(buf, 0),
            sh_type: be32(buf, 4),
            sh_flags: be32(buf, 8),
            sh_addr: be32(buf, 12),
            sh_offset: be32(buf, 16),
            sh_size: be32(buf, 20),
            sh_link: be32(buf, 24),
            sh_info: be32(buf, 28),
            sh_addralign: be32(buf, 32),
            sh_entsize: be32(buf, 36),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let fields = [
            self.sh_name,
            self.sh_type,
            self.sh_flags,
            self.sh_addr,
            self.sh_offset,
            self.sh_size,
            self.sh_link,
            self.sh_info,
            self.sh_addralign,
            self.sh_entsize,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        out
    }

    pub fn flags(&self) -> SectionFlags {
        SectionFlags::from_bits_retain(self.sh_flags)
    }
}

/// ELF symbol table entry (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Sym {
    pub st_name: u32,
    pub st_value: u32,
    pub st_size: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
}

impl Elf32Sym {
    pub const SIZE: usize = 16;

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            st_name: be32(buf, 0),
            st_value: be32(buf, 4),
            st_size: be32(buf, 8),
            st_info: buf[12],
            st_other: buf[13],
            st_shndx: be16(buf, 14),
        }
    }

    pub fn sym_type(&self) -> u8 {
        self.st_info & 0xF
    }

    pub fn binding(&self) -> u8 {
        self.st_info >> 4
    }
}

/// ELF relocation entry with addend (32-bit)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Elf32Rela {
    pub r_offset: u32,
    pub r_info: u32,
    pub r_addend: i32,
}

impl Elf32Rela {
    pub const SIZE: usize = 12;

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            r_offset: be32(buf, 0),
            r_info: be32(buf, 4),
            r_addend: be32(buf, 8) as i32,
        }
    }

    pub fn symbol_index(&self) -> usize {
        (self.r_info >> 8) as usize
    }

    pub fn rel_type(&self) -> u8 {
        (self.r_info & 0xFF) as u8
    }
}

/// Decode `count` fixed-size entries starting at `offset`.
///
/// Fails if the table, as described by the header, would run past the end
/// of `data`; callers trust the returned length from then on.
pub fn parse_table<T>(
    data: &[u8],
    table: &'static str,
    offset: u32,
    count: u16,
    entsize: u16,
    min_entsize: usize,
    parse: fn(&[u8]) -> T,
) -> Result<Vec<T>, LoaderError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if (entsize as usize) < min_entsize {
        return Err(LoaderError::InvalidElf(format!(
            "{} entry size {} is smaller than {}",
            table, entsize, min_entsize
        )));
    }

    let needed = offset as u64 + count as u64 * entsize as u64;
    require(table, data, needed)?;

    Ok((0..count as usize)
        .map(|i| {
            let start = offset as usize + i * entsize as usize;
            parse(&data[start..start + min_entsize])
        })
        .collect())
}
