//! Parsed executable image and section data access

use crate::elf::{
    parse_table, sht, Elf32Header, Elf32Phdr, Elf32Shdr, SectionFlags,
};
use flate2::read::ZlibDecoder;
use oc_core::error::LoaderError;
use once_cell::sync::OnceCell;
use std::io::Read;
use tracing::{debug, error, warn};

/// One executable file: the raw bytes plus its decoded tables.
///
/// The raw buffer is never modified. Compressed Cafe sections are inflated
/// lazily, at most once each, and kept for the lifetime of the image.
pub struct ElfImage {
    data: Vec<u8>,
    header: Elf32Header,
    segments: Vec<Elf32Phdr>,
    sections: Vec<Elf32Shdr>,
    is_cafe: bool,
    /// One slot per section index; `None` for non-Cafe images
    decompressed: Option<Vec<OnceCell<Vec<u8>>>>,
    pub(crate) section_addrs: Vec<u32>,
    pub(crate) relocate: bool,
    pub(crate) delta: u32,
    pub(crate) entry_point: u32,
    pub(crate) loaded_length: u32,
}

impl ElfImage {
    /// Parse a complete file buffer.
    ///
    /// Fails only if the header or one of its tables would read out of
    /// bounds, or if the buffer is not a big-endian ELF32 file.
    pub fn parse(data: Vec<u8>) -> Result<Self, LoaderError> {
        let header = Elf32Header::parse(&data)?;
        let is_cafe = header.is_cafe();

        debug!(
            "e_type=0x{:04x}{} e_machine=0x{:04x} e_entry=0x{:08x} e_flags=0x{:08x}",
            header.e_type,
            if is_cafe { " [Cafe RPL]" } else { "" },
            header.e_machine,
            header.e_entry,
            header.e_flags
        );
        debug!(
            "e_phoff=0x{:08x} e_phnum={} e_shoff=0x{:08x} e_shnum={} e_shstrndx={}",
            header.e_phoff, header.e_phnum, header.e_shoff, header.e_shnum, header.e_shstrndx
        );

        let segments = parse_table(
            &data,
            "program header table",
            header.e_phoff,
            header.e_phnum,
            header.e_phentsize,
            Elf32Phdr::SIZE,
            Elf32Phdr::parse,
        )?;
        let sections = parse_table(
            &data,
            "section header table",
            header.e_shoff,
            header.e_shnum,
            header.e_shentsize,
            Elf32Shdr::SIZE,
            Elf32Shdr::parse,
        )?;

        let decompressed = is_cafe.then(|| (0..sections.len()).map(|_| OnceCell::new()).collect());

        let image = Self {
            entry_point: header.e_entry,
            section_addrs: vec![0; sections.len()],
            data,
            header,
            segments,
            sections,
            is_cafe,
            decompressed,
            relocate: false,
            delta: 0,
            loaded_length: 0,
        };

        for (i, s) in image.sections.iter().enumerate() {
            debug!(
                "Section {:2} '{}': type=0x{:08x} flags=0x{:08x} addr=0x{:08x} off=0x{:08x} size=0x{:x} link={} info={}",
                i,
                image.section_name(i).unwrap_or(""),
                s.sh_type,
                s.sh_flags,
                s.sh_addr,
                s.sh_offset,
                s.sh_size,
                s.sh_link,
                s.sh_info
            );
        }

        Ok(image)
    }

    pub fn header(&self) -> &Elf32Header {
        &self.header
    }

    pub fn segments(&self) -> &[Elf32Phdr] {
        &self.segments
    }

    pub fn sections(&self) -> &[Elf32Shdr] {
        &self.sections
    }

    pub(crate) fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }

    /// True for RPX/RPL images
    pub fn is_cafe_module(&self) -> bool {
        self.is_cafe
    }

    /// Entry point; absolute once the image has been loaded
    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Whether `load_into` rebased the image
    pub fn did_relocate(&self) -> bool {
        self.relocate
    }

    /// Amount added to every link-time address by `load_into`
    pub fn load_delta(&self) -> u32 {
        self.delta
    }

    /// Bytes reserved for this image at its load base
    pub fn loaded_length(&self) -> u32 {
        self.loaded_length
    }

    /// Runtime address of a section after `load_into`
    pub fn section_address(&self, index: usize) -> Option<u32> {
        self.section_addrs.get(index).copied()
    }

    pub fn is_code_section(&self, index: usize) -> bool {
        self.sections
            .get(index)
            .is_some_and(|s| s.sh_type == sht::PROGBITS)
    }

    fn is_compressed(&self, index: usize) -> bool {
        self.is_cafe && self.sections[index].flags().contains(SectionFlags::DEFLATED)
    }

    /// Raw on-disk bytes of a section, if they lie inside the file
    fn raw_section(&self, index: usize) -> Option<&[u8]> {
        let s = &self.sections[index];
        let start = s.sh_offset as usize;
        let end = start.checked_add(s.sh_size as usize)?;
        let raw = self.data.get(start..end);
        if raw.is_none() {
            warn!(
                "Section {} data (0x{:x}+0x{:x}) lies outside the file ({} bytes)",
                index,
                s.sh_offset,
                s.sh_size,
                self.data.len()
            );
        }
        raw
    }

    /// Size of a section's contents, after inflation for compressed sections
    pub fn section_size(&self, index: usize) -> u32 {
        if index == 0 || index >= self.sections.len() {
            return 0;
        }
        if self.is_compressed(index) {
            return self
                .raw_section(index)
                .and_then(inflated_size)
                .unwrap_or(0) as u32;
        }
        self.sections[index].sh_size
    }

    /// Contents of a section.
    ///
    /// `None` for the null section, out-of-range indices, `SHT_NOBITS` and
    /// empty sections. Compressed Cafe sections are inflated on first
    /// access; later calls return the same cached buffer.
    pub fn section_bytes(&self, index: usize) -> Option<&[u8]> {
        let s = self.sections.get(index)?;
        if index == 0 || s.sh_type == sht::NOBITS || s.sh_size == 0 {
            return None;
        }

        if let (true, Some(cache)) = (self.is_compressed(index), &self.decompressed) {
            let raw = self.raw_section(index)?;
            let buf = cache[index].get_or_init(|| inflate_section(index, raw));
            return Some(buf.as_slice());
        }

        self.raw_section(index)
    }

    /// Name of a section from the section-header string table
    pub fn section_name(&self, index: usize) -> Option<&str> {
        let name_offset = self.sections.get(index)?.sh_name as usize;
        if name_offset == 0 {
            return None;
        }
        let strtab = self.section_bytes(self.header.e_shstrndx as usize)?;
        read_cstr(strtab, name_offset)
    }

    /// First section at or after `first` with the given name
    pub fn section_by_name(&self, name: &str, first: usize) -> Option<usize> {
        (first..self.sections.len()).find(|&i| self.section_name(i) == Some(name))
    }

    /// Modules this Cafe image imports from, as `<lib>.rpl`, in declaration order
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();

        for (i, s) in self.sections.iter().enumerate() {
            if s.sh_type != sht::RPL_IMPORTS {
                continue;
            }

            let lib = self
                .section_name(i)
                .and_then(|name| {
                    name.strip_prefix(".fimport_")
                        .or_else(|| name.strip_prefix(".dimport_"))
                })
                .or_else(|| self.section_bytes(i).and_then(|data| read_cstr(data, 8)));

            match lib {
                Some(lib) if !lib.is_empty() => {
                    let module = if lib.ends_with(".rpl") {
                        lib.to_string()
                    } else {
                        format!("{}.rpl", lib)
                    };
                    if !deps.contains(&module) {
                        deps.push(module);
                    }
                }
                _ => warn!("Import section {} has no library name", i),
            }
        }

        deps
    }
}

/// Read a NUL-terminated string starting at `offset`
pub(crate) fn read_cstr(table: &[u8], offset: usize) -> Option<&str> {
    let tail = table.get(offset..)?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).ok()
}

/// Upper bound on zlib expansion of a DEFLATE stream
const MAX_DEFLATE_RATIO: usize = 1032;

/// Declared inflated size of a compressed section, capped at what its
/// stream could possibly expand to
fn inflated_size(raw: &[u8]) -> Option<usize> {
    let prefix = raw.get(..4)?;
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    Some(declared.min((raw.len() - 4).saturating_mul(MAX_DEFLATE_RATIO)))
}

/// Inflate a compressed section. Failures are logged and yield a
/// zero-padded buffer of the declared size so loading can continue.
fn inflate_section(index: usize, raw: &[u8]) -> Vec<u8> {
    let Some(inflated_size) = inflated_size(raw) else {
        error!(
            "{}",
            LoaderError::DecompressionFailed {
                section: index,
                reason: "missing inflated size prefix".to_string(),
            }
        );
        return Vec::new();
    };

    let declared = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if declared > inflated_size {
        error!(
            "{}",
            LoaderError::DecompressionFailed {
                section: index,
                reason: format!(
                    "declared size 0x{:x} exceeds 0x{:x} for a 0x{:x} byte stream",
                    declared,
                    inflated_size,
                    raw.len() - 4
                ),
            }
        );
    }

    let mut out = Vec::with_capacity(inflated_size);
    let mut decoder = ZlibDecoder::new(&raw[4..]).take(inflated_size as u64);

    if let Err(e) = decoder.read_to_end(&mut out) {
        error!(
            "{}",
            LoaderError::DecompressionFailed {
                section: index,
                reason: e.to_string(),
            }
        );
    } else if out.len() != inflated_size {
        warn!(
            "Section {} inflated to 0x{:x} bytes, header declares 0x{:x}",
            index,
            out.len(),
            inflated_size
        );
    }

    out.resize(inflated_size, 0);
    debug!("Inflated section {} to 0x{:x} bytes", index, inflated_size);
    out
}
