//! PowerPC relocation of loaded Cafe modules

use crate::elf::{sht, Elf32Rela, POISON_ADDRESS, RESERVED_VIRTUAL_BASE};
use crate::image::ElfImage;
use crate::symbols::SymbolDatabase;
use oc_core::error::LoaderError;
use oc_memory::AddressSpace;
use tracing::{debug, error, info, trace};

/// Relocation types for 32-bit PowerPC
pub mod r_ppc {
    pub const NONE: u8 = 0;
    pub const ADDR32: u8 = 1;
    pub const ADDR16_LO: u8 = 4;
    pub const ADDR16_HI: u8 = 5;
    pub const ADDR16_HA: u8 = 6;
    pub const REL24: u8 = 10;
}

/// Supported relocation encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Addr32,
    Addr16Lo,
    Addr16Hi,
    Addr16Ha,
    Rel24,
}

/// A store computed for one relocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch {
    Word(u32),
    Half(u16),
}

impl RelocationKind {
    pub fn from_raw(rel_type: u8) -> Option<Self> {
        match rel_type {
            r_ppc::ADDR32 => Some(Self::Addr32),
            r_ppc::ADDR16_LO => Some(Self::Addr16Lo),
            r_ppc::ADDR16_HI => Some(Self::Addr16Hi),
            r_ppc::ADDR16_HA => Some(Self::Addr16Ha),
            r_ppc::REL24 => Some(Self::Rel24),
            _ => None,
        }
    }

    /// Bytes written at the target
    pub fn width(&self) -> u32 {
        match self {
            Self::Addr32 | Self::Rel24 => 4,
            Self::Addr16Lo | Self::Addr16Hi | Self::Addr16Ha => 2,
        }
    }

    /// Whether the encoding needs the instruction word currently at the target
    pub fn reads_target(&self) -> bool {
        matches!(self, Self::Rel24)
    }

    /// Encode `value` for a store at `target`. `existing` is the word at
    /// `target` and only matters for `Rel24`.
    pub fn encode(&self, value: u32, target: u32, existing: u32) -> Patch {
        match self {
            Self::Addr32 => Patch::Word(value),
            Self::Addr16Lo => Patch::Half(value as u16),
            Self::Addr16Hi => Patch::Half((value >> 16) as u16),
            // Compensates for the sign extension of the paired low half
            Self::Addr16Ha => Patch::Half(((value >> 16) + ((value >> 15) & 1)) as u16),
            Self::Rel24 => {
                let displacement = value.wrapping_sub(target) >> 2;
                Patch::Word((existing & 0xFC00_0000) | (displacement & 0x00FF_FFFF))
            }
        }
    }
}

/// Outcome of a relocation pass
#[derive(Debug, Clone, Default)]
pub struct RelocationReport {
    /// Entries written to memory
    pub applied: usize,
    /// Entries targeting the import/export range
    pub skipped: usize,
    /// Soft failures, in the order they were hit
    pub failures: Vec<LoaderError>,
}

impl RelocationReport {
    /// False when the module loaded but is not guaranteed to run correctly
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, err: LoaderError) {
        error!("{}", err);
        self.failures.push(err);
    }
}

impl ElfImage {
    /// Apply every `SHT_RELA` entry of a loaded Cafe module.
    ///
    /// Only a missing `.symtab` is an error. Unsupported entries and
    /// unresolved imports are recorded in the report and the pass carries
    /// on with the remaining entries.
    pub fn relocate<M: AddressSpace + ?Sized>(
        &self,
        memory: &M,
        symbols: &dyn SymbolDatabase,
    ) -> Result<RelocationReport, LoaderError> {
        let mut report = RelocationReport::default();

        if !self.is_cafe_module() {
            debug!("Standard ELF is prelinked, no relocation pass");
            return Ok(report);
        }

        let Some(symtab) = self.symbol_table() else {
            error!("Relocation needs a .symtab section");
            return Err(LoaderError::MissingSymbolTable);
        };
        let delta = self.load_delta();

        for (section, s) in self.sections().iter().enumerate() {
            match s.sh_type {
                sht::REL => {
                    report.fail(LoaderError::UnsupportedRelocation {
                        section,
                        reason: "SHT_REL sections are not supported".to_string(),
                    });
                    continue;
                }
                sht::RELA => {}
                _ => continue,
            }

            let Some(data) = self.section_bytes(section) else {
                continue;
            };
            debug!(
                "Relocating with section {} '{}' ({} entries)",
                section,
                self.section_name(section).unwrap_or(""),
                data.len() / Elf32Rela::SIZE
            );

            for rela in data.chunks_exact(Elf32Rela::SIZE).map(Elf32Rela::parse) {
                let Some(kind) = RelocationKind::from_raw(rela.rel_type()) else {
                    if rela.rel_type() != r_ppc::NONE {
                        report.fail(LoaderError::UnsupportedRelocation {
                            section,
                            reason: format!(
                                "relocation type {} at 0x{:08x}",
                                rela.rel_type(),
                                rela.r_offset
                            ),
                        });
                    }
                    continue;
                };

                let target = rela.r_offset.wrapping_add(delta);
                if rela.r_offset >= RESERVED_VIRTUAL_BASE
                    || target as u64 + kind.width() as u64 > RESERVED_VIRTUAL_BASE as u64
                {
                    report.skipped += 1;
                    continue;
                }

                let Some(sym) = symtab.entries.get(rela.symbol_index()) else {
                    report.fail(LoaderError::UnsupportedRelocation {
                        section,
                        reason: format!(
                            "symbol index {} out of range at 0x{:08x}",
                            rela.symbol_index(),
                            rela.r_offset
                        ),
                    });
                    continue;
                };

                let symbol_base = if sym.st_value >= RESERVED_VIRTUAL_BASE {
                    let name = symtab.name(sym).unwrap_or("");
                    match symbols.lookup(name) {
                        Some(record) => record.address,
                        None => {
                            report.fail(LoaderError::UnresolvedImport {
                                symbol: name.to_string(),
                                target,
                            });
                            POISON_ADDRESS
                        }
                    }
                } else {
                    sym.st_value.wrapping_add(delta)
                };

                let value = symbol_base.wrapping_add(rela.r_addend as u32);
                if let Err(e) = apply(memory, kind, target, value) {
                    error!("Relocation write at 0x{:08x} failed: {}", target, e);
                    continue;
                }
                trace!(
                    "{:?} at 0x{:08x} <- 0x{:08x} (addend {})",
                    kind,
                    target,
                    value,
                    rela.r_addend
                );
                report.applied += 1;
            }
        }

        info!(
            "Relocation done: {} applied, {} skipped, {} failures",
            report.applied,
            report.skipped,
            report.failures.len()
        );
        Ok(report)
    }
}

fn apply<M: AddressSpace + ?Sized>(
    memory: &M,
    kind: RelocationKind,
    target: u32,
    value: u32,
) -> Result<(), oc_core::error::MemoryError> {
    let existing = if kind.reads_target() {
        memory.read_be32(target)?
    } else {
        0
    };

    match kind.encode(value, target, existing) {
        Patch::Word(word) => memory.write_be32(target, word),
        Patch::Half(half) => memory.write_be16(target, half),
    }
}
