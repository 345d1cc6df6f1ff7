//! Entry points for booting executables and probing their flavor

use crate::elf::Elf32Header;
use crate::image::ElfImage;
use crate::rpl::{LoaderSession, ModuleSource, PatchHook};
use crate::symbols::SymbolDatabase;
use oc_core::error::LoaderError;
use oc_memory::AddressSpace;
use std::path::PathBuf;
use tracing::{info, warn};

/// `mfspr rX, HID4`, used only by Wii software
const HID4_PATTERN: u32 = 0x7C13_FBA6;
const HID4_MASK: u32 = 0xFC1F_FFFF;

/// Result of booting a relocatable module and its dependencies
#[derive(Debug, Clone)]
pub struct ModuleBoot {
    pub entry_point: u32,
    /// Module names in load order; the root module is last
    pub modules: Vec<String>,
    /// False if any module had relocation failures
    pub relocation_clean: bool,
}

/// Load a standard, pre-linked PowerPC ELF and register its symbols.
///
/// Returns the absolute entry point.
pub fn load_executable(
    image: &mut ElfImage,
    memory: &dyn AddressSpace,
    symbols: &dyn SymbolDatabase,
    hook: &mut dyn PatchHook,
    load_base: u32,
) -> u32 {
    if image.is_cafe_module() {
        warn!("Loading a Cafe module through the standard executable path");
    }

    let entry_point = image.load_into(memory, load_base);
    let had_symbols = image.import_symbols(symbols);
    symbols.finalize();
    if had_symbols {
        hook.symbols_imported("main");
    }

    info!("Executable entry point: 0x{:08x}", entry_point);
    entry_point
}

/// Load a Cafe module by name, depth-first through its dependencies.
pub fn load_relocatable_module(
    name: &str,
    search_paths: &[PathBuf],
    load_base: u32,
    memory: &dyn AddressSpace,
    symbols: &dyn SymbolDatabase,
    source: &dyn ModuleSource,
    hook: &mut dyn PatchHook,
) -> Result<ModuleBoot, LoaderError> {
    let mut session = LoaderSession::new(
        memory,
        symbols,
        source,
        hook,
        search_paths.to_vec(),
        load_base,
    );

    let root = session
        .load_module(name)?
        .ok_or_else(|| LoaderError::DependencyNotFound(name.to_string()))?;
    let entry_point = session.modules()[root].entry_point;

    let modules = session.into_modules();
    let relocation_clean = modules.iter().all(|m| m.relocation.success());
    info!(
        "Booted {} with {} modules, entry point 0x{:08x}",
        name,
        modules.len(),
        entry_point
    );

    Ok(ModuleBoot {
        entry_point,
        modules: modules.into_iter().map(|m| m.name).collect(),
        relocation_clean,
    })
}

impl ElfImage {
    /// A Cafe RPX/RPL, or an ELF that references `.rpl` sections
    pub fn is_relocatable_module(&self) -> bool {
        self.is_cafe_module()
            || (0..self.num_sections())
                .any(|i| self.section_name(i).is_some_and(|n| n.ends_with(".rpl")))
    }

    pub fn is_standard_executable(&self) -> bool {
        !self.is_relocatable_module()
    }

    /// A standard executable whose code touches HID4, which only Wii titles do
    pub fn is_wii_executable(&self) -> bool {
        if !self.is_standard_executable() {
            return false;
        }

        (0..self.num_sections())
            .filter(|&i| self.is_code_section(i))
            .filter_map(|i| self.section_bytes(i))
            .any(|code| {
                code.chunks_exact(4)
                    .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                    .any(|word| word & HID4_MASK == HID4_PATTERN)
            })
    }
}

/// A big-endian ELF32 that is not a Cafe module
pub fn is_standard_executable(bytes: &[u8]) -> bool {
    ElfImage::parse(bytes.to_vec()).is_ok_and(|image| image.is_standard_executable())
}

/// A Cafe RPX/RPL, or an ELF that references `.rpl` sections
pub fn is_relocatable_module(bytes: &[u8]) -> bool {
    match Elf32Header::parse(bytes) {
        Ok(header) if header.is_cafe() => true,
        Ok(_) => ElfImage::parse(bytes.to_vec()).is_ok_and(|image| image.is_relocatable_module()),
        Err(_) => false,
    }
}

/// A standard executable whose code touches HID4, which only Wii titles do
pub fn is_wii_executable(bytes: &[u8]) -> bool {
    ElfImage::parse(bytes.to_vec()).is_ok_and(|image| image.is_wii_executable())
}
