//! PowerPC ELF and Cafe RPX/RPL loader for oxidized-cafe

pub mod boot;
pub mod elf;
pub mod image;
pub mod load;
pub mod reloc;
pub mod rpl;
pub mod symbols;

// Re-export main types
pub use boot::{
    is_relocatable_module, is_standard_executable, is_wii_executable, load_executable,
    load_relocatable_module, ModuleBoot,
};
pub use elf::{Elf32Header, Elf32Phdr, Elf32Rela, Elf32Shdr, Elf32Sym, SectionFlags};
pub use image::ElfImage;
pub use reloc::{Patch, RelocationKind, RelocationReport};
pub use rpl::{HostFileSystem, LoadedModule, LoaderSession, ModuleSource, PatchHook};
pub use symbols::{SymbolDatabase, SymbolDb, SymbolKind, SymbolRecord};
