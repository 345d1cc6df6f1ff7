//! Game loader for booting executables from the host filesystem
//!
//! `GameLoader` reads a file, decides whether it is a standard PowerPC ELF
//! or a Cafe RPX/RPL, and places it (plus any RPL dependencies) into the
//! shared address space.

use oc_core::config::LoaderConfig;
use oc_core::error::{EmulatorError, LoaderError};
use oc_core::Result;
use oc_loader::{
    load_executable, load_relocatable_module, ElfImage, HostFileSystem, PatchHook, SymbolDb,
};
use oc_memory::MemoryManager;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Loaded game information
#[derive(Debug, Clone)]
pub struct LoadedGame {
    /// Absolute entry point
    pub entry_point: u32,
    /// Initial stack pointer; only Cafe boots set one up
    pub stack_pointer: Option<u32>,
    /// Modules in load order, root last. Empty for standard executables.
    pub modules: Vec<String>,
    /// False if any module had relocation failures
    pub relocation_clean: bool,
    /// Path the game was booted from
    pub path: PathBuf,
    /// Whether the executable touches Wii-only hardware registers
    pub is_wii: bool,
}

/// Game loader for standard ELF and Cafe executables
pub struct GameLoader {
    config: LoaderConfig,
    memory: Arc<MemoryManager>,
    symbols: Arc<SymbolDb>,
}

impl GameLoader {
    /// Create a new game loader
    pub fn new(config: LoaderConfig, memory: Arc<MemoryManager>, symbols: Arc<SymbolDb>) -> Self {
        Self {
            config,
            memory,
            symbols,
        }
    }

    /// Boot a file
    pub fn boot<P: AsRef<Path>>(&self, path: P) -> Result<LoadedGame> {
        self.boot_with_hook(path, &mut |_: &str| {})
    }

    /// Boot a file, reporting every module that registered symbols to `hook`
    pub fn boot_with_hook<P: AsRef<Path>>(
        &self,
        path: P,
        hook: &mut dyn PatchHook,
    ) -> Result<LoadedGame> {
        let path = path.as_ref();
        info!("Loading game: {}", path.display());

        let image = ElfImage::parse(std::fs::read(path)?)?;

        if image.is_relocatable_module() {
            self.boot_module(path, hook)
        } else {
            self.boot_executable(path, image, hook)
        }
    }

    fn boot_executable(
        &self,
        path: &Path,
        mut image: ElfImage,
        hook: &mut dyn PatchHook,
    ) -> Result<LoadedGame> {
        let is_wii = image.is_wii_executable();
        info!(
            "Standard executable ({}), base 0x{:08x}",
            if is_wii { "Wii" } else { "GameCube" },
            self.config.elf_load_base
        );

        let entry_point = load_executable(
            &mut image,
            &*self.memory,
            &*self.symbols,
            hook,
            self.config.elf_load_base,
        );

        Ok(LoadedGame {
            entry_point,
            stack_pointer: None,
            modules: Vec::new(),
            relocation_clean: true,
            path: path.to_path_buf(),
            is_wii,
        })
    }

    fn boot_module(&self, path: &Path, hook: &mut dyn PatchHook) -> Result<LoadedGame> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                EmulatorError::Loader(LoaderError::InvalidElf(format!(
                    "{} has no file name",
                    path.display()
                )))
            })?;

        let boot = load_relocatable_module(
            &name,
            &self.search_paths(path),
            self.config.rpl_load_base,
            &*self.memory,
            &*self.symbols,
            &HostFileSystem,
            hook,
        )?;

        Ok(LoadedGame {
            entry_point: boot.entry_point,
            stack_pointer: Some(self.config.stack_top),
            modules: boot.modules,
            relocation_clean: boot.relocation_clean,
            path: path.to_path_buf(),
            is_wii: false,
        })
    }

    /// The executable's own directory, then the configured library paths
    fn search_paths(&self, path: &Path) -> Vec<PathBuf> {
        let own_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        std::iter::once(own_dir)
            .chain(self.config.library_paths.iter().cloned())
            .collect()
    }

    /// Get the memory manager
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Get the symbol database
    pub fn symbols(&self) -> &Arc<SymbolDb> {
        &self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oc_loader::elf::{et, sht, Elf32Header, Elf32Shdr, EM_PPC};
    use oc_loader::SymbolDatabase;
    use oc_memory::AddressSpace;

    struct Section {
        name: &'static str,
        sh_type: u32,
        flags: u32,
        addr: u32,
        link: u32,
        data: Vec<u8>,
    }

    /// Minimal big-endian image: header, section payloads, `.shstrtab`,
    /// then the section header table.
    fn build_image(cafe: bool, entry: u32, sections: &[Section]) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut out = vec![0u8; Elf32Header::SIZE];
        let mut shdrs = vec![Elf32Shdr::default()];

        for s in sections {
            let sh_name = shstrtab.len() as u32;
            shstrtab.extend_from_slice(s.name.as_bytes());
            shstrtab.push(0);
            shdrs.push(Elf32Shdr {
                sh_name,
                sh_type: s.sh_type,
                sh_flags: s.flags,
                sh_addr: s.addr,
                sh_offset: out.len() as u32,
                sh_size: s.data.len() as u32,
                sh_link: s.link,
                ..Default::default()
            });
            out.extend_from_slice(&s.data);
        }

        let sh_name = shstrtab.len() as u32;
        shstrtab.extend_from_slice(b".shstrtab\0");
        shdrs.push(Elf32Shdr {
            sh_name,
            sh_type: sht::STRTAB,
            sh_offset: out.len() as u32,
            sh_size: shstrtab.len() as u32,
            ..Default::default()
        });
        out.extend_from_slice(&shstrtab);

        let shoff = out.len() as u32;
        for shdr in &shdrs {
            out.extend_from_slice(&shdr.to_bytes());
        }

        let mut e_ident = [0u8; 16];
        e_ident[..7].copy_from_slice(&[0x7F, b'E', b'L', b'F', 1, 2, 1]);
        if cafe {
            e_ident[7] = 0xCA;
            e_ident[8] = 0xFE;
        }
        let header = Elf32Header {
            e_ident,
            e_type: if cafe { et::CAFE_RPL } else { et::EXEC },
            e_machine: EM_PPC,
            e_version: 1,
            e_entry: entry,
            e_shoff: shoff,
            e_ehsize: Elf32Header::SIZE as u16,
            e_phentsize: 32,
            e_shentsize: Elf32Shdr::SIZE as u16,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: (shdrs.len() - 1) as u16,
            ..Default::default()
        };
        out[..Elf32Header::SIZE].copy_from_slice(&header.to_bytes());
        out
    }

    fn symtab(name: &'static str, value: u32, size: u32) -> (Vec<u8>, Vec<u8>) {
        let mut strings = vec![0u8];
        strings.extend_from_slice(name.as_bytes());
        strings.push(0);

        let mut table = vec![0u8; 16];
        table.extend_from_slice(&1u32.to_be_bytes());
        table.extend_from_slice(&value.to_be_bytes());
        table.extend_from_slice(&size.to_be_bytes());
        table.extend_from_slice(&[0x12, 0, 0, 1]);
        (strings, table)
    }

    fn create_loader(library_paths: Vec<PathBuf>) -> GameLoader {
        let config = LoaderConfig {
            library_paths,
            ..Default::default()
        };
        GameLoader::new(config, MemoryManager::new(), Arc::new(SymbolDb::new()))
    }

    #[test]
    fn test_boot_missing_file() {
        let loader = create_loader(Vec::new());
        let err = loader.boot("/nonexistent/game.elf").unwrap_err();
        assert!(matches!(err, EmulatorError::Io(_)));
    }

    #[test]
    fn test_boot_rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.elf");
        std::fs::write(&path, vec![0x42; 0x80]).unwrap();

        let loader = create_loader(Vec::new());
        let err = loader.boot(&path).unwrap_err();
        assert!(matches!(
            err,
            EmulatorError::Loader(LoaderError::InvalidElf(_))
        ));
        assert!(loader.memory().mapped_pages().is_empty());
    }

    #[test]
    fn test_boot_standard_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("game.elf");
        let bytes = build_image(
            false,
            0x8000_0100,
            &[Section {
                name: ".text",
                sh_type: sht::PROGBITS,
                flags: 0x6,
                addr: 0x8000_0100,
                link: 0,
                data: vec![0x4E, 0x80, 0x00, 0x20],
            }],
        );
        std::fs::write(&path, bytes).unwrap();

        let loader = create_loader(Vec::new());
        let game = loader.boot(&path).unwrap();

        assert_eq!(game.entry_point, 0x8000_0100);
        assert_eq!(game.stack_pointer, None);
        assert!(game.modules.is_empty());
        assert!(game.relocation_clean);
        assert!(!game.is_wii);
        assert_eq!(loader.memory().read_be32(0x8000_0100).unwrap(), 0x4E80_0020);
    }

    #[test]
    fn test_boot_rpx_with_library_dependency() {
        let game_dir = tempfile::tempdir().unwrap();
        let lib_dir = tempfile::tempdir().unwrap();

        let (strings, table) = symtab("lib_init", 0x0200_0000, 0x10);
        let lib = build_image(
            true,
            0x0200_0000,
            &[
                Section {
                    name: ".text",
                    sh_type: sht::PROGBITS,
                    flags: 0x6,
                    addr: 0x0200_0000,
                    link: 0,
                    data: vec![0; 0x10],
                },
                Section {
                    name: ".strtab",
                    sh_type: sht::STRTAB,
                    flags: 0,
                    addr: 0,
                    link: 0,
                    data: strings,
                },
                Section {
                    name: ".symtab",
                    sh_type: sht::SYMTAB,
                    flags: 0,
                    addr: 0,
                    link: 2,
                    data: table,
                },
            ],
        );
        std::fs::write(lib_dir.path().join("corelib.rpl"), lib).unwrap();

        let (strings, table) = symtab("main", 0x0200_0000, 0x10);
        let rpx = build_image(
            true,
            0x0200_0000,
            &[
                Section {
                    name: ".fimport_corelib",
                    sh_type: sht::RPL_IMPORTS,
                    flags: 0x2,
                    addr: 0xC000_0000,
                    link: 0,
                    data: vec![0; 16],
                },
                Section {
                    name: ".text",
                    sh_type: sht::PROGBITS,
                    flags: 0x6,
                    addr: 0x0200_0000,
                    link: 0,
                    data: vec![0; 0x10],
                },
                Section {
                    name: ".strtab",
                    sh_type: sht::STRTAB,
                    flags: 0,
                    addr: 0,
                    link: 0,
                    data: strings,
                },
                Section {
                    name: ".symtab",
                    sh_type: sht::SYMTAB,
                    flags: 0,
                    addr: 0,
                    link: 3,
                    data: table,
                },
            ],
        );
        let path = game_dir.path().join("game.rpx");
        std::fs::write(&path, rpx).unwrap();

        let loader = create_loader(vec![lib_dir.path().to_path_buf()]);
        let mut notified = Vec::new();
        let game = loader
            .boot_with_hook(&path, &mut |name: &str| notified.push(name.to_string()))
            .unwrap();

        assert_eq!(game.modules, vec!["corelib.rpl", "game.rpx"]);
        assert_eq!(game.entry_point, 0x8010_1000);
        assert_eq!(game.stack_pointer, Some(0x8400_0000));
        assert!(game.relocation_clean);
        assert_eq!(notified, vec!["corelib.rpl", "game.rpx"]);

        assert_eq!(loader.symbols().lookup("lib_init").unwrap().address, 0x8010_0000);
        assert_eq!(loader.symbols().lookup("main").unwrap().address, 0x8010_1000);
    }

    #[test]
    fn test_search_paths_order() {
        let loader = create_loader(vec![PathBuf::from("/sys/rpl")]);
        assert_eq!(
            loader.search_paths(Path::new("/games/title/code/app.rpx")),
            vec![PathBuf::from("/games/title/code"), PathBuf::from("/sys/rpl")]
        );
        assert_eq!(
            loader.search_paths(Path::new("app.rpx")),
            vec![PathBuf::from("."), PathBuf::from("/sys/rpl")]
        );
    }
}
