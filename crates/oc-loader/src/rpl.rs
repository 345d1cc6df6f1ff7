//! Recursive RPX/RPL module loading

use crate::image::ElfImage;
use crate::reloc::RelocationReport;
use crate::symbols::SymbolDatabase;
use oc_core::error::LoaderError;
use oc_memory::AddressSpace;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Supplies module file contents by directory and file name
pub trait ModuleSource {
    fn read_module(&self, dir: &Path, name: &str) -> Option<Vec<u8>>;
}

/// Reads modules from the host filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFileSystem;

impl ModuleSource for HostFileSystem {
    fn read_module(&self, dir: &Path, name: &str) -> Option<Vec<u8>> {
        std::fs::read(dir.join(name)).ok()
    }
}

/// Notified once for every module whose symbol import found symbols
pub trait PatchHook {
    fn symbols_imported(&mut self, module: &str);
}

impl<F: FnMut(&str)> PatchHook for F {
    fn symbols_imported(&mut self, module: &str) {
        self(module)
    }
}

/// A module placed in memory by a `LoaderSession`
pub struct LoadedModule {
    pub name: String,
    pub path: PathBuf,
    pub image: ElfImage,
    pub base: u32,
    pub entry_point: u32,
    pub relocation: RelocationReport,
}

/// State of one root-module load: the address cursor and the registry of
/// modules loaded so far. Dropped once the root module is in memory; the
/// symbols it registered stay in the symbol database.
pub struct LoaderSession<'a> {
    memory: &'a dyn AddressSpace,
    symbols: &'a dyn SymbolDatabase,
    source: &'a dyn ModuleSource,
    hook: &'a mut dyn PatchHook,
    search_paths: Vec<PathBuf>,
    next_load_address: u32,
    registry: HashMap<String, usize>,
    modules: Vec<LoadedModule>,
    in_progress: HashSet<String>,
}

impl<'a> LoaderSession<'a> {
    pub fn new(
        memory: &'a dyn AddressSpace,
        symbols: &'a dyn SymbolDatabase,
        source: &'a dyn ModuleSource,
        hook: &'a mut dyn PatchHook,
        search_paths: Vec<PathBuf>,
        load_base: u32,
    ) -> Self {
        Self {
            memory,
            symbols,
            source,
            hook,
            search_paths,
            next_load_address: load_base,
            registry: HashMap::new(),
            modules: Vec::new(),
            in_progress: HashSet::new(),
        }
    }

    /// Address the next module will be placed at
    pub fn next_load_address(&self) -> u32 {
        self.next_load_address
    }

    /// Modules in load order (dependencies before dependents)
    pub fn modules(&self) -> &[LoadedModule] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&LoadedModule> {
        self.registry.get(name).map(|&index| &self.modules[index])
    }

    pub fn into_modules(self) -> Vec<LoadedModule> {
        self.modules
    }

    fn find_module(&self, name: &str) -> Option<(PathBuf, Vec<u8>)> {
        self.search_paths.iter().find_map(|dir| {
            self.source
                .read_module(dir, name)
                .map(|data| (dir.join(name), data))
        })
    }

    /// Load `name` and, first, everything it depends on.
    ///
    /// Returns the module's index in `modules()`, or `None` when `name` is
    /// already being loaded further up the dependency chain.
    pub fn load_module(&mut self, name: &str) -> Result<Option<usize>, LoaderError> {
        if let Some(&index) = self.registry.get(name) {
            return Ok(Some(index));
        }
        if self.in_progress.contains(name) {
            warn!("Dependency cycle through {}, not descending again", name);
            return Ok(None);
        }

        let Some((path, data)) = self.find_module(name) else {
            return Err(LoaderError::DependencyNotFound(name.to_string()));
        };
        info!("Loading {}", path.display());

        let mut image = ElfImage::parse(data)?;

        self.in_progress.insert(name.to_string());
        for dependency in image.dependencies() {
            if let Err(e) = self.load_module(&dependency) {
                self.in_progress.remove(name);
                return Err(e);
            }
        }
        self.in_progress.remove(name);

        let base = self.next_load_address;
        info!("Loading {} into 0x{:08x}", name, base);
        let entry_point = image.load_into(self.memory, base);

        let had_symbols = image.import_symbols(self.symbols);
        self.symbols.finalize();

        let relocation = image.relocate(self.memory, self.symbols)?;
        if !relocation.success() {
            warn!(
                "{} loaded with {} relocation failures",
                name,
                relocation.failures.len()
            );
        }

        if had_symbols {
            self.hook.symbols_imported(name);
        }

        self.next_load_address = base.checked_add(image.loaded_length()).unwrap_or_else(|| {
            warn!("Load cursor wrapped past 4 GiB after {}", name);
            base.wrapping_add(image.loaded_length())
        });

        let index = self.modules.len();
        self.modules.push(LoadedModule {
            name: name.to_string(),
            path,
            image,
            base,
            entry_point,
            relocation,
        });
        self.registry.insert(name.to_string(), index);
        Ok(Some(index))
    }
}
