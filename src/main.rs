//! Oxidized-Cafe - PowerPC ELF and RPX/RPL loader
//!
//! Usage: `oxidized-cafe <file> [library-dir...]`

use anyhow::{bail, Context};
use oc_core::{logging, Config};
use oc_integration::GameLoader;
use oc_loader::SymbolDb;
use oc_memory::MemoryManager;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args_os().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        bail!("usage: oxidized-cafe <file> [library-dir...]");
    };

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load config ({}), using defaults", e);
        Config::default()
    });
    config.loader.library_paths.extend(args.map(PathBuf::from));

    // Initialize logging
    logging::init(config.debug.log_level);
    tracing::info!("Starting Oxidized-Cafe");

    let symbols = Arc::new(SymbolDb::new());
    let loader = GameLoader::new(config.loader.clone(), MemoryManager::new(), symbols.clone());
    let game = loader
        .boot(&file)
        .with_context(|| format!("failed to boot {}", file.display()))?;

    println!("entry point:   0x{:08x}", game.entry_point);
    if let Some(sp) = game.stack_pointer {
        println!("stack pointer: 0x{:08x}", sp);
    }
    for module in &game.modules {
        println!("module:        {}", module);
    }
    println!("symbols:       {}", symbols.sorted().len());
    if !game.relocation_clean {
        tracing::warn!("Some relocations failed; the image may not run correctly");
    }

    Ok(())
}
