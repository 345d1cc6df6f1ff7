//! Symbol import and the session-wide symbol database

use crate::elf::{Elf32Sym, RESERVED_VIRTUAL_BASE, STT_FUNC, STT_OBJECT};
use crate::image::{read_cstr, ElfImage};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info};

/// Kind of a registered symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
}

/// A function or data object at its absolute runtime address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRecord {
    pub name: String,
    pub address: u32,
    pub size: u32,
    pub kind: SymbolKind,
}

impl SymbolRecord {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.address && (addr as u64) < self.address as u64 + self.size as u64
    }
}

/// Name-keyed symbol store shared by every module of a boot
pub trait SymbolDatabase {
    /// Register a symbol; a later insert with the same name replaces it
    fn insert(&self, record: SymbolRecord);

    fn lookup(&self, name: &str) -> Option<SymbolRecord>;

    /// Rebuild lookup indices after a batch of inserts
    fn finalize(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default symbol database.
///
/// Both maps sit behind `RwLock`s so a debugger can query while the loader
/// thread inserts.
#[derive(Default)]
pub struct SymbolDb {
    by_name: RwLock<HashMap<String, SymbolRecord>>,
    /// Sorted by address; rebuilt by `finalize`
    by_address: RwLock<Vec<SymbolRecord>>,
}

impl SymbolDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbol whose extent contains `addr`, as of the last `finalize`
    pub fn symbol_at(&self, addr: u32) -> Option<SymbolRecord> {
        let index = self.by_address.read();
        let pos = index.partition_point(|s| s.address <= addr);
        index[..pos]
            .iter()
            .rev()
            .find(|s| s.contains(addr))
            .cloned()
    }

    /// All symbols ordered by address, as of the last `finalize`
    pub fn sorted(&self) -> Vec<SymbolRecord> {
        self.by_address.read().clone()
    }
}

impl SymbolDatabase for SymbolDb {
    fn insert(&self, record: SymbolRecord) {
        self.by_name.write().insert(record.name.clone(), record);
    }

    fn lookup(&self, name: &str) -> Option<SymbolRecord> {
        self.by_name.read().get(name).cloned()
    }

    fn finalize(&self) {
        let mut sorted: Vec<SymbolRecord> = self.by_name.read().values().cloned().collect();
        sorted.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));
        debug!("Indexed {} symbols", sorted.len());
        *self.by_address.write() = sorted;
    }

    fn len(&self) -> usize {
        self.by_name.read().len()
    }
}

/// Decoded `.symtab` with its paired string table
pub(crate) struct SymbolTable<'a> {
    pub entries: Vec<Elf32Sym>,
    pub strings: &'a [u8],
}

impl SymbolTable<'_> {
    pub fn name(&self, sym: &Elf32Sym) -> Option<&str> {
        read_cstr(self.strings, sym.st_name as usize)
    }
}

impl ElfImage {
    pub(crate) fn symbol_table(&self) -> Option<SymbolTable<'_>> {
        let index = self.section_by_name(".symtab", 0)?;
        let link = self.sections()[index].sh_link as usize;

        let entries = self
            .section_bytes(index)
            .map(|data| {
                data.chunks_exact(Elf32Sym::SIZE)
                    .map(Elf32Sym::parse)
                    .collect()
            })
            .unwrap_or_default();
        let strings = self.section_bytes(link).unwrap_or(&[]);

        Some(SymbolTable { entries, strings })
    }

    /// Register this image's functions and data objects in `db`.
    ///
    /// Returns whether the image had a `.symtab` that produced at least one
    /// symbol. Cafe import declarations (values in the reserved range) are
    /// not definitions and are skipped.
    pub fn import_symbols(&self, db: &dyn SymbolDatabase) -> bool {
        let Some(table) = self.symbol_table() else {
            debug!("No .symtab section");
            return false;
        };

        let mut count = 0;
        for sym in &table.entries {
            if sym.st_size == 0 {
                continue;
            }

            let kind = match sym.sym_type() {
                STT_OBJECT => SymbolKind::Data,
                STT_FUNC => SymbolKind::Function,
                _ => continue,
            };

            if self.is_cafe_module() && sym.st_value >= RESERVED_VIRTUAL_BASE {
                continue;
            }

            let Some(name) = table.name(sym).filter(|n| !n.is_empty()) else {
                continue;
            };

            let address = if self.did_relocate() {
                sym.st_value.wrapping_add(self.load_delta())
            } else {
                sym.st_value
            };

            db.insert(SymbolRecord {
                name: name.to_string(),
                address,
                size: sym.st_size,
                kind,
            });
            count += 1;
        }

        info!("Registered {} symbols", count);
        count > 0
    }
}
