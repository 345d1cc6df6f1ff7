//! Error types for the oxidized-cafe loader

use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Errors raised by the target address space
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Access of {len} bytes at 0x{addr:08x} wraps the 32-bit address space")]
    RangeOverflow { addr: u32, len: usize },
}

/// Loader errors
///
/// The first four kinds abort the load of a module. The rest are soft:
/// they are logged and collected while loading continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("Invalid ELF: {0}")]
    InvalidElf(String),

    #[error("Truncated {table}: needs 0x{needed:x} bytes, file has 0x{available:x}")]
    TruncatedHeader {
        table: &'static str,
        needed: u64,
        available: u64,
    },

    #[error("Dependency not found in any search path: {0}")]
    DependencyNotFound(String),

    #[error("Module has no .symtab section but needs relocation")]
    MissingSymbolTable,

    #[error("Unsupported relocation in section {section}: {reason}")]
    UnsupportedRelocation { section: usize, reason: String },

    #[error("Unresolved import '{symbol}' referenced at 0x{target:08x}")]
    UnresolvedImport { symbol: String, target: u32 },

    #[error("Failed to inflate section {section}: {reason}")]
    DecompressionFailed { section: usize, reason: String },
}

impl LoaderError {
    /// Whether this error aborts the current module's load
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidElf(_)
                | Self::TruncatedHeader { .. }
                | Self::DependencyNotFound(_)
                | Self::MissingSymbolTable
        )
    }
}

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, EmulatorError>;
