//! Boot driver for oxidized-cafe
//!
//! Ties the loader crates to the host filesystem and the user configuration.

pub mod loader;

pub use loader::{GameLoader, LoadedGame};
