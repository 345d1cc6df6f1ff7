//! Core types for the oxidized-cafe loader
//!
//! This crate provides the foundational error types, configuration,
//! and logging infrastructure shared by the loader crates.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{EmulatorError, Result};
