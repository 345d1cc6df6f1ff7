//! Memory management for the oxidized-cafe loader
//!
//! This crate provides the emulated 32-bit big-endian address space that
//! executable images are copied and relocated into.

pub mod manager;

pub use manager::{AddressSpace, MemoryManager, PAGE_SIZE};
