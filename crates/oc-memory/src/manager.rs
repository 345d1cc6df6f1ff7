//! Memory manager implementation

use oc_core::error::MemoryError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Page size of the backing store
pub const PAGE_SIZE: u32 = 0x1000;

/// Byte-addressed view of the emulated machine's memory.
///
/// Values are stored exactly as given; the big-endian helpers are the only
/// place where host and target byte order meet.
pub trait AddressSpace {
    /// Copy `data` to `addr`
    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError>;

    /// Copy `len` bytes starting at `addr`
    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Read a big-endian u32
    fn read_be32(&self, addr: u32) -> Result<u32, MemoryError> {
        let bytes = self.read_bytes(addr, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a big-endian u16
    fn write_be16(&self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }

    /// Write a big-endian u32
    fn write_be32(&self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write_bytes(addr, &value.to_be_bytes())
    }
}

impl<T: AddressSpace + ?Sized> AddressSpace for Arc<T> {
    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        (**self).write_bytes(addr, data)
    }

    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        (**self).read_bytes(addr, len)
    }
}

/// Sparse memory manager covering the full 32-bit address space.
///
/// Pages are allocated zero-filled the first time they are written.
/// Reads from pages that were never written return zeros.
pub struct MemoryManager {
    /// Page number -> page contents
    pages: RwLock<BTreeMap<u32, Box<[u8]>>>,
}

impl MemoryManager {
    /// Create a new, empty memory manager
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: RwLock::new(BTreeMap::new()),
        })
    }

    fn check_range(addr: u32, len: usize) -> Result<(), MemoryError> {
        if len == 0 {
            return Ok(());
        }
        let end = addr as u64 + len as u64;
        if end > 1u64 << 32 {
            return Err(MemoryError::RangeOverflow { addr, len });
        }
        Ok(())
    }

    /// Whether the page containing `addr` has ever been written
    pub fn is_mapped(&self, addr: u32) -> bool {
        self.pages.read().contains_key(&(addr / PAGE_SIZE))
    }

    /// Base addresses of every page that has been written, ascending
    pub fn mapped_pages(&self) -> Vec<u32> {
        self.pages.read().keys().map(|page| page * PAGE_SIZE).collect()
    }

    /// Number of bytes backed by allocated pages
    pub fn resident_size(&self) -> usize {
        self.pages.read().len() * PAGE_SIZE as usize
    }
}

impl AddressSpace for MemoryManager {
    fn write_bytes(&self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        Self::check_range(addr, data.len())?;
        trace!("write 0x{:x} bytes at 0x{:08x}", data.len(), addr);

        let mut pages = self.pages.write();
        let mut cursor = addr as u64;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page_num = (cursor / PAGE_SIZE as u64) as u32;
            let page_off = (cursor % PAGE_SIZE as u64) as usize;
            let chunk = remaining.len().min(PAGE_SIZE as usize - page_off);

            let page = pages
                .entry(page_num)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            page[page_off..page_off + chunk].copy_from_slice(&remaining[..chunk]);

            remaining = &remaining[chunk..];
            cursor += chunk as u64;
        }

        Ok(())
    }

    fn read_bytes(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        Self::check_range(addr, len)?;

        let pages = self.pages.read();
        let mut data = vec![0u8; len];
        let mut cursor = addr as u64;
        let mut filled = 0;

        while filled < len {
            let page_num = (cursor / PAGE_SIZE as u64) as u32;
            let page_off = (cursor % PAGE_SIZE as u64) as usize;
            let chunk = (len - filled).min(PAGE_SIZE as usize - page_off);

            if let Some(page) = pages.get(&page_num) {
                data[filled..filled + chunk].copy_from_slice(&page[page_off..page_off + chunk]);
            }

            filled += chunk;
            cursor += chunk as u64;
        }

        Ok(data)
    }
}
