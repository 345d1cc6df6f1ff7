//! Copying segments and sections into the target address space

use crate::elf::{et, pt, sht, SectionFlags, DEFAULT_RPL_LINK_BASE, RESERVED_VIRTUAL_BASE};
use crate::image::ElfImage;
use oc_memory::{AddressSpace, PAGE_SIZE};
use tracing::{debug, error, info, warn};

impl ElfImage {
    /// Copy the image into `memory` so that it runs at `base`.
    ///
    /// Pre-linked executables ignore `base`. Relocatable images are shifted
    /// by `base`; Cafe modules are shifted by `base - DEFAULT_RPL_LINK_BASE`
    /// since they are linked against that address. Individual copy failures
    /// are logged and skipped. Returns the absolute entry point.
    pub fn load_into<M: AddressSpace + ?Sized>(&mut self, memory: &M, base: u32) -> u32 {
        let is_cafe = self.is_cafe_module();
        self.relocate = is_cafe || self.header().e_type != et::EXEC;
        self.delta = match (self.relocate, is_cafe) {
            (false, _) => 0,
            (true, true) => base.wrapping_sub(DEFAULT_RPL_LINK_BASE),
            (true, false) => base,
        };
        self.entry_point = self.header().e_entry.wrapping_add(self.delta);

        if self.relocate {
            info!(
                "Relocatable module: base=0x{:08x} delta=0x{:08x}",
                base, self.delta
            );
        } else {
            info!("Prerelocated executable");
        }

        let delta = self.delta;
        let mut highest_end: u64 = 0;

        info!("{} segments:", self.segments().len());
        for (i, p) in self.segments().iter().enumerate() {
            debug!(
                "Segment {}: type={} vaddr=0x{:08x} filesz=0x{:x} memsz=0x{:x}",
                i, p.p_type, p.p_vaddr, p.p_filesz, p.p_memsz
            );
            if p.p_type != pt::LOAD {
                continue;
            }

            let write_addr = p.p_vaddr.wrapping_add(delta);
            if is_cafe && reaches_reserved(write_addr, p.p_memsz.max(p.p_filesz)) {
                warn!(
                    "Segment {} at 0x{:08x} overlaps the import/export range, skipped",
                    i, write_addr
                );
                continue;
            }

            let start = p.p_offset as usize;
            let src = start
                .checked_add(p.p_filesz as usize)
                .and_then(|end| self.raw_data().get(start..end));
            let Some(src) = src else {
                error!(
                    "Segment {} data (0x{:x}+0x{:x}) lies outside the file",
                    i, p.p_offset, p.p_filesz
                );
                continue;
            };

            // Segment payloads are target-order code and data; copy verbatim.
            copy_with_fill(memory, write_addr, src, p.p_memsz as usize);
            highest_end = highest_end.max(write_addr as u64 + p.p_memsz.max(p.p_filesz) as u64);
            info!(
                "Loadable segment copied to 0x{:08x}, size 0x{:08x}",
                write_addr, p.p_memsz
            );
        }

        info!("{} sections:", self.num_sections());
        let mut section_addrs = vec![0u32; self.num_sections()];
        for i in 0..self.num_sections() {
            let s = self.sections()[i];
            let name = self.section_name(i).unwrap_or("");
            let write_addr = s.sh_addr.wrapping_add(delta);
            section_addrs[i] = write_addr;

            if !s.flags().contains(SectionFlags::ALLOC) {
                debug!(
                    "Non-data section '{}' ignored (size=0x{:08x}, flags=0x{:08x})",
                    name, s.sh_size, s.sh_flags
                );
                continue;
            }

            let compressed = is_cafe && s.flags().contains(SectionFlags::DEFLATED);
            let dst_size = if compressed {
                self.section_size(i)
            } else {
                s.sh_size
            } as usize;

            if is_cafe
                && (s.sh_addr >= RESERVED_VIRTUAL_BASE
                    || reaches_reserved(write_addr, dst_size as u32))
            {
                debug!(
                    "Section '{}' at 0x{:08x} is import/export metadata, skipped",
                    name, s.sh_addr
                );
                continue;
            }

            let src = if s.sh_type == sht::NOBITS {
                &[][..]
            } else {
                self.section_bytes(i).unwrap_or(&[])
            };

            info!(
                "Data section '{}' at 0x{:08x}, size 0x{:08x}",
                name, write_addr, dst_size
            );
            copy_with_fill(memory, write_addr, src, dst_size);
            highest_end = highest_end.max(write_addr as u64 + dst_size as u64);
        }
        self.section_addrs = section_addrs;

        let span = align_up(highest_end.saturating_sub(base as u64));
        self.loaded_length = u32::try_from(span).unwrap_or(u32::MAX & !(PAGE_SIZE - 1));

        info!(
            "Done loading: entry=0x{:08x}, loaded length=0x{:x}",
            self.entry_point, self.loaded_length
        );
        self.entry_point
    }
}

/// Write `src` at `addr`, then zero the rest of `dst_size`
fn copy_with_fill<M: AddressSpace + ?Sized>(memory: &M, addr: u32, src: &[u8], dst_size: usize) {
    let copy_len = src.len();
    if copy_len > 0 {
        if let Err(e) = memory.write_bytes(addr, src) {
            error!("Failed to copy 0x{:x} bytes to 0x{:08x}: {}", copy_len, addr, e);
            return;
        }
    }

    if dst_size > copy_len {
        let zeros = vec![0u8; dst_size - copy_len];
        let bss_addr = addr.wrapping_add(copy_len as u32);
        if let Err(e) = memory.write_bytes(bss_addr, &zeros) {
            error!("Failed to zero BSS at 0x{:08x}: {}", bss_addr, e);
        }
    }
}

/// Whether `[addr, addr + size)` touches the reserved import/export range
fn reaches_reserved(addr: u32, size: u32) -> bool {
    addr >= RESERVED_VIRTUAL_BASE || addr as u64 + size as u64 > RESERVED_VIRTUAL_BASE as u64
}

fn align_up(value: u64) -> u64 {
    let page = PAGE_SIZE as u64;
    value.div_ceil(page) * page
}
