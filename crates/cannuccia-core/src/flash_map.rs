//! Flash page map: an ELF image carved into page-sized writes.

use std::collections::BTreeMap;

use tracing::warn;

use crate::elf::LoadableSegment;

/// The set of flash pages a firmware image touches, keyed by page address.
///
/// Every entry is exactly `page_size` bytes; the final partial page of a
/// segment is right-padded with 0x00. When two segments land on the same
/// page address the later one wins (well-formed firmware never overlaps).
#[derive(Debug)]
pub struct FlashMap {
    page_size: u32,
    pages: BTreeMap<u32, Vec<u8>>,
    num_pages: usize,
}

impl FlashMap {
    /// Carves `segments` (in file order) into `page_size`-sized chunks.
    pub fn new(page_size: u32, segments: &[LoadableSegment]) -> Self {
        let mut pages = BTreeMap::new();

        for seg in segments {
            if seg.phys_addr % page_size != 0 {
                warn!(
                    addr = format!("0x{:08X}", seg.phys_addr),
                    page_size, "Segment start is not page-aligned"
                );
            }

            for (i, chunk) in seg.data.chunks(page_size as usize).enumerate() {
                let addr = seg.phys_addr + i as u32 * page_size;
                let mut page = chunk.to_vec();
                page.resize(page_size as usize, 0x00);
                pages.insert(addr, page);
            }
        }

        let num_pages = pages.len();
        Self {
            page_size,
            pages,
            num_pages,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pages still to be flashed, address-sorted. Drained as flashing
    /// proceeds.
    pub fn pages(&mut self) -> &mut BTreeMap<u32, Vec<u8>> {
        &mut self.pages
    }

    /// Lowest-addressed remaining page, if any.
    pub fn first_page(&self) -> Option<(u32, &Vec<u8>)> {
        self.pages.iter().next().map(|(&addr, data)| (addr, data))
    }

    /// Page count at construction time; the progress denominator.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Pages flashed so far, judged by how far `pages` has drained.
    pub fn flashed(&self) -> usize {
        self.num_pages - self.pages.len()
    }

    pub fn is_done(&self) -> bool {
        self.pages.is_empty()
    }
}
