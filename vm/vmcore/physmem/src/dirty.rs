// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-client dirty page bitmaps over the RAM address space.

use bitvec::vec::BitVec;
use memory_range::MemoryRange;

/// A consumer of dirty page information. Each client has its own bitmap and
/// clears it independently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DirtyClient {
    /// Display refresh.
    Vga = 0,
    /// Live migration and snapshots.
    Migration = 1,
    /// Translated code invalidation.
    Code = 2,
}

impl DirtyClient {
    pub const ALL: [Self; 3] = [Self::Vga, Self::Migration, Self::Code];
}

#[derive(Debug, Default)]
pub(crate) struct DirtyBitmaps {
    maps: [BitVec; 3],
}

/// Converts a byte range of RAM address space to the pages it touches.
fn pages(ram_addr: u64, len: u64) -> std::ops::Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let range = MemoryRange::bounding(ram_addr..ram_addr + len);
    range.start_4k_gpn() as usize..range.end_4k_gpn() as usize
}

impl DirtyBitmaps {
    /// Grows every bitmap to cover `page_count` pages. Never shrinks.
    pub fn grow(&mut self, page_count: usize) {
        for map in &mut self.maps {
            if map.len() < page_count {
                map.resize(page_count, false);
            }
        }
    }

    fn clamp(&self, pages: std::ops::Range<usize>) -> std::ops::Range<usize> {
        let len = self.maps[0].len();
        pages.start.min(len)..pages.end.min(len)
    }

    pub fn set(&mut self, ram_addr: u64, len: u64, clients: &[DirtyClient]) {
        let pages = self.clamp(pages(ram_addr, len));
        for &client in clients {
            self.maps[client as usize][pages.clone()].fill(true);
        }
    }

    pub fn clear(&mut self, ram_addr: u64, len: u64, client: DirtyClient) {
        let pages = self.clamp(pages(ram_addr, len));
        self.maps[client as usize][pages].fill(false);
    }

    pub fn is_dirty(&self, ram_addr: u64, client: DirtyClient) -> bool {
        self.maps[client as usize]
            .get((ram_addr >> crate::PAGE_SHIFT) as usize)
            .is_some_and(|bit| *bit)
    }

    /// Returns true if any page in the range is clean for any client.
    pub fn includes_clean(&self, ram_addr: u64, len: u64) -> bool {
        let pages = self.clamp(pages(ram_addr, len));
        self.maps.iter().any(|map| map[pages.clone()].not_all())
    }

    /// Clears the range for `client`, returning whether any page was dirty.
    pub fn test_and_clear(&mut self, ram_addr: u64, len: u64, client: DirtyClient) -> bool {
        let pages = self.clamp(pages(ram_addr, len));
        let bits = &mut self.maps[client as usize][pages];
        let dirty = bits.any();
        bits.fill(false);
        dirty
    }
}
