// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One generation of an address space's dispatch trie.
//!
//! The trie indexes guest page numbers. Each level consumes
//! [`LEVEL_BITS`] bits of the page number; a [`Entry::Leaf`] at any level maps
//! every page below it to one section. Pages shared by several sections get a
//! subpage leaf that dispatches on the byte offset within the page instead.
//!
//! A generation is built once (`add_section` for every visible section, then
//! `compact`) and is read-only afterwards.

use crate::page_map::Entry;
use crate::page_map::NodeId;
use crate::page_map::PageMap;
use crate::page_map::RegionSection;
use crate::page_map::Section;
use crate::page_map::SectionId;
use crate::page_map::SectionTarget;
use crate::page_map::LEVELS;
use crate::page_map::LEVEL_BITS;
use crate::page_map::NODE_ENTRIES;
use crate::region::MemoryRegion;
use crate::region::Sentinels;
use crate::PAGE_OFFSET_MASK;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use std::sync::Arc;

pub(crate) struct Dispatch {
    root: Entry,
    map: PageMap,
}

impl Dispatch {
    pub fn new(sentinels: &Sentinels) -> Self {
        let mut map = PageMap::default();
        for region in sentinels.regions() {
            map.add_section(Section {
                target: SectionTarget::Region(region.clone()),
                offset_within_address_space: 0,
                offset_within_region: 0,
                size: u64::MAX,
            });
        }
        Self {
            root: Entry::ABSENT,
            map,
        }
    }

    pub fn section_count(&self) -> usize {
        self.map.section_count()
    }

    pub fn node_count(&self) -> usize {
        self.map.node_count()
    }

    fn set_range(&mut self, mut index: u64, mut count: u64, leaf: SectionId) {
        self.map.reserve(3 * LEVELS as usize);
        let mut root = self.root;
        self.map
            .set_level(&mut root, &mut index, &mut count, leaf, LEVELS - 1);
        self.root = root;
    }

    /// Finds the section covering `addr`, without resolving subpages.
    pub fn lookup(&self, addr: u64) -> SectionId {
        let index = addr >> PAGE_SHIFT;
        let mut entry = self.root;
        let mut level = LEVELS as i32;
        let id = loop {
            match entry {
                Entry::Leaf(id) => break id,
                Entry::Branch { node, skip } => {
                    level -= i32::from(skip);
                    if node == NodeId::NIL || level < 0 {
                        return SectionId::UNASSIGNED;
                    }
                    let slot =
                        (index >> (level as u32 * LEVEL_BITS)) as usize & (NODE_ENTRIES - 1);
                    entry = self.map.node(node)[slot];
                }
            }
        };
        // Compaction elides levels without checking their index bits, so the
        // leaf may belong to a neighbouring range.
        if self.map.section(id).covers(addr) {
            id
        } else {
            SectionId::UNASSIGNED
        }
    }

    /// Adds `section` to the tree, splitting its unaligned head and tail into
    /// subpages.
    pub fn add_section(&mut self, section: &RegionSection) {
        let mut addr = section.offset_within_address_space;
        let mut region_offset = section.offset_within_region;
        let mut remaining = section.size;
        while remaining != 0 {
            let page_offset = addr & PAGE_OFFSET_MASK;
            let len = if page_offset != 0 {
                remaining.min(PAGE_SIZE - page_offset)
            } else if remaining < PAGE_SIZE {
                remaining
            } else {
                remaining & !PAGE_OFFSET_MASK
            };
            let piece = Section {
                target: SectionTarget::Region(section.region.clone()),
                offset_within_address_space: addr,
                offset_within_region: region_offset,
                size: len,
            };
            if len < PAGE_SIZE || page_offset != 0 {
                self.register_subpage(piece);
            } else {
                self.register_multipage(piece);
            }
            remaining -= len;
            addr = addr.wrapping_add(len);
            region_offset = region_offset.wrapping_add(len);
        }
    }

    fn register_subpage(&mut self, section: Section) {
        let base = section.offset_within_address_space & !PAGE_OFFSET_MASK;
        let existing = self.lookup(base);
        let subpage = match self.map.section(existing).target {
            SectionTarget::Subpage(id) => id,
            SectionTarget::Region(_) => {
                // Bytes not claimed by this section keep resolving to
                // whatever covered the page before.
                let id = self.map.add_subpage(base, existing);
                let leaf = self.map.add_section(Section {
                    target: SectionTarget::Subpage(id),
                    offset_within_address_space: base,
                    offset_within_region: 0,
                    size: PAGE_SIZE,
                });
                self.set_range(base >> PAGE_SHIFT, 1, leaf);
                id
            }
        };
        let start = section.offset_within_address_space & PAGE_OFFSET_MASK;
        let end = start + section.size - 1;
        let id = self.map.add_section(section);
        let ok = self.map.subpage_mut(subpage).register_range(start, end, id);
        assert!(ok, "subpage range {start:#x}..={end:#x} leaves the page");
    }

    fn register_multipage(&mut self, section: Section) {
        let index = section.offset_within_address_space >> PAGE_SHIFT;
        let pages = section.size >> PAGE_SHIFT;
        assert!(pages != 0);
        let id = self.map.add_section(section);
        self.set_range(index, pages, id);
    }

    /// Collapses single-child chains. Lookups return the same sections before
    /// and after.
    pub fn compact(&mut self) {
        let mut root = self.root;
        self.map.compact(&mut root);
        self.root = root;
    }

    /// Resolves `addr` to a region, the offset within it, and the number of
    /// bytes (at most `len`) that can be accessed there without leaving the
    /// section.
    pub fn translate(&self, addr: u64, len: u64) -> (&Arc<dyn MemoryRegion>, u64, u64) {
        let mut section = self.map.section(self.lookup(addr));
        let mut len = len;
        if let SectionTarget::Subpage(id) = section.target {
            let subpage = self.map.subpage(id);
            debug_assert_eq!(subpage.base(), addr & !PAGE_OFFSET_MASK);
            let offset = addr & PAGE_OFFSET_MASK;
            len = len.min(subpage.run_len(offset));
            section = self.map.section(subpage.dispatch(offset));
        }
        let SectionTarget::Region(region) = &section.target else {
            panic!("subpage dispatches to another subpage");
        };
        let within = addr - section.offset_within_address_space;
        // Sentinels span the whole space, so the last byte has nothing after it
        // and still needs a one-byte chunk.
        let len = len.min((section.size - within).max(1));
        (region, within + section.offset_within_region, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::test_device::TestDevice;
    use crate::region::AccessSize;
    use crate::region::Endianness;

    fn device(name: &str, size: usize) -> Arc<dyn MemoryRegion> {
        Arc::new(TestDevice::new(
            name,
            size,
            AccessSize::default(),
            Endianness::Native,
        ))
    }

    fn region_at(d: &Dispatch, addr: u64) -> String {
        d.translate(addr, 1).0.name().to_owned()
    }

    fn build(sections: &[(&str, u64, u64)]) -> Dispatch {
        let sentinels = Sentinels::new();
        let mut d = Dispatch::new(&sentinels);
        for &(name, addr, size) in sections {
            d.add_section(&RegionSection::new(device(name, size as usize), addr));
        }
        d
    }

    #[test_with_tracing::test]
    fn empty_tree_is_unassigned() {
        let d = build(&[]);
        for addr in [0, 0x1000, 0xdead_beef, u64::MAX] {
            assert_eq!(d.lookup(addr), SectionId::UNASSIGNED);
        }
        assert_eq!(d.section_count(), 4);
    }

    #[test_with_tracing::test]
    fn round_trip_survives_compaction() {
        let layout = [
            ("low", 0, 0xa0000),
            ("vga", 0xa0000, 0x20000),
            ("bios", 0xe0000, 0x20000),
            ("high", 0x1_0000_0000, 0x40_0000),
            ("mmio", 0xfee0_0000, 0x1000),
            ("far", 0x7fff_ffff_f000, 0x1000),
        ];
        let mut d = build(&layout);
        let probes: Vec<_> = layout
            .iter()
            .flat_map(|&(name, addr, size)| {
                [addr, addr + size / 2, addr + size - 1].map(move |a| (a, name))
            })
            .collect();
        for &(addr, name) in &probes {
            assert_eq!(region_at(&d, addr), name, "{addr:#x}");
        }
        let holes = [0xc0000, 0xfee0_1000, 0x1_0040_0000, 0x7fff_ffff_e000];
        let before: Vec<_> = holes.iter().map(|&a| d.lookup(a)).collect();

        let nodes = d.node_count();
        d.compact();
        assert_eq!(d.node_count(), nodes);
        for &(addr, name) in &probes {
            assert_eq!(region_at(&d, addr), name, "{addr:#x}");
        }
        let after: Vec<_> = holes.iter().map(|&a| d.lookup(a)).collect();
        assert_eq!(before, after);
        assert!(after.iter().all(|&s| s == SectionId::UNASSIGNED));
    }

    #[test_with_tracing::test]
    fn compaction_elides_levels() {
        let mut d = build(&[("only", 0x40_0000_0000, 0x1000)]);
        d.compact();
        // A single page under an otherwise empty tree collapses into one
        // branch straight to the level-0 node.
        assert!(matches!(d.root, Entry::Branch { skip, .. } if skip == LEVELS as u8));
        assert_eq!(region_at(&d, 0x40_0000_0000), "only");
        assert_eq!(d.lookup(0x40_0000_1000), SectionId::UNASSIGNED);
        assert_eq!(d.lookup(0x1000), SectionId::UNASSIGNED);
    }

    #[test_with_tracing::test]
    fn large_aligned_range_uses_high_leaf() {
        // 1GiB aligned: a single level-2 leaf.
        let mut d = build(&[("big", 0x4000_0000, 0x4000_0000)]);
        assert_eq!(d.node_count(), LEVELS as usize - 2);
        d.compact();
        assert_eq!(region_at(&d, 0x4000_0000), "big");
        assert_eq!(region_at(&d, 0x7fff_ffff), "big");
        assert_eq!(d.lookup(0x8000_0000), SectionId::UNASSIGNED);
        assert_eq!(d.lookup(0x3fff_ffff), SectionId::UNASSIGNED);
    }

    #[test_with_tracing::test]
    fn subpage_partition() {
        let d = build(&[("a", 0x3000, 0x400), ("b", 0x3400, 0xc00)]);
        for addr in 0x3000..0x4000 {
            let expected = if addr < 0x3400 { "a" } else { "b" };
            assert_eq!(region_at(&d, addr), expected);
        }
        let (_, offset, len) = d.translate(0x3100, 0x1000);
        assert_eq!((offset, len), (0x100, 0x300));
        let (_, offset, len) = d.translate(0x3400, 0x1000);
        assert_eq!((offset, len), (0, 0xc00));
    }

    #[test_with_tracing::test]
    fn unaligned_section_splits() {
        let d = build(&[("dev", 0x1ffc, 0x2008)]);
        assert_eq!(region_at(&d, 0x1ffb), "unassigned");
        assert_eq!(region_at(&d, 0x1ffc), "dev");
        assert_eq!(region_at(&d, 0x2000), "dev");
        assert_eq!(region_at(&d, 0x4003), "dev");
        assert_eq!(region_at(&d, 0x4004), "unassigned");
        // Head, whole pages, tail: three sections plus two subpage leaves.
        assert_eq!(d.section_count(), 4 + 5);
        let (_, offset, len) = d.translate(0x1ffc, 0x10);
        assert_eq!((offset, len), (0, 4));
        let (_, offset, len) = d.translate(0x2000, 0x10000);
        assert_eq!((offset, len), (4, 0x2000));
        let (_, offset, len) = d.translate(0x4000, 0x10);
        assert_eq!((offset, len), (0x2004, 4));
    }

    #[test_with_tracing::test]
    fn overlap_last_wins() {
        let mut d = build(&[
            ("ram", 0, 0x20_0000),
            ("hole", 0x10_0000, 0x1000),
            ("reg", 0x10_2004, 4),
        ]);
        d.compact();
        assert_eq!(region_at(&d, 0xf_ffff), "ram");
        assert_eq!(region_at(&d, 0x10_0000), "hole");
        assert_eq!(region_at(&d, 0x10_1000), "ram");
        assert_eq!(region_at(&d, 0x10_2003), "ram");
        assert_eq!(region_at(&d, 0x10_2004), "reg");
        assert_eq!(region_at(&d, 0x10_2008), "ram");
        // The ram section keeps its own offsets inside the shared page.
        let (_, offset, len) = d.translate(0x10_2000, 0x100);
        assert_eq!((offset, len), (0x10_2000, 4));
        let (_, offset, len) = d.translate(0x10_2008, 0x100);
        assert_eq!((offset, len), (0x10_2008, 0x100));
    }

    #[test_with_tracing::test]
    fn sentinel_slots_are_reserved() {
        let d = build(&[("dev", 0x1000, 0x1000)]);
        let names: Vec<_> = [
            SectionId::UNASSIGNED,
            SectionId::NOTDIRTY,
            SectionId::ROM,
            SectionId::WATCH,
        ]
        .iter()
        .map(|&id| match &d.map.section(id).target {
            SectionTarget::Region(r) => r.name().to_owned(),
            SectionTarget::Subpage(_) => unreachable!(),
        })
        .collect();
        assert_eq!(names, ["unassigned", "notdirty", "rom", "watch"]);
        assert_eq!(d.lookup(0x1000), SectionId(4));
    }

    #[test_with_tracing::test]
    fn translate_clamps_to_section() {
        let d = build(&[("dev", 0x1000, 0x1000)]);
        let (region, offset, len) = d.translate(0x1ff0, 0x100);
        assert_eq!(region.name(), "dev");
        assert_eq!((offset, len), (0xff0, 0x10));
        let (region, offset, len) = d.translate(0x2000, 0x100);
        assert_eq!(region.name(), "unassigned");
        assert_eq!((offset, len), (0x2000, 0x100));
    }

    #[test_with_tracing::test]
    fn translate_top_of_space() {
        let d = build(&[("dev", 0x1000, 0x1000)]);
        let (region, offset, len) = d.translate(u64::MAX, 4);
        assert_eq!(region.name(), "unassigned");
        assert_eq!((offset, len), (u64::MAX, 1));
        let (_, offset, len) = d.translate(u64::MAX - 1, 4);
        assert_eq!((offset, len), (u64::MAX - 1, 1));
    }
}
