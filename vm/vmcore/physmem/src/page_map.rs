// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Arena storage for one dispatch generation: trie nodes, sections, and
//! subpage tables, all referenced by index.

use crate::region::MemoryRegion;
use crate::subpage::Subpage;
use crate::PAGE_SHIFT;
use crate::PAGE_SIZE;
use std::sync::Arc;

/// Index bits consumed per trie level.
pub(crate) const LEVEL_BITS: u32 = 9;
/// Entries per trie node.
pub(crate) const NODE_ENTRIES: usize = 1 << LEVEL_BITS;
/// Trie depth needed to cover every page of a 64-bit address space.
pub(crate) const LEVELS: u32 = (64 - PAGE_SHIFT - 1) / LEVEL_BITS + 1;
/// Skip counts are three bits wide.
pub(crate) const SKIP_LIMIT: u8 = 1 << 3;
/// Section indices are limited to one page's worth per generation.
pub(crate) const MAX_SECTIONS: usize = PAGE_SIZE as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SectionId(pub u16);

impl SectionId {
    pub const UNASSIGNED: Self = Self(0);
    pub const NOTDIRTY: Self = Self(1);
    pub const ROM: Self = Self(2);
    pub const WATCH: Self = Self(3);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct NodeId(pub u32);

impl NodeId {
    pub const NIL: Self = Self(u32::MAX);
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SubpageId(pub u32);

/// A trie slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Entry {
    Leaf(SectionId),
    /// A child node, reached by eliding `skip` levels. `node` may be
    /// [`NodeId::NIL`], meaning nothing is mapped below.
    Branch { node: NodeId, skip: u8 },
}

impl Entry {
    pub const ABSENT: Self = Entry::Branch {
        node: NodeId::NIL,
        skip: 1,
    };

    pub fn is_absent(&self) -> bool {
        matches!(self, Entry::Branch { node, .. } if *node == NodeId::NIL)
    }
}

pub(crate) type Node = [Entry; NODE_ENTRIES];

/// A mapping of part of an address space to part of a region.
#[derive(Clone)]
pub struct RegionSection {
    pub region: Arc<dyn MemoryRegion>,
    pub offset_within_address_space: u64,
    pub offset_within_region: u64,
    pub size: u64,
}

impl RegionSection {
    /// A section mapping all of `region` at `addr`.
    pub fn new(region: Arc<dyn MemoryRegion>, addr: u64) -> Self {
        let size = region.size();
        Self {
            region,
            offset_within_address_space: addr,
            offset_within_region: 0,
            size,
        }
    }
}

impl std::fmt::Debug for RegionSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionSection")
            .field("region", &self.region.name())
            .field(
                "offset_within_address_space",
                &format_args!("{:#x}", self.offset_within_address_space),
            )
            .field(
                "offset_within_region",
                &format_args!("{:#x}", self.offset_within_region),
            )
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

#[derive(Clone)]
pub(crate) enum SectionTarget {
    Region(Arc<dyn MemoryRegion>),
    Subpage(SubpageId),
}

/// A section as stored in the table. Immutable once added.
#[derive(Clone)]
pub(crate) struct Section {
    pub target: SectionTarget,
    pub offset_within_address_space: u64,
    pub offset_within_region: u64,
    pub size: u64,
}

impl Section {
    pub fn covers(&self, addr: u64) -> bool {
        self.size == u64::MAX
            || addr
                .checked_sub(self.offset_within_address_space)
                .is_some_and(|offset| offset < self.size)
    }
}

#[derive(Default)]
pub(crate) struct PageMap {
    nodes: Vec<Node>,
    sections: Vec<Section>,
    subpages: Vec<Subpage>,
}

impl PageMap {
    /// Makes room for `extra` more nodes ahead of an insertion.
    pub fn reserve(&mut self, extra: usize) {
        let needed = self.nodes.len() + extra;
        if needed > self.nodes.capacity() {
            let target = (self.nodes.capacity() * 2).max(16).max(needed);
            self.nodes.reserve_exact(target - self.nodes.len());
        }
    }

    /// Appends a node with every entry set to `fill`.
    pub fn alloc_node(&mut self, fill: Entry) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        assert!(id != NodeId::NIL, "dispatch node arena exhausted");
        self.nodes.push([fill; NODE_ENTRIES]);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[track_caller]
    pub fn add_section(&mut self, section: Section) -> SectionId {
        assert!(
            self.sections.len() < MAX_SECTIONS,
            "too many sections in one dispatch generation"
        );
        let id = SectionId(self.sections.len() as u16);
        self.sections.push(section);
        id
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Appends a subpage table for the page at `base` whose every byte
    /// resolves to `initial`.
    pub fn add_subpage(&mut self, base: u64, initial: SectionId) -> SubpageId {
        let id = SubpageId(self.subpages.len() as u32);
        self.subpages.push(Subpage::new(base, initial));
        id
    }

    pub fn subpage(&self, id: SubpageId) -> &Subpage {
        &self.subpages[id.0 as usize]
    }

    pub fn subpage_mut(&mut self, id: SubpageId) -> &mut Subpage {
        &mut self.subpages[id.0 as usize]
    }

    /// Writes `leaf` over `count` pages starting at page `index`, below
    /// `entry`, which sits at trie level `level`.
    ///
    /// Advances `index` and decrements `count` as pages are covered, so a
    /// caller walking sibling entries can continue where this one stopped.
    pub fn set_level(
        &mut self,
        entry: &mut Entry,
        index: &mut u64,
        count: &mut u64,
        leaf: SectionId,
        level: u32,
    ) {
        let step = 1u64 << (level * LEVEL_BITS);
        let node = match *entry {
            Entry::Branch { node, skip } if node != NodeId::NIL => {
                debug_assert_eq!(skip, 1, "inserting into a compacted tree");
                node
            }
            Entry::Branch { .. } => {
                let fill = if level == 0 {
                    Entry::Leaf(SectionId::UNASSIGNED)
                } else {
                    Entry::ABSENT
                };
                self.alloc_node(fill)
            }
            // A later section overlaps part of this one. Push the existing
            // leaf down a level so the overlap can be carved out.
            Entry::Leaf(existing) => self.alloc_node(Entry::Leaf(existing)),
        };
        *entry = Entry::Branch { node, skip: 1 };

        let mut slot = ((*index >> (level * LEVEL_BITS)) as usize) & (NODE_ENTRIES - 1);
        while *count != 0 && slot < NODE_ENTRIES {
            if *index & (step - 1) == 0 && *count >= step {
                self.node_mut(node)[slot] = Entry::Leaf(leaf);
                *index += step;
                *count -= step;
            } else {
                let mut child = self.node(node)[slot];
                self.set_level(&mut child, index, count, leaf, level - 1);
                self.node_mut(node)[slot] = child;
            }
            slot += 1;
        }
    }

    /// Collapses chains of single-child nodes below `entry`.
    pub fn compact(&mut self, entry: &mut Entry) {
        let Entry::Branch { node, skip } = *entry else {
            return;
        };
        if node == NodeId::NIL {
            return;
        }

        let mut only = None;
        let mut valid = 0;
        for slot in 0..NODE_ENTRIES {
            let mut child = self.node(node)[slot];
            if child.is_absent() {
                continue;
            }
            only = Some(slot);
            valid += 1;
            if matches!(child, Entry::Branch { .. }) {
                self.compact(&mut child);
                self.node_mut(node)[slot] = child;
            }
        }

        let (1, Some(slot)) = (valid, only) else {
            return;
        };
        match self.node(node)[slot] {
            Entry::Leaf(section) => *entry = Entry::Leaf(section),
            Entry::Branch {
                node: child,
                skip: child_skip,
            } => {
                if skip + child_skip < SKIP_LIMIT {
                    *entry = Entry::Branch {
                        node: child,
                        skip: skip + child_skip,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Sentinels;

    fn sentinel_section(sentinels: &Sentinels) -> Section {
        Section {
            target: SectionTarget::Region(sentinels.regions()[0].clone()),
            offset_within_address_space: 0,
            offset_within_region: 0,
            size: u64::MAX,
        }
    }

    #[test_with_tracing::test]
    fn level_count() {
        assert_eq!(LEVELS, 6);
        assert_eq!(NODE_ENTRIES, 512);
    }

    #[test_with_tracing::test]
    fn reserve_grows_geometrically() {
        let mut map = PageMap::default();
        map.reserve(3);
        assert!(map.nodes.capacity() >= 16);
        let cap = map.nodes.capacity();
        for _ in 0..cap {
            map.alloc_node(Entry::ABSENT);
        }
        map.reserve(1);
        assert!(map.nodes.capacity() >= 2 * cap);
    }

    #[test_with_tracing::test]
    fn new_nodes_are_absent() {
        let mut map = PageMap::default();
        let id = map.alloc_node(Entry::ABSENT);
        assert!(map.node(id).iter().all(Entry::is_absent));
    }

    #[test_with_tracing::test]
    fn section_limit() {
        let sentinels = Sentinels::new();
        let mut map = PageMap::default();
        for i in 0..MAX_SECTIONS {
            assert_eq!(map.add_section(sentinel_section(&sentinels)).0 as usize, i);
        }
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            map.add_section(sentinel_section(&sentinels))
        }));
        assert!(r.is_err());
    }

    #[test_with_tracing::test]
    fn covers() {
        let sentinels = Sentinels::new();
        let mut section = sentinel_section(&sentinels);
        assert!(section.covers(u64::MAX));
        section.offset_within_address_space = 0x2000;
        section.size = 0x1000;
        assert!(!section.covers(0x1fff));
        assert!(section.covers(0x2000));
        assert!(section.covers(0x2fff));
        assert!(!section.covers(0x3000));
    }
}
