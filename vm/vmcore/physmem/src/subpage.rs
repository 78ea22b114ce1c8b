// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Byte-granular dispatch for pages shared by more than one section.

use crate::page_map::SectionId;
use crate::PAGE_SIZE;

pub(crate) struct Subpage {
    base: u64,
    sections: Box<[SectionId]>,
}

impl Subpage {
    pub fn new(base: u64, initial: SectionId) -> Self {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        Self {
            base,
            sections: vec![initial; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Assigns offsets `start..=end` to `section`. Returns false, changing
    /// nothing, if the range leaves the page.
    #[must_use]
    pub fn register_range(&mut self, start: u64, end: u64, section: SectionId) -> bool {
        if start > end || end >= PAGE_SIZE {
            return false;
        }
        self.sections[start as usize..=end as usize].fill(section);
        true
    }

    pub fn dispatch(&self, offset: u64) -> SectionId {
        self.sections[offset as usize]
    }

    /// The number of bytes from `offset` to the end of its run of identically
    /// dispatched offsets.
    pub fn run_len(&self, offset: u64) -> u64 {
        let section = self.dispatch(offset);
        let rest = &self.sections[offset as usize..];
        rest.iter().position(|&s| s != section).unwrap_or(rest.len()) as u64
    }
}
