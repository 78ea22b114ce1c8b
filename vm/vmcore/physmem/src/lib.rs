// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest physical memory dispatch.
//!
//! A [`MemorySystem`] owns the guest's RAM blocks ([`RamList`]) and hands out
//! [`AddressSpace`]s. Each address space routes guest physical addresses to
//! [`MemoryRegion`]s through a page-granular trie that is rebuilt whenever the
//! topology changes and swapped in atomically, so that lookups never take a
//! lock on the topology itself.
//!
//! Accesses to RAM are copies to and from host memory. Accesses to anything
//! else are split, widened, and byte-swapped as the target region requires and
//! passed to its callbacks.

// UNSAFETY: Copying to and from host memory that backs guest RAM, and adopting
// caller-provided host memory as RAM.
#![expect(unsafe_code)]

mod access;
mod address_space;
mod bounce;
mod dirty;
mod dispatch;
mod page_map;
mod ram;
mod region;
mod subpage;

pub use address_space::AccessError;
pub use address_space::AddressSpace;
pub use address_space::Translation;
pub use bounce::MapWaiterId;
pub use bounce::Mapping;
pub use dirty::DirtyClient;
pub use page_map::RegionSection;
pub use ram::RamBlockInfo;
pub use ram::RamError;
pub use ram::RamFlags;
pub use ram::RamList;
pub use ram::ResizedFn;
pub use region::AccessSize;
pub use region::Endianness;
pub use region::IoError;
pub use region::MemoryRegion;
pub use region::RamRegion;

use bounce::BounceBuffer;
use bounce::MapWaiters;
use host_mmap::HostMemoryAllocator;
use parking_lot::Mutex;
use ram::RamConfig;
use region::Sentinels;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The dispatch granularity.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub(crate) const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Builder for [`MemorySystem`].
pub struct MemorySystemBuilder {
    mem_path: Option<PathBuf>,
    mem_prealloc: bool,
    mem_merge: bool,
    dump_guest_core: bool,
    huge_pages: bool,
    allocator: Option<Box<dyn HostMemoryAllocator>>,
}

impl Default for MemorySystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySystemBuilder {
    pub fn new() -> Self {
        Self {
            mem_path: None,
            mem_prealloc: false,
            mem_merge: true,
            dump_guest_core: true,
            huge_pages: true,
            allocator: None,
        }
    }

    /// Backs RAM with files created in `path`, typically a `hugetlbfs`
    /// mount.
    pub fn mem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mem_path = Some(path.into());
        self
    }

    /// Touches every page of file-backed RAM when it is allocated.
    pub fn mem_prealloc(mut self, enable: bool) -> Self {
        self.mem_prealloc = enable;
        self
    }

    /// Lets the host merge identical RAM pages. On by default.
    pub fn mem_merge(mut self, enable: bool) -> Self {
        self.mem_merge = enable;
        self
    }

    /// Includes guest RAM in host core dumps. On by default.
    pub fn dump_guest_core(mut self, enable: bool) -> Self {
        self.dump_guest_core = enable;
        self
    }

    /// Asks for transparent huge pages. On by default.
    pub fn huge_pages(mut self, enable: bool) -> Self {
        self.huge_pages = enable;
        self
    }

    /// Replaces the host allocator used for RAM that is not file-backed.
    pub fn host_allocator(mut self, allocator: Box<dyn HostMemoryAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn build(self) -> MemorySystem {
        let config = RamConfig {
            mem_path: self.mem_path,
            mem_prealloc: self.mem_prealloc,
            mem_merge: self.mem_merge,
            dump_guest_core: self.dump_guest_core,
            huge_pages: self.huge_pages,
        };
        tracing::debug!(?config, "creating memory system");
        MemorySystem {
            ram: Arc::new(RamList::new(config, self.allocator)),
            sentinels: Arc::new(Sentinels::new()),
            bounce: Default::default(),
            waiters: Default::default(),
        }
    }
}

/// Guest RAM and the address spaces that map it.
pub struct MemorySystem {
    ram: Arc<RamList>,
    sentinels: Arc<Sentinels>,
    bounce: Mutex<BounceBuffer>,
    waiters: Mutex<MapWaiters>,
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySystem {
    /// A memory system with default options.
    pub fn new() -> Self {
        MemorySystemBuilder::new().build()
    }

    pub fn ram(&self) -> &Arc<RamList> {
        &self.ram
    }

    /// Creates an empty address space. Every address reads as unassigned
    /// until the first commit.
    pub fn address_space(&self, name: &str) -> AddressSpace {
        AddressSpace::new(name, self.ram.clone(), self.sentinels.clone())
    }

    fn region(
        &self,
        name: &str,
        ram_addr: u64,
        size: Arc<AtomicU64>,
        readonly: bool,
    ) -> Arc<RamRegion> {
        Arc::new(RamRegion::new(
            name.to_owned(),
            self.ram.clone(),
            ram_addr,
            size,
            readonly,
        ))
    }

    /// Allocates `size` bytes of RAM and returns a region for it.
    pub fn ram_region(&self, name: &str, size: u64) -> Result<Arc<RamRegion>, RamError> {
        let ram_addr = self.ram.alloc(name, size)?;
        Ok(self.region(name, ram_addr, Arc::new(size.into()), false))
    }

    /// Like [`Self::ram_region`], but guest writes are ignored. The contents
    /// are loaded with [`AddressSpace::write_rom`].
    pub fn rom_region(&self, name: &str, size: u64) -> Result<Arc<RamRegion>, RamError> {
        let ram_addr = self.ram.alloc(name, size)?;
        Ok(self.region(name, ram_addr, Arc::new(size.into()), true))
    }

    /// Allocates RAM whose size can later change with [`RamList::resize`],
    /// up to `max_size`. The region's size follows the block's.
    pub fn ram_region_resizeable(
        &self,
        name: &str,
        size: u64,
        max_size: u64,
    ) -> Result<Arc<RamRegion>, RamError> {
        let region_size = Arc::new(AtomicU64::new(size));
        let resized: ResizedFn = Arc::new({
            let region_size = region_size.clone();
            move |_name: &str, size: u64| region_size.store(size, Ordering::Release)
        });
        let ram_addr = self.ram.alloc_resizeable(name, size, max_size, resized)?;
        Ok(self.region(name, ram_addr, region_size, false))
    }

    /// Adopts host memory owned by the caller as RAM.
    ///
    /// # Safety
    ///
    /// As for [`RamList::alloc_from_ptr`].
    pub unsafe fn ram_region_from_ptr(
        &self,
        name: &str,
        size: u64,
        host: *mut u8,
    ) -> Result<Arc<RamRegion>, RamError> {
        // SAFETY: guaranteed by caller.
        let ram_addr = unsafe { self.ram.alloc_from_ptr(name, size, host)? };
        Ok(self.region(name, ram_addr, Arc::new(size.into()), false))
    }
}
