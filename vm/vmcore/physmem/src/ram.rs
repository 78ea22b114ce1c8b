// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest RAM blocks and the RAM address space they are placed in.
//!
//! Every RAM-backed region owns one block. Blocks are placed at offsets in a
//! separate, flat RAM address space (not guest physical addresses), which is
//! also what the dirty bitmaps are indexed by. Block placement is best fit
//! over the gaps left by earlier blocks.

use crate::dirty::DirtyBitmaps;
use crate::dirty::DirtyClient;
use crate::PAGE_SHIFT;
use host_mmap::Advice;
use host_mmap::BorrowedMemory;
use host_mmap::HostMemory;
use host_mmap::HostMemoryAllocator;
use memory_range::MemoryRange;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[cfg(unix)]
use host_mmap::unix::FileMapping;

/// Called with the block name and new used length after a successful
/// [`RamList::resize`].
pub type ResizedFn = Arc<dyn Fn(&str, u64) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RamError {
    #[error("ram block {0:?} already exists")]
    DuplicateName(String),
    #[error("invalid size {size:#x} for ram block {name:?}")]
    InvalidSize { name: String, size: u64 },
    #[error("no free range of {0:#x} bytes in the ram address space")]
    NoGap(u64),
    #[error("failed to allocate host memory for ram block {name:?}")]
    Allocate {
        name: String,
        #[source]
        err: io::Error,
    },
    #[error("ram block {0:?} is not resizeable")]
    NotResizeable(String),
    #[error("ram block {name:?}: size {size:#x} exceeds maximum {max:#x}")]
    TooLarge { name: String, size: u64, max: u64 },
    #[error("no ram block at {0:#x}")]
    NotFound(u64),
    #[error("file-backed ram requires a memory path")]
    NoMemPath,
    #[error("ram at {addr:#x} cannot be remapped")]
    Remap {
        addr: u64,
        #[source]
        err: io::Error,
    },
}

/// RAM options taken from the machine configuration.
#[derive(Debug, Clone)]
pub(crate) struct RamConfig {
    pub mem_path: Option<PathBuf>,
    pub mem_prealloc: bool,
    pub mem_merge: bool,
    pub dump_guest_core: bool,
    pub huge_pages: bool,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RamFlags {
    /// The host memory was supplied by the caller.
    pub preallocated: bool,
    /// The host memory is a shared file mapping.
    pub shared: bool,
    /// The used length may change up to the maximum length.
    pub resizeable: bool,
}

/// A snapshot of one block, as passed to [`RamList::for_each_block`].
#[derive(Debug, Clone)]
pub struct RamBlockInfo {
    pub name: String,
    pub host: *mut u8,
    pub offset: u64,
    pub used_length: u64,
    pub max_length: u64,
    pub flags: RamFlags,
}

enum Backing {
    /// Allocated through the configured allocator.
    Allocated { anonymous: bool },
    Preallocated(Arc<dyn HostMemory>),
    #[cfg(unix)]
    File { shared: bool },
}

struct RamBlock {
    name: String,
    memory: Arc<dyn HostMemory>,
    #[cfg(unix)]
    file: Option<Arc<FileMapping>>,
    anonymous: bool,
    offset: u64,
    used_length: u64,
    max_length: u64,
    flags: RamFlags,
    resized: Option<ResizedFn>,
}

impl RamBlock {
    fn range(&self) -> MemoryRange {
        MemoryRange::new(self.offset..self.offset + self.max_length)
    }

    fn contains(&self, ram_addr: u64) -> bool {
        ram_addr.wrapping_sub(self.offset) < self.max_length
    }

    fn contains_host(&self, ptr: *const u8) -> bool {
        ((ptr as usize).wrapping_sub(self.memory.as_ptr() as usize) as u64) < self.max_length
    }

    fn info(&self) -> RamBlockInfo {
        RamBlockInfo {
            name: self.name.clone(),
            host: self.memory.as_ptr(),
            offset: self.offset,
            used_length: self.used_length,
            max_length: self.max_length,
            flags: self.flags,
        }
    }
}

#[derive(Default)]
struct RamInner {
    /// Sorted by descending `max_length`.
    blocks: Vec<RamBlock>,
    mru: Option<usize>,
    version: u64,
    dirty: DirtyBitmaps,
}

impl RamInner {
    fn find(&mut self, ram_addr: u64) -> Option<usize> {
        if let Some(i) = self.mru {
            if self.blocks[i].contains(ram_addr) {
                return Some(i);
            }
        }
        let i = self.blocks.iter().position(|b| b.contains(ram_addr))?;
        self.mru = Some(i);
        Some(i)
    }

    fn find_host(&mut self, ptr: *const u8) -> Option<usize> {
        if let Some(i) = self.mru {
            if self.blocks[i].contains_host(ptr) {
                return Some(i);
            }
        }
        let i = self.blocks.iter().position(|b| b.contains_host(ptr))?;
        self.mru = Some(i);
        Some(i)
    }

    fn last_offset(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| b.offset + b.max_length)
            .max()
            .unwrap_or(0)
    }

    fn invalidate(&mut self) {
        self.mru = None;
        self.version += 1;
    }
}

/// A range of host memory backing part of a block, kept alive while in use.
pub(crate) struct HostChunk {
    memory: Arc<dyn HostMemory>,
    offset: usize,
    len: usize,
}

impl HostChunk {
    pub fn ptr(&self) -> *mut u8 {
        self.memory.as_ptr().wrapping_add(self.offset)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn into_memory(self) -> Arc<dyn HostMemory> {
        self.memory
    }
}

/// The list of RAM blocks and their dirty bitmaps.
pub struct RamList {
    inner: Mutex<RamInner>,
    config: RamConfig,
    allocator: Option<Box<dyn HostMemoryAllocator>>,
    dirty_tracking: AtomicBool,
}

fn host_align(name: &str, size: u64) -> Result<u64, RamError> {
    size.checked_next_multiple_of(host_mmap::page_size() as u64)
        .filter(|&size| size != 0 && size <= MemoryRange::MAX_ADDRESS)
        .ok_or_else(|| RamError::InvalidSize {
            name: name.to_owned(),
            size,
        })
}

impl RamList {
    pub(crate) fn new(config: RamConfig, allocator: Option<Box<dyn HostMemoryAllocator>>) -> Self {
        Self {
            inner: Default::default(),
            config,
            allocator,
            dirty_tracking: AtomicBool::new(false),
        }
    }

    /// Allocates a block of `size` bytes.
    ///
    /// The block is file-backed if a memory path is configured, and otherwise
    /// comes from the host allocator. Returns the block's RAM address.
    pub fn alloc(&self, name: &str, size: u64) -> Result<u64, RamError> {
        let size = host_align(name, size)?;
        #[cfg(unix)]
        if self.config.mem_path.is_some() {
            return self.add_block(name, size, size, Backing::File { shared: false }, None);
        }
        let backing = Backing::Allocated {
            anonymous: self.allocator.is_none(),
        };
        self.add_block(name, size, size, backing, None)
    }

    /// Adds a block backed by memory the caller owns.
    ///
    /// Panics if `host` is null.
    ///
    /// # Safety
    ///
    /// `host..host + size`, rounded up to the host page size, must remain
    /// valid for reads and writes until the block is freed and every mapping
    /// of it is unmapped.
    pub unsafe fn alloc_from_ptr(
        &self,
        name: &str,
        size: u64,
        host: *mut u8,
    ) -> Result<u64, RamError> {
        let Some(host) = NonNull::new(host) else {
            panic!("ram block {name:?} has a null host pointer");
        };
        let size = host_align(name, size)?;
        // SAFETY: guaranteed by caller.
        let memory = unsafe { BorrowedMemory::new(host, size as usize) };
        self.add_block(
            name,
            size,
            size,
            Backing::Preallocated(Arc::new(memory)),
            None,
        )
    }

    /// Allocates a block whose used length starts at `size` and can later be
    /// changed with [`RamList::resize`], up to `max_size`.
    pub fn alloc_resizeable(
        &self,
        name: &str,
        size: u64,
        max_size: u64,
        resized: ResizedFn,
    ) -> Result<u64, RamError> {
        let size = host_align(name, size)?;
        let max_size = host_align(name, max_size)?;
        if size > max_size {
            return Err(RamError::TooLarge {
                name: name.to_owned(),
                size,
                max: max_size,
            });
        }
        let backing = Backing::Allocated {
            anonymous: self.allocator.is_none(),
        };
        self.add_block(name, size, max_size, backing, Some(resized))
    }

    /// Allocates a block backed by an unlinked file under the configured
    /// memory path, typically a `hugetlbfs` mount.
    #[cfg(unix)]
    pub fn alloc_from_file(&self, name: &str, size: u64, shared: bool) -> Result<u64, RamError> {
        let size = host_align(name, size)?;
        self.add_block(name, size, size, Backing::File { shared }, None)
    }

    fn add_block(
        &self,
        name: &str,
        used_length: u64,
        max_length: u64,
        backing: Backing,
        resized: Option<ResizedFn>,
    ) -> Result<u64, RamError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.blocks.iter().any(|b| b.name == name) {
            return Err(RamError::DuplicateName(name.to_owned()));
        }
        let ranges: Vec<_> = inner.blocks.iter().map(RamBlock::range).collect();
        let offset =
            memory_range::best_fit_gap(&ranges, max_length).ok_or(RamError::NoGap(max_length))?;

        let alloc_err = |err| RamError::Allocate {
            name: name.to_owned(),
            err,
        };
        let mut flags = RamFlags {
            resizeable: resized.is_some(),
            ..Default::default()
        };
        #[cfg(unix)]
        let mut file = None;
        let mut anonymous = false;
        let memory: Arc<dyn HostMemory> = match backing {
            Backing::Allocated { anonymous: anon } => {
                anonymous = anon;
                let memory = match &self.allocator {
                    Some(allocator) => allocator.allocate(max_length as usize),
                    None => host_mmap::AnonymousAllocator.allocate(max_length as usize),
                }
                .map_err(alloc_err)?;
                if (memory.len() as u64) < max_length {
                    return Err(alloc_err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "allocator returned a short allocation",
                    )));
                }
                memory.into()
            }
            Backing::Preallocated(memory) => {
                flags.preallocated = true;
                memory
            }
            #[cfg(unix)]
            Backing::File { shared } => {
                let dir = self.config.mem_path.as_deref().ok_or(RamError::NoMemPath)?;
                let mapping = Arc::new(
                    FileMapping::new(dir, max_length as usize, shared, self.config.mem_prealloc)
                        .map_err(alloc_err)?,
                );
                flags.shared = shared;
                file = Some(mapping.clone());
                mapping as Arc<dyn HostMemory>
            }
        };

        if !flags.preallocated {
            self.advise(name, memory.as_ptr(), max_length as usize);
        }

        let block = RamBlock {
            name: name.to_owned(),
            memory,
            #[cfg(unix)]
            file,
            anonymous,
            offset,
            used_length,
            max_length,
            flags,
            resized,
        };
        let range = block.range();
        let pos = inner
            .blocks
            .iter()
            .position(|b| b.max_length < max_length)
            .unwrap_or(inner.blocks.len());
        inner.blocks.insert(pos, block);
        inner.invalidate();
        let page_count = (inner.last_offset() >> PAGE_SHIFT) as usize;
        inner.dirty.grow(page_count);
        inner.dirty.set(offset, used_length, &DirtyClient::ALL);

        tracing::debug!(
            name,
            range = %range,
            used_length,
            preallocated = flags.preallocated,
            shared = flags.shared,
            resizeable = flags.resizeable,
            "added ram block"
        );
        Ok(offset)
    }

    fn advise(&self, name: &str, ptr: *mut u8, len: usize) {
        let advice = [
            (self.config.mem_merge, Advice::Mergeable),
            (!self.config.dump_guest_core, Advice::DontDump),
            (self.config.huge_pages, Advice::HugePage),
            (true, Advice::DontFork),
        ];
        for (enabled, advice) in advice {
            if !enabled {
                continue;
            }
            if let Err(err) = host_mmap::advise(ptr, len, advice) {
                tracing::warn!(
                    name,
                    ?advice,
                    error = &err as &dyn std::error::Error,
                    "failed to apply memory advice"
                );
            }
        }
    }

    /// Removes the block at `ram_addr`. Its host memory is released once no
    /// mapping refers to it.
    pub fn free(&self, ram_addr: u64) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.blocks.iter().position(|b| b.offset == ram_addr) else {
            tracing::warn!(ram_addr, "freeing unknown ram block");
            return;
        };
        let block = inner.blocks.remove(index);
        inner.invalidate();
        tracing::debug!(name = %block.name, range = %block.range(), "freed ram block");
    }

    /// Changes the used length of the resizeable block at `ram_addr`.
    ///
    /// The dirty bits of the old used range are cleared and the new used
    /// range is marked dirty for every client.
    pub fn resize(&self, ram_addr: u64, new_size: u64) -> Result<(), RamError> {
        let (name, resized, new_size) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let block = inner
                .blocks
                .iter_mut()
                .find(|b| b.offset == ram_addr)
                .ok_or(RamError::NotFound(ram_addr))?;
            let new_size = host_align(&block.name, new_size)?;
            if block.used_length == new_size {
                return Ok(());
            }
            if !block.flags.resizeable {
                return Err(RamError::NotResizeable(block.name.clone()));
            }
            if new_size > block.max_length {
                return Err(RamError::TooLarge {
                    name: block.name.clone(),
                    size: new_size,
                    max: block.max_length,
                });
            }
            for client in DirtyClient::ALL {
                inner.dirty.clear(block.offset, block.used_length, client);
            }
            tracing::info!(
                name = %block.name,
                old_size = block.used_length,
                new_size,
                "resizing ram block"
            );
            block.used_length = new_size;
            inner.dirty.set(block.offset, new_size, &DirtyClient::ALL);
            (block.name.clone(), block.resized.clone(), new_size)
        };
        if let Some(resized) = resized {
            resized(&name, new_size);
        }
        Ok(())
    }

    pub(crate) fn host_chunk(&self, ram_addr: u64, len: u64) -> HostChunk {
        let mut inner = self.inner.lock();
        let Some(index) = inner.find(ram_addr) else {
            panic!("no ram block at {ram_addr:#x}");
        };
        let block = &inner.blocks[index];
        let offset = ram_addr - block.offset;
        HostChunk {
            memory: block.memory.clone(),
            offset: offset as usize,
            len: len.min(block.max_length - offset) as usize,
        }
    }

    /// Returns the host address of `ram_addr`.
    ///
    /// Panics if no block contains `ram_addr`.
    pub fn host_ptr(&self, ram_addr: u64) -> *mut u8 {
        self.host_chunk(ram_addr, 0).ptr()
    }

    /// Returns the host address of `ram_addr`, reducing `len` so that the
    /// range stays within one block.
    pub fn host_ptr_len(&self, ram_addr: u64, len: &mut u64) -> *mut u8 {
        let chunk = self.host_chunk(ram_addr, *len);
        *len = chunk.len() as u64;
        chunk.ptr()
    }

    /// Maps a host address inside some block back to its RAM address.
    pub fn ram_addr_from_host(&self, ptr: *const u8) -> Option<u64> {
        let mut inner = self.inner.lock();
        let index = inner.find_host(ptr)?;
        let block = &inner.blocks[index];
        Some(block.offset + (ptr as usize - block.memory.as_ptr() as usize) as u64)
    }

    /// The end of the highest block in the RAM address space.
    pub fn last_ram_offset(&self) -> u64 {
        self.inner.lock().last_offset()
    }

    /// Incremented whenever a block is added or removed.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Calls `f` for a snapshot of every block, largest first. The list is not
    /// locked while `f` runs.
    pub fn for_each_block(&self, mut f: impl FnMut(&RamBlockInfo)) {
        let blocks: Vec<_> = self.inner.lock().blocks.iter().map(RamBlock::info).collect();
        for block in &blocks {
            f(block);
        }
    }

    /// Replaces `ram_addr..ram_addr + len` with fresh zeroed memory.
    #[cfg(unix)]
    pub fn remap(&self, ram_addr: u64, len: u64) -> Result<(), RamError> {
        let mut inner = self.inner.lock();
        let index = inner.find(ram_addr).ok_or(RamError::NotFound(ram_addr))?;
        let block = &inner.blocks[index];
        let offset = ram_addr - block.offset;
        let remap_err = |err| RamError::Remap {
            addr: ram_addr,
            err,
        };
        if len > block.max_length - offset {
            return Err(remap_err(io::ErrorKind::InvalidInput.into()));
        }
        let (offset, len) = (offset as usize, len as usize);
        if let Some(file) = &block.file {
            // SAFETY: the range is inside the block's own mapping, and
            // remapping discards guest contents by definition.
            unsafe { file.remap(offset, len) }.map_err(remap_err)?;
        } else if block.anonymous {
            if offset % host_mmap::page_size() != 0 || len % host_mmap::page_size() != 0 {
                return Err(remap_err(io::ErrorKind::InvalidInput.into()));
            }
            // SAFETY: the block's memory is a private anonymous mapping owned
            // by the block, and the range is inside it.
            unsafe { host_mmap::unix::remap_anonymous(block.memory.as_ptr().add(offset), len) }
                .map_err(remap_err)?;
        } else {
            return Err(remap_err(io::ErrorKind::Unsupported.into()));
        }
        let ptr = block.memory.as_ptr().wrapping_add(offset);
        let name = block.name.clone();
        drop(inner);
        self.advise(&name, ptr, len);
        tracing::debug!(name = %name, ram_addr, len, "remapped ram");
        Ok(())
    }

    /// Copies from RAM into `buf`, stopping at the end of the block. Returns
    /// the number of bytes copied.
    pub(crate) fn read_ram(&self, ram_addr: u64, buf: &mut [u8]) -> usize {
        let chunk = self.host_chunk(ram_addr, buf.len() as u64);
        // SAFETY: the chunk is inside a live block allocation, which `chunk`
        // keeps alive. Guest memory may change concurrently, like any shared
        // memory the guest can write.
        unsafe { std::ptr::copy_nonoverlapping(chunk.ptr(), buf.as_mut_ptr(), chunk.len()) };
        chunk.len()
    }

    fn copy_to_ram(&self, ram_addr: u64, buf: &[u8]) -> usize {
        let chunk = self.host_chunk(ram_addr, buf.len() as u64);
        // SAFETY: as in `read_ram`.
        unsafe { std::ptr::copy_nonoverlapping(buf.as_ptr(), chunk.ptr(), chunk.len()) };
        chunk.len()
    }

    /// Copies `buf` into RAM, stopping at the end of the block, and marks the
    /// written pages dirty. Returns the number of bytes copied.
    pub(crate) fn write_ram(&self, ram_addr: u64, buf: &[u8]) -> usize {
        let n = self.copy_to_ram(ram_addr, buf);
        self.mark_written(ram_addr, n as u64);
        n
    }

    /// Like [`Self::write_ram`], but only marks pages dirty while dirty
    /// tracking is enabled.
    pub(crate) fn write_ram_notdirty(&self, ram_addr: u64, buf: &[u8]) -> usize {
        let n = self.copy_to_ram(ram_addr, buf);
        if self.dirty_tracking() {
            self.mark_written(ram_addr, n as u64);
        }
        n
    }

    /// Marks a guest write to RAM: every client but the code client sees it.
    pub(crate) fn mark_written(&self, ram_addr: u64, len: u64) {
        let mut inner = self.inner.lock();
        if inner.dirty.includes_clean(ram_addr, len) {
            inner
                .dirty
                .set(ram_addr, len, &[DirtyClient::Vga, DirtyClient::Migration]);
        }
    }

    /// Marks the range dirty for every client.
    pub fn set_dirty_range(&self, ram_addr: u64, len: u64) {
        self.inner
            .lock()
            .dirty
            .set(ram_addr, len, &DirtyClient::ALL);
    }

    /// Marks the range dirty for every client except [`DirtyClient::Code`].
    pub fn set_dirty_range_nocode(&self, ram_addr: u64, len: u64) {
        self.inner
            .lock()
            .dirty
            .set(ram_addr, len, &[DirtyClient::Vga, DirtyClient::Migration]);
    }

    pub fn clear_dirty_range(&self, ram_addr: u64, len: u64, client: DirtyClient) {
        self.inner.lock().dirty.clear(ram_addr, len, client);
    }

    pub fn is_dirty(&self, ram_addr: u64, client: DirtyClient) -> bool {
        self.inner.lock().dirty.is_dirty(ram_addr, client)
    }

    /// Returns true if any page in the range is clean for any client.
    pub fn range_includes_clean(&self, ram_addr: u64, len: u64) -> bool {
        self.inner.lock().dirty.includes_clean(ram_addr, len)
    }

    /// Clears the range for `client` and returns whether any of it was dirty.
    pub fn test_and_clear_dirty(&self, ram_addr: u64, len: u64, client: DirtyClient) -> bool {
        self.inner.lock().dirty.test_and_clear(ram_addr, len, client)
    }

    /// Enables or disables dirty tracking for writes that normally bypass it,
    /// such as page table updates made on the guest's behalf.
    pub fn set_dirty_tracking(&self, enable: bool) {
        self.dirty_tracking.store(enable, Ordering::Relaxed);
    }

    pub fn dirty_tracking(&self) -> bool {
        self.dirty_tracking.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;
    use std::sync::atomic::AtomicU64;

    fn config() -> RamConfig {
        RamConfig {
            mem_path: None,
            mem_prealloc: false,
            mem_merge: true,
            dump_guest_core: true,
            huge_pages: false,
        }
    }

    fn ram() -> RamList {
        RamList::new(config(), None)
    }

    #[test_with_tracing::test]
    fn first_block_at_zero() {
        let ram = ram();
        assert_eq!(ram.alloc("a", 3 * PAGE_SIZE).unwrap(), 0);
        assert_eq!(ram.last_ram_offset(), 3 * PAGE_SIZE);
        assert_eq!(ram.alloc("b", PAGE_SIZE).unwrap(), 3 * PAGE_SIZE);
        assert_eq!(ram.last_ram_offset(), 4 * PAGE_SIZE);
    }

    #[test_with_tracing::test]
    fn best_fit_placement() {
        let ram = ram();
        let a = ram.alloc("a", 10 * PAGE_SIZE).unwrap();
        let hole = ram.alloc("hole", 40 * PAGE_SIZE).unwrap();
        let b = ram.alloc("b", 10 * PAGE_SIZE).unwrap();
        assert_eq!((a, hole, b), (0, 10 * PAGE_SIZE, 50 * PAGE_SIZE));
        ram.free(hole);
        // Blocks now occupy pages [0,10) and [50,60).
        let c = ram.alloc("c", 5 * PAGE_SIZE).unwrap();
        assert!((10 * PAGE_SIZE..50 * PAGE_SIZE).contains(&c));
    }

    #[test_with_tracing::test]
    fn blocks_sorted_by_size() {
        let ram = ram();
        ram.alloc("small", PAGE_SIZE).unwrap();
        ram.alloc("big", 8 * PAGE_SIZE).unwrap();
        ram.alloc("mid", 4 * PAGE_SIZE).unwrap();
        let mut names = Vec::new();
        ram.for_each_block(|b| names.push(b.name.clone()));
        assert_eq!(names, ["big", "mid", "small"]);
    }

    #[test_with_tracing::test]
    fn duplicate_name() {
        let ram = ram();
        ram.alloc("a", PAGE_SIZE).unwrap();
        let version = ram.version();
        assert!(matches!(
            ram.alloc("a", PAGE_SIZE),
            Err(RamError::DuplicateName(_))
        ));
        assert_eq!(ram.version(), version);
    }

    #[test_with_tracing::test]
    fn sizes_are_page_aligned() {
        let ram = ram();
        ram.alloc("a", 1).unwrap();
        ram.for_each_block(|b| {
            assert_eq!(b.used_length, host_mmap::page_size() as u64);
            assert_eq!(b.max_length, host_mmap::page_size() as u64);
        });
        assert!(matches!(
            ram.alloc("zero", 0),
            Err(RamError::InvalidSize { .. })
        ));
    }

    #[test_with_tracing::test]
    fn new_blocks_are_dirty() {
        let ram = ram();
        let a = ram.alloc("a", 2 * PAGE_SIZE).unwrap();
        for client in DirtyClient::ALL {
            assert!(ram.is_dirty(a, client));
            assert!(ram.is_dirty(a + PAGE_SIZE, client));
        }
        ram.clear_dirty_range(a, 2 * PAGE_SIZE, DirtyClient::Vga);
        assert!(!ram.is_dirty(a, DirtyClient::Vga));
        assert!(ram.range_includes_clean(a, PAGE_SIZE));
        ram.set_dirty_range_nocode(a, 1);
        assert!(ram.is_dirty(a, DirtyClient::Vga));
        assert!(ram.test_and_clear_dirty(a, PAGE_SIZE, DirtyClient::Migration));
        assert!(!ram.is_dirty(a, DirtyClient::Migration));
        ram.set_dirty_range(a, PAGE_SIZE);
        assert!(!ram.range_includes_clean(a, PAGE_SIZE));
    }

    #[test_with_tracing::test]
    fn write_marks_dirty_except_code() {
        let ram = ram();
        let a = ram.alloc("a", PAGE_SIZE).unwrap();
        for client in DirtyClient::ALL {
            ram.clear_dirty_range(a, PAGE_SIZE, client);
        }
        assert_eq!(ram.write_ram(a + 8, &[1, 2, 3, 4]), 4);
        assert!(ram.is_dirty(a, DirtyClient::Vga));
        assert!(ram.is_dirty(a, DirtyClient::Migration));
        assert!(!ram.is_dirty(a, DirtyClient::Code));
        let mut buf = [0; 4];
        assert_eq!(ram.read_ram(a + 8, &mut buf), 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test_with_tracing::test]
    fn notdirty_write_respects_tracking() {
        let ram = ram();
        let a = ram.alloc("a", PAGE_SIZE).unwrap();
        ram.clear_dirty_range(a, PAGE_SIZE, DirtyClient::Migration);
        ram.write_ram_notdirty(a, &[1]);
        assert!(!ram.is_dirty(a, DirtyClient::Migration));
        ram.set_dirty_tracking(true);
        ram.write_ram_notdirty(a, &[2]);
        assert!(ram.is_dirty(a, DirtyClient::Migration));
    }

    #[test_with_tracing::test]
    fn resize_resets_dirty() {
        let ram = ram();
        let seen = Arc::new(AtomicU64::new(0));
        let a = ram
            .alloc_resizeable(
                "vram",
                2 * PAGE_SIZE,
                4 * PAGE_SIZE,
                Arc::new({
                    let seen = seen.clone();
                    move |name: &str, size: u64| {
                        assert_eq!(name, "vram");
                        seen.store(size, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        ram.resize(a, PAGE_SIZE).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), PAGE_SIZE);
        assert!(ram.is_dirty(a, DirtyClient::Vga));
        assert!(!ram.is_dirty(a + PAGE_SIZE, DirtyClient::Vga));
        assert!(!ram.is_dirty(a + PAGE_SIZE, DirtyClient::Migration));

        ram.resize(a, 4 * PAGE_SIZE).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4 * PAGE_SIZE);
        assert!(ram.is_dirty(a + 3 * PAGE_SIZE, DirtyClient::Code));

        assert!(matches!(
            ram.resize(a, 5 * PAGE_SIZE),
            Err(RamError::TooLarge { .. })
        ));
        ram.for_each_block(|b| {
            assert_eq!(b.used_length, 4 * PAGE_SIZE);
            assert!(b.flags.resizeable);
        });
    }

    #[test_with_tracing::test]
    fn resize_fixed_block_fails() {
        let ram = ram();
        let a = ram.alloc("a", 2 * PAGE_SIZE).unwrap();
        ram.resize(a, 2 * PAGE_SIZE).unwrap();
        assert!(matches!(
            ram.resize(a, PAGE_SIZE),
            Err(RamError::NotResizeable(_))
        ));
        assert!(matches!(
            ram.resize(0x1234_0000, PAGE_SIZE),
            Err(RamError::NotFound(_))
        ));
    }

    #[test_with_tracing::test]
    fn host_pointers() {
        let ram = ram();
        let a = ram.alloc("a", 2 * PAGE_SIZE).unwrap();
        let b = ram.alloc("b", PAGE_SIZE).unwrap();
        let host = ram.host_ptr(a + 0x10);
        assert_eq!(ram.ram_addr_from_host(host), Some(a + 0x10));
        let mut len = 3 * PAGE_SIZE;
        let p = ram.host_ptr_len(a + PAGE_SIZE, &mut len);
        assert_eq!(len, PAGE_SIZE);
        assert_eq!(ram.ram_addr_from_host(p), Some(a + PAGE_SIZE));
        assert_eq!(ram.ram_addr_from_host(ram.host_ptr(b)), Some(b));
        assert_eq!(ram.ram_addr_from_host(std::ptr::null()), None);
    }

    #[test_with_tracing::test]
    #[should_panic(expected = "no ram block")]
    fn host_ptr_without_block() {
        ram().host_ptr(0x1000);
    }

    #[test_with_tracing::test]
    fn preallocated_block() {
        let ram = ram();
        let memory = host_mmap::Allocation::new(PAGE_SIZE as usize).unwrap();
        // SAFETY: `memory` outlives `ram`.
        let a = unsafe { ram.alloc_from_ptr("rom", PAGE_SIZE, memory.as_ptr()) }.unwrap();
        ram.write_ram(a, &[0xaa]);
        // SAFETY: the allocation is one page long.
        assert_eq!(unsafe { memory.as_ptr().read() }, 0xaa);
        ram.for_each_block(|b| {
            assert!(b.flags.preallocated);
            assert_eq!(b.host, memory.as_ptr());
        });
        ram.free(a);
        assert_eq!(ram.last_ram_offset(), 0);
        drop(ram);
    }

    #[test_with_tracing::test]
    #[should_panic(expected = "null host pointer")]
    fn preallocated_null() {
        // SAFETY: panics before the pointer is used.
        let _ = unsafe { ram().alloc_from_ptr("x", PAGE_SIZE, std::ptr::null_mut()) };
    }

    #[derive(Default)]
    struct CountingAllocator(AtomicU64);

    impl HostMemoryAllocator for CountingAllocator {
        fn allocate(&self, size: usize) -> io::Result<Box<dyn HostMemory>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            host_mmap::AnonymousAllocator.allocate(size)
        }
    }

    #[test_with_tracing::test]
    fn custom_allocator_is_used() {
        let allocator = Arc::new(CountingAllocator::default());
        struct Shared(Arc<CountingAllocator>);
        impl HostMemoryAllocator for Shared {
            fn allocate(&self, size: usize) -> io::Result<Box<dyn HostMemory>> {
                self.0.allocate(size)
            }
        }
        let ram = RamList::new(config(), Some(Box::new(Shared(allocator.clone()))));
        ram.alloc("a", PAGE_SIZE).unwrap();
        ram.alloc("b", PAGE_SIZE).unwrap();
        assert_eq!(allocator.0.load(Ordering::SeqCst), 2);
    }

    #[cfg(unix)]
    #[test_with_tracing::test]
    fn remap_zeroes_range() {
        let ram = ram();
        let a = ram.alloc("a", 2 * PAGE_SIZE).unwrap();
        ram.write_ram(a, &[1]);
        ram.write_ram(a + PAGE_SIZE, &[2]);
        let page = host_mmap::page_size() as u64;
        ram.remap(a, page).unwrap();
        let mut buf = [0xff];
        ram.read_ram(a, &mut buf);
        assert_eq!(buf, [0]);
        if page == PAGE_SIZE {
            ram.read_ram(a + PAGE_SIZE, &mut buf);
            assert_eq!(buf, [2]);
        }
        assert!(ram.remap(a, 16 * PAGE_SIZE).is_err());
    }

    #[cfg(unix)]
    #[test_with_tracing::test]
    fn file_backed_block() {
        let config = RamConfig {
            mem_path: Some(std::env::temp_dir()),
            ..config()
        };
        let ram = RamList::new(config, None);
        let a = ram.alloc("file", 2 * PAGE_SIZE).unwrap();
        let b = ram.alloc_from_file("shared", PAGE_SIZE, true).unwrap();
        assert_ne!(a, b);
        ram.write_ram(b, &[7]);
        let mut buf = [0];
        ram.read_ram(b, &mut buf);
        assert_eq!(buf, [7]);
        let mut shared = Vec::new();
        ram.for_each_block(|blk| shared.push((blk.name.clone(), blk.flags.shared)));
        assert!(shared.contains(&("shared".to_owned(), true)));
        assert!(shared.contains(&("file".to_owned(), false)));
        ram.remap(b, host_mmap::page_size() as u64).unwrap();
    }

    #[cfg(unix)]
    #[test_with_tracing::test]
    fn file_backing_needs_path() {
        assert!(matches!(
            ram().alloc_from_file("f", PAGE_SIZE, false),
            Err(RamError::NoMemPath)
        ));
    }
}
