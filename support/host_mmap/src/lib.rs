// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host memory backings for guest RAM.
//!
//! Guest RAM blocks are backed by host virtual memory obtained through a
//! [`HostMemoryAllocator`]. The default allocator hands out private anonymous
//! mappings; callers with unusual needs (an accelerator that must own the
//! memory, a test that wants to count allocations) can substitute their own.
//! File-backed memory (for huge pages on a `hugetlbfs` mount) and memory that
//! was allocated elsewhere and merely borrowed are also represented as
//! [`HostMemory`] so that the RAM block list can treat all three uniformly.

// UNSAFETY: Calling mmap/munmap/madvise and handing out raw host pointers.
#![expect(unsafe_code)]

pub mod alloc;
#[cfg(unix)]
pub mod unix;

pub use alloc::Allocation;
pub use alloc::BorrowedMemory;

use std::fmt::Debug;
use std::io;

/// A range of host virtual memory that backs guest RAM.
///
/// The memory stays valid and at the same address for the lifetime of the
/// object and is released when it is dropped.
pub trait HostMemory: Debug + Send + Sync {
    /// The start of the range.
    fn as_ptr(&self) -> *mut u8;

    /// The length of the range in bytes.
    fn len(&self) -> usize;

    /// Returns true if the range is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A replaceable allocator for guest RAM host memory.
pub trait HostMemoryAllocator: Send + Sync {
    /// Allocates `size` bytes of zeroed, readable and writable host memory.
    fn allocate(&self, size: usize) -> io::Result<Box<dyn HostMemory>>;
}

/// The default allocator: private anonymous mappings.
#[derive(Debug, Default, Copy, Clone)]
pub struct AnonymousAllocator;

impl HostMemoryAllocator for AnonymousAllocator {
    fn allocate(&self, size: usize) -> io::Result<Box<dyn HostMemory>> {
        Ok(Box::new(Allocation::new(size)?))
    }
}

/// Hints that can be applied to a host memory range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Advice {
    /// Allow the kernel to merge identical pages.
    Mergeable,
    /// Exclude the range from core dumps.
    DontDump,
    /// Prefer transparent huge pages.
    HugePage,
    /// Do not make the range available to forked children.
    DontFork,
}

/// Applies `advice` to the host range `ptr..ptr + len`.
///
/// Advice is best effort. Platforms that do not support a given hint return
/// `Ok(())` without doing anything.
pub fn advise(ptr: *mut u8, len: usize, advice: Advice) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        unix::advise(ptr, len, advice)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (ptr, len, advice);
        Ok(())
    }
}

/// Returns the host page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unix::page_size()
    }
    #[cfg(not(unix))]
    {
        4096
    }
}
