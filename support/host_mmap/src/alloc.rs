// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Anonymous and borrowed host memory.

use crate::HostMemory;
use std::io;
use std::ptr::NonNull;
#[cfg(unix)]
use unix as sys;
#[cfg(windows)]
use windows as sys;

/// A private anonymous allocation, released on drop.
#[derive(Debug)]
pub struct Allocation {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the allocation is exclusively owned by this object and the pointer
// is only a handle to it; access synchronization is the caller's concern.
unsafe impl Send for Allocation {}
// SAFETY: see above.
unsafe impl Sync for Allocation {}

impl Allocation {
    /// Allocates `size` bytes of zeroed memory.
    pub fn new(size: usize) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "allocation size must be greater than 0",
            ));
        }
        let ptr = sys::alloc(size)?;
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Allocation { ptr, size })
    }
}

impl HostMemory for Allocation {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        // SAFETY: the pointer and size came from `sys::alloc` and nothing else
        // references the allocation anymore.
        unsafe {
            sys::free(self.ptr.as_ptr(), self.size);
        }
    }
}

/// Host memory owned by someone else, for example memory handed to the VMM
/// by an accelerator. Dropping it does not free anything.
#[derive(Debug)]
pub struct BorrowedMemory {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: the owner guarantees the memory outlives this object; the pointer
// is only a handle.
unsafe impl Send for BorrowedMemory {}
// SAFETY: see above.
unsafe impl Sync for BorrowedMemory {}

impl BorrowedMemory {
    /// Wraps an externally owned range.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + size` must be valid for reads and writes for as long as the
    /// returned object (and anything derived from it) is alive.
    pub unsafe fn new(ptr: NonNull<u8>, size: usize) -> Self {
        Self { ptr, size }
    }
}

impl HostMemory for BorrowedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.size
    }
}

#[cfg(windows)]
mod windows {
    use std::ptr;
    use windows_sys::Win32::System::Memory::VirtualAlloc;
    use windows_sys::Win32::System::Memory::VirtualFree;
    use windows_sys::Win32::System::Memory::MEM_COMMIT;
    use windows_sys::Win32::System::Memory::MEM_RELEASE;
    use windows_sys::Win32::System::Memory::MEM_RESERVE;
    use windows_sys::Win32::System::Memory::PAGE_READWRITE;

    pub fn alloc(size: usize) -> std::io::Result<*mut u8> {
        // SAFETY: reserving and committing a fresh range has no preconditions.
        let ptr = unsafe {
            VirtualAlloc(
                ptr::null(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ptr.cast::<u8>())
    }

    /// # Safety
    /// `ptr` must have been returned by `alloc` and not freed yet.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        // SAFETY: guaranteed by caller.
        let ret = unsafe { VirtualFree(ptr.cast(), 0, MEM_RELEASE) };
        assert!(ret != 0);
    }
}

#[cfg(unix)]
mod unix {
    use std::ptr;

    pub fn alloc(size: usize) -> std::io::Result<*mut u8> {
        // SAFETY: mapping a new anonymous range has no preconditions.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(ptr.cast::<u8>())
    }

    /// # Safety
    /// `ptr..ptr + size` must have been returned by `alloc` and not freed yet.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        // SAFETY: guaranteed by caller.
        let ret = unsafe { libc::munmap(ptr.cast::<libc::c_void>(), size) };
        assert!(ret == 0);
    }
}
