// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Unix-only backings: file-backed memory, advice, and remapping.

#[cfg(target_os = "linux")]
use crate::Advice;
use crate::HostMemory;
use std::ffi::c_void;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::prelude::*;
use std::path::Path;
use std::ptr::null_mut;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let s = PAGE_SIZE.load(Ordering::Relaxed);
    if s != 0 {
        s
    } else {
        // SAFETY: sysconf has no preconditions.
        let s = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(s, Ordering::Relaxed);
        s
    }
}

#[cfg(target_os = "linux")]
const HUGETLBFS_MAGIC: u64 = 0x958458f6;

#[cfg(target_os = "linux")]
pub(crate) fn advise(ptr: *mut u8, len: usize, advice: Advice) -> io::Result<()> {
    let advice = match advice {
        Advice::Mergeable => libc::MADV_MERGEABLE,
        Advice::DontDump => libc::MADV_DONTDUMP,
        Advice::HugePage => libc::MADV_HUGEPAGE,
        Advice::DontFork => libc::MADV_DONTFORK,
    };
    // SAFETY: madvise only changes kernel hints for the range; it does not
    // change the contents or validity of the memory for these advice values.
    if unsafe { libc::madvise(ptr.cast::<c_void>(), len, advice) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Returns the block size of the file system containing `file`.
///
/// On a `hugetlbfs` mount this is the huge page size.
pub fn file_block_size(file: &File) -> io::Result<u64> {
    // SAFETY: statfs is a plain-old-data structure.
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: `buf` is a valid out pointer and the fd is open.
        let ret = unsafe { libc::fstatfs(file.as_raw_fd(), &mut buf) };
        if ret == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    #[cfg(target_os = "linux")]
    if buf.f_type as u64 != HUGETLBFS_MAGIC {
        tracing::warn!("memory backing file is not on a hugetlbfs mount");
    }
    Ok(buf.f_bsize as u64)
}

/// A mapping of an unlinked file, used to back guest RAM with huge pages or a
/// tmpfs file.
#[derive(Debug)]
pub struct FileMapping {
    ptr: *mut u8,
    len: usize,
    block_size: u64,
    shared: bool,
    file: File,
}

// SAFETY: the mapping is exclusively owned by this object.
unsafe impl Send for FileMapping {}
// SAFETY: see above.
unsafe impl Sync for FileMapping {}

impl FileMapping {
    /// Creates a file under `dir`, unlinks it, and maps at least `size` bytes
    /// of it, rounded up to the file system's block size.
    ///
    /// If `prefault` is set, every block is touched before returning so that
    /// later guest accesses never fault in huge pages.
    pub fn new(dir: &Path, size: usize, shared: bool, prefault: bool) -> io::Result<Self> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let path = dir.join(format!(
            "physmem_back_mem.{}.{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;
        std::fs::remove_file(&path)?;

        let block_size = file_block_size(&file)?.max(page_size() as u64);
        let len = (size as u64)
            .checked_next_multiple_of(block_size)
            .ok_or(io::ErrorKind::InvalidInput)?;
        file.set_len(len)?;
        let len = len as usize;

        let flags = if shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        // SAFETY: mapping a new range of a file we own.
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let this = Self {
            ptr: ptr.cast(),
            len,
            block_size,
            shared,
            file,
        };
        if prefault {
            this.prefault();
        }
        tracing::debug!(
            path = %path.display(),
            len,
            block_size,
            shared,
            "mapped file-backed memory"
        );
        Ok(this)
    }

    fn prefault(&self) {
        let mut offset = 0;
        while offset < self.len {
            // SAFETY: offset is within the mapping, which is readable and
            // writable. Rewriting the byte that is already there is harmless.
            unsafe {
                let p = self.ptr.add(offset);
                p.write_volatile(p.read_volatile());
            }
            offset += self.block_size as usize;
        }
    }

    /// The block size of the backing file system.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Replaces `offset..offset + len` of the mapping with a fresh mapping of
    /// the same file range.
    ///
    /// # Safety
    ///
    /// No one may be relying on the current contents of the range.
    pub unsafe fn remap(&self, offset: usize, len: usize) -> io::Result<()> {
        check_range(self.len, offset, len)?;
        let flags = if self.shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        // SAFETY: the range is inside our mapping, and the caller guarantees
        // its contents may be discarded.
        unsafe {
            map_fixed(
                self.ptr.add(offset),
                len,
                flags,
                self.file.as_raw_fd(),
                offset as i64,
            )
        }
    }
}

impl AsFd for FileMapping {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl HostMemory for FileMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for FileMapping {
    fn drop(&mut self) {
        // SAFETY: the range was mapped in `new` and is no longer referenced.
        let ret = unsafe { libc::munmap(self.ptr.cast::<c_void>(), self.len) };
        assert!(ret == 0);
    }
}

/// Replaces the anonymous memory at `ptr..ptr + len` with fresh zeroed
/// memory.
///
/// # Safety
///
/// The range must be part of a private anonymous mapping owned by the caller,
/// and no one may be relying on its current contents.
pub unsafe fn remap_anonymous(ptr: *mut u8, len: usize) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    unsafe { map_fixed(ptr, len, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, -1, 0) }
}

fn check_range(total: usize, offset: usize, len: usize) -> io::Result<()> {
    let end = offset.checked_add(len).ok_or(io::ErrorKind::InvalidInput)?;
    let page_size = page_size();
    if offset % page_size != 0 || len % page_size != 0 || end > total {
        return Err(io::ErrorKind::InvalidInput.into());
    }
    Ok(())
}

/// # Safety
/// `ptr..ptr + len` must be an owned mapping whose contents may be discarded.
unsafe fn map_fixed(ptr: *mut u8, len: usize, flags: i32, fd: i32, offset: i64) -> io::Result<()> {
    // SAFETY: guaranteed by caller.
    let area = unsafe {
        libc::mmap(
            ptr.cast::<c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    if area == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    assert_eq!(area.cast::<u8>(), ptr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Allocation;

    #[test_with_tracing::test]
    fn file_mapping_round_trip() {
        let dir = std::env::temp_dir();
        let mapping = FileMapping::new(&dir, 3 * page_size(), false, true).unwrap();
        assert!(mapping.len() >= 3 * page_size());
        assert_eq!(mapping.len() as u64 % mapping.block_size(), 0);
        // SAFETY: the mapping is at least three pages long.
        unsafe {
            mapping.as_ptr().add(page_size()).write(7);
            assert_eq!(mapping.as_ptr().add(page_size()).read(), 7);
        }
    }

    #[test_with_tracing::test]
    fn remap_anonymous_zeroes() {
        let alloc = Allocation::new(2 * page_size()).unwrap();
        // SAFETY: the allocation is two pages long and owned by this test.
        unsafe {
            alloc.as_ptr().write(1);
            alloc.as_ptr().add(page_size()).write(2);
            remap_anonymous(alloc.as_ptr(), page_size()).unwrap();
            assert_eq!(alloc.as_ptr().read(), 0);
            assert_eq!(alloc.as_ptr().add(page_size()).read(), 2);
        }
    }

    #[test_with_tracing::test]
    fn remap_rejects_unaligned() {
        let dir = std::env::temp_dir();
        let mapping = FileMapping::new(&dir, page_size(), true, false).unwrap();
        // SAFETY: nothing depends on the mapping contents.
        let err = unsafe { mapping.remap(1, page_size()) }.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
