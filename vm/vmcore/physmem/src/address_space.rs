// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address spaces: topology updates and the translation and transfer paths.

use crate::dispatch::Dispatch;
use crate::page_map::RegionSection;
use crate::ram::RamList;
use crate::region::AccessSize;
use crate::region::IoError;
use crate::region::MemoryRegion;
use crate::region::Sentinels;
use crate::PAGE_SIZE;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Returned when one or more chunks of a transfer failed. The rest of the
/// transfer was still performed; failed reads read as all ones.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{failed} access chunk(s) failed, first at {gpa:#x}")]
pub struct AccessError {
    gpa: u64,
    failed: usize,
}

impl AccessError {
    /// The guest physical address of the first failed chunk.
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    /// The number of chunks that failed.
    pub fn failed_chunks(&self) -> usize {
        self.failed
    }
}

#[derive(Default)]
struct Failures(Option<AccessError>);

impl Failures {
    fn record(&mut self, gpa: u64, failed: usize) {
        match &mut self.0 {
            Some(err) => err.failed += failed,
            None => self.0 = Some(AccessError { gpa, failed }),
        }
    }

    fn into_result(self) -> Result<(), AccessError> {
        self.0.map_or(Ok(()), Err)
    }
}

/// The result of [`AddressSpace::translate`].
pub struct Translation {
    pub region: Arc<dyn MemoryRegion>,
    /// The offset of the address within `region`.
    pub offset: u64,
    /// The number of bytes from the address that stay within one section.
    pub len: u64,
    /// Whether the access can go straight to host RAM.
    pub direct: bool,
}

impl std::fmt::Debug for Translation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translation")
            .field("region", &self.region.name())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("direct", &self.direct)
            .finish()
    }
}

pub(crate) enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Transfer<'_> {
    fn len(&self) -> usize {
        match self {
            Transfer::Read(buf) => buf.len(),
            Transfer::Write(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Transfer::Write(_))
    }
}

/// Returns the RAM address of `offset` within `region` if an access can bypass
/// the region's callbacks.
fn direct_ram(region: &dyn MemoryRegion, offset: u64, is_write: bool) -> Option<u64> {
    if is_write && region.is_readonly() {
        return None;
    }
    region.ram_addr().map(|base| base + offset)
}

/// Picks the size of the next device access for a remaining length of `len`
/// bytes at `offset`.
///
/// The result is a power of two, at most the region's maximum, aligned to
/// `offset` unless the region allows unaligned accesses, and (when narrower
/// than the region's minimum) contained in one minimum-sized unit.
pub(crate) fn access_size(access: &AccessSize, offset: u64, len: u64) -> u64 {
    debug_assert!(len != 0);
    let mut max = access.max_bytes();
    if !access.unaligned {
        let align = offset & offset.wrapping_neg();
        if align != 0 && align < max {
            max = align;
        }
    }
    let mut size = len.min(max);
    let min = access.min_bytes();
    if size < min {
        size = size.min(min - (offset & (min - 1)));
    }
    1 << size.ilog2()
}

fn value_mask(size: u64) -> u64 {
    u64::MAX >> (64 - size * 8)
}

fn swap(value: u64, size: u64) -> u64 {
    value.swap_bytes() >> (64 - size * 8)
}

/// Where a `size`-byte field at `within` sits inside a `min`-byte value.
fn lane_shift(big_endian: bool, min: u64, within: u64, size: u64) -> u64 {
    if big_endian {
        (min - size - within) * 8
    } else {
        within * 8
    }
}

/// Reads a device register, returning the value in guest byte order.
fn io_read(region: &dyn MemoryRegion, offset: u64, size: u64) -> Result<u64, IoError> {
    if !region.accepts(offset, size as u32, false) {
        return Err(IoError::Rejected);
    }
    let min = region.access_size().min_bytes();
    let big = region.endianness().is_big();
    let value = if size < min {
        let base = offset & !(min - 1);
        let shift = lane_shift(big, min, offset - base, size);
        (region.read(base, min as u32)? >> shift) & value_mask(size)
    } else {
        region.read(offset, size as u32)?
    };
    Ok(if big { swap(value, size) } else { value })
}

/// Writes a device register from a value in guest byte order.
fn io_write(
    region: &dyn MemoryRegion,
    offset: u64,
    size: u64,
    value: u64,
) -> Result<(), IoError> {
    if !region.accepts(offset, size as u32, true) {
        return Err(IoError::Rejected);
    }
    let min = region.access_size().min_bytes();
    let big = region.endianness().is_big();
    let value = if big { swap(value, size) } else { value };
    if size < min {
        let base = offset & !(min - 1);
        let shift = lane_shift(big, min, offset - base, size);
        let mask = value_mask(size) << shift;
        let old = region.read(base, min as u32)?;
        region.write(base, min as u32, (old & !mask) | ((value << shift) & mask))
    } else {
        region.write(offset, size as u32, value)
    }
}

/// A guest physical address space.
///
/// Readers work on an immutable snapshot of the dispatch tree. Topology
/// updates build a new tree between [`AddressSpace::begin`] and
/// [`AddressSpace::commit`] and publish it atomically; accesses already in
/// flight finish on the tree they started with.
pub struct AddressSpace {
    name: Arc<str>,
    ram: Arc<RamList>,
    sentinels: Arc<Sentinels>,
    active: RwLock<Arc<Dispatch>>,
    pending: Mutex<Option<Dispatch>>,
}

impl AddressSpace {
    pub(crate) fn new(name: &str, ram: Arc<RamList>, sentinels: Arc<Sentinels>) -> Self {
        let empty = Dispatch::new(&sentinels);
        Self {
            name: name.into(),
            ram,
            sentinels,
            active: RwLock::new(Arc::new(empty)),
            pending: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn ram(&self) -> &RamList {
        &self.ram
    }

    fn dispatch(&self) -> Arc<Dispatch> {
        self.active.read().clone()
    }

    /// Starts building a new topology. An unfinished one is discarded.
    pub fn begin(&self) {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            tracing::debug!(
                address_space = %self.name,
                "discarding unfinished topology update"
            );
        }
        *pending = Some(Dispatch::new(&self.sentinels));
    }

    /// Adds a section to the topology under construction. Later sections win
    /// where they overlap earlier ones.
    ///
    /// Panics if no update is in progress.
    #[track_caller]
    pub fn region_add(&self, section: &RegionSection) {
        let mut pending = self.pending.lock();
        let Some(next) = pending.as_mut() else {
            panic!("{}: region_add without begin", self.name);
        };
        if section.size == 0 {
            return;
        }
        tracing::trace!(address_space = %self.name, ?section, "adding section");
        next.add_section(section);
    }

    /// Publishes the topology under construction.
    ///
    /// Panics if no update is in progress.
    #[track_caller]
    pub fn commit(&self) {
        let next = self.pending.lock().take();
        let Some(mut next) = next else {
            panic!("{}: commit without begin", self.name);
        };
        next.compact();
        tracing::debug!(
            address_space = %self.name,
            sections = next.section_count(),
            nodes = next.node_count(),
            "committing topology"
        );
        let old = std::mem::replace(&mut *self.active.write(), Arc::new(next));
        // Freed here unless a reader still holds it.
        drop(old);
    }

    /// Replaces the whole topology with `sections`.
    pub fn update<'a>(&self, sections: impl IntoIterator<Item = &'a RegionSection>) {
        self.begin();
        for section in sections {
            self.region_add(section);
        }
        self.commit();
    }

    /// Resolves `addr` to a region. The returned length is at most `len` and
    /// never crosses into another section.
    pub fn translate(&self, addr: u64, len: u64, is_write: bool) -> Translation {
        let dispatch = self.dispatch();
        let (region, offset, len) = dispatch.translate(addr, len);
        Translation {
            direct: direct_ram(region.as_ref(), offset, is_write).is_some(),
            region: region.clone(),
            offset,
            len,
        }
    }

    pub(crate) fn transfer(&self, addr: u64, mut data: Transfer<'_>) -> Result<(), AccessError> {
        let dispatch = self.dispatch();
        let is_write = data.is_write();
        let total = data.len();
        let mut failures = Failures::default();
        let mut done = 0;
        while done < total {
            let gpa = addr.wrapping_add(done as u64);
            let (region, offset, len) = dispatch.translate(gpa, (total - done) as u64);
            let region = region.as_ref();
            if let Some(ram_addr) = direct_ram(region, offset, is_write) {
                let range = done..done + len as usize;
                done += match &mut data {
                    Transfer::Read(buf) => self.ram.read_ram(ram_addr, &mut buf[range]),
                    Transfer::Write(buf) => self.ram.write_ram(ram_addr, &buf[range]),
                };
                continue;
            }

            let size = access_size(&region.access_size(), offset, len);
            let range = done..done + size as usize;
            let result = match &mut data {
                Transfer::Read(buf) => io_read(region, offset, size).map(|value| {
                    buf[range.clone()].copy_from_slice(&value.to_le_bytes()[..range.len()])
                }),
                Transfer::Write(buf) => {
                    let mut value = [0; 8];
                    value[..range.len()].copy_from_slice(&buf[range.clone()]);
                    io_write(region, offset, size, u64::from_le_bytes(value))
                }
            };
            if let Err(err) = result {
                tracing::trace!(
                    address_space = %self.name,
                    region = region.name(),
                    gpa,
                    size,
                    is_write,
                    error = &err as &dyn std::error::Error,
                    "device access failed"
                );
                if let Transfer::Read(buf) = &mut data {
                    buf[range].fill(!0);
                }
                failures.record(gpa, 1);
            }
            done += size as usize;
        }
        failures.into_result()
    }

    /// Reads or writes `buf` at `addr`, splitting the access at section
    /// boundaries and into sizes each device accepts.
    pub fn read_write(
        &self,
        addr: u64,
        buf: &mut [u8],
        is_write: bool,
    ) -> Result<(), AccessError> {
        if is_write {
            self.transfer(addr, Transfer::Write(buf))
        } else {
            self.transfer(addr, Transfer::Read(buf))
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        self.transfer(addr, Transfer::Read(buf))
    }

    pub fn write(&self, addr: u64, buf: &[u8]) -> Result<(), AccessError> {
        self.transfer(addr, Transfer::Write(buf))
    }

    /// Writes `len` copies of `value` starting at `addr`.
    pub fn fill(&self, addr: u64, value: u8, len: u64) -> Result<(), AccessError> {
        let buf = [value; PAGE_SIZE as usize];
        let mut failures = Failures::default();
        let mut done = 0;
        while done < len {
            let n = (len - done).min(PAGE_SIZE);
            if let Err(err) = self.write(addr.wrapping_add(done), &buf[..n as usize]) {
                failures.record(err.gpa, err.failed);
            }
            done += n;
        }
        failures.into_result()
    }

    /// Writes `buf` into RAM and ROM at `addr`, for loading firmware images.
    /// Parts of the range that are not RAM-backed are skipped.
    pub fn write_rom(&self, addr: u64, buf: &[u8]) {
        let dispatch = self.dispatch();
        let mut done = 0;
        while done < buf.len() {
            let gpa = addr.wrapping_add(done as u64);
            let (region, offset, len) = dispatch.translate(gpa, (buf.len() - done) as u64);
            done += match region.ram_addr() {
                Some(base) => self
                    .ram
                    .write_ram(base + offset, &buf[done..done + len as usize]),
                None => len as usize,
            };
        }
    }

    /// Returns whether every device access needed for `len` bytes at `addr`
    /// would be accepted.
    pub fn access_valid(&self, addr: u64, len: u64, is_write: bool) -> bool {
        let dispatch = self.dispatch();
        let mut done = 0;
        while done < len {
            let gpa = addr.wrapping_add(done);
            let (region, offset, len) = dispatch.translate(gpa, len - done);
            let region = region.as_ref();
            if direct_ram(region, offset, is_write).is_some() {
                done += len;
                continue;
            }
            let size = access_size(&region.access_size(), offset, len);
            if !region.accepts(offset, size as u32, is_write) {
                return false;
            }
            done += size;
        }
        true
    }

    /// Returns whether `addr` is backed by something other than RAM.
    pub fn is_io(&self, addr: u64) -> bool {
        let dispatch = self.dispatch();
        dispatch.translate(addr, 1).0.ram_addr().is_none()
    }
}
