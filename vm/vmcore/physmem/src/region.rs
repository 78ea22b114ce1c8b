// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The region capability consumed by the dispatcher, plus the regions the
//! dispatcher provides itself.

use crate::ram::RamList;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The byte order a region uses for the values passed to
/// [`MemoryRegion::read`] and [`MemoryRegion::write`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Endianness {
    /// The guest's native order (little endian).
    #[default]
    Native,
    /// Little endian.
    Little,
    /// Big endian.
    Big,
}

impl Endianness {
    pub(crate) fn is_big(self) -> bool {
        matches!(self, Endianness::Big)
    }
}

/// The access sizes a region supports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AccessSize {
    /// The smallest access the region handles. Narrower guest accesses are
    /// widened. Zero means 1.
    pub min: u32,
    /// The largest access the region handles. Wider guest accesses are split.
    /// Zero means 4.
    pub max: u32,
    /// Whether accesses may be unaligned with respect to their size.
    pub unaligned: bool,
}

impl Default for AccessSize {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            unaligned: false,
        }
    }
}

impl AccessSize {
    pub(crate) fn min_bytes(&self) -> u64 {
        self.min.clamp(1, 8).into()
    }

    pub(crate) fn max_bytes(&self) -> u64 {
        if self.max == 0 {
            4
        } else {
            self.max.min(8).into()
        }
    }
}

/// An error reported by a region for a single access.
#[derive(Debug, Error)]
pub enum IoError {
    /// There is no register at the accessed offset.
    #[error("invalid register")]
    InvalidRegister,
    /// The access length is invalid for the offset.
    #[error("invalid access size")]
    InvalidAccessSize,
    /// The region does not support unaligned accesses.
    #[error("unaligned access")]
    UnalignedAccess,
    /// The region declined the access in [`MemoryRegion::accepts`].
    #[error("access rejected")]
    Rejected,
}

/// A range of guest physical address space with a backing capability: RAM, a
/// device's registers, or a hole.
pub trait MemoryRegion: Send + Sync {
    /// The region's name, for diagnostics.
    fn name(&self) -> &str;

    /// The region's size in bytes.
    fn size(&self) -> u64;

    /// If the region is backed by guest RAM, the offset of its first byte in
    /// the RAM address space. Accesses to such regions bypass
    /// [`MemoryRegion::read`] and [`MemoryRegion::write`].
    fn ram_addr(&self) -> Option<u64> {
        None
    }

    /// Whether guest writes must not reach the RAM behind the region.
    fn is_readonly(&self) -> bool {
        false
    }

    fn access_size(&self) -> AccessSize {
        AccessSize::default()
    }

    fn endianness(&self) -> Endianness {
        Endianness::Native
    }

    /// Returns whether an access of `size` bytes at `offset` is valid.
    fn accepts(&self, offset: u64, size: u32, is_write: bool) -> bool {
        let _ = (offset, size, is_write);
        true
    }

    /// Reads `size` bytes at `offset`. `size` is a power of two no larger than
    /// eight, within the region's declared limits.
    fn read(&self, offset: u64, size: u32) -> Result<u64, IoError>;

    /// Writes the low `size` bytes of `value` at `offset`.
    fn write(&self, offset: u64, size: u32, value: u64) -> Result<(), IoError>;
}

/// Guest RAM or ROM backed by a RAM block.
pub struct RamRegion {
    name: String,
    ram: Arc<RamList>,
    ram_addr: u64,
    size: Arc<AtomicU64>,
    readonly: bool,
}

impl RamRegion {
    pub(crate) fn new(
        name: String,
        ram: Arc<RamList>,
        ram_addr: u64,
        size: Arc<AtomicU64>,
        readonly: bool,
    ) -> Self {
        Self {
            name,
            ram,
            ram_addr,
            size,
            readonly,
        }
    }
}

impl std::fmt::Debug for RamRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RamRegion")
            .field("name", &self.name)
            .field("ram_addr", &self.ram_addr)
            .field("size", &self.size())
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl MemoryRegion for RamRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    fn ram_addr(&self) -> Option<u64> {
        Some(self.ram_addr)
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn access_size(&self) -> AccessSize {
        AccessSize {
            min: 1,
            max: 8,
            unaligned: true,
        }
    }

    fn read(&self, offset: u64, size: u32) -> Result<u64, IoError> {
        let mut value = [0; 8];
        self.ram
            .read_ram(self.ram_addr + offset, &mut value[..size as usize]);
        Ok(u64::from_le_bytes(value))
    }

    fn write(&self, offset: u64, size: u32, value: u64) -> Result<(), IoError> {
        if self.readonly {
            tracing::trace!(name = %self.name, offset, size, "ignoring write to rom");
            return Ok(());
        }
        self.ram.write_ram(
            self.ram_addr + offset,
            &value.to_le_bytes()[..size as usize],
        );
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SentinelKind {
    Unassigned,
    NotDirty,
    Rom,
    Watch,
}

/// A region occupying one of the reserved section slots.
#[derive(Debug)]
struct SentinelRegion(SentinelKind);

impl MemoryRegion for SentinelRegion {
    fn name(&self) -> &str {
        match self.0 {
            SentinelKind::Unassigned => "unassigned",
            SentinelKind::NotDirty => "notdirty",
            SentinelKind::Rom => "rom",
            SentinelKind::Watch => "watch",
        }
    }

    fn size(&self) -> u64 {
        u64::MAX
    }

    fn access_size(&self) -> AccessSize {
        AccessSize {
            min: 1,
            max: 8,
            unaligned: true,
        }
    }

    fn accepts(&self, _offset: u64, _size: u32, _is_write: bool) -> bool {
        self.0 != SentinelKind::Unassigned
    }

    fn read(&self, _offset: u64, _size: u32) -> Result<u64, IoError> {
        match self.0 {
            SentinelKind::Unassigned => Err(IoError::InvalidRegister),
            SentinelKind::NotDirty | SentinelKind::Rom | SentinelKind::Watch => Ok(0),
        }
    }

    fn write(&self, _offset: u64, _size: u32, _value: u64) -> Result<(), IoError> {
        match self.0 {
            SentinelKind::Unassigned => Err(IoError::InvalidRegister),
            SentinelKind::NotDirty | SentinelKind::Rom | SentinelKind::Watch => Ok(()),
        }
    }
}

/// The regions behind the four reserved section slots, in slot order.
pub(crate) struct Sentinels([Arc<dyn MemoryRegion>; 4]);

impl Sentinels {
    pub fn new() -> Self {
        Self([
            Arc::new(SentinelRegion(SentinelKind::Unassigned)),
            Arc::new(SentinelRegion(SentinelKind::NotDirty)),
            Arc::new(SentinelRegion(SentinelKind::Rom)),
            Arc::new(SentinelRegion(SentinelKind::Watch)),
        ])
    }

    pub fn regions(&self) -> &[Arc<dyn MemoryRegion>; 4] {
        &self.0
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test_with_tracing::test]
    fn access_size_defaults() {
        let zero = AccessSize {
            min: 0,
            max: 0,
            unaligned: false,
        };
        assert_eq!(zero.min_bytes(), 1);
        assert_eq!(zero.max_bytes(), 4);
        assert_eq!(AccessSize::default().max_bytes(), 4);
    }

    #[test_with_tracing::test]
    fn sentinels_in_slot_order() {
        let sentinels = Sentinels::new();
        let names: Vec<_> = sentinels.regions().iter().map(|r| r.name()).collect();
        assert_eq!(names, ["unassigned", "notdirty", "rom", "watch"]);
        let unassigned = &sentinels.regions()[0];
        assert!(!unassigned.accepts(0, 4, false));
        assert!(unassigned.read(0, 4).is_err());
        assert_eq!(sentinels.regions()[3].read(0x10, 4).unwrap(), 0);
        assert!(sentinels.regions().iter().all(|r| r.size() == u64::MAX));
    }
}
