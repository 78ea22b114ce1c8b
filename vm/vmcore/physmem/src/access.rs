// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-width accessors on [`AddressSpace`].

use crate::address_space::AccessError;
use crate::address_space::AddressSpace;
use crate::region::Endianness;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

impl AddressSpace {
    fn load<const N: usize>(
        &self,
        addr: u64,
        endianness: Endianness,
    ) -> Result<[u8; N], AccessError> {
        let mut bytes = [0; N];
        self.read(addr, &mut bytes)?;
        if endianness.is_big() {
            bytes.reverse();
        }
        Ok(bytes)
    }

    /// Stores `bytes`, given in little-endian order, with the requested byte
    /// order.
    fn store<const N: usize>(
        &self,
        addr: u64,
        mut bytes: [u8; N],
        endianness: Endianness,
    ) -> Result<(), AccessError> {
        if endianness.is_big() {
            bytes.reverse();
        }
        self.write(addr, &bytes)
    }

    pub fn load_u8(&self, addr: u64) -> Result<u8, AccessError> {
        self.load::<1>(addr, Endianness::Native).map(|[b]| b)
    }

    pub fn load_u16(&self, addr: u64, endianness: Endianness) -> Result<u16, AccessError> {
        self.load(addr, endianness).map(u16::from_le_bytes)
    }

    pub fn load_u32(&self, addr: u64, endianness: Endianness) -> Result<u32, AccessError> {
        self.load(addr, endianness).map(u32::from_le_bytes)
    }

    pub fn load_u64(&self, addr: u64, endianness: Endianness) -> Result<u64, AccessError> {
        self.load(addr, endianness).map(u64::from_le_bytes)
    }

    pub fn store_u8(&self, addr: u64, value: u8) -> Result<(), AccessError> {
        self.write(addr, &[value])
    }

    pub fn store_u16(
        &self,
        addr: u64,
        value: u16,
        endianness: Endianness,
    ) -> Result<(), AccessError> {
        self.store(addr, value.to_le_bytes(), endianness)
    }

    pub fn store_u32(
        &self,
        addr: u64,
        value: u32,
        endianness: Endianness,
    ) -> Result<(), AccessError> {
        self.store(addr, value.to_le_bytes(), endianness)
    }

    pub fn store_u64(
        &self,
        addr: u64,
        value: u64,
        endianness: Endianness,
    ) -> Result<(), AccessError> {
        self.store(addr, value.to_le_bytes(), endianness)
    }

    /// Stores a 32-bit value without marking the page dirty, unless dirty
    /// tracking is enabled. Used for page table accessed and dirty bits.
    ///
    /// Falls back to an ordinary store if the target is not writable RAM.
    pub fn store_u32_notdirty(&self, addr: u64, value: u32) -> Result<(), AccessError> {
        let t = self.translate(addr, 4, true);
        match t.region.ram_addr() {
            Some(base) if t.direct && t.len == 4 => {
                self.ram()
                    .write_ram_notdirty(base + t.offset, &value.to_le_bytes());
                Ok(())
            }
            _ => self.store_u32(addr, value, Endianness::Native),
        }
    }

    /// Reads a plain-old-data value.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, addr: u64) -> Result<T, AccessError> {
        let mut value = T::new_zeroed();
        self.read(addr, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes a plain-old-data value.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        addr: u64,
        value: &T,
    ) -> Result<(), AccessError> {
        self.write(addr, value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use crate::page_map::RegionSection;
    use crate::region::Endianness;
    use crate::region::MemoryRegion;
    use crate::DirtyClient;
    use crate::MemorySystem;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    #[repr(C)]
    #[derive(Debug, Default, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
    struct Descriptor {
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    }

    #[test_with_tracing::test]
    fn typed_round_trip() {
        let sys = MemorySystem::new();
        let space = sys.address_space("memory");
        let ram = sys.ram_region("ram", 0x1000).unwrap();
        space.update(&[RegionSection::new(ram, 0)]);

        space.store_u16(0x10, 0x1234, Endianness::Big).unwrap();
        assert_eq!(space.load_u8(0x10).unwrap(), 0x12);
        assert_eq!(space.load_u16(0x10, Endianness::Little).unwrap(), 0x3412);
        assert_eq!(space.load_u16(0x10, Endianness::Big).unwrap(), 0x1234);

        space
            .store_u64(0x20, 0x0102_0304_0506_0708, Endianness::Native)
            .unwrap();
        assert_eq!(space.load_u8(0x20).unwrap(), 0x08);
        assert_eq!(
            space.load_u64(0x20, Endianness::Big).unwrap(),
            0x0807_0605_0403_0201
        );
        assert_eq!(space.load_u32(0x24, Endianness::Little).unwrap(), 0x0102_0304);
    }

    #[test_with_tracing::test]
    fn plain_values() {
        let sys = MemorySystem::new();
        let space = sys.address_space("memory");
        let ram = sys.ram_region("ram", 0x1000).unwrap();
        space.update(&[RegionSection::new(ram, 0x40000)]);

        let desc = Descriptor {
            addr: 0x1234_5678,
            len: 0x200,
            flags: 3,
            next: 7,
        };
        space.write_plain(0x40100, &desc).unwrap();
        assert_eq!(space.read_plain::<Descriptor>(0x40100).unwrap(), desc);
        assert_eq!(space.load_u32(0x40108, Endianness::Native).unwrap(), 0x200);
        assert!(space.read_plain::<Descriptor>(0x40ff8).is_err());
    }

    #[test_with_tracing::test]
    fn notdirty_store() {
        let sys = MemorySystem::new();
        let space = sys.address_space("memory");
        let ram = sys.ram_region("ram", 0x2000).unwrap();
        space.update(&[RegionSection::new(ram.clone(), 0)]);
        let base = ram.ram_addr().unwrap();
        sys.ram()
            .clear_dirty_range(base, 0x2000, DirtyClient::Migration);

        space.store_u32_notdirty(0x1000, 0xabcd).unwrap();
        assert_eq!(space.load_u32(0x1000, Endianness::Native).unwrap(), 0xabcd);
        assert!(!sys.ram().is_dirty(base + 0x1000, DirtyClient::Migration));

        sys.ram().set_dirty_tracking(true);
        space.store_u32_notdirty(0x1000, 1).unwrap();
        assert!(sys.ram().is_dirty(base + 0x1000, DirtyClient::Migration));

        // Not RAM: an ordinary store, which fails on a hole.
        assert!(space.store_u32_notdirty(0x8000, 1).is_err());
    }
}
