// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-global address translation.
//!
//! Update candidates and envelope spans are described in a single
//! device-global address space, but the things that consume them talk
//! to one device at a time in device-local offsets. This crate owns the
//! (static) table that maps between the two.

#![cfg_attr(not(test), no_std)]

use drv_update_api::MemRegion;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceHandle {
    /// Internal non-volatile memory, where update storage lives.
    Nvm,
    /// Volatile memory shared with companion domains.
    Ram,
    /// External serial flash.
    External,
}

/// A device-local location.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub device: DeviceHandle,
    pub offset: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemMapError {
    /// Entries overlap in the global address space.
    Overlap,
    /// The address falls outside every window.
    Unmapped,
    /// The region straddles a window boundary.
    Split,
}

#[derive(Copy, Clone, Debug)]
pub struct MemMapEntry {
    pub device: DeviceHandle,
    pub base: u64,
    pub size: u64,
}

impl MemMapEntry {
    fn contains(&self, address: u64) -> bool {
        address >= self.base && address - self.base < self.size
    }
}

/// A fixed table of address windows, one per device. Built once at
/// startup from the platform configuration and then only read.
pub struct MemMap<const N: usize> {
    entries: [MemMapEntry; N],
}

impl<const N: usize> MemMap<N> {
    pub fn new(entries: [MemMapEntry; N]) -> Result<Self, MemMapError> {
        for (i, a) in entries.iter().enumerate() {
            for b in &entries[i + 1..] {
                let disjoint = a.base + a.size <= b.base || b.base + b.size <= a.base;
                if !disjoint {
                    return Err(MemMapError::Overlap);
                }
            }
        }
        Ok(Self { entries })
    }

    pub fn resolve(&self, address: u64) -> Result<Location, MemMapError> {
        for e in &self.entries {
            if e.contains(address) {
                return Ok(Location {
                    device: e.device,
                    offset: (address - e.base) as u32,
                });
            }
        }
        Err(MemMapError::Unmapped)
    }

    /// Resolves a whole region; the region must fit inside one window.
    pub fn resolve_region(
        &self,
        region: &MemRegion,
    ) -> Result<Location, MemMapError> {
        let start = self.resolve(region.address)?;
        if region.size == 0 {
            return Ok(start);
        }
        let end = self.resolve(region.address + u64::from(region.size) - 1)?;
        if start.device != end.device {
            return Err(MemMapError::Split);
        }
        Ok(start)
    }

    /// Reverse mapping: device-local offset back to a global address.
    pub fn global_for(
        &self,
        device: DeviceHandle,
        offset: u32,
    ) -> Result<u64, MemMapError> {
        for e in &self.entries {
            if e.device == device && u64::from(offset) < e.size {
                return Ok(e.base + u64::from(offset));
            }
        }
        Err(MemMapError::Unmapped)
    }

    /// Convenience for the storage manager, which works exclusively in
    /// NVM offsets.
    pub fn nvm_offset_for(&self, address: u64) -> Result<u32, MemMapError> {
        let loc = self.resolve(address)?;
        if loc.device != DeviceHandle::Nvm {
            return Err(MemMapError::Unmapped);
        }
        Ok(loc.offset)
    }

    pub fn global_for_nvm_offset(&self, offset: u32) -> Result<u64, MemMapError> {
        self.global_for(DeviceHandle::Nvm, offset)
    }
}
