// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow interface to the non-volatile memory that backs update storage.
//!
//! The storage manager only needs four operations: erase, program, read,
//! and the write granule. Everything above this trait works in device
//! offsets; address translation happens in `mem-map`.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;

/// Value of an erased NOR flash byte. Programming can only clear bits.
pub const ERASED_BYTE: u8 = 0xFF;

#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromPrimitive,
)]
#[repr(u32)]
pub enum FlashError {
    OutOfBounds = 1,
    /// Write offset or length is not a multiple of the write granule.
    BadAlignment = 2,
    NotReady = 3,
    Io = 4,
}

pub trait FlashDevice {
    /// Smallest programmable unit, in bytes. Write offsets and lengths
    /// must be multiples of this.
    fn write_granule(&self) -> usize;

    /// Total addressable size, in bytes.
    fn capacity(&self) -> usize;

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;

    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), FlashError>;
}

/// RAM-backed flash with NOR semantics, for hosted tests.
///
/// Erase fills with `ERASED_BYTE`; programming can only clear bits, so
/// writing over unerased data corrupts it the same way real hardware
/// would. `fail_after` simulates power loss: once the byte budget is
/// exhausted, the current operation is applied only partially and fails
/// with `Io`, and every later operation fails immediately.
pub struct RamFlash<const N: usize> {
    mem: [u8; N],
    granule: usize,
    fail_after: Option<usize>,
}

impl<const N: usize> RamFlash<N> {
    pub fn new(granule: usize) -> Self {
        Self {
            mem: [ERASED_BYTE; N],
            granule,
            fail_after: None,
        }
    }

    /// Arrange for exactly `budget` more bytes to reach the array before
    /// the device starts failing.
    pub fn fail_after(&mut self, budget: usize) {
        self.fail_after = Some(budget);
    }

    /// Clear a pending fault so the device works again, leaving whatever
    /// torn state the fault produced in place.
    pub fn clear_fault(&mut self) {
        self.fail_after = None;
    }

    pub fn contents(&self) -> &[u8] {
        &self.mem
    }

    /// Consume up to `want` bytes of fault budget, returning how many may
    /// actually be applied.
    fn budget_take(&mut self, want: usize) -> Result<usize, usize> {
        match self.fail_after {
            None => Ok(want),
            Some(left) if left >= want => {
                self.fail_after = Some(left - want);
                Ok(want)
            }
            Some(left) => {
                self.fail_after = Some(0);
                Err(left)
            }
        }
    }
}

impl<const N: usize> FlashDevice for RamFlash<N> {
    fn write_granule(&self) -> usize {
        self.granule
    }

    fn capacity(&self) -> usize {
        N
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        let offset = offset as usize;
        let len = len as usize;
        if offset.checked_add(len).map_or(true, |end| end > N) {
            return Err(FlashError::OutOfBounds);
        }

        match self.budget_take(len) {
            Ok(n) | Err(n) if n < len => {
                self.mem[offset..offset + n].fill(ERASED_BYTE);
                Err(FlashError::Io)
            }
            _ => {
                self.mem[offset..offset + len].fill(ERASED_BYTE);
                Ok(())
            }
        }
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = offset as usize;
        if offset % self.granule != 0 || data.len() % self.granule != 0 {
            return Err(FlashError::BadAlignment);
        }
        if offset.checked_add(data.len()).map_or(true, |end| end > N) {
            return Err(FlashError::OutOfBounds);
        }

        let (applied, result) = match self.budget_take(data.len()) {
            Ok(n) if n == data.len() => (n, Ok(())),
            Ok(n) | Err(n) => (n, Err(FlashError::Io)),
        };
        for (dst, src) in self.mem[offset..].iter_mut().zip(&data[..applied]) {
            // NOR programming: bits only go from 1 to 0.
            *dst &= *src;
        }
        result
    }

    fn read(&self, offset: u32, out: &mut [u8]) -> Result<(), FlashError> {
        let offset = offset as usize;
        if offset.checked_add(out.len()).map_or(true, |end| end > N) {
            return Err(FlashError::OutOfBounds);
        }
        out.copy_from_slice(&self.mem[offset..offset + out.len()]);
        Ok(())
    }
}
