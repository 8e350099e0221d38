// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Word-aligned buffered append over a flash device.
//!
//! Flash program operations require aligned, fixed-size writes, while
//! the parts of an envelope have arbitrary lengths. `WordBuffer`
//! accumulates appends into a single hardware-word-sized block and
//! issues a flash write only when the block fills or on an explicit
//! flush, padding the trailing partial word at flush time.
//!
//! Invariants: every write issued through this type is word-aligned and
//! word-sized, and no byte offset is programmed twice between resets.

#![cfg_attr(not(test), no_std)]

use drv_flash_api::{FlashDevice, FlashError};

pub struct WordBuffer<const WORD: usize> {
    block: heapless::Vec<u8, WORD>,
    /// Flash offset the next full word will be programmed at.
    write_offset: u32,
}

impl<const WORD: usize> WordBuffer<WORD> {
    pub const fn new() -> Self {
        Self {
            block: heapless::Vec::new(),
            write_offset: 0,
        }
    }

    /// Resets the cursor to `offset`, discarding any buffered bytes.
    /// `offset` must be word-aligned.
    pub fn begin(&mut self, offset: u32) -> Result<(), FlashError> {
        if offset as usize % WORD != 0 {
            return Err(FlashError::BadAlignment);
        }
        self.block.clear();
        self.write_offset = offset;
        Ok(())
    }

    /// Next logical byte position, counting buffered-but-unwritten
    /// bytes.
    pub fn position(&self) -> u32 {
        self.write_offset + self.block.len() as u32
    }

    pub fn append(
        &mut self,
        flash: &mut impl FlashDevice,
        mut data: &[u8],
    ) -> Result<(), FlashError> {
        while !data.is_empty() {
            let cap = WORD - self.block.len();
            let take = usize::min(cap, data.len());
            // Cannot fail: `take` never exceeds remaining capacity.
            let _ = self.block.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.block.len() == WORD {
                flash.write(self.write_offset, &self.block)?;
                self.write_offset += WORD as u32;
                self.block.clear();
            }
        }
        Ok(())
    }

    /// Writes out the trailing partial word, padded with `pad`. A no-op
    /// when nothing is buffered.
    pub fn flush(
        &mut self,
        flash: &mut impl FlashDevice,
        pad: u8,
    ) -> Result<(), FlashError> {
        if self.block.is_empty() {
            return Ok(());
        }
        while self.block.len() < WORD {
            let _ = self.block.push(pad);
        }
        flash.write(self.write_offset, &self.block)?;
        self.write_offset += WORD as u32;
        self.block.clear();
        Ok(())
    }
}

impl<const WORD: usize> Default for WordBuffer<WORD> {
    fn default() -> Self {
        Self::new()
    }
}
