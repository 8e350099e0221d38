// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for instrumenting the update stack.
//!
//! Components embed a [`Ringbuf`] of `Copy + PartialEq` event payloads
//! and record entries at interesting state transitions (install
//! begin/commit/abort, mode changes, chunk accept/refuse, timeouts).
//! The buffer is meant to be inspected from a debugger or dumped in
//! tests; it is cheap enough to leave in production code.
//!
//! When an entry is recorded with the same line and payload as the most
//! recent one, its count is bumped instead of consuming a new slot, so
//! a polling loop does not flood the buffer.
//!
//! The usual pattern is a private `Trace` enum next to the component
//! and a [`trace!`] call at each site:
//!
//! ```
//! # use ringbuf::{trace, Ringbuf};
//! #[derive(Copy, Clone, Debug, PartialEq)]
//! enum Trace {
//!     None,
//!     InstallStart { area: u8 },
//! }
//!
//! let mut ring = Ringbuf::<Trace, 16>::new(Trace::None);
//! trace!(ring, Trace::InstallStart { area: 0 });
//! ```

#![cfg_attr(not(test), no_std)]

/// A single entry: the line that recorded it, a generation counter for
/// wrap detection, a repeat count, and the payload itself.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    last: Option<usize>,
    buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    /// Records `payload` at `line`, coalescing into the previous entry
    /// when line and payload both match. The oldest entry is
    /// overwritten once the buffer is full.
    pub fn entry(&mut self, line: u16, payload: T) {
        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];

                if ent.line == line && ent.payload == payload {
                    ent.count += 1;
                    return;
                }

                if last + 1 >= self.buffer.len() {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);

        self.last = Some(ndx);
    }

    /// The most recently recorded payload, if any.
    pub fn last_entry(&self) -> Option<&RingbufEntry<T>> {
        self.last.map(|ndx| &self.buffer[ndx])
    }

    /// Iterates over recorded entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> {
        let first = match self.last {
            None => 0,
            Some(last) if last + 1 >= N => 0,
            Some(last) => {
                if self.buffer[last + 1].count != 0 {
                    last + 1
                } else {
                    0
                }
            }
        };
        self.buffer
            .iter()
            .cycle()
            .skip(first)
            .take(N)
            .filter(|e| e.count != 0)
    }
}

/// Records an entry in a [`Ringbuf`], capturing the source line.
#[macro_export]
macro_rules! trace {
    ($ring:expr, $payload:expr) => {
        $ring.entry(line!() as u16, $payload);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_repeats() {
        let mut ring = Ringbuf::<u32, 4>::new(0);
        ring.entry(10, 7);
        ring.entry(10, 7);
        ring.entry(10, 7);

        let last = ring.last_entry().unwrap();
        assert_eq!(last.payload, 7);
        assert_eq!(last.count, 3);
        assert_eq!(ring.iter().count(), 1);
    }

    #[test]
    fn distinct_lines_do_not_coalesce() {
        let mut ring = Ringbuf::<u32, 4>::new(0);
        ring.entry(10, 7);
        ring.entry(11, 7);
        assert_eq!(ring.iter().count(), 2);
    }

    #[test]
    fn wraps_oldest_first() {
        let mut ring = Ringbuf::<u32, 3>::new(0);
        for i in 0..5 {
            ring.entry(i as u16, i);
        }
        let seen: Vec<u32> = ring.iter().map(|e| e.payload).collect();
        assert_eq!(seen, vec![2, 3, 4]);
        assert_eq!(ring.last_entry().unwrap().payload, 4);
    }
}
