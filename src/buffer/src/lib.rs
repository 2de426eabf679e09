// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A `Pipe` is a single contiguous byte buffer with a read cursor and a write
//! cursor, used for buffered stream I/O. Bytes are produced at the write
//! cursor and consumed at the read cursor; the region between the two cursors
//! is the readable data. The buffer may grow beyond its target size under
//! load and shrinks back when cleared between commands.

pub use bytes::buf::UninitSlice;
pub use bytes::{Buf, BufMut};

const KB: usize = 1024;
const MB: usize = 1024 * KB;

/// Invariant: `rpos <= wpos <= storage.len()`.
pub struct Pipe {
    storage: Vec<u8>,
    rpos: usize,
    wpos: usize,
    target_size: usize,
}

impl Pipe {
    /// Create a pipe that holds up to `target_size` bytes without resizing.
    /// The capacity is rounded up to the next power of two.
    pub fn new(target_size: usize) -> Self {
        let target_size = target_size.next_power_of_two();
        Self {
            storage: vec![0; target_size],
            rpos: 0,
            wpos: 0,
            target_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of readable bytes.
    pub fn rsize(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Number of writable bytes before the pipe must grow.
    pub fn wsize(&self) -> usize {
        self.storage.len() - self.wpos
    }

    pub fn is_empty(&self) -> bool {
        self.rpos == self.wpos
    }

    /// The readable region.
    pub fn rdata(&self) -> &[u8] {
        &self.storage[self.rpos..self.wpos]
    }

    /// The writable region. Call `produced` after filling a prefix of it.
    pub fn wdata(&mut self) -> &mut [u8] {
        let wpos = self.wpos;
        let cap = self.storage.len();
        &mut self.storage[wpos..cap]
    }

    /// Advance the write cursor after bytes were written into `wdata`.
    pub fn produced(&mut self, amt: usize) {
        self.wpos = core::cmp::min(self.wpos + amt, self.storage.len());
    }

    /// Advance the read cursor, discarding `amt` readable bytes.
    pub fn consumed(&mut self, amt: usize) {
        self.rpos = core::cmp::min(self.rpos + amt, self.wpos);
        if self.rpos == self.wpos {
            self.rpos = 0;
            self.wpos = 0;
        }
    }

    /// Make room for at least `amt` additional writable bytes. May relocate
    /// the storage, so slices taken earlier must be re-taken afterwards.
    /// Growth doubles up to a megabyte, then proceeds in whole megabytes.
    pub fn reserve(&mut self, amt: usize) {
        if self.is_empty() {
            self.rpos = 0;
            self.wpos = 0;
        }

        if amt <= self.wsize() {
            return;
        }

        let needed = self.wpos + amt;
        let new_cap = if needed > MB {
            (needed / MB + 1) * MB
        } else {
            needed.next_power_of_two()
        };
        self.storage.resize(new_cap, 0);
    }

    /// Reset the cursors and return an oversized pipe to its target size.
    /// Discards any readable bytes; only valid between commands.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
        if self.storage.len() > self.target_size {
            self.storage.truncate(self.target_size);
            self.storage.shrink_to_fit();
        }
    }

    /// Shrink an oversized pipe while preserving readable bytes: moves the
    /// readable region to the front and drops excess capacity where possible.
    /// Only valid between commands, when no ranges into the pipe are held.
    pub fn shrink(&mut self) {
        if self.is_empty() {
            self.clear();
            return;
        }

        if self.storage.len() == self.target_size {
            return;
        }

        if self.rpos > 0 {
            self.storage.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }

        let needed = core::cmp::max(self.wpos, self.target_size);
        let target = if needed > MB {
            (needed / MB + 1) * MB
        } else {
            needed.next_power_of_two()
        };
        if target < self.storage.len() {
            self.storage.truncate(target);
            self.storage.shrink_to_fit();
        }
    }

    /// Absolute position of the read cursor within the storage. Ranges
    /// recorded against the pipe (for example by a scatter-send path) are
    /// expressed as absolute offsets, which survive relocation by `reserve`.
    pub fn read_offset(&self) -> usize {
        self.rpos
    }

    /// Absolute position of the write cursor within the storage.
    pub fn write_offset(&self) -> usize {
        self.wpos
    }

    /// The bytes at an absolute offset range. The range must lie within the
    /// produced region.
    pub fn range(&self, start: usize, len: usize) -> &[u8] {
        &self.storage[start..start + len]
    }
}

impl Buf for Pipe {
    fn remaining(&self) -> usize {
        self.rsize()
    }

    fn chunk(&self) -> &[u8] {
        self.rdata()
    }

    fn advance(&mut self, amt: usize) {
        self.consumed(amt);
    }
}

unsafe impl BufMut for Pipe {
    fn remaining_mut(&self) -> usize {
        self.storage.len() - self.wpos
    }

    unsafe fn advance_mut(&mut self, amt: usize) {
        self.produced(amt);
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let wpos = self.wpos;
        let cap = self.storage.len();
        UninitSlice::new(&mut self.storage[wpos..cap])
    }

    fn put_slice(&mut self, src: &[u8]) {
        self.reserve(src.len());
        let wpos = self.wpos;
        self.storage[wpos..wpos + src.len()].copy_from_slice(src);
        self.wpos += src.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new() {
        let pipe = Pipe::new(1024);
        assert_eq!(pipe.rsize(), 0);
        assert_eq!(pipe.wsize(), 1024);

        // non power of two rounds up
        let pipe = Pipe::new(100);
        assert_eq!(pipe.wsize(), 128);
    }

    #[test]
    fn produce_and_consume() {
        let mut pipe = Pipe::new(16);

        pipe.put_slice(b"header");
        assert_eq!(pipe.rsize(), 6);
        assert_eq!(pipe.rdata(), b"header");

        pipe.consumed(2);
        assert_eq!(pipe.rdata(), b"ader");

        // consuming everything resets the cursors
        pipe.consumed(4);
        assert!(pipe.is_empty());
        assert_eq!(pipe.wsize(), 16);
    }

    #[test]
    fn wdata_then_produced() {
        let mut pipe = Pipe::new(8);
        let w = pipe.wdata();
        w[0..3].copy_from_slice(b"abc");
        pipe.produced(3);
        assert_eq!(pipe.rdata(), b"abc");
    }

    #[test]
    fn grows_on_demand() {
        let mut pipe = Pipe::new(4);
        pipe.put_slice(b"0123456789");
        assert_eq!(pipe.rsize(), 10);
        assert!(pipe.capacity() >= 10);
        assert_eq!(pipe.rdata(), b"0123456789");
    }

    #[test]
    fn reserve_relocation_preserves_absolute_ranges() {
        let mut pipe = Pipe::new(8);
        pipe.put_slice(b"keep");
        let start = pipe.read_offset();

        pipe.reserve(4096);
        assert_eq!(pipe.range(start, 4), b"keep");
    }

    #[test]
    fn shrink_returns_to_target() {
        let mut pipe = Pipe::new(16);
        pipe.put_slice(&[0u8; 4096]);
        pipe.consumed(4090);
        assert_eq!(pipe.rsize(), 6);

        pipe.shrink();
        assert_eq!(pipe.rsize(), 6);
        assert_eq!(pipe.capacity(), 16);
        assert_eq!(pipe.read_offset(), 0);
    }

    #[test]
    fn clear_discards_and_shrinks() {
        let mut pipe = Pipe::new(16);
        pipe.put_slice(&[0u8; 4096]);
        pipe.clear();
        assert!(pipe.is_empty());
        assert_eq!(pipe.capacity(), 16);
    }
}
