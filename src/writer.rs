//! Outgoing packet assembly (spec §4.3 "Writer"). A `Writer` is a chain of blocks borrowed
//! from a [`BlockAllocator`], with a reserved region at the front of the first block for a
//! protocol header written after the body (so frontends can prepend e.g. a content-length
//! once the body size is known, without a second allocation or a copy).
//!
//! `Writer` is internally refcounted via [`AtomicRefCounted`]/[`Ark`] rather than wrapped in
//! an `Arc`: one reference is held by whoever is still appending to it, one by each send-queue
//! entry it's been enqueued as, and the block chain is returned to the allocator the moment
//! the last one drops.

use std::sync::atomic::{AtomicU32, Ordering::{AcqRel, Relaxed}};
use std::sync::{Arc, Mutex};

use crate::block::{BlockAllocator, BlockHandle};
use crate::common::{Ark, AtomicRefCounted};
use crate::error::{Error, Result};

struct WriterState {
    head: BlockHandle,
    tail: BlockHandle,
    /// Offset within `head` where body content starts, i.e. the end of the header reservation.
    body_start: u32,
    /// Next free byte offset within `tail`.
    tail_write_offset: u32,
    /// Total body bytes written so far (excludes the header reservation itself).
    body_len: u32,
    header_reserve: u32,
    header_written: bool,
}

pub struct Writer {
    refcount: AtomicU32,
    allocator: Arc<BlockAllocator>,
    state: Mutex<WriterState>,
}

impl Writer {
    /// Allocate a fresh writer with `header_reserve` bytes reserved at the front of its first
    /// block for a header to be filled in later via [`Writer::write_header`].
    pub fn new(allocator: Arc<BlockAllocator>, header_reserve: u32) -> Result<Ark<Writer>> {
        let block_size = allocator.block_size();
        if header_reserve > block_size {
            return Err(Error::new("header_reserve exceeds block size"));
        }
        let head = allocator.allocate().ok_or_else(Error::slots_exhausted)?;
        let writer = Writer {
            refcount: AtomicU32::new(1),
            allocator,
            state: Mutex::new(WriterState {
                head,
                tail: head,
                body_start: header_reserve,
                tail_write_offset: header_reserve,
                body_len: 0,
                header_reserve,
                header_written: header_reserve == 0,
            }),
        };
        Ok(Ark::new(writer))
    }

    pub fn block_size(&self) -> u32 {
        self.allocator.block_size()
    }

    pub fn body_len(&self) -> u32 {
        self.state.lock().expect("writer mutex poisoned").body_len
    }

    pub fn header_reserve(&self) -> u32 {
        self.state.lock().expect("writer mutex poisoned").header_reserve
    }

    /// Append `data` to the body, allocating new blocks from the chain as needed.
    pub fn write(&self, mut data: &[u8]) -> Result<()> {
        let block_size = self.allocator.block_size();
        let mut state = self.state.lock().expect("writer mutex poisoned");
        while !data.is_empty() {
            let room = block_size - state.tail_write_offset;
            if room == 0 {
                let next = self.allocator.allocate().ok_or_else(Error::slots_exhausted)?;
                self.allocator.link(state.tail, next);
                state.tail = next;
                state.tail_write_offset = 0;
                continue;
            }
            let n = room.min(data.len() as u32) as usize;
            let tail = state.tail;
            let offset = state.tail_write_offset as usize;
            self.allocator.resolve_mut(tail)[offset..offset + n].copy_from_slice(&data[..n]);
            state.tail_write_offset += n as u32;
            state.body_len += n as u32;
            data = &data[n..];
        }
        Ok(())
    }

    /// Fill in the header reservation at the front of the first block. Must be called at
    /// most once, after the body (and thus its final length) is known.
    pub fn write_header(&self, header: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        if state.header_written {
            return Err(Error::new("writer header already written"));
        }
        if header.len() as u32 > state.header_reserve {
            return Err(Error::new("header exceeds reserved space"));
        }
        // Left-align the header against the start of the body so a shorter-than-reserved
        // header (e.g. a content-length that encoded smaller than the worst case) still sits
        // immediately before the body with no gap.
        let pad = state.header_reserve - header.len() as u32;
        let head = state.head;
        let start = pad as usize;
        self.allocator.resolve_mut(head)[start..start + header.len()].copy_from_slice(header);
        state.body_start = start as u32;
        state.header_written = true;
        Ok(())
    }

    pub fn head(&self) -> BlockHandle {
        self.state.lock().expect("writer mutex poisoned").head
    }

    /// Segments to assemble into a vectored send: `(block, offset, len)` triples spanning
    /// the header (if written) followed by the full body, in chain order.
    pub fn segments(&self) -> Vec<(BlockHandle, u32, u32)> {
        let state = self.state.lock().expect("writer mutex poisoned");
        let block_size = self.allocator.block_size();
        let mut segments = Vec::new();
        let mut cur = state.head;
        // Walk the chain, emitting the live byte range of each block. The first block starts
        // at `body_start` (post-header, or the unwritten header reservation if no header was
        // ever written); every following block starts at 0. Every block before `tail` is full
        // to `block_size`; `tail` ends at `tail_write_offset`.
        let mut offset = state.body_start;
        let mut total = state.body_len + (state.header_reserve - state.body_start);
        while total > 0 {
            let end = if cur == state.tail { state.tail_write_offset } else { block_size };
            let len = end - offset;
            segments.push((cur, offset, len));
            total -= len;
            offset = 0;
            if cur == state.tail {
                break;
            }
            cur = self.allocator.get_next_block(cur);
        }
        segments
    }

    pub fn read_block(&self, handle: BlockHandle) -> &[u8] {
        self.allocator.resolve(handle)
    }

    /// `segments()`, minus the first `skip` bytes of content. Used to resume a vectored send
    /// that only partially drained on a previous pass.
    pub fn segments_from(&self, skip: u32) -> Vec<(BlockHandle, u32, u32)> {
        let mut skip = skip;
        let mut segments = self.segments();
        let mut i = 0;
        while i < segments.len() && skip > 0 {
            let (_, _, len) = segments[i];
            if skip >= len {
                skip -= len;
                i += 1;
            } else {
                segments[i].1 += skip;
                segments[i].2 -= skip;
                skip = 0;
            }
        }
        segments.split_off(i)
    }

    /// Total content length (header, if written, plus body).
    pub fn total_len(&self) -> u32 {
        self.segments().iter().map(|(_, _, l)| l).sum()
    }
}

impl AtomicRefCounted for Writer {
    fn refcount(&self) -> u32 {
        self.refcount.load(Relaxed)
    }

    fn incref(&self) {
        self.refcount.fetch_add(1, Relaxed);
    }

    fn decref(&self) -> bool {
        self.refcount.fetch_sub(1, AcqRel) == 1
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("writer mutex poisoned");
        self.allocator.free_block_chain(state.head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(block_size: u32, blocks: u32) -> Arc<BlockAllocator> {
        Arc::new(BlockAllocator::new((block_size * blocks) as usize, block_size))
    }

    #[test]
    fn write_within_one_block() {
        let alloc = allocator(64, 4);
        let w = Writer::new(alloc, 0).unwrap();
        w.write(b"hello").unwrap();
        assert_eq!(w.body_len(), 5);
        let segs = w.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].2, 5);
    }

    #[test]
    fn write_spanning_blocks() {
        let alloc = allocator(8, 8);
        let w = Writer::new(alloc, 0).unwrap();
        w.write(b"0123456789abcdef").unwrap();
        assert_eq!(w.body_len(), 16);
        let segs = w.segments();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].2, 8);
        assert_eq!(segs[1].2, 8);
    }

    #[test]
    fn header_reservation_roundtrip() {
        let alloc = allocator(32, 4);
        let w = Writer::new(alloc, 10).unwrap();
        w.write(b"body-bytes").unwrap();
        w.write_header(b"hdr5").unwrap();
        let segs = w.segments();
        // header is left-padded within the 10-byte reservation, so total = 4 + 10 bytes.
        let total: u32 = segs.iter().map(|(_, _, l)| l).sum();
        assert_eq!(total, 4 + 10);
    }
}
