//! Incoming-data block-chain buffer (spec §4.4), used both as the plaintext recv buffer and,
//! when TLS is enabled, as the decrypt buffer rustls decodes into. Unlike [`crate::writer::Writer`]
//! this isn't shared/refcounted: it's owned outright by whichever task (recv task or TLS pump)
//! is currently reading off the socket, so it needs no internal synchronization.
//!
//! The next block is always allocated as soon as the current one fills, rather than lazily on
//! the next write attempt (spec §9 open question): a frontend holding a reference to the tail
//! of a just-filled block via [`RecvBuffer::peek`] must never observe a torn allocation mid-parse.

use std::sync::Arc;

use crate::block::{BlockAllocator, BlockHandle};
use crate::error::{Error, Result};

pub struct RecvBuffer {
    allocator: Arc<BlockAllocator>,
    block_size: u32,
    /// Oldest block that may still hold unread bytes.
    head: BlockHandle,
    /// Block currently being written into.
    write_block: BlockHandle,
    /// Next free byte offset within `write_block`.
    write_offset: u32,
    /// Offset within `head` of the next unread byte.
    read_offset: u32,
    /// Total unread bytes across the whole chain.
    data_avail: u32,
}

impl RecvBuffer {
    pub fn new(allocator: Arc<BlockAllocator>) -> Result<Self> {
        let block_size = allocator.block_size();
        let head = allocator.allocate().ok_or_else(Error::slots_exhausted)?;
        Ok(Self {
            allocator,
            block_size,
            head,
            write_block: head,
            write_offset: 0,
            read_offset: 0,
            data_avail: 0,
        })
    }

    pub fn data_avail(&self) -> u32 {
        self.data_avail
    }

    pub fn is_empty(&self) -> bool {
        self.data_avail == 0
    }

    /// The writable tail of the current write block, to read() a socket or TLS plaintext
    /// stream directly into.
    pub fn spare_capacity(&mut self) -> &mut [u8] {
        let offset = self.write_offset as usize;
        &mut self.allocator.resolve_mut(self.write_block)[offset..]
    }

    /// Record that `n` bytes were just written into the slice returned by
    /// [`RecvBuffer::spare_capacity`]. Pre-allocates the next block if that filled the
    /// current one, so a later `spare_capacity` call never has to allocate under a held peek.
    pub fn got_data(&mut self, n: u32) -> Result<()> {
        debug_assert!(self.write_offset + n <= self.block_size);
        self.write_offset += n;
        self.data_avail += n;
        if self.write_offset == self.block_size {
            let next = self.allocator.allocate().ok_or_else(Error::slots_exhausted)?;
            self.allocator.link(self.write_block, next);
            self.write_block = next;
            self.write_offset = 0;
        }
        Ok(())
    }

    /// The unread bytes of the oldest (head) block only. Callers that need data spanning
    /// multiple blocks should drain this block (via [`RecvBuffer::discard_data`]) before
    /// reading the next.
    pub fn peek(&self) -> &[u8] {
        let end = if self.head == self.write_block { self.write_offset } else { self.block_size };
        &self.allocator.resolve(self.head)[self.read_offset as usize..end as usize]
    }

    /// Copy `data` in, chunked across block boundaries exactly like
    /// [`crate::writer::Writer::write`]'s append loop. Convenience for callers (the plaintext
    /// and TLS recv tasks) that read into a scratch buffer off the socket before transferring
    /// into the block chain, rather than reading directly into `spare_capacity` a chunk at a
    /// time.
    pub fn extend_from_slice(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = self.spare_capacity().len();
            let n = room.min(data.len());
            self.spare_capacity()[..n].copy_from_slice(&data[..n]);
            self.got_data(n as u32)?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Drop `n` bytes from the front of the buffer, freeing the head block once fully
    /// consumed and advancing to its successor.
    pub fn discard_data(&mut self, mut n: u32) {
        debug_assert!(n <= self.data_avail);
        self.data_avail -= n;
        while n > 0 {
            let avail_in_head = if self.head == self.write_block {
                self.write_offset - self.read_offset
            } else {
                self.block_size - self.read_offset
            };
            let take = n.min(avail_in_head);
            self.read_offset += take;
            n -= take;
            if self.read_offset == self.block_size && self.head != self.write_block {
                let next = self.allocator.get_next_block(self.head);
                self.allocator.free_one(self.head);
                self.head = next;
                self.read_offset = 0;
            } else if n > 0 {
                break;
            }
        }
    }
}

impl Drop for RecvBuffer {
    fn drop(&mut self) {
        self.allocator.free_block_chain(self.head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(block_size: u32, blocks: u32) -> Arc<BlockAllocator> {
        Arc::new(BlockAllocator::new((block_size * blocks) as usize, block_size))
    }

    #[test]
    fn write_read_within_one_block() {
        let mut buf = RecvBuffer::new(allocator(16, 4)).unwrap();
        buf.spare_capacity()[..5].copy_from_slice(b"hello");
        buf.got_data(5).unwrap();
        assert_eq!(buf.data_avail(), 5);
        assert_eq!(buf.peek(), b"hello");
        buf.discard_data(5);
        assert_eq!(buf.data_avail(), 0);
    }

    #[test]
    fn fill_exact_block_preallocates_next() {
        let mut buf = RecvBuffer::new(allocator(4, 4)).unwrap();
        buf.spare_capacity().copy_from_slice(b"abcd");
        buf.got_data(4).unwrap();
        // the write block rolled over; writing more should land in the new block, not panic.
        buf.spare_capacity()[..2].copy_from_slice(b"ef");
        buf.got_data(2).unwrap();
        assert_eq!(buf.data_avail(), 6);
    }

    #[test]
    fn discard_across_block_boundary_frees_head() {
        let mut buf = RecvBuffer::new(allocator(4, 4)).unwrap();
        buf.spare_capacity().copy_from_slice(b"abcd");
        buf.got_data(4).unwrap();
        buf.spare_capacity()[..4].copy_from_slice(b"efgh");
        buf.got_data(4).unwrap();
        assert_eq!(buf.peek(), b"abcd");
        buf.discard_data(4);
        assert_eq!(buf.peek(), b"efgh");
        buf.discard_data(4);
        assert_eq!(buf.data_avail(), 0);
    }
}
