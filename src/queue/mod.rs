//! Bounded, generation-tagged queue (spec §4.1). Used for each connection's outgoing send
//! queue and its pending-free queue. The generation counter is bumped by [`GenQueue::reset`]
//! so that a send-worker op built against generation `g` is silently dropped once the
//! connection has been reset past `g`, instead of racing a use-after-reuse of the slot.
//!
//! The original backs this with a lock-free ring buffer; we realize the same contract with a
//! `Mutex<VecDeque<T>>` since each queue is contended by at most one send-worker thread and
//! one app/recv-path producer at a time (spec §9 treats an equivalent serialization as
//! satisfying the contract as long as ordering is preserved).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicBool, Ordering::{Acquire, Release, Relaxed}};
use std::sync::Mutex;

pub struct GenQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    generation: AtomicU8,
    locked: AtomicBool,
}

impl<T> GenQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            generation: AtomicU8::new(0),
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn generation(&self) -> u8 {
        self.generation.load(Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("gen queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prevents further enqueues. Used once a connection starts closing, so that racing
    /// producers stop adding work the send worker is about to discard anyway.
    pub fn lock(&self) {
        self.locked.store(true, Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Acquire)
    }

    /// Push `item` onto the back of the queue. Fails (returning `item` back) if the queue is
    /// locked, at capacity, or `expected_generation` no longer matches: the caller built its
    /// op against a connection generation that's since been reset out from under it.
    pub fn enqueue(&self, item: T, expected_generation: u8) -> Result<(), T> {
        if self.locked.load(Acquire) || self.generation.load(Acquire) != expected_generation {
            return Err(item);
        }
        let mut guard = self.inner.lock().expect("gen queue mutex poisoned");
        if guard.len() >= self.capacity {
            return Err(item);
        }
        guard.push_back(item);
        Ok(())
    }

    /// Pop the front element, if any.
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().expect("gen queue mutex poisoned").pop_front()
    }

    /// Drop the front element without returning it. Used once the send worker has fully
    /// flushed it and no longer needs the value.
    pub fn advance(&self) {
        self.inner.lock().expect("gen queue mutex poisoned").pop_front();
    }

    /// Replace the front element in place, e.g. to store the remainder of a partially
    /// vectored-sent writer chain back at the head of the queue.
    pub fn replace_top(&self, item: T) {
        let mut guard = self.inner.lock().expect("gen queue mutex poisoned");
        if let Some(front) = guard.front_mut() {
            *front = item;
        } else {
            guard.push_front(item);
        }
    }

    /// Reset the queue: drops every pending element, unlocks it and bumps the generation so
    /// any op still in flight against the old generation is recognized as stale.
    pub fn reset(&self) where T: Send {
        let mut guard = self.inner.lock().expect("gen queue mutex poisoned");
        guard.clear();
        drop(guard);
        self.locked.store(false, Release);
        self.generation.fetch_add(1, Relaxed);
    }
}

impl<T> GenQueue<T>
where
    T: Clone,
{
    /// Peek at (clones of) the first `k` elements without removing them, in FIFO order.
    pub fn peek_top(&self, k: usize) -> Vec<T> {
        let guard = self.inner.lock().expect("gen queue mutex poisoned");
        guard.iter().take(k).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_respects_capacity_and_generation() {
        let q: GenQueue<u32> = GenQueue::new(2);
        assert!(q.enqueue(1, 0).is_ok());
        assert!(q.enqueue(2, 0).is_ok());
        assert!(q.enqueue(3, 0).is_err(), "queue should be full");

        assert_eq!(q.try_dequeue(), Some(1));
        assert!(q.enqueue(3, 0).is_ok());
        assert_eq!(q.peek_top(2), vec![2, 3]);
    }

    #[test]
    fn reset_bumps_generation_and_rejects_stale_producers() {
        let q: GenQueue<u32> = GenQueue::new(4);
        q.enqueue(1, 0).unwrap();
        q.reset();
        assert_eq!(q.generation(), 1);
        assert!(q.is_empty());
        assert!(q.enqueue(2, 0).is_err(), "stale generation must be rejected");
        assert!(q.enqueue(2, 1).is_ok());
    }

    #[test]
    fn lock_blocks_further_enqueues() {
        let q: GenQueue<u32> = GenQueue::new(4);
        q.lock();
        assert!(q.enqueue(1, 0).is_err());
        q.reset();
        assert!(!q.is_locked());
    }

    #[test]
    fn replace_top_overwrites_front_only() {
        let q: GenQueue<u32> = GenQueue::new(4);
        q.enqueue(1, 0).unwrap();
        q.enqueue(2, 0).unwrap();
        q.replace_top(10);
        assert_eq!(q.peek_top(2), vec![10, 2]);
    }
}
