//! Lock-free single-producer/single-consumer ring buffer.
//!
//! The writer index moves only after the payload is stored (release), the
//! reader index only after the payload is loaded (release); each side
//! acquires the other's index before touching a slot. One slot stays
//! unused so empty (`writer == reader`) and full (`writer + 1 == reader`,
//! modulo the length) remain distinguishable.

#![allow(dead_code)] // Introspection methods are exercised by the tests.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscRing<T> {
    storage: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the producer writes. Producer-owned.
    writer: AtomicUsize,
    /// Next slot the consumer reads. Consumer-owned.
    reader: AtomicUsize,
}

// One thread pushes, one thread pops; the index protocol hands each slot
// to exactly one side at a time.
unsafe impl<T: Send> Sync for SpscRing<T> {}
unsafe impl<T: Send> Send for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// A ring of `len` slots holds at most `len - 1` items.
    pub fn new(len: usize) -> SpscRing<T> {
        assert!(len >= 2, "ring length must be at least 2");
        let mut storage = Vec::with_capacity(len);
        storage.resize_with(len, || UnsafeCell::new(MaybeUninit::uninit()));
        SpscRing {
            storage: storage.into_boxed_slice(),
            writer: AtomicUsize::new(0),
            reader: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len() - 1
    }

    pub fn len(&self) -> usize {
        let writer = self.writer.load(Ordering::Relaxed);
        let reader = self.reader.load(Ordering::Relaxed);
        (writer + self.storage.len() - reader) % self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writer.load(Ordering::Acquire) == self.reader.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let writer = self.writer.load(Ordering::Acquire);
        let reader = self.reader.load(Ordering::Acquire);
        (writer + 1) % self.storage.len() == reader
    }

    /// Producer side. Returns false when the ring is full.
    pub fn push(&self, item: T) -> bool {
        let writer = self.writer.load(Ordering::Relaxed);
        let next = (writer + 1) % self.storage.len();
        if next == self.reader.load(Ordering::Acquire) {
            return false;
        }
        unsafe {
            (*self.storage[writer].get()).write(item);
        }
        self.writer.store(next, Ordering::Release);
        true
    }

    /// Consumer side. Returns None when the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let reader = self.reader.load(Ordering::Relaxed);
        if reader == self.writer.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*self.storage[reader].get()).assume_init_read() };
        self.reader.store((reader + 1) % self.storage.len(), Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let ring = SpscRing::new(8);
        for i in 0..5 {
            assert!(ring.push(i));
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_one_slot_reserved() {
        let ring = SpscRing::new(4);
        assert_eq!(ring.capacity(), 3);
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(ring.push(3));
        assert!(ring.is_full());
        assert!(!ring.push(4));
        assert_eq!(ring.len(), 3);

        assert_eq!(ring.pop(), Some(1));
        assert!(ring.push(4));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_empty_and_full_distinguished_across_wrap() {
        let ring = SpscRing::new(2);
        assert_eq!(ring.capacity(), 1);
        for round in 0..10 {
            assert!(ring.is_empty());
            assert!(ring.push(round));
            assert!(ring.is_full());
            assert!(!ring.push(round));
            assert_eq!(ring.pop(), Some(round));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn test_no_loss_or_duplication_across_threads() {
        const ITEMS: usize = 100_000;
        let ring = Arc::new(SpscRing::new(64));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..ITEMS {
                    while !ring.push(i) {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut expected = 0;
                while expected < ITEMS {
                    match ring.pop() {
                        Some(value) => {
                            assert_eq!(value, expected, "lost or duplicated element");
                            expected += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_size_stays_within_bounds() {
        let ring = SpscRing::new(5);
        for i in 0..4 {
            assert!(ring.len() <= ring.capacity());
            ring.push(i);
        }
        assert_eq!(ring.len(), 4);
        while ring.pop().is_some() {
            assert!(ring.len() <= ring.capacity());
        }
        assert_eq!(ring.len(), 0);
    }
}
