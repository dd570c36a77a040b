//! Fd-indexed connection slot table.
//!
//! Slot `i` holds the connection state for fd `i`; the kernel only reuses
//! an fd after close, and the server always de-registers before closing,
//! so at most one logical connection maps to an index at any instant.
//! Everything is allocated up front; steady state is allocation-free.

use crate::http::HttpConn;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct SlotTable {
    slots: Box<[Mutex<HttpConn>]>,
    /// Process-wide count of active connections; the acceptor is the only
    /// admission gate that reads it for control flow.
    active: AtomicUsize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> SlotTable {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Mutex::new(HttpConn::new()));
        SlotTable {
            slots: slots.into_boxed_slice(),
            active: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// O(1) lookup by fd. Out-of-range fds have no slot.
    pub fn get(&self, fd: RawFd) -> Option<&Mutex<HttpConn>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn counter(&self) -> &AtomicUsize {
        &self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_fd() {
        let table = SlotTable::new(8);
        assert_eq!(table.capacity(), 8);
        assert!(table.get(0).is_some());
        assert!(table.get(7).is_some());
        assert!(table.get(8).is_none());
        assert!(table.get(-1).is_none());
    }

    #[test]
    fn test_slots_start_free() {
        let table = SlotTable::new(4);
        for fd in 0..4 {
            assert!(!table.get(fd).unwrap().lock().unwrap().is_active());
        }
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn test_counter_tracks_admissions() {
        let table = SlotTable::new(4);
        table.counter().fetch_add(1, Ordering::Relaxed);
        table.counter().fetch_add(1, Ordering::Relaxed);
        assert_eq!(table.active_count(), 2);
        table.counter().fetch_sub(1, Ordering::Relaxed);
        assert_eq!(table.active_count(), 1);
    }
}
