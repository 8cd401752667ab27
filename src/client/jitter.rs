//! Jitter buffer (M6): one per remote sender. A min-heap ordered by
//! sequence number, buffering on start and whenever it runs dry, matching
//! `heapq`-based semantics — `BinaryHeap` with `Reverse` gives the same
//! "always pop smallest sequence" behavior.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::config::{JITTER_MAX_SIZE, JITTER_TARGET_DELAY};

#[derive(Debug)]
struct Entry {
    seq: u32,
    data: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for Entry {}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct JitterBuffer {
    heap: BinaryHeap<Reverse<Entry>>,
    last_seq: Option<u32>,
    target_delay: usize,
    max_size: usize,
    buffering: bool,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self::with_params(JITTER_TARGET_DELAY, JITTER_MAX_SIZE)
    }

    pub fn with_params(target_delay: usize, max_size: usize) -> Self {
        JitterBuffer {
            heap: BinaryHeap::new(),
            last_seq: None,
            target_delay,
            max_size,
            buffering: true,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert an arrived frame. Out-of-order arrival within the buffer
    /// window is fine (the heap reorders); a frame at or behind the last
    /// sequence played is dropped as too-late.
    pub fn add(&mut self, seq: u32, data: Vec<u8>) {
        if let Some(last) = self.last_seq {
            if seq <= last {
                return;
            }
        }
        self.heap.push(Reverse(Entry { seq, data }));
        if self.heap.len() > self.max_size {
            // Discard the *oldest* (smallest seq) entry — a full buffer means
            // the consumer has fallen behind, so drop old audio rather than
            // the freshest arrival.
            self.heap.pop();
        }
    }

    /// Pull the next frame to play, or `None` if nothing is ready yet
    /// (either genuinely empty, or still filling to `target_delay`).
    pub fn get(&mut self) -> Option<Vec<u8>> {
        if self.heap.is_empty() {
            self.buffering = true;
            return None;
        }
        if self.buffering && self.heap.len() < self.target_delay {
            return None;
        }
        self.buffering = false;
        let Reverse(entry) = self.heap.pop().unwrap();
        self.last_seq = Some(entry.seq);
        Some(entry.data)
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withholds_until_target_delay_then_plays_in_order() {
        let mut jb = JitterBuffer::with_params(4, 50);
        for seq in 0..3 {
            jb.add(seq, vec![seq as u8]);
            assert_eq!(jb.get(), None);
        }
        jb.add(3, vec![3]);
        assert_eq!(jb.get(), Some(vec![0]));
        assert_eq!(jb.get(), Some(vec![1]));
    }

    #[test]
    fn reorders_out_of_order_arrivals() {
        let mut jb = JitterBuffer::with_params(2, 50);
        jb.add(5, vec![5]);
        jb.add(3, vec![3]);
        jb.add(4, vec![4]);
        assert_eq!(jb.get(), Some(vec![3]));
        assert_eq!(jb.get(), Some(vec![4]));
        assert_eq!(jb.get(), Some(vec![5]));
    }

    #[test]
    fn drops_packets_at_or_behind_last_played() {
        let mut jb = JitterBuffer::with_params(1, 50);
        jb.add(10, vec![10]);
        assert_eq!(jb.get(), Some(vec![10]));
        jb.add(10, vec![99]);
        jb.add(5, vec![99]);
        assert!(jb.is_empty());
    }

    #[test]
    fn drops_oldest_when_over_capacity() {
        let mut jb = JitterBuffer::with_params(1, 3);
        jb.add(1, vec![1]);
        jb.add(2, vec![2]);
        jb.add(3, vec![3]);
        jb.add(4, vec![4]);
        assert_eq!(jb.len(), 3);
        assert_eq!(jb.get(), Some(vec![2]));
    }

    #[test]
    fn re_enters_buffering_after_running_dry() {
        let mut jb = JitterBuffer::with_params(2, 50);
        jb.add(1, vec![1]);
        jb.add(2, vec![2]);
        assert_eq!(jb.get(), Some(vec![1]));
        assert_eq!(jb.get(), Some(vec![2]));
        assert_eq!(jb.get(), None);
        jb.add(3, vec![3]);
        assert_eq!(jb.get(), None);
        jb.add(4, vec![4]);
        assert_eq!(jb.get(), Some(vec![3]));
    }
}
