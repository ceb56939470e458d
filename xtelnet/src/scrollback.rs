//! Bounded scrollback buffer: a FIFO of recent output chunks replayed to a
//! newly-attached UI.
//!
//! Adapted from `huntwj-tinyfugue`'s `history.rs` `InputHistory`, which
//! backs a bounded ring buffer with a `VecDeque` and evicts from the stale
//! end on overflow — here applied to *output* chunks instead of input
//! lines, with a single mutex per spec.md §4.5's concurrency note (all
//! writes come from the session's output fan-out, all reads from the
//! attach plane).

use std::collections::VecDeque;
use std::sync::Mutex;

/// FIFO of opaque, UI-ready output chunks with a hard capacity.
#[derive(Debug)]
pub struct Scrollback {
    inner: Mutex<VecDeque<Vec<u8>>>,
    cap: usize,
}

impl Scrollback {
    pub fn new(cap: usize) -> Self {
        Self { inner: Mutex::new(VecDeque::with_capacity(cap.min(4096))), cap: cap.max(1) }
    }

    /// Append `chunk`, evicting from the head if capacity is exceeded.
    pub fn put(&self, chunk: Vec<u8>) {
        let mut buf = self.inner.lock().unwrap();
        buf.push_back(chunk);
        while buf.len() > self.cap {
            buf.pop_front();
        }
    }

    /// Snapshot of up to the `n` most recent chunks, oldest-first.
    pub fn get_tail(&self, n: usize) -> Vec<Vec<u8>> {
        let buf = self.inner.lock().unwrap();
        let len = buf.len();
        let start = len.saturating_sub(n);
        buf.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
