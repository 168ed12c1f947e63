//! Sequence numbers for outbound JAUS frames.
//!
//! Every frame written to the Node Manager carries a 16-bit sequence number
//! in its trailer.  The Node Manager uses it to spot gaps and duplicates, so
//! each frame needs a fresh value, even when several sessions send at once.
//!
//! # Thread safety
//!
//! The counter is a single `AtomicU16`.  `fetch_add` is one indivisible
//! read-modify-write, so concurrent callers never observe the same number
//! (until the counter wraps, which JAUS expects).

use std::sync::atomic::{AtomicU16, Ordering};

/// A lock-free, wrapping counter for JAUS sequence numbers.
///
/// # Examples
///
/// ```rust
/// use iop_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU16,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next sequence number.  Wraps from `u16::MAX` to 0.
    ///
    /// `Relaxed` is enough: the value orders frames, it does not publish memory.
    pub fn next(&self) -> u16 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Value the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> u16 {
        self.inner.load(Ordering::Relaxed)
    }
}
