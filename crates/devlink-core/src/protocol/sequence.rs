//! Request id allocation.
//!
//! Each command frame carries a `request_id`; the device copies it into the
//! response header so the host can tell a stale reply from the one it is
//! waiting for.  Ids are allocated per session and never repeat within one.
//!
//! Id `0` is reserved for frames that do not answer anything, so the counter
//! starts at 1 and skips 0 when it wraps.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free allocator of request ids.
///
/// # Examples
///
/// ```rust
/// use devlink_core::protocol::SequenceCounter;
///
/// let ids = SequenceCounter::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Allocates the next request id.
    pub fn next(&self) -> u64 {
        // Relaxed: ids only need to be unique, they order nothing else.
        loop {
            let id = self.inner.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
