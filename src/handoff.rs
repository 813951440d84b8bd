//! Bounded hand-off queue between network workers and the core.
//!
//! Network readers push received lines; the core drains them under its
//! lock. The queue never grows: when full, the oldest keepalive line is
//! shed to make room, and if none is queued the newest line is rejected.
//!
//! ```rust
//! use rs_throttle_bridge::handoff::HandoffQueue;
//!
//! let mut queue: HandoffQueue<String, 2> = HandoffQueue::new();
//! assert_eq!(queue.push("*".into()), Ok(None));
//! assert_eq!(queue.push("PPA1".into()), Ok(None));
//!
//! // Full: the keepalive goes first
//! assert_eq!(queue.push("M0AL3<;>V10".into()), Ok(Some("*".into())));
//! // Full with no keepalive left: the newcomer is refused
//! assert_eq!(queue.push("PPA0".into()), Err("PPA0".into()));
//! ```

use alloc::string::String;

use heapless::Deque;

/// Items that may be dropped under pressure.
pub trait Sheddable {
    /// Whether losing this item is harmless.
    fn is_keepalive(&self) -> bool;
}

impl Sheddable for String {
    fn is_keepalive(&self) -> bool {
        crate::protocol::is_keepalive_line(self)
    }
}

impl Sheddable for &str {
    fn is_keepalive(&self) -> bool {
        crate::protocol::is_keepalive_line(self)
    }
}

/// Fixed-capacity FIFO with keepalive shedding.
pub struct HandoffQueue<T, const N: usize> {
    items: Deque<T, N>,
    shed: u32,
    rejected: u32,
}

impl<T: Sheddable, const N: usize> HandoffQueue<T, N> {
    /// Creates an empty queue.
    pub const fn new() -> Self {
        Self {
            items: Deque::new(),
            shed: 0,
            rejected: 0,
        }
    }

    /// Push at the back.
    ///
    /// Returns `Ok(Some(shed))` when a queued keepalive was dropped to make
    /// room, and `Err(item)` when the queue is full of frames that matter.
    #[must_use]
    pub fn push(&mut self, item: T) -> Result<Option<T>, T> {
        if !self.items.is_full() {
            return self.items.push_back(item).map(|()| None);
        }

        let Some(pos) = self.items.iter().position(|queued| queued.is_keepalive()) else {
            self.rejected = self.rejected.saturating_add(1);
            return Err(item);
        };

        // Rebuild without the oldest keepalive
        let mut kept: Deque<T, N> = Deque::new();
        let mut shed = None;
        let mut n = 0;
        while let Some(queued) = self.items.pop_front() {
            if n == pos {
                shed = Some(queued);
            } else {
                let _ = kept.push_back(queued);
            }
            n += 1;
        }
        self.items = kept;
        self.shed = self.shed.saturating_add(1);
        match self.items.push_back(item) {
            Ok(()) => Ok(shed),
            Err(item) => Err(item),
        }
    }

    /// Pop the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Peek at the oldest item.
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true if at capacity.
    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }

    /// Keepalives shed so far.
    pub fn shed_count(&self) -> u32 {
        self.shed
    }

    /// Items refused so far.
    pub fn rejected_count(&self) -> u32 {
        self.rejected
    }
}

impl<T: Sheddable, const N: usize> Default for HandoffQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q: HandoffQueue<&str, 4> = HandoffQueue::new();
        for line in ["a", "b", "c"] {
            assert_eq!(q.push(line), Ok(None));
        }
        assert_eq!(q.peek(), Some(&"a"));
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), Some("b"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn sheds_oldest_keepalive_only() {
        let mut q: HandoffQueue<&str, 4> = HandoffQueue::new();
        for line in ["PPA1", "*", "<#>", "RL0"] {
            let _ = q.push(line);
        }
        assert_eq!(q.push("PPA0"), Ok(Some("*")));
        assert_eq!(q.push("PPA2"), Ok(Some("<#>")));
        assert_eq!(q.push("VN2.0"), Err("VN2.0"));
        assert_eq!(q.shed_count(), 2);
        assert_eq!(q.rejected_count(), 1);

        let drained: alloc::vec::Vec<&str> = core::iter::from_fn(|| q.pop()).collect();
        assert_eq!(drained, ["PPA1", "RL0", "PPA0", "PPA2"]);
    }

    #[test]
    fn clear_resets_contents() {
        let mut q: HandoffQueue<String, 2> = HandoffQueue::default();
        let _ = q.push("<# 50>".into());
        assert!(!q.is_full());
        q.clear();
        assert!(q.is_empty());
    }
}
