//! Growable circular buffers.
//!
//! Both buffers keep their elements in a circular array that starts at a
//! fixed initial capacity:
//!
//! ```text
//!   start             start + span
//!     v                    v
//! [ . . A _ B C . . . . . . ]      _ = vacated slot
//! ```
//!
//! # Invariants
//!
//! - Iteration and removal order equal insertion order, across
//!   any number of grows.
//! - A buffer of capacity `N` holds `N` live entries; the
//!   `N+1`-th insertion doubles the capacity exactly once.
//! - Once the last entry is removed the buffer returns to its
//!   initial capacity.
//! - The slot at `start` is never vacant while the buffer is
//!   non-empty.

mod pending;
mod queue;

pub use pending::PendingMap;
pub use queue::RingQueue;

/// Circular storage shared by [`PendingMap`] and [`RingQueue`].
#[derive(Debug)]
struct Slots<T> {
    buf: Vec<Option<T>>,
    start: usize,
    span: usize,
    live: usize,
    initial: usize,
}

impl<T> Slots<T> {
    fn new(capacity: usize) -> Self {
        let initial = capacity.max(1);
        Self {
            buf: empty_slots(initial),
            start: 0,
            span: 0,
            live: 0,
            initial,
        }
    }

    const fn len(&self) -> usize {
        self.live
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn index(&self, offset: usize) -> usize {
        (self.start + offset) % self.buf.len()
    }

    fn push(&mut self, item: T) {
        if self.span == self.buf.len() {
            let capacity = if self.live == self.buf.len() {
                self.buf.len() * 2
            } else {
                self.buf.len()
            };
            self.relinearize(capacity);
        }
        let slot = self.index(self.span);
        self.buf[slot] = Some(item);
        self.span += 1;
        self.live += 1;
    }

    /// Copies live entries, in order, to the front of a fresh array.
    fn relinearize(&mut self, capacity: usize) {
        let mut buf = empty_slots(capacity);
        let mut next = 0;
        for offset in 0..self.span {
            let slot = self.index(offset);
            if let Some(item) = self.buf[slot].take() {
                buf[next] = Some(item);
                next += 1;
            }
        }
        self.buf = buf;
        self.start = 0;
        self.span = next;
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.live == 0 {
            return None;
        }
        let slot = self.start;
        let item = self.buf[slot].take();
        self.start = self.index(1);
        self.span -= 1;
        self.live -= 1;
        self.settle();
        item
    }

    /// Takes the first entry satisfying `pred`, leaving a vacant slot.
    fn take_first(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<T> {
        let offset = (0..self.span).find(|offset| {
            let slot = self.index(*offset);
            self.buf[slot].as_ref().is_some_and(&mut pred)
        })?;
        let slot = self.index(offset);
        let item = self.buf[slot].take();
        self.live -= 1;
        self.settle();
        item
    }

    /// Skips vacant slots at `start` and shrinks once empty.
    fn settle(&mut self) {
        if self.live == 0 {
            self.start = 0;
            self.span = 0;
            if self.buf.len() != self.initial {
                self.buf = empty_slots(self.initial);
            }
            return;
        }
        while self.buf[self.start].is_none() {
            self.start = self.index(1);
            self.span -= 1;
        }
    }

    fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.span).filter_map(move |offset| self.buf[self.index(offset)].as_ref())
    }

    fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.live);
        for offset in 0..self.span {
            let slot = self.index(offset);
            if let Some(item) = self.buf[slot].take() {
                items.push(item);
            }
        }
        self.live = 0;
        self.settle();
        items
    }
}

fn empty_slots<T>(capacity: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(capacity).collect()
}
