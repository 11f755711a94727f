//! FIFO queue of outbound messages.

use super::Slots;

/// First-in first-out queue on a growable ring.
#[derive(Debug)]
pub struct RingQueue<T> {
    slots: Slots<T>,
}

impl<T> RingQueue<T> {
    /// Empty queue with room for `capacity` items before growing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::new(capacity),
        }
    }

    /// Appends an item.
    pub fn add(&mut self, item: T) {
        self.slots.push(item);
    }

    /// Removes the oldest item.
    pub fn remove(&mut self) -> Option<T> {
        self.slots.pop_front()
    }

    /// Returns `true` if the queue is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Number of queued items.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.slots.len()
    }

    /// Current slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Removes every item, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.slots.drain()
    }
}
