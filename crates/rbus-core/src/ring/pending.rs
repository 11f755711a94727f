//! Serial-keyed table of outstanding calls.

use super::Slots;

/// Values keyed by message serial, kept in insertion order.
///
/// Serials are allocated monotonically, so the oldest call sits at the
/// front and lookups from the front find recent replies quickly in the
/// common case of few outstanding calls.
#[derive(Debug)]
pub struct PendingMap<V> {
    slots: Slots<(u32, V)>,
}

impl<V> PendingMap<V> {
    /// Empty map with room for `capacity` entries before growing.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Slots::new(capacity),
        }
    }

    /// Inserts `value` under `serial`.
    pub fn put(&mut self, serial: u32, value: V) {
        self.slots.push((serial, value));
    }

    /// Removes and returns the value for `serial`.
    pub fn remove(&mut self, serial: u32) -> Option<V> {
        self.slots
            .take_first(|(key, _)| *key == serial)
            .map(|(_, value)| value)
    }

    /// Returns `true` if `serial` is present.
    #[must_use]
    pub fn contains(&self, serial: u32) -> bool {
        self.slots.iter().any(|(key, _)| *key == serial)
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if there are no entries.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.slots.len() == 0
    }

    /// Current slot count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Serials in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|(key, _)| *key)
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<(u32, V)> {
        self.slots.drain()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_put_remove() {
        let mut map = PendingMap::new(10);
        map.put(1, "a");
        map.put(2, "b");
        assert!(map.contains(1));
        assert_eq!(map.remove(1), Some("a"));
        assert_eq!(map.remove(1), None);
        assert!(!map.contains(1));
        assert_eq!(map.len(), 1);
        assert_eq!(map.remove(2), Some("b"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_grows_once_past_capacity() {
        let mut map = PendingMap::new(10);
        for serial in 1..=10 {
            map.put(serial, serial);
        }
        assert_eq!(map.capacity(), 10);
        map.put(11, 11);
        assert_eq!(map.capacity(), 20);
        assert_eq!(map.keys().collect::<Vec<_>>(), (1..=11).collect::<Vec<_>>());
    }

    #[test]
    fn test_grow_after_wraparound_preserves_order() {
        let mut map = PendingMap::new(4);
        for serial in 1..=4 {
            map.put(serial, ());
        }
        map.remove(1);
        map.remove(2);
        map.put(5, ());
        map.put(6, ());
        map.put(7, ());
        assert_eq!(map.capacity(), 8);
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_shrinks_when_emptied() {
        let mut map = PendingMap::new(2);
        for serial in 1..=9 {
            map.put(serial, ());
        }
        assert!(map.capacity() > 2);
        for serial in (1..=9).rev() {
            map.remove(serial);
        }
        assert_eq!(map.capacity(), 2);
        map.put(10, ());
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![10]);
    }

    #[test]
    fn test_drain_in_order() {
        let mut map = PendingMap::new(3);
        for serial in [5, 6, 7, 8] {
            map.put(serial, serial * 10);
        }
        map.remove(6);
        assert_eq!(map.drain(), vec![(5, 50), (7, 70), (8, 80)]);
        assert!(map.is_empty());
        assert_eq!(map.capacity(), 3);
    }

    proptest! {
        #[test]
        fn prop_matches_ordered_model(ops in proptest::collection::vec((any::<bool>(), 0u32..32), 0..200)) {
            let mut map = PendingMap::new(4);
            let mut model: Vec<u32> = Vec::new();
            let mut next = 1u32;
            for (insert, pick) in ops {
                if insert || model.is_empty() {
                    map.put(next, next);
                    model.push(next);
                    next += 1;
                } else {
                    let serial = model.remove(pick as usize % model.len());
                    prop_assert_eq!(map.remove(serial), Some(serial));
                }
                prop_assert_eq!(map.keys().collect::<Vec<_>>(), model.clone());
                prop_assert!(map.capacity() >= map.len());
            }
        }
    }
}
