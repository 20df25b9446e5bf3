use std::collections::HashMap;

use model::TileIdentifier;

/// Fixed-capacity ring of identifiers whose refcount dropped to zero, in the
/// order they became unused.
///
/// Reclaimed identifiers leave a hole instead of compacting the ring. The
/// write cursor always points at the oldest insertion, so writing over an
/// occupied slot evicts strictly in insertion order (FIFO, not LRU).
#[derive(Debug)]
pub struct UnusedRing {
    slots: Box<[Option<TileIdentifier>]>,
    positions: HashMap<TileIdentifier, usize>,
    cursor: usize,
}

impl UnusedRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "unused ring capacity must be at least 1");
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        Self {
            slots: slots.into_boxed_slice(),
            positions: HashMap::with_capacity(capacity),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, identifier: &TileIdentifier) -> bool {
        self.positions.contains_key(identifier)
    }

    /// Appends `identifier` and returns the entry it displaced, if any.
    pub fn insert(&mut self, identifier: TileIdentifier) -> Option<TileIdentifier> {
        if self.positions.contains_key(&identifier) {
            panic!("identifier {identifier} inserted into unused ring twice");
        }
        let evicted = self.slots[self.cursor].take();
        if let Some(evicted) = &evicted {
            self.positions.remove(evicted);
        }
        self.positions.insert(identifier.clone(), self.cursor);
        self.slots[self.cursor] = Some(identifier);
        self.cursor = (self.cursor + 1) % self.slots.len();
        evicted
    }

    /// Removes `identifier` because it is in use again. Returns whether it
    /// was present.
    pub fn reclaim(&mut self, identifier: &TileIdentifier) -> bool {
        let Some(position) = self.positions.remove(identifier) else {
            return false;
        };
        self.slots[position] = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::UnusedRing;
    use model::TileIdentifier;

    fn id(raw: &str) -> TileIdentifier {
        TileIdentifier::from(raw)
    }

    #[test]
    fn overflow_evicts_oldest_insertion() {
        let mut ring = UnusedRing::new(3);
        assert_eq!(ring.insert(id("a")), None);
        assert_eq!(ring.insert(id("b")), None);
        assert_eq!(ring.insert(id("c")), None);
        assert_eq!(ring.insert(id("d")), Some(id("a")));
        assert_eq!(ring.insert(id("e")), Some(id("b")));
        assert_eq!(ring.len(), 3);
        assert!(!ring.contains(&id("a")));
    }

    #[test]
    fn reclaimed_slot_is_nulled_not_compacted() {
        let mut ring = UnusedRing::new(3);
        ring.insert(id("a"));
        ring.insert(id("b"));
        ring.insert(id("c"));
        assert!(ring.reclaim(&id("a")));
        assert!(!ring.reclaim(&id("a")));

        assert_eq!(ring.insert(id("d")), None);
        assert_eq!(ring.insert(id("e")), Some(id("b")));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn released_again_requeues_at_the_back() {
        let mut ring = UnusedRing::new(2);
        ring.insert(id("a"));
        ring.insert(id("b"));
        ring.reclaim(&id("a"));
        assert_eq!(ring.insert(id("a")), None);

        assert_eq!(ring.insert(id("c")), Some(id("b")));
        assert_eq!(ring.insert(id("d")), Some(id("a")));
    }
}
