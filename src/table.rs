// src/table.rs

/// Index-stable table of live connections keyed by file descriptor.
///
/// Descriptors are small dense integers, so a boxed slice of options gives
/// O(1) insert/lookup/remove without hashing. The kernel reuses descriptor
/// numbers only after close, so inserting over a stale slot is the normal way
/// an abandoned entry gets reclaimed.
///
/// The table is owned and mutated by the reactor thread only; workers borrow
/// individual entries for the duration of `process`.
pub struct FdTable<T> {
    entries: Box<[Option<T>]>,
    active_count: usize,
}

impl<T> FdTable<T> {
    /// Allocate all slots once at startup.
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);

        Self {
            entries: entries.into_boxed_slice(),
            active_count: 0,
        }
    }

    /// Install an entry for `fd`, replacing any stale one left behind by a
    /// previous connection on the same descriptor number. Returns false if
    /// the descriptor is outside the table.
    pub fn insert(&mut self, fd: i32, value: T) -> bool {
        let Some(slot) = self.entries.get_mut(fd as usize) else {
            return false;
        };
        if slot.replace(value).is_none() {
            self.active_count += 1;
        }
        true
    }

    pub fn get(&self, fd: i32) -> Option<&T> {
        self.entries.get(fd as usize).and_then(|slot| slot.as_ref())
    }

    pub fn remove(&mut self, fd: i32) -> Option<T> {
        let slot = self.entries.get_mut(fd as usize)?;
        let value = slot.take();
        if value.is_some() {
            self.active_count -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_operations() {
        let mut table: FdTable<&str> = FdTable::new(16);

        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), 16);

        assert!(table.insert(5, "a"));
        assert!(table.insert(9, "b"));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(5), Some(&"a"));

        assert_eq!(table.remove(5), Some("a"));
        assert_eq!(table.len(), 1);
        assert!(table.get(5).is_none());
        assert!(table.remove(5).is_none());
    }

    #[test]
    fn insert_over_stale_slot_replaces() {
        let mut table: FdTable<u32> = FdTable::new(8);
        assert!(table.insert(3, 100));
        // Descriptor number reused by a new accept before the old entry was
        // explicitly removed.
        assert!(table.insert(3, 200));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(3), Some(&200));
    }

    #[test]
    fn out_of_range_fd_is_rejected() {
        let mut table: FdTable<u32> = FdTable::new(4);
        assert!(!table.insert(4, 1));
        assert!(table.get(99).is_none());
    }
}
