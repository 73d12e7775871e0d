//! Compact bitset over the column positions of a schema.
//!
//! Used for enabled-column masks on maps and for the change masks produced
//! when a record is diffed against its captured snapshot.

/// A compact bitset representing "column is selected" for positions `0..len`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSet {
    len: usize,
    bits: Box<[u64]>,
}

impl ColumnSet {
    /// Create an empty (nothing selected) set for `len` columns.
    #[must_use]
    pub fn empty(len: usize) -> Self {
        let words = len.div_ceil(64);
        Self {
            len,
            bits: vec![0u64; words].into_boxed_slice(),
        }
    }

    /// Create a full (everything selected) set for `len` columns.
    #[must_use]
    pub fn all(len: usize) -> Self {
        let mut s = Self::empty(len);
        for idx in 0..len {
            s.insert(idx);
        }
        s
    }

    /// Number of column positions represented by this set.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if no position is selected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of selected positions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Select a position. Positions outside `0..len` are ignored.
    pub fn insert(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w |= 1u64 << (idx % 64);
        }
    }

    /// Deselect a position.
    pub fn remove(&mut self, idx: usize) {
        if idx >= self.len {
            return;
        }
        if let Some(w) = self.bits.get_mut(idx / 64) {
            *w &= !(1u64 << (idx % 64));
        }
    }

    /// Check whether a position is selected.
    #[must_use]
    pub fn contains(&self, idx: usize) -> bool {
        if idx >= self.len {
            return false;
        }
        self.bits
            .get(idx / 64)
            .is_some_and(|w| (w & (1u64 << (idx % 64))) != 0)
    }

    /// Selected positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|idx| self.contains(*idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_all() {
        let empty = ColumnSet::empty(70);
        assert!(empty.is_empty());
        assert_eq!(empty.len(), 70);

        let all = ColumnSet::all(70);
        assert_eq!(all.count(), 70);
        assert!(all.contains(69));
        assert!(!all.contains(70));
    }

    #[test]
    fn test_insert_remove_iter() {
        let mut set = ColumnSet::empty(5);
        set.insert(1);
        set.insert(3);
        set.insert(9);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![1, 3]);
        set.remove(1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3]);
        assert_eq!(set.count(), 1);
    }
}
