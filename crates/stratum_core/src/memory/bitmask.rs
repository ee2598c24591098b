//! # Row Bitmask
//!
//! Compact bitset with one bit per chunk row. Used for per-row enabled bits
//! of enableable components and for row masks produced by the enabled
//! filter.
//!
//! - Set / test: O(1)
//! - Uniformity check: O(rows / 64)
//! - Iterate set rows: O(set rows), skipping clear words with `trailing_zeros`

/// Bitset over a fixed number of rows. Bit set = row selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowMask {
    words: Vec<u64>,
    rows: usize,
}

impl RowMask {
    /// Creates a mask over `rows` rows with every bit clear.
    #[must_use]
    pub fn new(rows: usize) -> Self {
        Self {
            words: vec![0; rows.div_ceil(64)],
            rows,
        }
    }

    /// Creates a mask over `rows` rows with every bit set.
    #[must_use]
    pub fn full(rows: usize) -> Self {
        let mut mask = Self::new(rows);
        mask.set_range(0, rows, true);
        mask
    }

    /// Number of rows covered.
    #[inline]
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Sets or clears one bit.
    #[inline]
    pub fn set(&mut self, row: usize, value: bool) {
        debug_assert!(row < self.rows, "row out of bounds");
        let Some(word) = self.words.get_mut(row / 64) else {
            return;
        };
        let bit = 1u64 << (row % 64);
        if value {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Sets or clears bits `start..end`.
    pub fn set_range(&mut self, start: usize, end: usize, value: bool) {
        for row in start..end.min(self.rows) {
            self.set(row, value);
        }
    }

    /// Tests one bit. Rows outside the mask read as clear.
    #[inline]
    #[must_use]
    pub fn get(&self, row: usize) -> bool {
        if row >= self.rows {
            return false;
        }
        (self.words[row / 64] >> (row % 64)) & 1 == 1
    }

    /// Number of set bits in `0..len`.
    #[must_use]
    pub fn count_ones(&self, len: usize) -> usize {
        self.iter_ones(len).count()
    }

    /// Checks whether bits `0..len` are all set.
    #[must_use]
    pub fn all(&self, len: usize) -> bool {
        self.uniform(len) == Some(true)
    }

    /// Returns `Some(value)` when bits `0..len` all equal `value`.
    ///
    /// An empty range is uniformly set.
    #[must_use]
    pub fn uniform(&self, len: usize) -> Option<bool> {
        let len = len.min(self.rows);
        if len == 0 {
            return Some(true);
        }
        let first = self.get(0);
        let full_words = len / 64;
        let expected = if first { u64::MAX } else { 0 };
        if self.words[..full_words].iter().any(|&w| w != expected) {
            return None;
        }
        let remaining = len % 64;
        if remaining > 0 {
            let mask = (1u64 << remaining) - 1;
            if self.words[full_words] & mask != expected & mask {
                return None;
            }
        }
        Some(first)
    }

    /// Intersects with `other` in place.
    pub fn and_with(&mut self, other: &RowMask) {
        for (word, other) in self.words.iter_mut().zip(&other.words) {
            *word &= *other;
        }
        if other.words.len() < self.words.len() {
            for word in &mut self.words[other.words.len()..] {
                *word = 0;
            }
        }
    }

    /// Moves bit `from` into bit `to`, the swap-remove counterpart for masks.
    #[inline]
    pub fn move_bit(&mut self, from: usize, to: usize) {
        let value = self.get(from);
        self.set(to, value);
    }

    /// Iterates over set rows in `0..len`.
    #[must_use]
    pub fn iter_ones(&self, len: usize) -> Ones<'_> {
        Ones {
            words: &self.words,
            word_idx: 0,
            current: self.words.first().copied().unwrap_or(0),
            len: len.min(self.rows),
        }
    }
}

/// Iterator over set rows of a [`RowMask`].
pub struct Ones<'a> {
    words: &'a [u64],
    word_idx: usize,
    current: u64,
    len: usize,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                let row = self.word_idx * 64 + bit;
                self.current &= self.current - 1;
                // Bits are visited in ascending order.
                return (row < self.len).then_some(row);
            }
            self.word_idx += 1;
            if self.word_idx >= self.words.len() || self.word_idx * 64 >= self.len {
                return None;
            }
            self.current = self.words[self.word_idx];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut mask = RowMask::new(130);
        mask.set(0, true);
        mask.set(64, true);
        mask.set(129, true);
        assert!(mask.get(0));
        assert!(mask.get(64));
        assert!(mask.get(129));
        assert!(!mask.get(1));
        assert!(!mask.get(500));
        mask.set(64, false);
        assert!(!mask.get(64));
    }

    #[test]
    fn test_uniform() {
        let mut mask = RowMask::full(100);
        assert_eq!(mask.uniform(100), Some(true));
        mask.set(99, false);
        assert_eq!(mask.uniform(99), Some(true));
        assert_eq!(mask.uniform(100), None);

        let empty = RowMask::new(70);
        assert_eq!(empty.uniform(70), Some(false));
        assert_eq!(empty.uniform(0), Some(true));
    }

    #[test]
    fn test_iter_ones_respects_len() {
        let mut mask = RowMask::new(200);
        for row in [3, 64, 65, 150, 199] {
            mask.set(row, true);
        }
        let rows: Vec<usize> = mask.iter_ones(151).collect();
        assert_eq!(rows, vec![3, 64, 65, 150]);
        assert_eq!(mask.count_ones(200), 5);
    }

    #[test]
    fn test_and_with() {
        let mut a = RowMask::full(10);
        let mut b = RowMask::new(10);
        b.set(2, true);
        b.set(7, true);
        a.and_with(&b);
        assert_eq!(a.iter_ones(10).collect::<Vec<_>>(), vec![2, 7]);
    }

    #[test]
    fn test_move_bit() {
        let mut mask = RowMask::new(8);
        mask.set(7, true);
        mask.move_bit(7, 2);
        assert!(mask.get(2));
        mask.move_bit(0, 7);
        assert!(!mask.get(7));
    }
}
