use alloc::vec;
use alloc::vec::Vec;

/// Fixed-size allocation bitmap with first-fit search.
///
/// Tracks which sectors of a volume, or which slots of the swap device,
/// are in use. A set bit means "allocated".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    bits: usize,
    set: usize,
}

impl Bitmap {
    /// A bitmap of `bits` clear bits.
    #[must_use]
    pub fn new(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64)],
            bits,
            set: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Number of set bits.
    #[inline]
    #[must_use]
    pub const fn count_set(&self) -> usize {
        self.set
    }

    /// Whether bit `index` is set. Out-of-range bits read as clear.
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        index < self.bits && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Set bit `index`; returns `false` if it was already set or out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.bits || self.test(index) {
            return false;
        }
        self.words[index / 64] |= 1 << (index % 64);
        self.set += 1;
        true
    }

    /// Clear bit `index`; returns `false` if it was already clear or out of range.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.test(index) {
            return false;
        }
        self.words[index / 64] &= !(1 << (index % 64));
        self.set -= 1;
        true
    }

    /// Find the lowest clear bit, set it, and return its index.
    pub fn scan_and_set(&mut self) -> Option<usize> {
        let (word_index, word) = self
            .words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)?;
        let index = word_index * 64 + word.trailing_ones() as usize;
        self.set(index).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_the_lowest_hole() {
        let mut map = Bitmap::new(130);
        for expected in 0..70 {
            assert_eq!(map.scan_and_set(), Some(expected));
        }
        assert!(map.clear(3));
        assert!(map.clear(65));
        assert_eq!(map.scan_and_set(), Some(3));
        assert_eq!(map.scan_and_set(), Some(65));
        assert_eq!(map.scan_and_set(), Some(70));
        assert_eq!(map.count_set(), 71);
    }

    #[test]
    fn exhaustion_respects_the_logical_length() {
        let mut map = Bitmap::new(3);
        assert_eq!(map.scan_and_set(), Some(0));
        assert_eq!(map.scan_and_set(), Some(1));
        assert_eq!(map.scan_and_set(), Some(2));
        // the padding bits of the last word are never handed out
        assert_eq!(map.scan_and_set(), None);
        assert_eq!(map.count_set(), 3);
    }

    #[test]
    fn double_set_and_double_clear_are_reported() {
        let mut map = Bitmap::new(8);
        assert!(map.set(5));
        assert!(!map.set(5));
        assert!(map.clear(5));
        assert!(!map.clear(5));
        assert!(!map.set(8));
    }
}
