//! Dirty Page Bitmap
//!
//! One bit per page of an inode-backed object, set while the resident copy of
//! the page differs from the inode. Bits are atomic so readers need no lock;
//! writers serialize on the owning object's lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::VmResult;

/// Bits per bitmap word
const BITS_PER_WORD: usize = 64;

/// Fixed-length bitmap of dirty pages
#[derive(Debug)]
pub struct DirtyBitmap {
    words: Box<[AtomicU64]>,
    /// Number of bits (pages)
    len: usize,
}

impl DirtyBitmap {
    /// Create a bitmap of `len` clear bits
    pub fn try_new(len: usize) -> VmResult<Self> {
        let word_count = len.div_ceil(BITS_PER_WORD);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count)?;
        words.resize_with(word_count, || AtomicU64::new(0));

        Ok(Self {
            words: words.into_boxed_slice(),
            len,
        })
    }

    /// Copy the current bits into a new bitmap
    pub fn try_clone(&self) -> VmResult<Self> {
        let copy = Self::try_new(self.len)?;
        for (dst, src) in copy.words.iter().zip(self.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(copy)
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "dirty bit {} out of range", index);
        let word = self.words[index / BITS_PER_WORD].load(Ordering::Acquire);
        word & Self::mask(index) != 0
    }

    pub fn set(&self, index: usize, dirty: bool) {
        assert!(index < self.len, "dirty bit {} out of range", index);
        let word = &self.words[index / BITS_PER_WORD];
        if dirty {
            word.fetch_or(Self::mask(index), Ordering::AcqRel);
        } else {
            word.fetch_and(!Self::mask(index), Ordering::AcqRel);
        }
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|word| word.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    fn mask(index: usize) -> u64 {
        1 << (index % BITS_PER_WORD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bitmap_is_clear() {
        let bitmap = DirtyBitmap::try_new(130).unwrap();
        assert_eq!(bitmap.len(), 130);
        assert_eq!(bitmap.count_ones(), 0);
        assert!(!bitmap.get(129));
    }

    #[test]
    fn test_set_and_clear_across_words() {
        let bitmap = DirtyBitmap::try_new(130).unwrap();
        bitmap.set(0, true);
        bitmap.set(64, true);
        bitmap.set(129, true);
        assert_eq!(bitmap.count_ones(), 3);
        assert!(bitmap.get(64));
        assert!(!bitmap.get(63));

        bitmap.set(64, false);
        assert!(!bitmap.get(64));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn test_clone_copies_bits() {
        let bitmap = DirtyBitmap::try_new(10).unwrap();
        bitmap.set(3, true);
        let copy = bitmap.try_clone().unwrap();
        bitmap.set(3, false);
        assert!(copy.get(3));
        assert_eq!(copy.len(), 10);
    }

    #[test]
    fn test_empty_bitmap() {
        let bitmap = DirtyBitmap::try_new(0).unwrap();
        assert!(bitmap.is_empty());
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_bit_is_fatal() {
        let bitmap = DirtyBitmap::try_new(8).unwrap();
        bitmap.set(8, true);
    }
}
