//! Physical Zone - Buddy Allocator
//!
//! A zone manages a power-of-two span of physical pages with the buddy
//! system:
//!   - order 0 = 1 page
//!   - order 1 = 2 pages
//!   - ...
//!   - order N = 2^N pages (the whole zone)
//!
//! On allocation the smallest free block of at least the requested order is
//! split down; on deallocation a block merges with its buddy while the buddy
//! is free.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use super::PAGE_SIZE;
use crate::types::PhysicalAddress;

/// A buddy-managed span of physical pages
#[derive(Debug)]
pub struct PhysicalZone {
    /// First page of the zone
    base: PhysicalAddress,
    /// Pages in the zone (a power of two)
    page_count: usize,
    /// Order of the whole zone
    max_order: usize,
    /// Free blocks per order, as page offsets from `base`
    free_blocks: Vec<BTreeSet<usize>>,
    /// Pages currently handed out
    used_pages: usize,
}

impl PhysicalZone {
    /// Create a zone with every page free
    pub fn new(base: PhysicalAddress, page_count: usize) -> Self {
        assert!(
            page_count.is_power_of_two(),
            "zone size must be a power of two"
        );
        assert!(base.is_page_aligned());

        let max_order = page_count.trailing_zeros() as usize;
        let mut free_blocks: Vec<BTreeSet<usize>> = (0..=max_order).map(|_| BTreeSet::new()).collect();
        free_blocks[max_order].insert(0);

        Self {
            base,
            page_count,
            max_order,
            free_blocks,
            used_pages: 0,
        }
    }

    /// First page of the zone
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Number of pages in the zone
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Order of the largest possible block
    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Pages currently allocated
    pub fn used_pages(&self) -> usize {
        self.used_pages
    }

    /// Pages currently free
    pub fn free_pages(&self) -> usize {
        self.page_count - self.used_pages
    }

    /// True when no page is free
    pub fn is_empty(&self) -> bool {
        self.used_pages == self.page_count
    }

    /// Does `addr` fall inside this zone?
    pub fn contains(&self, addr: PhysicalAddress) -> bool {
        let start = self.base.get();
        let end = start + (self.page_count * PAGE_SIZE) as u64;
        addr.get() >= start && addr.get() < end
    }

    /// Order of the largest free block, if any page is free
    pub fn largest_free_order(&self) -> Option<usize> {
        (0..=self.max_order)
            .rev()
            .find(|&order| !self.free_blocks[order].is_empty())
    }

    /// Allocate a block of `2^order` pages
    ///
    /// Returns `None` and leaves the zone untouched when no free block of at
    /// least that order exists.
    pub fn allocate_block(&mut self, order: usize) -> Option<PhysicalAddress> {
        if order > self.max_order {
            return None;
        }

        let found = (order..=self.max_order).find(|&o| !self.free_blocks[o].is_empty())?;
        let offset = self.free_blocks[found].pop_first()?;

        // Split down, freeing the upper half at each step.
        for split in (order..found).rev() {
            self.free_blocks[split].insert(offset + (1 << split));
        }

        self.used_pages += 1 << order;
        Some(self.page_address(offset))
    }

    /// Return a block of `2^order` pages starting at `addr`
    ///
    /// Panics if the address is outside the zone, misaligned for the order,
    /// or (partially) free already.
    pub fn deallocate_block(&mut self, addr: PhysicalAddress, order: usize) {
        assert!(self.contains(addr), "{:?} is not in this zone", addr);
        assert!(order <= self.max_order);

        let mut offset = self.page_offset(addr);
        assert_eq!(offset & ((1 << order) - 1), 0, "misaligned block");
        assert!(!self.is_offset_free(offset), "double free of {:?}", addr);

        self.used_pages -= 1 << order;

        let mut current = order;
        while current < self.max_order {
            let buddy = offset ^ (1 << current);
            if !self.free_blocks[current].remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            current += 1;
        }
        self.free_blocks[current].insert(offset);
    }

    /// Is the page at `addr` free?
    pub fn is_page_free(&self, addr: PhysicalAddress) -> bool {
        self.contains(addr) && self.is_offset_free(self.page_offset(addr))
    }

    fn is_offset_free(&self, offset: usize) -> bool {
        (0..=self.max_order).any(|order| {
            let block = offset & !((1 << order) - 1);
            self.free_blocks[order].contains(&block)
        })
    }

    fn page_offset(&self, addr: PhysicalAddress) -> usize {
        ((addr.get() - self.base.get()) as usize) / PAGE_SIZE
    }

    fn page_address(&self, offset: usize) -> PhysicalAddress {
        self.base.offset((offset * PAGE_SIZE) as u64)
    }
}
