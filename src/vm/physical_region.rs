//! Physical Region
//!
//! A contiguous `[lower, upper)` span of physical memory tiled with buddy
//! zones. Zones with at least one free page sit on the usable list, the rest
//! on the full list; allocation scans the usable list in order.

use alloc::vec::Vec;

use super::physical_zone::PhysicalZone;
use super::{LARGE_ZONE_PAGES, PAGE_SIZE, SMALL_ZONE_PAGES};
use crate::types::PhysicalAddress;

/// A span of physical memory and its zones
#[derive(Debug)]
pub struct PhysicalRegion {
    lower: PhysicalAddress,
    upper: PhysicalAddress,
    /// Always `(upper - lower) / PAGE_SIZE`
    pages: usize,
    /// Pages currently handed out
    used: usize,
    zones: Vec<PhysicalZone>,
    /// Indices into `zones` of zones with a free page, in allocation order
    usable_zones: Vec<usize>,
    /// Indices into `zones` of exhausted zones
    full_zones: Vec<usize>,
}

impl PhysicalRegion {
    /// Create a region with no zones yet
    pub fn new(lower: PhysicalAddress, upper: PhysicalAddress) -> Self {
        assert!(lower.is_page_aligned() && upper.is_page_aligned());
        assert!(lower <= upper);

        Self {
            lower,
            upper,
            pages: Self::pages_between(lower, upper),
            used: 0,
            zones: Vec::new(),
            usable_zones: Vec::new(),
            full_zones: Vec::new(),
        }
    }

    fn pages_between(lower: PhysicalAddress, upper: PhysicalAddress) -> usize {
        ((upper.get() - lower.get()) / PAGE_SIZE as u64) as usize
    }

    /// Tile the region with zones, largest first
    ///
    /// 4096-page zones go first, then 256-page zones; whatever is left is
    /// covered by progressively smaller power-of-two zones so that every page
    /// belongs to exactly one zone. Every zone starts out usable.
    pub fn initialize_zones(&mut self) {
        assert!(self.zones.is_empty(), "zones already initialized");

        let mut remaining_pages = self.pages;
        let mut base_address = self.lower;

        let mut make_zones = |zone_size: usize, zones: &mut Vec<PhysicalZone>| {
            while remaining_pages >= zone_size {
                log::debug!(
                    " * Zone {:016x}-{:016x} ({} bytes)",
                    base_address.get(),
                    base_address.get() + (zone_size * PAGE_SIZE) as u64 - 1,
                    zone_size * PAGE_SIZE
                );
                zones.push(PhysicalZone::new(base_address, zone_size));
                base_address = base_address.offset((zone_size * PAGE_SIZE) as u64);
                remaining_pages -= zone_size;
            }
        };

        let mut zones = Vec::new();
        make_zones(LARGE_ZONE_PAGES, &mut zones);
        make_zones(SMALL_ZONE_PAGES, &mut zones);

        let mut tail_size = SMALL_ZONE_PAGES / 2;
        while tail_size > 0 {
            make_zones(tail_size, &mut zones);
            tail_size /= 2;
        }

        self.usable_zones = (0..zones.len()).collect();
        self.zones = zones;
    }

    /// Carve the first `page_count` pages off into a new region
    ///
    /// Must be called before `initialize_zones`; requires
    /// `0 < page_count < size()`.
    pub fn try_take_pages_from_beginning(&mut self, page_count: usize) -> PhysicalRegion {
        assert!(page_count > 0);
        assert!(page_count < self.pages);
        assert!(
            self.zones.is_empty(),
            "cannot split a region after its zones are initialized"
        );

        let taken_lower = self.lower;
        let taken_upper = taken_lower.offset((page_count * PAGE_SIZE) as u64);
        self.lower = taken_upper;
        self.pages = Self::pages_between(self.lower, self.upper);

        PhysicalRegion::new(taken_lower, taken_upper)
    }

    /// Allocate one page from the first usable zone
    pub fn take_free_page(&mut self) -> Option<PhysicalAddress> {
        let Some(&zone_index) = self.usable_zones.first() else {
            log::warn!("PhysicalRegion::take_free_page: No free physical pages");
            return None;
        };

        let page = self.zones[zone_index]
            .allocate_block(0)
            .expect("usable zone without a free page");

        self.used += 1;
        self.retire_if_exhausted(0);
        Some(page)
    }

    /// Allocate `count` physically contiguous pages
    ///
    /// The request is rounded up to a power-of-two block; pages past `count`
    /// go straight back to the zone. Returns the first page's address, or
    /// `None` with no state change if no usable zone has a big enough block.
    pub fn take_contiguous_free_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        assert!(count > 0);
        let rounded_page_count = count.next_power_of_two();
        let order = rounded_page_count.trailing_zeros() as usize;

        for position in 0..self.usable_zones.len() {
            let zone_index = self.usable_zones[position];
            let zone = &mut self.zones[zone_index];

            let Some(page_base) = zone.allocate_block(order) else {
                continue;
            };

            for i in count..rounded_page_count {
                zone.deallocate_block(page_base.offset((i * PAGE_SIZE) as u64), 0);
            }

            self.used += count;
            self.retire_if_exhausted(position);
            return Some(page_base);
        }

        log::warn!(
            "PhysicalRegion::take_contiguous_free_pages: no block of order {} for {} pages",
            order,
            count
        );
        None
    }

    /// Give one page back to the zone that owns it
    ///
    /// Panics if no zone of this region contains `paddr`.
    pub fn return_page(&mut self, paddr: PhysicalAddress) {
        let Some(zone_index) = self.zones.iter().position(|zone| zone.contains(paddr)) else {
            panic!("PhysicalRegion::return_page: {:?} is not owned by any zone", paddr);
        };

        self.zones[zone_index].deallocate_block(paddr.page_base(), 0);
        self.used -= 1;

        if let Some(position) = self.full_zones.iter().position(|&i| i == zone_index) {
            self.full_zones.remove(position);
            self.usable_zones.push(zone_index);
        }
    }

    /// Move the usable zone at `position` to the full list if it has no free page
    fn retire_if_exhausted(&mut self, position: usize) {
        let zone_index = self.usable_zones[position];
        if self.zones[zone_index].is_empty() {
            self.usable_zones.remove(position);
            self.full_zones.push(zone_index);
        }
    }

    /// Does this region span `paddr`?
    pub fn contains(&self, paddr: PhysicalAddress) -> bool {
        paddr >= self.lower && paddr < self.upper
    }

    pub fn lower(&self) -> PhysicalAddress {
        self.lower
    }

    pub fn upper(&self) -> PhysicalAddress {
        self.upper
    }

    /// Number of pages in the region
    pub fn size(&self) -> usize {
        self.pages
    }

    /// Pages currently allocated
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn zones(&self) -> &[PhysicalZone] {
        &self.zones
    }

    pub fn usable_zone_count(&self) -> usize {
        self.usable_zones.len()
    }

    pub fn full_zone_count(&self) -> usize {
        self.full_zones.len()
    }

    /// Is the zone at `zone_index` on the usable list?
    pub fn is_zone_usable(&self, zone_index: usize) -> bool {
        self.usable_zones.contains(&zone_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const BASE: u64 = 0x100_0000;

    fn region(pages: usize) -> PhysicalRegion {
        let lower = PhysicalAddress::new(BASE);
        PhysicalRegion::new(lower, lower.offset((pages * PAGE_SIZE) as u64))
    }

    #[test]
    fn test_initialize_zones_4352_pages() {
        let mut region = region(4352);
        region.initialize_zones();

        let sizes: Vec<_> = region.zones().iter().map(|z| z.page_count()).collect();
        assert_eq!(sizes, [4096, 256]);
        assert_eq!(region.usable_zone_count(), 2);
        assert_eq!(region.full_zone_count(), 0);
        assert_eq!(
            region.zones()[1].base(),
            PhysicalAddress::new(BASE + 4096 * PAGE_SIZE as u64)
        );
    }

    #[test]
    fn test_take_free_page_moves_exhausted_zone_to_full() {
        let mut region = region(256 + 128);
        region.initialize_zones();
        assert_eq!(region.usable_zone_count(), 2);

        for _ in 0..256 {
            region.take_free_page().unwrap();
        }
        assert_eq!(region.usable_zone_count(), 1);
        assert_eq!(region.full_zone_count(), 1);
        assert_eq!(region.used(), 256);

        region.return_page(PhysicalAddress::new(BASE + 10 * PAGE_SIZE as u64));
        assert_eq!(region.usable_zone_count(), 2);
        assert_eq!(region.full_zone_count(), 0);
        assert!(region.is_zone_usable(0));
    }

    #[test]
    fn test_take_free_page_without_usable_zone() {
        let mut region = region(256);
        region.initialize_zones();
        for _ in 0..256 {
            assert!(region.take_free_page().is_some());
        }
        assert_eq!(region.take_free_page(), None);
    }

    #[test]
    fn test_contiguous_request_rounds_up_and_fails_cleanly() {
        let mut region = region(256);
        region.initialize_zones();

        // Use up everything except a single order-2 block at offset 4.
        let mut kept = Vec::new();
        for _ in 0..4 {
            kept.push(region.take_free_page().unwrap());
        }
        let order_2 = region.take_contiguous_free_pages(4).unwrap();
        let mut rest = Vec::new();
        while let Some(page) = region.take_contiguous_free_pages(8) {
            rest.push(page);
        }
        region.return_page(order_2);
        region.return_page(order_2.offset(PAGE_SIZE as u64));
        region.return_page(order_2.offset(2 * PAGE_SIZE as u64));
        region.return_page(order_2.offset(3 * PAGE_SIZE as u64));
        assert_eq!(region.zones()[0].largest_free_order(), Some(2));

        let used_before = region.used();
        assert_eq!(region.take_contiguous_free_pages(5), None);
        assert_eq!(region.used(), used_before);
        assert_eq!(region.zones()[0].largest_free_order(), Some(2));
        assert_eq!(region.zones()[0].free_pages(), 4);
    }

    #[test]
    fn test_contiguous_round_trip_restores_classification() {
        let mut region = region(256);
        region.initialize_zones();

        let base = region.take_contiguous_free_pages(256).unwrap();
        assert_eq!(region.full_zone_count(), 1);

        for i in 0..256 {
            region.return_page(base.offset((i * PAGE_SIZE) as u64));
        }
        assert_eq!(region.usable_zone_count(), 1);
        assert_eq!(region.full_zone_count(), 0);
        assert_eq!(region.zones()[0].largest_free_order(), Some(8));
    }

    #[test]
    fn test_partial_contiguous_round_trip_restores_classification() {
        let mut region = region(8);
        region.initialize_zones();

        let base = region.take_contiguous_free_pages(5).unwrap();
        assert_eq!(region.usable_zone_count(), 1);
        let singles: Vec<_> = (0..3).map(|_| region.take_free_page().unwrap()).collect();
        assert_eq!(region.full_zone_count(), 1);
        assert_eq!(region.zones()[0].largest_free_order(), None);

        for i in 0..5 {
            region.return_page(base.offset((i * PAGE_SIZE) as u64));
        }
        assert_eq!(region.usable_zone_count(), 1);
        assert_eq!(region.full_zone_count(), 0);

        for page in singles {
            region.return_page(page);
        }
        assert_eq!(region.used(), 0);
        assert_eq!(region.zones()[0].free_pages(), 8);
        assert_eq!(region.zones()[0].largest_free_order(), Some(3));
    }

    #[test]
    fn test_contiguous_tail_is_returned() {
        let mut region = region(256);
        region.initialize_zones();

        let base = region.take_contiguous_free_pages(5).unwrap();
        assert_eq!(region.used(), 5);
        assert_eq!(region.zones()[0].free_pages(), 251);
        assert!(region.zones()[0].is_page_free(base.offset(5 * PAGE_SIZE as u64)));
    }

    #[test]
    fn test_take_pages_from_beginning() {
        let mut region = region(1024);
        let taken = region.try_take_pages_from_beginning(256);

        assert_eq!(taken.size(), 256);
        assert_eq!(taken.lower(), PhysicalAddress::new(BASE));
        assert_eq!(taken.upper(), region.lower());
        assert_eq!(region.size(), 768);
        assert_eq!(
            region.size(),
            ((region.upper().get() - region.lower().get()) / PAGE_SIZE as u64) as usize
        );
    }

    #[test]
    #[should_panic]
    fn test_take_all_pages_from_beginning_is_fatal() {
        let mut region = region(16);
        region.try_take_pages_from_beginning(16);
    }

    #[test]
    #[should_panic]
    fn test_take_zero_pages_from_beginning_is_fatal() {
        let mut region = region(16);
        region.try_take_pages_from_beginning(0);
    }

    #[test]
    #[should_panic(expected = "not owned by any zone")]
    fn test_return_foreign_page_is_fatal() {
        let mut region = region(256);
        region.initialize_zones();
        region.return_page(PhysicalAddress::new(BASE - PAGE_SIZE as u64));
    }

    proptest! {
        #[test]
        fn zones_tile_every_page_exactly_once(pages in 1usize..10_000) {
            let mut region = region(pages);
            region.initialize_zones();

            let total: usize = region.zones().iter().map(|z| z.page_count()).sum();
            prop_assert_eq!(total, pages);

            let mut expected = PhysicalAddress::new(BASE);
            for zone in region.zones() {
                prop_assert_eq!(zone.base(), expected);
                expected = expected.offset((zone.page_count() * PAGE_SIZE) as u64);
            }
            prop_assert_eq!(expected, region.upper());
        }

        #[test]
        fn allocations_never_overlap(ops in proptest::collection::vec((any::<bool>(), 1usize..9), 1..200)) {
            let mut region = region(512 + 64);
            region.initialize_zones();
            let mut allocated: BTreeSet<u64> = BTreeSet::new();

            for (allocate, count) in ops {
                if allocate || allocated.is_empty() {
                    let pages: Vec<PhysicalAddress> = if count == 1 {
                        region.take_free_page().into_iter().collect()
                    } else {
                        region
                            .take_contiguous_free_pages(count)
                            .map(|base| (0..count).map(|i| base.offset((i * PAGE_SIZE) as u64)).collect())
                            .unwrap_or_default()
                    };
                    for page in pages {
                        prop_assert!(allocated.insert(page.get()), "page handed out twice");
                        let zone = region.zones().iter().find(|z| z.contains(page)).unwrap();
                        prop_assert!(!zone.is_page_free(page));
                    }
                } else {
                    let victim = *allocated.iter().nth(count % allocated.len()).unwrap();
                    allocated.remove(&victim);
                    region.return_page(PhysicalAddress::new(victim));
                }
                prop_assert_eq!(region.used(), allocated.len());
            }
        }
    }
}
