//! Memory Manager
//!
//! The boot-time service that owns physical memory: the page-entry table,
//! the user and supervisor physical regions, the registry of live VM objects
//! and the backend used to touch frame contents.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::Write;
use spin::Mutex;

use super::frame_access::PhysicalMemoryAccess;
use super::physical_page::{PhysicalPage, PhysicalPageEntries, PhysicalPageEntry};
use super::physical_region::PhysicalRegion;
use super::registry::VmObjectRegistry;
use super::vm_object::{VmObject, VmObjectId};
use super::{VmError, VmResult, PAGE_SIZE};
use crate::boot::{MemoryMap, MemoryMapError};
use crate::types::{pages_for, PhysicalAddress};

// ============================================================================
// Configuration
// ============================================================================

/// Boot parameters for the memory manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Pages carved off the largest region for supervisor allocations
    pub supervisor_pages: usize,
}

/// Whether a freshly allocated user page is cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldZeroFill {
    No,
    Yes,
}

// ============================================================================
// Statistics
// ============================================================================

/// System-wide memory counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemMemoryInfo {
    pub user_physical_pages: usize,
    pub user_physical_pages_used: usize,
    pub super_physical_pages: usize,
    pub super_physical_pages_used: usize,
    /// Live VM objects
    pub vmobject_count: usize,
    /// Slots holding a page, summed over every live VM object
    pub resident_vmobject_pages: usize,
}

/// Snapshot of one live VM object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmObjectInfo {
    pub id: VmObjectId,
    pub class_name: &'static str,
    pub page_count: usize,
    pub resident_pages: usize,
    pub dirty_pages: usize,
    pub region_count: usize,
}

impl VmObjectInfo {
    /// One line in the style of `/proc/mm`
    pub fn describe(&self) -> heapless::String<128> {
        let mut line = heapless::String::new();
        // Truncation only loses the tail of the line.
        let _ = write!(
            line,
            "{:>6} {:<24} pages={} resident={} dirty={} regions={}",
            self.id.as_u64(),
            self.class_name,
            self.page_count,
            self.resident_pages,
            self.dirty_pages,
            self.region_count
        );
        line
    }
}

// ============================================================================
// Memory Manager
// ============================================================================

/// Physical regions, guarded together by the allocator lock
struct PhysicalAllocator {
    user_regions: Vec<PhysicalRegion>,
    supervisor_region: Option<PhysicalRegion>,
}

impl PhysicalAllocator {
    fn region_for(&mut self, paddr: PhysicalAddress) -> Option<&mut PhysicalRegion> {
        if let Some(region) = self.supervisor_region.as_mut() {
            if region.contains(paddr) {
                return Some(region);
            }
        }
        self.user_regions
            .iter_mut()
            .find(|region| region.contains(paddr))
    }
}

/// The physical memory service
pub struct MemoryManager {
    page_entries: PhysicalPageEntries,
    allocator: Mutex<PhysicalAllocator>,
    vmobjects: VmObjectRegistry,
    frames: Box<dyn PhysicalMemoryAccess>,
    user_physical_pages: usize,
    super_physical_pages: usize,
}

impl MemoryManager {
    /// Build a memory manager from the boot memory map
    ///
    /// The manager lives for the rest of the kernel's lifetime.
    pub fn boot(
        memory_map: &MemoryMap<'_>,
        config: MemoryManagerConfig,
        frames: Box<dyn PhysicalMemoryAccess>,
    ) -> VmResult<&'static MemoryManager> {
        if let Err(err) = memory_map.validate() {
            log::error!("MM: rejecting memory map: {:?}", err);
            return Err(VmError::InvalidMemoryMap(err));
        }
        memory_map.log_memory_map();

        let (span_lower, span_upper) = memory_map
            .physical_span()
            .ok_or(VmError::InvalidMemoryMap(MemoryMapError::Empty))?;
        let page_entries = PhysicalPageEntries::try_new(
            PhysicalAddress::new(span_lower),
            PhysicalAddress::new(span_upper),
        )?;

        let mut user_regions = Vec::new();
        for (lower, upper) in memory_map.available_ranges() {
            log::debug!("MM: physical region {:#016x}-{:#016x}", lower, upper - 1);
            user_regions.try_reserve(1)?;
            user_regions.push(PhysicalRegion::new(
                PhysicalAddress::new(lower),
                PhysicalAddress::new(upper),
            ));
        }

        let mut supervisor_region = if config.supervisor_pages > 0 {
            let largest = user_regions
                .iter_mut()
                .max_by_key(|region| region.size())
                .ok_or(VmError::InvalidMemoryMap(MemoryMapError::NoUsableMemory))?;
            if config.supervisor_pages >= largest.size() {
                log::error!(
                    "MM: {} supervisor pages do not fit in the largest region ({} pages)",
                    config.supervisor_pages,
                    largest.size()
                );
                return Err(VmError::InvalidMemoryMap(MemoryMapError::SupervisorTooLarge));
            }
            Some(largest.try_take_pages_from_beginning(config.supervisor_pages))
        } else {
            None
        };

        for region in user_regions.iter_mut().chain(supervisor_region.iter_mut()) {
            region.initialize_zones();
        }

        let user_physical_pages: usize = user_regions.iter().map(PhysicalRegion::size).sum();
        let super_physical_pages = supervisor_region.as_ref().map_or(0, PhysicalRegion::size);
        log::info!(
            "MM: {} user pages, {} supervisor pages, {} page entries",
            user_physical_pages,
            super_physical_pages,
            page_entries.len()
        );

        let mm = Box::new(MemoryManager {
            page_entries,
            allocator: Mutex::new(PhysicalAllocator {
                user_regions,
                supervisor_region,
            }),
            vmobjects: VmObjectRegistry::new(),
            frames,
            user_physical_pages,
            super_physical_pages,
        });
        Ok(Box::leak(mm))
    }

    /// Allocate one page from the user regions
    pub fn allocate_user_physical_page(
        &'static self,
        should_zero_fill: ShouldZeroFill,
    ) -> VmResult<PhysicalPage> {
        let paddr = {
            let mut allocator = self.allocator.lock();
            allocator
                .user_regions
                .iter_mut()
                .filter(|region| region.used() < region.size())
                .find_map(PhysicalRegion::take_free_page)
        };
        let Some(paddr) = paddr else {
            log::warn!("MM: no user physical pages available");
            return Err(VmError::OutOfMemory);
        };

        if should_zero_fill == ShouldZeroFill::Yes {
            self.frames.zero_frame(paddr);
        }
        Ok(PhysicalPage::create(self, paddr, true))
    }

    /// Allocate one zeroed page from the supervisor region
    pub fn allocate_supervisor_physical_page(&'static self) -> VmResult<PhysicalPage> {
        let paddr = self
            .allocator
            .lock()
            .supervisor_region
            .as_mut()
            .and_then(PhysicalRegion::take_free_page)
            .ok_or(VmError::OutOfMemory)?;

        self.frames.zero_frame(paddr);
        Ok(PhysicalPage::create(self, paddr, true))
    }

    /// Allocate zeroed, physically contiguous supervisor pages covering `size` bytes
    pub fn allocate_contiguous_supervisor_physical_pages(
        &'static self,
        size: usize,
    ) -> VmResult<Vec<PhysicalPage>> {
        let count = pages_for(size);
        if count == 0 {
            return Err(VmError::InvalidRange);
        }

        let mut pages = Vec::new();
        pages.try_reserve_exact(count)?;

        let base = self
            .allocator
            .lock()
            .supervisor_region
            .as_mut()
            .and_then(|region| region.take_contiguous_free_pages(count))
            .ok_or(VmError::NoContiguousBlock)?;

        for i in 0..count {
            let paddr = base.offset((i * PAGE_SIZE) as u64);
            self.frames.zero_frame(paddr);
            pages.push(PhysicalPage::create(self, paddr, true));
        }
        Ok(pages)
    }

    /// Give a frame back to the region that owns it
    ///
    /// Panics if no region owns `paddr`.
    pub fn deallocate_physical_page(&self, paddr: PhysicalAddress) {
        let mut allocator = self.allocator.lock();
        match allocator.region_for(paddr) {
            Some(region) => region.return_page(paddr),
            None => panic!("MM: deallocate_physical_page: {:?} is not in any region", paddr),
        }
    }

    /// Descriptor slot for the frame containing `paddr`
    ///
    /// Panics if the frame lies outside the page-entry table.
    pub fn get_physical_page_entry(&self, paddr: PhysicalAddress) -> &PhysicalPageEntry {
        match self.page_entries.entry(paddr) {
            Some(entry) => entry,
            None => panic!("MM: {:?} is outside the physical page table", paddr),
        }
    }

    pub fn get_physical_address(&self, page: &PhysicalPage) -> PhysicalAddress {
        page.paddr()
    }

    /// Copy the contents of `page` into `buffer`
    pub fn copy_physical_page(&self, page: &PhysicalPage, buffer: &mut [u8; PAGE_SIZE]) {
        self.frames.read_frame(page.paddr(), buffer);
    }

    /// Overwrite the contents of `page`
    pub fn write_physical_page(&self, page: &PhysicalPage, data: &[u8; PAGE_SIZE]) {
        self.frames.write_frame(page.paddr(), data);
    }

    pub fn frames(&self) -> &dyn PhysicalMemoryAccess {
        &*self.frames
    }

    /// Registry of every live VM object
    pub fn vmobjects(&self) -> &VmObjectRegistry {
        &self.vmobjects
    }

    pub fn page_entries(&self) -> &PhysicalPageEntries {
        &self.page_entries
    }

    /// Snapshot of the system-wide counters
    pub fn system_memory_info(&self) -> SystemMemoryInfo {
        let (user_used, super_used) = {
            let allocator = self.allocator.lock();
            let user_used: usize = allocator.user_regions.iter().map(PhysicalRegion::used).sum();
            let super_used = allocator
                .supervisor_region
                .as_ref()
                .map_or(0, PhysicalRegion::used);
            (user_used, super_used)
        };

        let (vmobject_count, resident_vmobject_pages) = self.vmobjects.with_lock(|objects| {
            let resident: usize = objects
                .iter()
                .map(|object| object.core().resident_page_count())
                .sum();
            (objects.len(), resident)
        });

        SystemMemoryInfo {
            user_physical_pages: self.user_physical_pages,
            user_physical_pages_used: user_used,
            super_physical_pages: self.super_physical_pages,
            super_physical_pages_used: super_used,
            vmobject_count,
            resident_vmobject_pages,
        }
    }

    /// Describe every live VM object
    pub fn vmobject_report(&self) -> VmResult<Vec<VmObjectInfo>> {
        self.vmobjects.with_lock(|objects| -> VmResult<Vec<VmObjectInfo>> {
            let mut report = Vec::new();
            report.try_reserve_exact(objects.len())?;
            for object in objects {
                let core = object.core();
                report.push(VmObjectInfo {
                    id: core.id(),
                    class_name: object.class_name(),
                    page_count: core.page_count(),
                    resident_pages: core.resident_page_count(),
                    dirty_pages: object.as_inode().map_or(0, |inode| inode.amount_dirty()),
                    region_count: core.region_count(),
                });
            }
            Ok(report)
        })
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
const TEST_PHYSICAL_BASE: u64 = 0x10_0000;

#[cfg(test)]
const TEST_SUPERVISOR_PAGES: usize = 32;

#[cfg(test)]
const TEST_DEVICE_PAGES: usize = 16;

/// A private manager with `user_pages` user pages, 32 supervisor pages and a
/// small device range that is described but never allocated from
#[cfg(test)]
pub(crate) fn test_memory_manager(user_pages: usize) -> &'static MemoryManager {
    use crate::boot::{MemoryMapEntry, MemoryType};
    use crate::vm::RamPhysicalMemory;

    let available = ((user_pages + TEST_SUPERVISOR_PAGES) * PAGE_SIZE) as u64;
    let entries = [
        MemoryMapEntry::new(MemoryType::Reserved, 0, TEST_PHYSICAL_BASE),
        MemoryMapEntry::new(MemoryType::Available, TEST_PHYSICAL_BASE, available),
        MemoryMapEntry::new(
            MemoryType::Device,
            TEST_PHYSICAL_BASE + available,
            (TEST_DEVICE_PAGES * PAGE_SIZE) as u64,
        ),
    ];

    MemoryManager::boot(
        &MemoryMap::new(&entries),
        MemoryManagerConfig {
            supervisor_pages: TEST_SUPERVISOR_PAGES,
        },
        Box::new(RamPhysicalMemory::new()),
    )
    .unwrap()
}

#[cfg(test)]
impl MemoryManager {
    /// First frame of the device range of a `test_memory_manager`
    pub(crate) fn test_device_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.page_entries.upper().get() - (TEST_DEVICE_PAGES * PAGE_SIZE) as u64)
    }
}
