//! Physical Page - Page Frame Descriptors
//!
//! Every frame the memory manager knows about has a fixed descriptor slot in
//! an arena indexed by frame number, so frame-to-descriptor lookup is O(1).
//! A `PhysicalPage` is an owning, reference-counted handle to one slot. When
//! the last handle drops, the descriptor is torn down in place and the frame
//! goes back to the allocator unless it was created as permanently reserved
//! (a framebuffer, say).

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, AtomicBool, AtomicU32, Ordering};

use super::memory_manager::MemoryManager;
use super::VmResult;
use crate::types::PhysicalAddress;

// ============================================================================
// Descriptor Arena
// ============================================================================

/// Descriptor slot for one physical frame
#[derive(Debug, Default)]
pub struct PhysicalPageEntry {
    /// Live handles; 0 means no descriptor is constructed in this slot
    ref_count: AtomicU32,
    /// Return the frame to the allocator when the last handle drops
    may_return_to_freelist: AtomicBool,
}

impl PhysicalPageEntry {
    /// Number of live handles
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Is a descriptor currently constructed here?
    pub fn is_live(&self) -> bool {
        self.ref_count() > 0
    }
}

/// Descriptor slots for a contiguous span of frames
#[derive(Debug)]
pub struct PhysicalPageEntries {
    base_pfn: usize,
    entries: Vec<PhysicalPageEntry>,
}

impl PhysicalPageEntries {
    /// Build slots covering `[lower, upper)`
    pub fn try_new(lower: PhysicalAddress, upper: PhysicalAddress) -> VmResult<Self> {
        assert!(lower.is_page_aligned() && upper.is_page_aligned());
        assert!(lower <= upper);

        let count = upper.pfn() - lower.pfn();
        let mut entries = Vec::new();
        entries.try_reserve_exact(count)?;
        entries.resize_with(count, PhysicalPageEntry::default);

        Ok(Self {
            base_pfn: lower.pfn(),
            entries,
        })
    }

    /// First frame covered
    pub fn lower(&self) -> PhysicalAddress {
        PhysicalAddress::from_pfn(self.base_pfn)
    }

    /// End of the covered span (exclusive)
    pub fn upper(&self) -> PhysicalAddress {
        PhysicalAddress::from_pfn(self.base_pfn + self.entries.len())
    }

    /// Slot for the frame containing `paddr`
    pub fn entry(&self, paddr: PhysicalAddress) -> Option<&PhysicalPageEntry> {
        paddr
            .pfn()
            .checked_sub(self.base_pfn)
            .and_then(|index| self.entries.get(index))
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of slots with a live descriptor
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_live()).count()
    }
}

// ============================================================================
// Page Handle
// ============================================================================

/// Owning handle to one physical page frame
///
/// Cloning shares the frame; the frame is released exactly once, by
/// whichever handle drops last.
pub struct PhysicalPage {
    mm: &'static MemoryManager,
    pfn: usize,
}

impl PhysicalPage {
    /// Construct a descriptor for the frame at `paddr`
    ///
    /// The frame must lie inside the memory manager's page-entry table and
    /// must not already have a live descriptor.
    pub fn create(
        mm: &'static MemoryManager,
        paddr: PhysicalAddress,
        may_return_to_freelist: bool,
    ) -> PhysicalPage {
        let entry = mm.get_physical_page_entry(paddr);
        let claimed = entry
            .ref_count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        assert!(claimed, "frame {:?} already has a live descriptor", paddr);
        entry
            .may_return_to_freelist
            .store(may_return_to_freelist, Ordering::Release);

        PhysicalPage {
            mm,
            pfn: paddr.pfn(),
        }
    }

    /// Physical address of the frame
    pub fn paddr(&self) -> PhysicalAddress {
        PhysicalAddress::from_pfn(self.pfn)
    }

    /// Live handles to this frame
    pub fn ref_count(&self) -> u32 {
        self.entry().ref_count()
    }

    pub fn may_return_to_freelist(&self) -> bool {
        self.entry().may_return_to_freelist.load(Ordering::Acquire)
    }

    /// Do both handles refer to the same frame?
    pub fn ptr_eq(a: &PhysicalPage, b: &PhysicalPage) -> bool {
        a.pfn == b.pfn && core::ptr::eq(a.mm, b.mm)
    }

    /// The memory manager that owns this frame
    pub fn memory_manager(&self) -> &'static MemoryManager {
        self.mm
    }

    fn entry(&self) -> &'static PhysicalPageEntry {
        self.mm.get_physical_page_entry(self.paddr())
    }

    fn free_this(&self) {
        let entry = self.entry();
        let may_return = entry.may_return_to_freelist.swap(false, Ordering::AcqRel);
        if may_return {
            self.mm.deallocate_physical_page(self.paddr());
        }
    }
}

impl Clone for PhysicalPage {
    fn clone(&self) -> Self {
        self.entry().ref_count.fetch_add(1, Ordering::Relaxed);
        PhysicalPage {
            mm: self.mm,
            pfn: self.pfn,
        }
    }
}

impl Drop for PhysicalPage {
    fn drop(&mut self) {
        if self.entry().ref_count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        fence(Ordering::Acquire);
        self.free_this();
    }
}

impl PartialEq for PhysicalPage {
    fn eq(&self, other: &Self) -> bool {
        PhysicalPage::ptr_eq(self, other)
    }
}

impl Eq for PhysicalPage {}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("paddr", &self.paddr())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
