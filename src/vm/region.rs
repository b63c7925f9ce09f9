//! Region
//!
//! A mapping of part of a VM object into one address space. The region owns
//! a reference to its object and attaches itself to the object's region list
//! for as long as it exists. Page-table installation is done elsewhere; a
//! region only records that its mapping needs refreshing.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use super::physical_page::PhysicalPage;
use super::vm_object::VmObject;
use super::{VmError, VmResult, PAGE_SIZE};
use crate::types::{VirtualAddress, VirtualRange};

bitflags! {
    /// Region access rights
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Region identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

impl RegionId {
    fn allocate() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// A window onto a VM object at a virtual address
pub struct Region {
    id: RegionId,
    this: Weak<Region>,
    range: VirtualRange,
    vmobject: Arc<dyn VmObject>,
    offset_in_vmobject: usize,
    name: Option<String>,
    access: Access,
    shared: bool,
    /// Listed in the object's region list
    attached: AtomicBool,
    remap_count: AtomicU64,
}

impl Region {
    /// Map `range` of `vmobject` starting `offset_in_vmobject` bytes in
    ///
    /// The range and offset must be page aligned and the window must fit
    /// inside the object.
    pub fn try_create(
        range: VirtualRange,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        shared: bool,
    ) -> VmResult<Arc<Region>> {
        if !range.base().is_page_aligned()
            || range.size() % PAGE_SIZE != 0
            || offset_in_vmobject % PAGE_SIZE != 0
        {
            return Err(VmError::InvalidRange);
        }
        let end = offset_in_vmobject
            .checked_add(range.size())
            .ok_or(VmError::InvalidRange)?;
        if end > vmobject.size() {
            return Err(VmError::InvalidRange);
        }

        let region = Arc::new_cyclic(|this| Region {
            id: RegionId::allocate(),
            this: this.clone(),
            range,
            vmobject,
            offset_in_vmobject,
            name,
            access,
            shared,
            attached: AtomicBool::new(false),
            remap_count: AtomicU64::new(0),
        });

        region.vmobject.core().add_region(&region)?;
        region.attached.store(true, Ordering::Release);
        Ok(region)
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub(crate) fn weak_self(&self) -> Weak<Region> {
        self.this.clone()
    }

    pub fn range(&self) -> VirtualRange {
        self.range
    }

    pub fn vaddr(&self) -> VirtualAddress {
        self.range.base()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn page_count(&self) -> usize {
        self.range.size() / PAGE_SIZE
    }

    /// Index of the object's page that this region's page 0 maps
    pub fn first_page_index(&self) -> usize {
        self.offset_in_vmobject / PAGE_SIZE
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    pub fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.vmobject
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The page behind this region's page `index`, if resident
    ///
    /// Panics if `index` is outside the region.
    pub fn physical_page(&self, index: usize) -> Option<PhysicalPage> {
        assert!(index < self.page_count(), "page {} outside region", index);
        self.vmobject
            .core()
            .physical_page(self.first_page_index() + index)
            .ok()
            .flatten()
    }

    /// Run `f` on the object slot behind this region's page `index`
    ///
    /// The object lock is held while `f` runs.
    pub fn with_physical_page_slot<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Option<PhysicalPage>) -> R,
    ) -> R {
        assert!(index < self.page_count(), "page {} outside region", index);
        let slot_index = self.first_page_index() + index;
        self.vmobject
            .core()
            .with_physical_pages_mut(|pages| f(&mut pages[slot_index]))
    }

    /// Make this region's page `index` resident
    pub fn page_in(&self, index: usize) -> VmResult<PhysicalPage> {
        if index >= self.page_count() {
            return Err(VmError::InvalidPageIndex);
        }
        self.vmobject.fault_in_page(self.first_page_index() + index)
    }

    /// Ask for the mapping to be rebuilt from the object's slots
    pub fn remap(&self) {
        self.remap_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Remap requests so far
    pub fn remap_count(&self) -> u64 {
        self.remap_count.load(Ordering::Relaxed)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.attached.load(Ordering::Acquire) {
            self.vmobject.core().remove_region(self);
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("vmobject", &self.vmobject.id())
            .field("offset_in_vmobject", &self.offset_in_vmobject)
            .field("access", &self.access)
            .field("shared", &self.shared)
            .finish()
    }
}
