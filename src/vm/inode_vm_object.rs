//! Inode VM Object
//!
//! The part shared by private and shared file-backed objects: a VM object
//! core, the inode it caches, and one dirty bit per page slot.
//!
//! A slot is dirty once its page has been written and not yet synced, clean
//! otherwise. An empty slot is neither.

use alloc::sync::Arc;

use super::dirty_bitmap::DirtyBitmap;
use super::memory_manager::{MemoryManager, ShouldZeroFill};
use super::physical_page::PhysicalPage;
use super::region::Access;
use super::vm_object::VmObjectCore;
use super::{VmError, VmResult, PAGE_SIZE};
use crate::fs::Inode;

/// File-backed VM object state
pub struct InodeVmObject {
    core: VmObjectCore,
    inode: Arc<dyn Inode>,
    dirty_pages: DirtyBitmap,
}

impl InodeVmObject {
    /// Object of `ceil(size / PAGE_SIZE)` empty, clean slots over `inode`
    pub fn try_create(
        mm: &'static MemoryManager,
        inode: Arc<dyn Inode>,
        size: usize,
    ) -> VmResult<Self> {
        let core = VmObjectCore::try_new(mm, size)?;
        let dirty_pages = DirtyBitmap::try_new(core.page_count())?;
        Ok(Self::from_parts(core, inode, dirty_pages))
    }

    fn from_parts(core: VmObjectCore, inode: Arc<dyn Inode>, dirty_pages: DirtyBitmap) -> Self {
        assert_eq!(
            dirty_pages.len(),
            core.page_count(),
            "dirty bitmap length mismatch"
        );
        Self {
            core,
            inode,
            dirty_pages,
        }
    }

    /// Copy with its own slot array and dirty bitmap over the same inode
    ///
    /// The copied slots still reference the same frames.
    pub fn try_clone_nonvirtual(&self) -> VmResult<Self> {
        let (core, dirty_pages) = self.core.with_lock(|| -> VmResult<_> {
            let core = VmObjectCore::try_clone_from(&self.core)?;
            let dirty_pages = self.dirty_pages.try_clone()?;
            Ok((core, dirty_pages))
        })?;
        Ok(Self::from_parts(core, Arc::clone(&self.inode), dirty_pages))
    }

    pub fn core(&self) -> &VmObjectCore {
        &self.core
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub(crate) fn dirty_pages(&self) -> &DirtyBitmap {
        &self.dirty_pages
    }

    // ------------------------------------------------------------------------
    // Dirty Tracking
    // ------------------------------------------------------------------------

    /// Resident pages that are dirty
    pub fn amount_dirty(&self) -> usize {
        self.count_resident(true)
    }

    /// Resident pages that are clean
    pub fn amount_clean(&self) -> usize {
        self.count_resident(false)
    }

    fn count_resident(&self, dirty: bool) -> usize {
        self.core.with_physical_pages(|pages| {
            pages
                .iter()
                .enumerate()
                .filter(|(index, slot)| slot.is_some() && self.dirty_pages.get(*index) == dirty)
                .count()
        })
    }

    pub fn set_page_dirty(&self, page_index: usize, dirty: bool) -> VmResult<()> {
        if page_index >= self.core.page_count() {
            return Err(VmError::InvalidPageIndex);
        }
        self.core
            .with_lock(|| self.dirty_pages.set(page_index, dirty));
        Ok(())
    }

    pub fn is_page_dirty(&self, page_index: usize) -> VmResult<bool> {
        if page_index >= self.core.page_count() {
            return Err(VmError::InvalidPageIndex);
        }
        Ok(self.dirty_pages.get(page_index))
    }

    /// Drop every clean resident page
    ///
    /// Dirty slots and empty slots are left alone. Regions mapping this
    /// object are asked to remap afterwards. Returns the number of pages
    /// released.
    pub fn release_all_clean_pages(&self) -> usize {
        let count = self.core.with_physical_pages_mut(|pages| {
            let mut count = 0;
            for (index, slot) in pages.iter_mut().enumerate() {
                if slot.is_some() && !self.dirty_pages.get(index) {
                    *slot = None;
                    count += 1;
                }
            }
            count
        });

        if count > 0 {
            log::debug!(
                "{:?}: released {} clean page(s)",
                self.core.id(),
                count
            );
            self.core.for_each_region(|region| region.remap());
        }
        count
    }

    // ------------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------------

    /// Regions mapping this object with write access
    pub fn writable_mappings(&self) -> u32 {
        self.count_mappings(Access::WRITE)
    }

    /// Regions mapping this object with execute access
    pub fn executable_mappings(&self) -> u32 {
        self.count_mappings(Access::EXECUTE)
    }

    fn count_mappings(&self, access: Access) -> u32 {
        let mut count = 0;
        self.core.for_each_region(|region| {
            if region.access().contains(access) {
                count += 1;
            }
        });
        count
    }

    // ------------------------------------------------------------------------
    // Paging
    // ------------------------------------------------------------------------

    /// Make slot `page_index` resident, reading its bytes from the inode
    ///
    /// The inode read happens without the object lock. If another caller
    /// fills the slot meanwhile, its page wins and ours is released.
    pub fn fault_in_page(&self, page_index: usize) -> VmResult<PhysicalPage> {
        if let Some(page) = self.core.physical_page(page_index)? {
            return Ok(page);
        }

        let mut buffer = [0u8; PAGE_SIZE];
        let offset = (page_index * PAGE_SIZE) as u64;
        self.inode.read_bytes(offset, &mut buffer)?;

        let mm = self.core.memory_manager();
        let page = mm.allocate_user_physical_page(ShouldZeroFill::No)?;
        mm.write_physical_page(&page, &buffer);

        self.core.with_physical_pages_mut(|pages| -> VmResult<PhysicalPage> {
            let slot = pages
                .get_mut(page_index)
                .ok_or(VmError::InvalidPageIndex)?;
            if slot.is_none() {
                // Fresh from the inode, so clean.
                self.dirty_pages.set(page_index, false);
            }
            Ok(slot.get_or_insert(page).clone())
        })
    }
}
