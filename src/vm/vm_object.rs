//! VM Object
//!
//! A VM object is one unit of backing storage seen as an array of page slots.
//! Each slot is empty or holds a reference to a physical page. The object
//! also keeps a non-owning list of the regions that map it.
//!
//! `VmObjectCore` holds the state every kind of object shares; the concrete
//! kinds (anonymous, private inode, shared inode) embed it and implement the
//! `VmObject` trait.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::inode_vm_object::InodeVmObject;
use super::memory_manager::MemoryManager;
use super::physical_page::PhysicalPage;
use super::region::{Region, RegionId};
use super::{VmError, VmResult, PAGE_SIZE};
use crate::kern::lock::RecursiveSpinLock;
use crate::types::pages_for;

// ============================================================================
// Object Identity
// ============================================================================

/// VM object identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(u64);

impl VmObjectId {
    fn allocate() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VmObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VMObject#{}", self.0)
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Back-link to a mapping region
struct RegionLink {
    id: RegionId,
    region: Weak<Region>,
}

/// Everything guarded by the object lock
struct VmObjectState {
    regions: RefCell<Vec<RegionLink>>,
    physical_pages: RefCell<Box<[Option<PhysicalPage>]>>,
}

/// State common to every VM object
///
/// The slot array never changes length, so `size()` is always
/// `page_count() * PAGE_SIZE`.
pub struct VmObjectCore {
    id: VmObjectId,
    mm: &'static MemoryManager,
    page_count: usize,
    state: RecursiveSpinLock<VmObjectState>,
}

impl VmObjectCore {
    /// Core with `ceil(size / PAGE_SIZE)` empty slots
    pub fn try_new(mm: &'static MemoryManager, size: usize) -> VmResult<Self> {
        let page_count = pages_for(size);
        let mut slots = Vec::new();
        slots.try_reserve_exact(page_count)?;
        slots.resize_with(page_count, || None);
        Ok(Self::with_slots(mm, slots.into_boxed_slice()))
    }

    /// Core over an already built slot array
    pub fn with_slots(mm: &'static MemoryManager, slots: Box<[Option<PhysicalPage>]>) -> Self {
        Self {
            id: VmObjectId::allocate(),
            mm,
            page_count: slots.len(),
            state: RecursiveSpinLock::new(VmObjectState {
                regions: RefCell::new(Vec::new()),
                physical_pages: RefCell::new(slots),
            }),
        }
    }

    /// Core whose slots reference the same pages as `other`
    ///
    /// Frames are shared, not copied. The new core maps no regions.
    pub fn try_clone_from(other: &VmObjectCore) -> VmResult<Self> {
        let slots = other.with_physical_pages(|pages| -> VmResult<_> {
            let mut slots = Vec::new();
            slots.try_reserve_exact(pages.len())?;
            slots.extend(pages.iter().cloned());
            Ok(slots)
        })?;
        Ok(Self::with_slots(other.mm, slots.into_boxed_slice()))
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn memory_manager(&self) -> &'static MemoryManager {
        self.mm
    }

    /// Number of page slots
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    // ------------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------------

    /// Record a region that maps this object
    pub fn add_region(&self, region: &Region) -> VmResult<()> {
        let state = self.state.lock();
        let mut regions = state.regions.borrow_mut();
        regions.try_reserve(1)?;
        regions.push(RegionLink {
            id: region.id(),
            region: region.weak_self(),
        });
        log::trace!("{:?}: region {:?} attached", self.id, region.id());
        Ok(())
    }

    /// Forget a region that stops mapping this object
    ///
    /// Panics if the region was never added.
    pub fn remove_region(&self, region: &Region) {
        let state = self.state.lock();
        let mut regions = state.regions.borrow_mut();
        let position = regions.iter().position(|link| link.id == region.id());
        assert!(
            position.is_some(),
            "{:?}: removing region {:?} that does not map it",
            self.id,
            region.id()
        );
        if let Some(position) = position {
            regions.remove(position);
        }
        log::trace!("{:?}: region {:?} detached", self.id, region.id());
    }

    /// Call `callback` on every mapping region with the object locked
    ///
    /// The callback may re-enter this object's lock but must not add or
    /// remove regions of this object.
    pub fn for_each_region(&self, mut callback: impl FnMut(&Region)) {
        let state = self.state.lock();
        let live: Vec<Arc<Region>> = state
            .regions
            .borrow()
            .iter()
            .filter_map(|link| link.region.upgrade())
            .collect();

        for region in &live {
            callback(region);
        }

        // A region dropped here detaches itself, which re-enters the lock.
        drop(live);
        drop(state);
    }

    /// Number of mapping regions
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.borrow().len()
    }

    // ------------------------------------------------------------------------
    // Page Slots
    // ------------------------------------------------------------------------

    /// Run `f` with the object locked
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock();
        f()
    }

    /// Read the slot array under the object lock
    pub fn with_physical_pages<R>(&self, f: impl FnOnce(&[Option<PhysicalPage>]) -> R) -> R {
        let state = self.state.lock();
        let pages = state.physical_pages.borrow();
        f(&pages)
    }

    /// Modify the slot array under the object lock
    pub fn with_physical_pages_mut<R>(
        &self,
        f: impl FnOnce(&mut [Option<PhysicalPage>]) -> R,
    ) -> R {
        let state = self.state.lock();
        let mut pages = state.physical_pages.borrow_mut();
        f(&mut pages)
    }

    /// The page in slot `index`, if any
    pub fn physical_page(&self, index: usize) -> VmResult<Option<PhysicalPage>> {
        self.with_physical_pages(|pages| {
            pages
                .get(index)
                .cloned()
                .ok_or(VmError::InvalidPageIndex)
        })
    }

    /// Put `page` in slot `index` unless another page got there first
    ///
    /// Returns whichever page ends up resident.
    pub fn install_page(&self, index: usize, page: PhysicalPage) -> VmResult<PhysicalPage> {
        self.with_physical_pages_mut(|pages| -> VmResult<PhysicalPage> {
            let slot = pages.get_mut(index).ok_or(VmError::InvalidPageIndex)?;
            Ok(slot.get_or_insert(page).clone())
        })
    }

    /// Slots holding a page
    pub fn resident_page_count(&self) -> usize {
        self.with_physical_pages(|pages| pages.iter().filter(|slot| slot.is_some()).count())
    }
}

impl Drop for VmObjectCore {
    fn drop(&mut self) {
        self.mm.vmobjects().unregister(self.id);

        let mapped = self.state.get_mut().regions.get_mut().len();
        assert!(
            mapped == 0,
            "{:?} destroyed while still mapped by {} region(s)",
            self.id,
            mapped
        );
    }
}

impl fmt::Debug for VmObjectCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObjectCore")
            .field("id", &self.id)
            .field("page_count", &self.page_count)
            .finish()
    }
}

// ============================================================================
// VM Object Trait
// ============================================================================

/// A unit of backing storage that regions can map
pub trait VmObject: Send + Sync + 'static {
    fn core(&self) -> &VmObjectCore;

    /// Produce the object a new address space gets when this one is cloned
    fn try_clone(&self) -> VmResult<Arc<dyn VmObject>>;

    fn class_name(&self) -> &'static str;

    /// Make slot `page_index` resident and return its page
    fn fault_in_page(&self, page_index: usize) -> VmResult<PhysicalPage>;

    fn is_anonymous(&self) -> bool {
        false
    }

    fn is_inode(&self) -> bool {
        false
    }

    fn is_shared_inode(&self) -> bool {
        false
    }

    fn is_private_inode(&self) -> bool {
        false
    }

    /// The inode-backed part of this object, if it has one
    fn as_inode(&self) -> Option<&InodeVmObject> {
        None
    }

    fn id(&self) -> VmObjectId {
        self.core().id()
    }

    fn page_count(&self) -> usize {
        self.core().page_count()
    }

    fn size(&self) -> usize {
        self.core().size()
    }
}

impl fmt::Debug for dyn VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.class_name())
            .field("id", &self.id())
            .field("page_count", &self.page_count())
            .finish()
    }
}

/// Register a freshly built object with its memory manager
///
/// Registration happens only once the object is complete; if it fails the
/// object is dropped and nothing observable remains.
pub(crate) fn register<T: VmObject>(object: T) -> VmResult<Arc<T>> {
    let object = Arc::new(object);
    object
        .core()
        .memory_manager()
        .vmobjects()
        .register(&object)?;
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_manager::test_memory_manager;
    use crate::vm::{AllocationStrategy, AnonymousVmObject, ShouldZeroFill};

    #[test]
    fn test_core_rounds_up_to_pages() {
        let mm = test_memory_manager(16);
        let core = VmObjectCore::try_new(mm, PAGE_SIZE + 1).unwrap();
        assert_eq!(core.page_count(), 2);
        assert_eq!(core.size(), 2 * PAGE_SIZE);
        assert_eq!(core.resident_page_count(), 0);
        assert_eq!(core.region_count(), 0);
    }

    #[test]
    fn test_ids_are_unique() {
        let mm = test_memory_manager(16);
        let a = VmObjectCore::try_new(mm, PAGE_SIZE).unwrap();
        let b = VmObjectCore::try_new(mm, PAGE_SIZE).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_clone_shares_frames() {
        let mm = test_memory_manager(16);
        let core = VmObjectCore::try_new(mm, 3 * PAGE_SIZE).unwrap();
        let page = mm.allocate_user_physical_page(ShouldZeroFill::Yes).unwrap();
        core.install_page(1, page.clone()).unwrap();

        let clone = VmObjectCore::try_clone_from(&core).unwrap();
        assert_eq!(clone.page_count(), 3);
        assert_eq!(clone.size(), core.size());
        assert_eq!(clone.physical_page(1).unwrap(), Some(page.clone()));
        assert_eq!(clone.physical_page(0).unwrap(), None);
        // Original, clone and local handle.
        assert_eq!(page.ref_count(), 3);

        // Emptying one array leaves the other intact.
        clone.with_physical_pages_mut(|pages| pages[1] = None);
        assert_eq!(core.physical_page(1).unwrap(), Some(page));
    }

    #[test]
    fn test_install_keeps_first_page() {
        let mm = test_memory_manager(16);
        let core = VmObjectCore::try_new(mm, PAGE_SIZE).unwrap();
        let first = mm.allocate_user_physical_page(ShouldZeroFill::No).unwrap();
        let second = mm.allocate_user_physical_page(ShouldZeroFill::No).unwrap();

        let resident = core.install_page(0, first.clone()).unwrap();
        assert_eq!(resident, first);
        let resident = core.install_page(0, second).unwrap();
        assert_eq!(resident, first);
        assert_eq!(
            core.install_page(1, first).err(),
            Some(VmError::InvalidPageIndex)
        );
    }

    #[test]
    fn test_lock_is_reentrant_inside_page_access() {
        let mm = test_memory_manager(16);
        let core = VmObjectCore::try_new(mm, 2 * PAGE_SIZE).unwrap();
        let count = core.with_lock(|| core.resident_page_count() + core.region_count());
        assert_eq!(count, 0);
    }

    #[test]
    fn test_trait_accessors() {
        let mm = test_memory_manager(16);
        let object: Arc<dyn VmObject> =
            AnonymousVmObject::try_create_with_size(mm, 5 * PAGE_SIZE, AllocationStrategy::Reserve)
                .unwrap();
        assert_eq!(object.page_count(), 5);
        assert_eq!(object.size(), 5 * PAGE_SIZE);
        assert!(object.as_inode().is_none());
        assert!(!object.is_inode());
    }
}
