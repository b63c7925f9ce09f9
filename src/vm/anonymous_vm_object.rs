//! Anonymous VM Object
//!
//! Memory with no backing file: zero-filled on first touch, or committed up
//! front. Also used to wrap fixed physical ranges such as a framebuffer,
//! whose frames never go back to the allocator.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::memory_manager::{MemoryManager, ShouldZeroFill};
use super::physical_page::PhysicalPage;
use super::vm_object::{self, VmObject, VmObjectCore};
use super::{VmError, VmResult, PAGE_SIZE};
use crate::types::{pages_for, PhysicalAddress};

/// When an anonymous object gets its pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Zero-fill each page on first fault
    Reserve,
    /// Allocate and zero every page now
    AllocateNow,
}

/// Zero-fill memory
pub struct AnonymousVmObject {
    core: VmObjectCore,
}

impl AnonymousVmObject {
    pub fn try_create_with_size(
        mm: &'static MemoryManager,
        size: usize,
        strategy: AllocationStrategy,
    ) -> VmResult<Arc<Self>> {
        let core = match strategy {
            AllocationStrategy::Reserve => VmObjectCore::try_new(mm, size)?,
            AllocationStrategy::AllocateNow => {
                let page_count = pages_for(size);
                let mut slots = Vec::new();
                slots.try_reserve_exact(page_count)?;
                for _ in 0..page_count {
                    // Pages taken so far are released if this fails.
                    slots.push(Some(mm.allocate_user_physical_page(ShouldZeroFill::Yes)?));
                }
                VmObjectCore::with_slots(mm, slots.into_boxed_slice())
            }
        };
        vm_object::register(Self { core })
    }

    /// Object over the fixed frames `[paddr, paddr + size)`
    ///
    /// The frames must not be managed by any physical region.
    pub fn try_create_for_physical_range(
        mm: &'static MemoryManager,
        paddr: PhysicalAddress,
        size: usize,
    ) -> VmResult<Arc<Self>> {
        if !paddr.is_page_aligned() {
            return Err(VmError::InvalidRange);
        }
        let page_count = pages_for(size);
        let mut slots = Vec::new();
        slots.try_reserve_exact(page_count)?;
        for index in 0..page_count {
            let frame = paddr.offset((index * PAGE_SIZE) as u64);
            slots.push(Some(PhysicalPage::create(mm, frame, false)));
        }
        vm_object::register(Self {
            core: VmObjectCore::with_slots(mm, slots.into_boxed_slice()),
        })
    }
}

impl VmObject for AnonymousVmObject {
    fn core(&self) -> &VmObjectCore {
        &self.core
    }

    /// Shallow clone; both objects reference the same frames
    fn try_clone(&self) -> VmResult<Arc<dyn VmObject>> {
        let core = VmObjectCore::try_clone_from(&self.core)?;
        let clone: Arc<dyn VmObject> = vm_object::register(Self { core })?;
        Ok(clone)
    }

    fn class_name(&self) -> &'static str {
        "AnonymousVMObject"
    }

    fn fault_in_page(&self, page_index: usize) -> VmResult<PhysicalPage> {
        if let Some(page) = self.core.physical_page(page_index)? {
            return Ok(page);
        }
        let page = self
            .core
            .memory_manager()
            .allocate_user_physical_page(ShouldZeroFill::Yes)?;
        self.core.install_page(page_index, page)
    }

    fn is_anonymous(&self) -> bool {
        true
    }
}
