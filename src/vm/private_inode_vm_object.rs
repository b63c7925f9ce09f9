//! Private Inode VM Object
//!
//! A file mapping owned by one address space. Every creation and every clone
//! yields a new object with its own slot array; two private objects over the
//! same inode never alias.

use alloc::sync::Arc;
use core::ops::Deref;

use super::inode_vm_object::InodeVmObject;
use super::memory_manager::MemoryManager;
use super::physical_page::PhysicalPage;
use super::vm_object::{self, VmObject, VmObjectCore};
use super::{VmError, VmResult};
use crate::fs::Inode;

/// Copy-on-write view of an inode
pub struct PrivateInodeVmObject {
    inner: InodeVmObject,
}

impl PrivateInodeVmObject {
    /// New private object sized to the inode's current size
    pub fn try_create_with_inode(
        mm: &'static MemoryManager,
        inode: &Arc<dyn Inode>,
    ) -> VmResult<Arc<Self>> {
        let size = usize::try_from(inode.size()).map_err(|_| VmError::InvalidRange)?;
        let inner = InodeVmObject::try_create(mm, Arc::clone(inode), size)?;
        vm_object::register(Self { inner })
    }
}

impl Deref for PrivateInodeVmObject {
    type Target = InodeVmObject;

    fn deref(&self) -> &InodeVmObject {
        &self.inner
    }
}

impl VmObject for PrivateInodeVmObject {
    fn core(&self) -> &VmObjectCore {
        self.inner.core()
    }

    fn try_clone(&self) -> VmResult<Arc<dyn VmObject>> {
        let inner = self.inner.try_clone_nonvirtual()?;
        let clone: Arc<dyn VmObject> = vm_object::register(Self { inner })?;
        Ok(clone)
    }

    fn class_name(&self) -> &'static str {
        "PrivateInodeVMObject"
    }

    fn fault_in_page(&self, page_index: usize) -> VmResult<PhysicalPage> {
        self.inner.fault_in_page(page_index)
    }

    fn is_inode(&self) -> bool {
        true
    }

    fn is_private_inode(&self) -> bool {
        true
    }

    fn as_inode(&self) -> Option<&InodeVmObject> {
        Some(&self.inner)
    }
}
