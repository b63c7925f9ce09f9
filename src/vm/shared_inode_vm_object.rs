//! Shared Inode VM Object
//!
//! A file mapping seen by every address space that maps the inode shared.
//! The inode keeps a weak reference to its shared object, so repeated
//! lookups converge on one instance for as long as anyone holds it.

use alloc::sync::Arc;
use core::ops::Deref;

use super::inode_vm_object::InodeVmObject;
use super::memory_manager::MemoryManager;
use super::physical_page::PhysicalPage;
use super::vm_object::{self, VmObject, VmObjectCore};
use super::{VmError, VmResult, PAGE_SIZE};
use crate::fs::{Inode, InodeError};

/// The one shared VM object of an inode
pub struct SharedInodeVmObject {
    inner: InodeVmObject,
}

impl SharedInodeVmObject {
    /// The inode's live shared object, or a new one recorded on the inode
    pub fn try_create_with_inode(
        mm: &'static MemoryManager,
        inode: &Arc<dyn Inode>,
    ) -> VmResult<Arc<Self>> {
        inode.shared_vmobject_slot().get_or_try_create(|| {
            let size = usize::try_from(inode.size()).map_err(|_| VmError::InvalidRange)?;
            let inner = InodeVmObject::try_create(mm, Arc::clone(inode), size)?;
            let object = vm_object::register(Self { inner })?;
            log::debug!(
                "{:?}: shared object for inode {}",
                object.id(),
                inode.identifier()
            );
            Ok(object)
        })
    }

    /// Write resident pages `[offset_in_pages, offset_in_pages + pages)` back to the inode
    ///
    /// The range is clamped to the object. Every resident page is written,
    /// trimmed to the inode's size. A page's dirty bit is cleared under the
    /// object lock when its frame is copied out, so a write landing after the
    /// copy dirties it again. Pages wholly past the end of the file have
    /// nothing to write back and are marked clean. The first failed write
    /// stops the sync with that page's dirty bit restored; later pages are
    /// left untouched.
    pub fn sync(&self, offset_in_pages: usize, pages: usize) -> VmResult<()> {
        let core = self.core();
        let end = core
            .page_count()
            .min(offset_in_pages.saturating_add(pages));
        let inode = self.inode();
        let inode_size = inode.size();
        let mm = core.memory_manager();
        let dirty_pages = self.dirty_pages();
        let mut buffer = [0u8; PAGE_SIZE];

        for page_index in offset_in_pages..end {
            let byte_offset = (page_index * PAGE_SIZE) as u64;
            if byte_offset >= inode_size {
                core.with_lock(|| dirty_pages.set(page_index, false));
                continue;
            }

            // Snapshot the frame under the lock; write it out without.
            let resident = core.with_physical_pages(|slots| {
                let Some(page) = slots[page_index].as_ref() else {
                    return false;
                };
                dirty_pages.set(page_index, false);
                mm.copy_physical_page(page, &mut buffer);
                true
            });
            if !resident {
                continue;
            }

            let length = (inode_size - byte_offset).min(PAGE_SIZE as u64) as usize;
            let result = match inode.write_bytes(byte_offset, &buffer[..length]) {
                Ok(written) if written == length => Ok(()),
                Ok(_) => Err(VmError::Io(InodeError::ShortTransfer)),
                Err(err) => Err(VmError::Io(err)),
            };
            if let Err(err) = result {
                log::warn!(
                    "{:?}: sync of page {} failed: {:?}",
                    core.id(),
                    page_index,
                    err
                );
                core.with_lock(|| dirty_pages.set(page_index, true));
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Deref for SharedInodeVmObject {
    type Target = InodeVmObject;

    fn deref(&self) -> &InodeVmObject {
        &self.inner
    }
}

impl VmObject for SharedInodeVmObject {
    fn core(&self) -> &VmObjectCore {
        self.inner.core()
    }

    /// A clone gets its own slot array and is not recorded on the inode
    fn try_clone(&self) -> VmResult<Arc<dyn VmObject>> {
        let inner = self.inner.try_clone_nonvirtual()?;
        let clone: Arc<dyn VmObject> = vm_object::register(Self { inner })?;
        Ok(clone)
    }

    fn class_name(&self) -> &'static str {
        "SharedInodeVMObject"
    }

    fn fault_in_page(&self, page_index: usize) -> VmResult<PhysicalPage> {
        self.inner.fault_in_page(page_index)
    }

    fn is_inode(&self) -> bool {
        true
    }

    fn is_shared_inode(&self) -> bool {
        true
    }

    fn as_inode(&self) -> Option<&InodeVmObject> {
        Some(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InodeIdentifier, RamInode, SharedVmObjectSlot};
    use crate::vm::memory_manager::test_memory_manager;
    use alloc::sync::Weak;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;
    use std::sync::Barrier;
    use std::thread;

    /// RAM inode whose next write first stores new bytes into page 0
    ///
    /// Stands in for a user write fault landing while the write-back of
    /// page 0 is in flight.
    struct WriteDuringSyncInode {
        ram: RamInode,
        object: Mutex<Weak<SharedInodeVmObject>>,
        armed: AtomicBool,
    }

    impl Inode for WriteDuringSyncInode {
        fn identifier(&self) -> InodeIdentifier {
            self.ram.identifier()
        }

        fn size(&self) -> u64 {
            self.ram.size()
        }

        fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, InodeError> {
            self.ram.read_bytes(offset, buffer)
        }

        fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize, InodeError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                if let Some(object) = self.object.lock().upgrade() {
                    let page = object.fault_in_page(0).unwrap();
                    object
                        .core()
                        .memory_manager()
                        .write_physical_page(&page, &[0xee; PAGE_SIZE]);
                    object.set_page_dirty(0, true).unwrap();
                }
            }
            self.ram.write_bytes(offset, data)
        }

        fn shared_vmobject_slot(&self) -> &SharedVmObjectSlot {
            self.ram.shared_vmobject_slot()
        }
    }

    fn ram_inode(bytes: usize) -> Arc<RamInode> {
        Arc::new(RamInode::new(
            InodeIdentifier { fsid: 4, index: 9 },
            vec![0u8; bytes],
        ))
    }

    fn fill(object: &SharedInodeVmObject, page_index: usize, byte: u8) {
        let page = object.fault_in_page(page_index).unwrap();
        object
            .core()
            .memory_manager()
            .write_physical_page(&page, &[byte; PAGE_SIZE]);
        object.set_page_dirty(page_index, true).unwrap();
    }

    #[test]
    fn test_same_inode_same_object() {
        let mm = test_memory_manager(16);
        let inode: Arc<dyn Inode> = ram_inode(PAGE_SIZE);

        let a = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        let b = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&inode.shared_vmobject().unwrap(), &a));
        assert_eq!(mm.vmobjects().count(), 1);

        let first_id = a.id();
        drop(a);
        drop(b);
        assert!(inode.shared_vmobject().is_none());

        let c = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        assert_ne!(c.id(), first_id);
    }

    #[test]
    fn test_concurrent_creation_converges() {
        let mm = test_memory_manager(16);
        let inode: Arc<dyn Inode> = ram_inode(2 * PAGE_SIZE);
        let barrier = Arc::new(Barrier::new(8));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let inode = Arc::clone(&inode);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap()
                })
            })
            .collect();
        let objects: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        for object in &objects[1..] {
            assert!(Arc::ptr_eq(object, &objects[0]));
        }
        assert_eq!(mm.vmobjects().count(), 1);
    }

    #[test]
    fn test_clone_is_a_new_object() {
        let mm = test_memory_manager(16);
        let inode: Arc<dyn Inode> = ram_inode(PAGE_SIZE);
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();

        let clone = object.try_clone().unwrap();
        assert!(clone.is_shared_inode());
        assert_ne!(clone.id(), object.id());
        // The inode still resolves to the original.
        assert!(Arc::ptr_eq(&inode.shared_vmobject().unwrap(), &object));
    }

    #[test]
    fn test_sync_writes_pages_and_clears_dirty_bits() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(3 * PAGE_SIZE);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();

        fill(&object, 0, 0xaa);
        fill(&object, 2, 0xcc);
        assert_eq!(object.amount_dirty(), 2);

        object.sync(0, 3).unwrap();
        assert_eq!(object.amount_dirty(), 0);
        assert_eq!(object.amount_clean(), 2);
        // Empty slot 1 is not written.
        assert_eq!(ram.write_calls(), 2);

        let contents = ram.contents();
        assert!(contents[..PAGE_SIZE].iter().all(|&b| b == 0xaa));
        assert!(contents[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|&b| b == 0));
        assert!(contents[2 * PAGE_SIZE..].iter().all(|&b| b == 0xcc));
    }

    #[test]
    fn test_sync_failure_keeps_dirty_bits() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(3 * PAGE_SIZE);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        for index in 0..3 {
            fill(&object, index, index as u8 + 1);
        }

        ram.fail_writes_after(1);
        assert_eq!(object.sync(0, 3), Err(VmError::Io(InodeError::Io)));
        assert_eq!(object.is_page_dirty(0), Ok(false));
        assert_eq!(object.is_page_dirty(1), Ok(true));
        assert_eq!(object.is_page_dirty(2), Ok(true));

        ram.clear_write_failure();
        object.sync(0, 3).unwrap();
        assert_eq!(object.amount_dirty(), 0);
    }

    #[test]
    fn test_sync_clamps_to_object_and_file() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(PAGE_SIZE + 100);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        assert_eq!(object.page_count(), 2);
        fill(&object, 1, 0x77);

        object.sync(1, usize::MAX).unwrap();
        // The file does not grow past its size.
        assert_eq!(ram.contents().len(), PAGE_SIZE + 100);
        assert!(ram.contents()[PAGE_SIZE..].iter().all(|&b| b == 0x77));

        // A range past the end of the object writes nothing.
        let calls = ram.write_calls();
        object.sync(5, 3).unwrap();
        assert_eq!(ram.write_calls(), calls);
    }

    #[test]
    fn test_write_during_sync_stays_dirty() {
        let mm = test_memory_manager(16);
        let racy = Arc::new(WriteDuringSyncInode {
            ram: RamInode::new(InodeIdentifier { fsid: 4, index: 10 }, vec![0u8; PAGE_SIZE]),
            object: Mutex::new(Weak::new()),
            armed: AtomicBool::new(false),
        });
        let inode: Arc<dyn Inode> = racy.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        *racy.object.lock() = Arc::downgrade(&object);
        fill(&object, 0, 0xaa);

        racy.armed.store(true, Ordering::SeqCst);
        object.sync(0, 1).unwrap();

        // The snapshot went out; the newer bytes did not.
        assert!(racy.ram.contents().iter().all(|&b| b == 0xaa));
        assert_eq!(object.is_page_dirty(0), Ok(true));
        assert_eq!(object.release_all_clean_pages(), 0);

        object.sync(0, 1).unwrap();
        assert!(racy.ram.contents().iter().all(|&b| b == 0xee));
        assert_eq!(object.is_page_dirty(0), Ok(false));
    }

    #[test]
    fn test_failed_write_restores_dirty_bit() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(2 * PAGE_SIZE);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        fill(&object, 0, 0x11);

        ram.fail_writes_after(0);
        assert_eq!(object.sync(0, 1), Err(VmError::Io(InodeError::Io)));
        assert_eq!(object.is_page_dirty(0), Ok(true));
        assert_eq!(object.release_all_clean_pages(), 0);
    }

    #[test]
    fn test_sync_concurrent_with_writes_never_loses_data() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(PAGE_SIZE);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let writer = {
            let object = Arc::clone(&object);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for value in 1..=200u8 {
                    let page = object.fault_in_page(0).unwrap();
                    object
                        .core()
                        .memory_manager()
                        .write_physical_page(&page, &[value; PAGE_SIZE]);
                    object.set_page_dirty(0, true).unwrap();
                }
            })
        };
        let syncer = {
            let object = Arc::clone(&object);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..200 {
                    object.sync(0, 1).unwrap();
                }
            })
        };
        writer.join().unwrap();
        syncer.join().unwrap();

        // A clean page must match what reached the inode.
        if !object.is_page_dirty(0).unwrap() {
            let page = object.core().physical_page(0).unwrap().unwrap();
            let mut frame = [0u8; PAGE_SIZE];
            mm.copy_physical_page(&page, &mut frame);
            assert_eq!(&ram.contents()[..], &frame[..]);
        }
        object.sync(0, 1).unwrap();
        assert!(ram.contents().iter().all(|&b| b == 200));
        assert_eq!(object.amount_dirty(), 0);
    }

    #[test]
    fn test_sync_cleans_pages_past_end_of_file() {
        let mm = test_memory_manager(16);
        let ram = ram_inode(2 * PAGE_SIZE);
        let inode: Arc<dyn Inode> = ram.clone();
        let object = SharedInodeVmObject::try_create_with_inode(mm, &inode).unwrap();
        fill(&object, 0, 0x01);
        fill(&object, 1, 0x02);

        ram.truncate(PAGE_SIZE);
        object.sync(0, 2).unwrap();
        assert_eq!(ram.write_calls(), 1);
        assert_eq!(ram.contents().len(), PAGE_SIZE);
        assert_eq!(object.amount_dirty(), 0);
        assert_eq!(object.release_all_clean_pages(), 2);
    }
}
