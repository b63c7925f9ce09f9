//! VM object registry
//!
//! The list of every live VM object, used for introspection. Objects enter
//! the list once fully constructed and leave it from their destructor, so the
//! list holds weak references only.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use super::vm_object::{VmObject, VmObjectId};
use super::VmResult;

/// Registry of live VM objects
pub struct VmObjectRegistry {
    objects: Mutex<Vec<(VmObjectId, Weak<dyn VmObject>)>>,
}

impl VmObjectRegistry {
    pub const fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Add a constructed object
    ///
    /// Must not be called with any VM object lock held.
    pub fn register<T: VmObject>(&self, object: &Arc<T>) -> VmResult<()> {
        let id = object.core().id();
        let weak: Weak<dyn VmObject> = Arc::downgrade(object) as Weak<dyn VmObject>;

        let mut objects = self.objects.lock();
        objects.try_reserve(1)?;
        objects.push((id, weak));
        log::trace!("VMObject {:?} registered ({} live)", id, objects.len());
        Ok(())
    }

    /// Remove an object; unknown ids are ignored
    pub fn unregister(&self, id: VmObjectId) {
        let mut objects = self.objects.lock();
        if let Some(position) = objects.iter().position(|(entry, _)| *entry == id) {
            objects.swap_remove(position);
            log::trace!("VMObject {:?} unregistered ({} live)", id, objects.len());
        }
    }

    /// Run `visitor` over every live object while the registry is locked
    ///
    /// Objects already being destroyed are skipped. The strong references the
    /// visitor sees are released after the registry lock, since dropping the
    /// last one unregisters the object.
    pub fn with_lock<R>(&self, visitor: impl FnOnce(&[Arc<dyn VmObject>]) -> R) -> R {
        let mut live: Vec<Arc<dyn VmObject>> = Vec::new();
        let result = {
            let objects = self.objects.lock();
            live.extend(objects.iter().filter_map(|(_, weak)| weak.upgrade()));
            visitor(&live)
        };
        drop(live);
        result
    }

    /// Number of registered objects
    pub fn count(&self) -> usize {
        self.objects.lock().len()
    }
}

impl Default for VmObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::memory_manager::test_memory_manager;
    use crate::vm::{AllocationStrategy, AnonymousVmObject, PAGE_SIZE};

    #[test]
    fn test_objects_register_and_unregister() {
        let mm = test_memory_manager(64);
        let registry = mm.vmobjects();
        assert_eq!(registry.count(), 0);

        let a = AnonymousVmObject::try_create_with_size(mm, PAGE_SIZE, AllocationStrategy::Reserve)
            .unwrap();
        let b = AnonymousVmObject::try_create_with_size(mm, 2 * PAGE_SIZE, AllocationStrategy::Reserve)
            .unwrap();
        assert_eq!(registry.count(), 2);

        let ids = registry.with_lock(|objects| {
            objects.iter().map(|object| object.id()).collect::<Vec<_>>()
        });
        assert!(ids.contains(&a.id()));
        assert!(ids.contains(&b.id()));

        drop(a);
        assert_eq!(registry.count(), 1);
        drop(b);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_last_reference_dropped_after_visit() {
        let mm = test_memory_manager(64);
        let object = AnonymousVmObject::try_create_with_size(mm, PAGE_SIZE, AllocationStrategy::Reserve)
            .unwrap();
        let weak = Arc::downgrade(&object);

        // The visitor drops the only external handle while the registry holds
        // a temporary one; destruction must wait until the lock is released.
        let mut handle = Some(object);
        let seen = mm.vmobjects().with_lock(|objects| {
            handle.take();
            objects.len()
        });
        assert_eq!(seen, 1);
        assert!(weak.upgrade().is_none());
        assert_eq!(mm.vmobjects().count(), 0);
    }

    #[test]
    fn test_unregister_unknown_id_is_ignored() {
        let registry = VmObjectRegistry::new();
        registry.unregister(VmObjectId::from_u64(u64::MAX));
        assert_eq!(registry.count(), 0);
    }
}
