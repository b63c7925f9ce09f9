//! Virtual Memory Subsystem
//!
//! Memory objects and the physical pages behind them:
//! - physical_page: reference-counted page-frame descriptors
//! - physical_zone / physical_region: the buddy allocator over physical memory
//! - memory_manager: the boot-time service owning allocator and registry
//! - vm_object: the page-slot array shared by every kind of memory object
//! - anonymous / inode objects: zero-fill and file-backed storage
//! - region: a mapping of (part of) an object into one address space
//!
//! Lock ordering, outermost first:
//!
//! 1. an inode's shared-object slot lock
//! 2. the VM object registry lock
//! 3. a VM object's recursive lock (region list and page slots)
//! 4. the physical allocator lock
//!
//! Objects are registered and unregistered with no object lock held.
//! Dropping the last reference to a physical page takes the allocator lock,
//! so it may happen under an object lock. The allocator never calls back into
//! VM objects.

pub mod anonymous_vm_object;
pub mod dirty_bitmap;
pub mod frame_access;
pub mod inode_vm_object;
pub mod memory_manager;
pub mod physical_page;
pub mod physical_region;
pub mod physical_zone;
pub mod private_inode_vm_object;
pub mod region;
pub mod registry;
pub mod shared_inode_vm_object;
pub mod vm_object;


pub use anonymous_vm_object::{AllocationStrategy, AnonymousVmObject};
pub use dirty_bitmap::DirtyBitmap;
pub use frame_access::{PhysicalMemoryAccess, RamPhysicalMemory};
pub use inode_vm_object::InodeVmObject;
pub use memory_manager::{
    MemoryManager, MemoryManagerConfig, ShouldZeroFill, SystemMemoryInfo, VmObjectInfo,
};
pub use physical_page::{PhysicalPage, PhysicalPageEntries, PhysicalPageEntry};
pub use physical_region::PhysicalRegion;
pub use physical_zone::PhysicalZone;
pub use private_inode_vm_object::PrivateInodeVmObject;
pub use region::{Access, Region, RegionId};
pub use registry::VmObjectRegistry;
pub use shared_inode_vm_object::SharedInodeVmObject;
pub use vm_object::{VmObject, VmObjectCore, VmObjectId};

use alloc::boxed::Box;

use crate::boot::{MemoryMap, MemoryMapError};
use crate::fs::InodeError;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Pages in a large buddy zone
pub const LARGE_ZONE_PAGES: usize = 4096;

/// Pages in a small buddy zone
pub const SMALL_ZONE_PAGES: usize = 256;

// ============================================================================
// Errors
// ============================================================================

/// VM operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Kernel heap or physical pages exhausted
    OutOfMemory,
    /// No zone holds a free block of the requested order
    NoContiguousBlock,
    /// Range does not fit inside the object
    InvalidRange,
    /// Page index beyond the object's slots
    InvalidPageIndex,
    /// Memory map rejected at boot
    InvalidMemoryMap(MemoryMapError),
    /// Backing inode failed
    Io(InodeError),
}

impl From<InodeError> for VmError {
    fn from(err: InodeError) -> Self {
        VmError::Io(err)
    }
}

impl From<alloc::collections::TryReserveError> for VmError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        VmError::OutOfMemory
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

// ============================================================================
// Global State
// ============================================================================

static MEMORY_MANAGER: spin::Once<&'static MemoryManager> = spin::Once::new();

/// Boot the VM subsystem and install the global memory manager
///
/// Later calls return the manager installed by the first successful one.
/// Concurrent callers wait for that boot instead of running their own.
pub fn init(
    memory_map: &MemoryMap<'_>,
    config: MemoryManagerConfig,
    frames: Box<dyn PhysicalMemoryAccess>,
) -> VmResult<&'static MemoryManager> {
    MEMORY_MANAGER
        .try_call_once(|| MemoryManager::boot(memory_map, config, frames))
        .copied()
}

/// The global memory manager, if `init` has run
pub fn try_memory_manager() -> Option<&'static MemoryManager> {
    MEMORY_MANAGER.get().copied()
}

/// The global memory manager
///
/// Panics if called before `init`.
pub fn memory_manager() -> &'static MemoryManager {
    try_memory_manager().expect("VM subsystem not initialized")
}
