//! Inode contract
//!
//! What inode-backed VM objects consume from the filesystem layer.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::vm::{SharedInodeVmObject, VmResult};

/// Filesystem-wide inode identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeIdentifier {
    pub fsid: u32,
    pub index: u64,
}

impl fmt::Display for InodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.fsid, self.index)
    }
}

/// Inode I/O errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeError {
    /// Device or filesystem failure
    Io,
    /// No space left on the filesystem
    NoSpace,
    /// Filesystem mounted read-only
    ReadOnly,
    /// Fewer bytes transferred than requested
    ShortTransfer,
}

/// The filesystem side of an inode-backed VM object
pub trait Inode: Send + Sync {
    fn identifier(&self) -> InodeIdentifier;

    /// Current file size in bytes
    fn size(&self) -> u64;

    /// Read at `offset` into `buffer`; returns bytes read (0 at end of file)
    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, InodeError>;

    /// Write `data` at `offset`; returns bytes written
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize, InodeError>;

    /// Slot remembering this inode's shared VM object
    fn shared_vmobject_slot(&self) -> &SharedVmObjectSlot;

    /// The live shared VM object for this inode, if any
    fn shared_vmobject(&self) -> Option<Arc<SharedInodeVmObject>> {
        self.shared_vmobject_slot().get()
    }

    fn set_shared_vmobject(&self, vmobject: &Arc<SharedInodeVmObject>) {
        self.shared_vmobject_slot().set(vmobject);
    }
}

impl fmt::Debug for dyn Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Inode({})", self.identifier())
    }
}

// ============================================================================
// Shared VM Object Slot
// ============================================================================

/// Weak back-reference from an inode to its shared VM object
///
/// Never keeps the object alive; once the object is gone, lookups find
/// nothing.
#[derive(Default)]
pub struct SharedVmObjectSlot {
    vmobject: Mutex<Weak<SharedInodeVmObject>>,
}

impl SharedVmObjectSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<SharedInodeVmObject>> {
        self.vmobject.lock().upgrade()
    }

    pub fn set(&self, vmobject: &Arc<SharedInodeVmObject>) {
        *self.vmobject.lock() = Arc::downgrade(vmobject);
    }

    /// Return the live object, or build and record one
    ///
    /// The check and the creation happen under the slot lock, so concurrent
    /// callers end up with the same object.
    pub fn get_or_try_create(
        &self,
        create: impl FnOnce() -> VmResult<Arc<SharedInodeVmObject>>,
    ) -> VmResult<Arc<SharedInodeVmObject>> {
        let mut slot = self.vmobject.lock();
        if let Some(existing) = slot.upgrade() {
            return Ok(existing);
        }
        let vmobject = create()?;
        *slot = Arc::downgrade(&vmobject);
        Ok(vmobject)
    }
}

impl fmt::Debug for SharedVmObjectSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedVmObjectSlot")
            .field("live", &(self.vmobject.lock().strong_count() > 0))
            .finish()
    }
}

// ============================================================================
// RAM Inode
// ============================================================================

/// Successful writes allowed when no failure is armed
const UNLIMITED_WRITES: usize = usize::MAX;

/// An inode whose contents live in memory
///
/// Writes can be made to fail after a number of successful calls, which is
/// how storage errors are simulated.
pub struct RamInode {
    identifier: InodeIdentifier,
    data: Mutex<Vec<u8>>,
    shared_vmobject: SharedVmObjectSlot,
    writes_remaining: AtomicUsize,
    write_calls: AtomicUsize,
}

impl RamInode {
    pub fn new(identifier: InodeIdentifier, data: Vec<u8>) -> Self {
        Self {
            identifier,
            data: Mutex::new(data),
            shared_vmobject: SharedVmObjectSlot::new(),
            writes_remaining: AtomicUsize::new(UNLIMITED_WRITES),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// Let `count` more writes succeed, then fail every write with `Io`
    pub fn fail_writes_after(&self, count: usize) {
        self.writes_remaining.store(count, Ordering::SeqCst);
    }

    /// Let every write succeed again
    pub fn clear_write_failure(&self) {
        self.writes_remaining.store(UNLIMITED_WRITES, Ordering::SeqCst);
    }

    /// Number of `write_bytes` calls so far
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Cut the file down to `len` bytes
    pub fn truncate(&self, len: usize) {
        self.data.lock().truncate(len);
    }

    /// Copy of the current contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn take_write_budget(&self) -> bool {
        self.writes_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    UNLIMITED_WRITES => Some(UNLIMITED_WRITES),
                    n => Some(n - 1),
                }
            })
            .is_ok()
    }
}

impl Inode for RamInode {
    fn identifier(&self) -> InodeIdentifier {
        self.identifier
    }

    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<usize, InodeError> {
        let data = self.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }
        let count = buffer.len().min(data.len() - start);
        buffer[..count].copy_from_slice(&data[start..start + count]);
        Ok(count)
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<usize, InodeError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if !self.take_write_budget() {
            return Err(InodeError::Io);
        }

        let start = usize::try_from(offset).map_err(|_| InodeError::NoSpace)?;
        let end = start.checked_add(bytes.len()).ok_or(InodeError::NoSpace)?;

        let mut data = self.data.lock();
        if end > data.len() {
            let additional = end - data.len();
            data.try_reserve(additional)
                .map_err(|_| InodeError::NoSpace)?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn shared_vmobject_slot(&self) -> &SharedVmObjectSlot {
        &self.shared_vmobject
    }
}
