//! Locking Primitives
//!
//! Provides the re-entrant spin lock that guards a VM object's region list
//! and page slots. Plain data locks elsewhere in the crate use `spin::Mutex`.
//!
//! A recursive spin lock may be re-acquired by the holder that already owns
//! it, which lets an operation that holds the object lock call back into
//! helpers (such as region iteration) that take the same lock. Other holders
//! spin until the lock is released. Nothing may sleep while holding it.

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::processor;

/// Holder value meaning "unlocked"
const NO_HOLDER: usize = 0;

// ============================================================================
// Recursive Spin Lock
// ============================================================================

/// A spin lock that its current holder may take again
///
/// The guard only hands out shared references; state that must change under
/// the lock lives in a `RefCell` (or atomics) inside `T`.
pub struct RecursiveSpinLock<T> {
    /// Identity of the holder, `NO_HOLDER` when free
    holder: AtomicUsize,
    /// Nesting depth of the current holder
    depth: AtomicU32,
    data: UnsafeCell<T>,
}

impl<T> RecursiveSpinLock<T> {
    /// Create a new unlocked lock
    pub const fn new(data: T) -> Self {
        Self {
            holder: AtomicUsize::new(NO_HOLDER),
            depth: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning unless this holder already owns it
    pub fn lock(&self) -> RecursiveSpinLockGuard<'_, T> {
        let me = processor::current_holder_id();

        if self.holder.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return RecursiveSpinLockGuard { lock: self };
        }

        while self
            .holder
            .compare_exchange_weak(NO_HOLDER, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.holder.load(Ordering::Relaxed) != NO_HOLDER {
                core::hint::spin_loop();
            }
        }
        self.depth.store(1, Ordering::Relaxed);
        RecursiveSpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<RecursiveSpinLockGuard<'_, T>> {
        let me = processor::current_holder_id();

        if self.holder.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return Some(RecursiveSpinLockGuard { lock: self });
        }

        self.holder
            .compare_exchange(NO_HOLDER, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.depth.store(1, Ordering::Relaxed);
                RecursiveSpinLockGuard { lock: self }
            })
    }

    /// Check if anyone holds the lock
    pub fn is_locked(&self) -> bool {
        self.holder.load(Ordering::Relaxed) != NO_HOLDER
    }

    /// Check if the calling holder owns the lock
    pub fn is_locked_by_current_holder(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == processor::current_holder_id()
    }

    /// Current nesting depth (0 when unlocked)
    pub fn depth(&self) -> u32 {
        if self.is_locked() {
            self.depth.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Access the data without locking; the caller has exclusive access
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.holder.store(NO_HOLDER, Ordering::Release);
        }
    }
}

impl<T: Default> Default for RecursiveSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> core::fmt::Debug for RecursiveSpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecursiveSpinLock")
            .field("locked", &self.is_locked())
            .field("depth", &self.depth())
            .finish()
    }
}

// Only one holder at a time can reach `data`, so `T` need only be `Send`.
unsafe impl<T: Send> Send for RecursiveSpinLock<T> {}
unsafe impl<T: Send> Sync for RecursiveSpinLock<T> {}

/// RAII guard for a recursive spin lock
pub struct RecursiveSpinLockGuard<'a, T> {
    lock: &'a RecursiveSpinLock<T>,
}

impl<'a, T> Deref for RecursiveSpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for RecursiveSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
