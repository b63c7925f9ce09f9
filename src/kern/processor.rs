//! Processor identity
//!
//! Lock ownership is tracked per processor: kernel spin locks run with
//! preemption disabled, so the processor number identifies the holder. The
//! platform layer installs the function that reads the current processor
//! number. Hosted builds identify holders by thread instead.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Processor identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcessorId(pub u32);

/// Installed `fn() -> ProcessorId`, stored as an address; 0 means "boot CPU only"
static PROCESSOR_ID_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Install the platform hook that reports the executing processor
pub fn set_processor_id_source(source: fn() -> ProcessorId) {
    PROCESSOR_ID_SOURCE.store(source as usize, Ordering::Release);
}

/// Number of the processor executing this code
pub fn current_processor_id() -> ProcessorId {
    let source = PROCESSOR_ID_SOURCE.load(Ordering::Acquire);
    if source == 0 {
        return ProcessorId(0);
    }
    // SAFETY: only `set_processor_id_source` stores non-zero values, and it
    // stores a valid `fn() -> ProcessorId`.
    let source: fn() -> ProcessorId = unsafe { core::mem::transmute(source) };
    source()
}

/// Non-zero identity of the current lock holder
#[cfg(not(any(test, feature = "std")))]
pub fn current_holder_id() -> usize {
    current_processor_id().0 as usize + 1
}

/// Non-zero identity of the current lock holder
#[cfg(any(test, feature = "std"))]
pub fn current_holder_id() -> usize {
    static NEXT_HOLDER: AtomicUsize = AtomicUsize::new(1);

    std::thread_local! {
        static HOLDER: usize = NEXT_HOLDER.fetch_add(1, Ordering::Relaxed);
    }
    HOLDER.with(|id| *id)
}
