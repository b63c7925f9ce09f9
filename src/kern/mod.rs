//! Kern subsystem - Core kernel primitives
//!
//! Processor identity and the locks built on it.

pub mod lock;
pub mod processor;

pub use lock::{RecursiveSpinLock, RecursiveSpinLockGuard};
pub use processor::{current_processor_id, set_processor_id_source, ProcessorId};
