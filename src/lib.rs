//! vmcore - Virtual memory objects for a multiprocessor kernel
//!
//! This crate models the ownership and lifetime of kernel memory objects:
//! reference-counted physical pages, the buddy allocator they come from, VM
//! objects (anonymous and inode-backed, private and shared) and the regions
//! that map them into address spaces.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Standard library replacement for no_std
extern crate alloc;

// Core types
pub mod types;

// Kernel primitives
pub mod kern;

// Boot-time inputs
pub mod boot;

// Filesystem contract
pub mod fs;

// Virtual memory
pub mod vm;

pub use types::{PhysicalAddress, VirtualAddress, VirtualRange};
pub use vm::{VmError, VmResult};
