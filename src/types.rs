//! Common types used across vmcore
//!
//! Address newtypes shared by the physical allocator, the VM objects and the
//! regions that map them.

use core::fmt;

use crate::vm::{PAGE_SHIFT, PAGE_SIZE};

/// Physical memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Address `bytes` further into physical memory
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    /// Round down to the containing page
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }

    /// Physical frame number
    pub const fn pfn(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    pub const fn from_pfn(pfn: usize) -> Self {
        Self((pfn as u64) << PAGE_SHIFT)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{:#x}", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#016x}", self.0)
    }
}

/// Virtual memory address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u64 - 1) == 0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:#x}", self.0)
    }
}

/// A page-aligned virtual address range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: usize,
}

impl VirtualRange {
    pub const fn new(base: VirtualAddress, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn end(&self) -> VirtualAddress {
        self.base.offset(self.size as u64)
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// Number of pages needed to hold `bytes`
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}
