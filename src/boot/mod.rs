//! Boot-time inputs to the VM subsystem
//!
//! The bootloader hands the kernel a physical memory map; the memory manager
//! turns its available entries into physical regions.

pub mod memory_map;

pub use memory_map::{MemoryMap, MemoryMapError, MemoryStats};

/// Memory map entry
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryMapEntry {
    /// Memory type
    pub mem_type: MemoryType,
    /// Physical start address
    pub start_addr: u64,
    /// Size in bytes
    pub size: u64,
}

impl MemoryMapEntry {
    pub const fn new(mem_type: MemoryType, start_addr: u64, size: u64) -> Self {
        Self {
            mem_type,
            start_addr,
            size,
        }
    }

    /// Exclusive end address
    pub const fn end_addr(&self) -> u64 {
        self.start_addr + self.size
    }
}

/// Memory region types
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Available RAM
    Available,
    /// Reserved by firmware
    Reserved,
    /// ACPI reclaimable
    AcpiReclaimable,
    /// ACPI non-volatile storage
    AcpiNvs,
    /// Bad memory
    BadMemory,
    /// Bootloader reclaimable
    Bootloader,
    /// Kernel code/data
    Kernel,
    /// Memory-mapped device (framebuffers, MMIO)
    Device,
}

impl MemoryType {
    pub const fn name(self) -> &'static str {
        match self {
            MemoryType::Available => "Available",
            MemoryType::Reserved => "Reserved",
            MemoryType::AcpiReclaimable => "ACPI Reclaimable",
            MemoryType::AcpiNvs => "ACPI NVS",
            MemoryType::BadMemory => "Bad Memory",
            MemoryType::Bootloader => "Bootloader",
            MemoryType::Kernel => "Kernel",
            MemoryType::Device => "Device",
        }
    }
}
