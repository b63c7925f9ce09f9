//! Physical memory map
//!
//! Validates the bootloader's memory map and derives the page-aligned ranges
//! the memory manager needs: every available range (one physical region
//! each) and the whole span the page-entry table must cover.

use core::fmt::Write;

use crate::boot::{MemoryMapEntry, MemoryType};
use crate::vm::PAGE_SIZE;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Memory map validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryMapError {
    /// No entries at all
    Empty,
    /// Two entries overlap
    Overlap,
    /// No available entry holds a whole page
    NoUsableMemory,
    /// The supervisor carve-out leaves no user page in the largest region
    SupervisorTooLarge,
}

/// Memory map view
pub struct MemoryMap<'a> {
    entries: &'a [MemoryMapEntry],
}

impl<'a> MemoryMap<'a> {
    /// Create a memory map over bootloader entries
    pub const fn new(entries: &'a [MemoryMapEntry]) -> Self {
        Self { entries }
    }

    /// Page-aligned `[lower, upper)` ranges of available memory
    ///
    /// Starts round up and ends round down; entries smaller than a page after
    /// rounding are skipped.
    pub fn available_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.mem_type == MemoryType::Available)
            .filter_map(|entry| {
                let lower = (entry.start_addr + PAGE_MASK) & !PAGE_MASK;
                let upper = entry.end_addr() & !PAGE_MASK;
                (upper > lower).then_some((lower, upper))
            })
    }

    /// Page-aligned span covering every entry, of any type
    pub fn physical_span(&self) -> Option<(u64, u64)> {
        let lower = self.entries.iter().map(|e| e.start_addr).min()?;
        let upper = self.entries.iter().map(|e| e.end_addr()).max()?;
        Some((lower & !PAGE_MASK, (upper + PAGE_MASK) & !PAGE_MASK))
    }

    /// Validate memory map consistency
    pub fn validate(&self) -> Result<(), MemoryMapError> {
        if self.entries.is_empty() {
            return Err(MemoryMapError::Empty);
        }

        for i in 0..self.entries.len() {
            for j in i + 1..self.entries.len() {
                let entry1 = &self.entries[i];
                let entry2 = &self.entries[j];

                if entry1.start_addr < entry2.end_addr() && entry2.start_addr < entry1.end_addr() {
                    return Err(MemoryMapError::Overlap);
                }
            }
        }

        if self.available_ranges().next().is_none() {
            return Err(MemoryMapError::NoUsableMemory);
        }

        Ok(())
    }

    /// Bytes per memory type
    pub fn get_stats(&self) -> MemoryStats {
        let mut stats = MemoryStats::default();

        for entry in self.entries {
            stats.total += entry.size;
            match entry.mem_type {
                MemoryType::Available => stats.available += entry.size,
                MemoryType::Reserved => stats.reserved += entry.size,
                MemoryType::AcpiReclaimable => stats.acpi_reclaimable += entry.size,
                MemoryType::AcpiNvs => stats.acpi_nvs += entry.size,
                MemoryType::BadMemory => stats.bad_memory += entry.size,
                MemoryType::Bootloader => stats.bootloader += entry.size,
                MemoryType::Kernel => stats.kernel += entry.size,
                MemoryType::Device => stats.device += entry.size,
            }
        }

        stats
    }

    /// Log the memory map at debug level and its totals at info level
    pub fn log_memory_map(&self) -> MemoryStats {
        log::debug!("Memory map:");
        for (i, entry) in self.entries.iter().enumerate() {
            log::debug!("{}", format_memory_entry(i, entry));
        }

        let stats = self.get_stats();
        log::info!(
            "Memory: {} total, {} available, {} reserved, {} device",
            format_size(stats.total),
            format_size(stats.available),
            format_size(stats.reserved),
            format_size(stats.device)
        );
        if stats.bad_memory > 0 {
            log::warn!("Memory: {} marked bad", format_size(stats.bad_memory));
        }
        stats
    }
}

/// Memory statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: u64,
    pub available: u64,
    pub reserved: u64,
    pub acpi_reclaimable: u64,
    pub acpi_nvs: u64,
    pub bad_memory: u64,
    pub bootloader: u64,
    pub kernel: u64,
    pub device: u64,
}

/// Format memory entry for display
fn format_memory_entry(index: usize, entry: &MemoryMapEntry) -> heapless::String<128> {
    let mut result = heapless::String::new();
    // Truncation on overflow is acceptable for a log line.
    let _ = write!(
        result,
        "{}: {:#018x} - {:#018x} ({}) {}",
        index,
        entry.start_addr,
        entry.end_addr().saturating_sub(1),
        format_size(entry.size),
        entry.mem_type.name()
    );
    result
}

/// Human-readable size
fn format_size(size: u64) -> heapless::String<24> {
    let mut result = heapless::String::new();

    let _ = if size >= 1024 * 1024 * 1024 {
        write!(result, "{}GB", size / (1024 * 1024 * 1024))
    } else if size >= 1024 * 1024 {
        write!(result, "{}MB", size / (1024 * 1024))
    } else if size >= 1024 {
        write!(result, "{}KB", size / 1024)
    } else {
        write!(result, "{}B", size)
    };

    result
}
