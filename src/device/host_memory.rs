//! Simulated host DDR backing device-visible buffer objects.
//!
//! On client NPUs every buffer object lives in host DDR and is reached by the
//! array through the shim tiles. The simulated backend keeps that memory here:
//! a sparse page store plus a table of live regions, one per buffer object.
//!
//! ```text
//!  0x1000_0000                                   HostMemory::BASE
//!  ├── region "instr#3"   (command buffer)
//!  ├── region "debug#4"   (result buffer)
//!  └── ...                bump-allocated, 4 KiB aligned
//! ```
//!
//! # Usage
//!
//! ```
//! use xdna_timeline::device::HostMemory;
//!
//! let mut mem = HostMemory::new();
//! let base = mem.allocate("output", 4096).unwrap();
//! mem.write_u32(base, 0xDEAD_BEEF);
//! assert_eq!(mem.read_u32(base), 0xDEAD_BEEF);
//! mem.free(base).unwrap();
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// A live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Human-readable name (e.g., "instr#3", "debug#4")
    pub name: String,
    /// Base address in host address space
    pub base_address: u64,
    /// Size in bytes
    pub size: usize,
    /// Number of bytes written through the device side
    pub device_writes: u64,
}

impl MemoryRegion {
    fn new(name: impl Into<String>, base_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            device_writes: 0,
        }
    }

    /// Check if an address falls within this region.
    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base_address && addr < self.base_address + self.size as u64
    }

    /// Check if an address range is fully inside this region.
    #[inline]
    pub fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.base_address
            && addr.saturating_add(len as u64) <= self.base_address + self.size as u64
    }
}

/// Error type for host memory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostMemoryError {
    /// Zero-sized or oversized request
    #[error("Invalid allocation size {0}")]
    InvalidSize(usize),
    /// The configured capacity is exhausted
    #[error("Out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },
    /// No region starts at this address
    #[error("No region at 0x{0:016x}")]
    RegionNotFound(u64),
}

/// Sparse simulated host memory.
///
/// Pages are materialised on first write; unwritten memory reads as zero.
pub struct HostMemory {
    /// Sparse storage: page_address -> page_data
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,

    /// Live regions keyed by base address
    regions: BTreeMap<u64, MemoryRegion>,

    /// Next free address for the bump allocator
    next_address: u64,

    /// Maximum number of bytes that may be live at once
    capacity: usize,
}

impl HostMemory {
    /// Page size for sparse storage (4KB, matching typical OS page size)
    pub const PAGE_SIZE: usize = 4096;

    /// First address handed out by the allocator
    pub const BASE: u64 = 0x1000_0000;

    /// Default capacity (64 MiB)
    pub const DEFAULT_CAPACITY: usize = 64 * 1024 * 1024;

    /// Page address mask (lower 12 bits are offset)
    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    /// Create a new empty host memory with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a new empty host memory limited to `capacity` live bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            regions: BTreeMap::new(),
            next_address: Self::BASE,
            capacity,
        }
    }

    /// Allocate a named region and return its base address.
    ///
    /// Regions are page aligned and never reuse addresses, so a stale
    /// address can't alias a newer allocation.
    pub fn allocate(&mut self, name: impl Into<String>, size: usize) -> Result<u64, HostMemoryError> {
        if size == 0 {
            return Err(HostMemoryError::InvalidSize(size));
        }
        let available = self.capacity.saturating_sub(self.live_bytes());
        if size > available {
            return Err(HostMemoryError::OutOfMemory { requested: size, available });
        }

        let base = self.next_address;
        let span = (size as u64 + Self::PAGE_SIZE as u64 - 1) & Self::PAGE_MASK;
        self.next_address += span;
        self.regions.insert(base, MemoryRegion::new(name, base, size));
        Ok(base)
    }

    /// Release the region starting at `base` and drop its pages.
    pub fn free(&mut self, base: u64) -> Result<MemoryRegion, HostMemoryError> {
        let region = self
            .regions
            .remove(&base)
            .ok_or(HostMemoryError::RegionNotFound(base))?;

        let end = base + region.size as u64;
        let stale: Vec<u64> = self
            .pages
            .range(base & Self::PAGE_MASK..end)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.pages.remove(&addr);
        }
        Ok(region)
    }

    /// Find the region containing an address.
    pub fn region_at(&self, addr: u64) -> Option<&MemoryRegion> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Total bytes held by live regions.
    pub fn live_bytes(&self) -> usize {
        self.regions.values().map(|r| r.size).sum()
    }

    /// Get or create a page for the given address.
    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages
            .entry(page_addr)
            .or_insert_with(|| Box::new([0u8; Self::PAGE_SIZE]))
    }

    /// Get a page for reading, if it exists.
    fn get_page(&self, addr: u64) -> Option<&[u8; Self::PAGE_SIZE]> {
        let page_addr = addr & Self::PAGE_MASK;
        self.pages.get(&page_addr).map(|b| b.as_ref())
    }

    /// Write a 32-bit word (little-endian).
    #[inline]
    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    /// Read a 32-bit word (little-endian).
    #[inline]
    pub fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Write a byte slice to memory.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        let mut current_addr = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let page = self.get_or_create_page(current_addr);
            let offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let to_write = remaining.len().min(Self::PAGE_SIZE - offset);

            page[offset..offset + to_write].copy_from_slice(&remaining[..to_write]);

            current_addr += to_write as u64;
            remaining = &remaining[to_write..];
        }

        if let Some(region) = self.regions.range_mut(..=addr).next_back().map(|(_, r)| r) {
            if region.contains(addr) {
                region.device_writes += data.len() as u64;
            }
        }
    }

    /// Read bytes from memory into a buffer.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        let mut current_addr = addr;
        let mut offset_in_buf = 0;

        while offset_in_buf < buf.len() {
            let page_offset = (current_addr & (Self::PAGE_SIZE as u64 - 1)) as usize;
            let to_read = (buf.len() - offset_in_buf).min(Self::PAGE_SIZE - page_offset);

            match self.get_page(current_addr) {
                Some(page) => buf[offset_in_buf..offset_in_buf + to_read]
                    .copy_from_slice(&page[page_offset..page_offset + to_read]),
                // Unallocated pages read as zero
                None => buf[offset_in_buf..offset_in_buf + to_read].fill(0),
            }

            current_addr += to_read as u64;
            offset_in_buf += to_read;
        }
    }

    /// Get number of materialised pages.
    pub fn allocated_pages(&self) -> usize {
        self.pages.len()
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("allocated_pages", &self.pages.len())
            .field("regions", &self.regions.len())
            .field("live_bytes", &self.live_bytes())
            .field("capacity", &self.capacity)
            .finish()
    }
}
