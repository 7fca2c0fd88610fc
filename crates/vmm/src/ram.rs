//! Boot-time physical memory stealing.
//!
//! Before the frame allocator has a frame table, the kernel can only carve pages off the
//! bottom of physical RAM. [`BootRam`] tracks the remaining unclaimed range and hands out
//! pages bump-allocator style. Once the frame allocator takes over, the range is sealed
//! and any further attempt to steal from it is a kernel bug.

use crate::PhysicalAddress;
use crate::arch::PAGE_SIZE;

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    /// Creates a new memory region.
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of this region.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.size)
    }

    /// Returns the number of whole pages in this region.
    pub const fn pages(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Returns true if this region contains the given address range.
    pub const fn contains(&self, base: PhysicalAddress, size: usize) -> bool {
        base.as_usize() >= self.base.as_usize() && base.as_usize() + size <= self.end().as_usize()
    }
}

/// Physical RAM as seen before the frame allocator is bootstrapped.
#[derive(Debug)]
pub struct BootRam {
    start: PhysicalAddress,
    first: PhysicalAddress,
    last: PhysicalAddress,
    sealed: bool,
}

impl BootRam {
    /// Describes the free physical RAM handed over by the bootloader.
    ///
    /// The base is aligned up and the end aligned down to page boundaries, so partial
    /// pages at either edge are never used.
    pub fn new(base: PhysicalAddress, size: usize) -> Self {
        let first = base.align_up(PAGE_SIZE);
        let end = (base + size).align_down(PAGE_SIZE);
        let last = if end < first { first } else { end };
        Self {
            start: first,
            first,
            last,
            sealed: false,
        }
    }

    /// Returns the RAM that has not been stolen yet.
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.first, self.last - self.first)
    }

    /// Returns the RAM that has been stolen so far.
    pub fn stolen(&self) -> MemoryRegion {
        MemoryRegion::new(self.start, self.first - self.start)
    }

    /// Takes `npages` contiguous pages off the bottom of the remaining RAM.
    ///
    /// Returns `None` if not enough RAM remains.
    ///
    /// # Panics
    ///
    /// Panics if the RAM has been sealed by the frame allocator.
    pub fn steal_pages(&mut self, npages: usize) -> Option<PhysicalAddress> {
        assert!(!self.sealed, "boot RAM stolen from after the frame allocator took over");

        let size = npages.checked_mul(PAGE_SIZE)?;
        if size > self.last - self.first {
            return None;
        }

        let paddr = self.first;
        self.first = self.first + size;
        Some(paddr)
    }

    /// Hands the remaining RAM over for good; stealing afterwards panics.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Returns whether the RAM has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }
}
