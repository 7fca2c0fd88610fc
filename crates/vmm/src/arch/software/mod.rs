//! A host-runnable machine for tests and development.
//!
//! The emulated machine is a scale model of a MIPS-style system with a software-managed
//! TLB:
//! - 4 KiB pages
//! - 32-bit physical addresses, user space below 0x8000_0000
//! - a 64-slot TLB refilled entirely by the kernel, with a hardware-style random
//!   replacement register
//! - physical RAM backed by a host buffer
//! - a per-thread interrupt mask

use alloc::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use core::cell::Cell;
use core::ptr::{self, NonNull};

mod tlb;

pub use tlb::EmulatedTlb;

/// Physical addresses fit in 32 bits.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Top of the user address space; the user stack grows down from here.
pub const USER_STACK_TOP: usize = 0x8000_0000;

/// Number of slots in the emulated TLB.
pub const TLB_SLOTS: usize = 64;

/// Byte pattern that fresh emulated RAM is filled with, so that code relying on
/// memory being zeroed without zeroing it shows up in tests.
pub const POISON_BYTE: u8 = 0xDB;

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

/// Kernel virtual addresses in emulation are host pointers into the emulated RAM
/// buffer, so every value is accepted.
#[inline]
pub const fn validate_virtual(_addr: usize) -> bool {
    true
}

/// Emulated physical memory for software simulation.
///
/// This provides a simulated physical memory space for testing frame allocation
/// without requiring actual hardware. Physical address `n` is byte `n` of the buffer,
/// and the buffer is page-aligned so that page-aligned physical addresses are too.
pub struct EmulatedMemory {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is exclusively owned by this value and only reached through raw
// pointers handed out by `translate`; callers synchronize access to frame contents.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Allocates `size` bytes of emulated RAM filled with [`POISON_BYTE`].
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory size");
        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc(layout) };
        let Some(base) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        // SAFETY: The allocation is `size` bytes long.
        unsafe { ptr::write_bytes(base.as_ptr(), POISON_BYTE, size) };
        Self { base, layout }
    }

    /// Returns the host pointer backing physical address `phys`.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        // SAFETY: `phys` is within the buffer.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Returns the physical address backed by the host pointer `ptr`.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size(), "pointer not within emulated memory");
        offset
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: The buffer was allocated in `new` with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

std::thread_local! {
    static INTERRUPT_MASK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Returns whether interrupts are enabled on the current (emulated) execution unit.
pub fn interrupts_enabled() -> bool {
    INTERRUPT_MASK_DEPTH.with(|depth| depth.get() == 0)
}

/// RAII guard that masks interrupts on the current execution unit.
///
/// In emulation each host thread plays the role of an execution unit; guards nest.
pub struct InterruptGuard {
    _private: (),
}

impl InterruptGuard {
    /// Masks interrupts until the guard is dropped.
    #[must_use]
    pub fn new() -> Self {
        INTERRUPT_MASK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self { _private: () }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        INTERRUPT_MASK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}
