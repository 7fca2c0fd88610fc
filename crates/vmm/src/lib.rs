#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! The virtual memory core of a small kernel with a software-managed TLB. It provides:
//!
//! - A coremap frame allocator handing out chains of physical frames.
//! - Per-process address spaces with two loadable segments and a fixed-size stack.
//! - A fault resolver that translates faulting addresses and programs the TLB, filling
//!   free slots first and falling back to random replacement.
//! - Software emulation of RAM, the TLB and interrupt masking for testing in non-kernel
//!   environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod coremap;
mod error;
mod fault;
mod frame;
mod human_size;
mod ram;
mod tlb;
mod vm;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, Permissions, Region, Segment, Translation, stack_base};
pub use coremap::{AllocError, FrameAllocator};
pub use error::VmError;
pub use fault::{FaultKind, Process};
pub use frame::{FrameEntry, FrameFlag, FrameFlags};
pub use human_size::HumanSize;
pub use ram::{BootRam, MemoryRegion};
pub use tlb::{Shootdown, Tlb, TlbEntry, TlbManager, TlbSlot};
pub use vm::VirtualMemory;

pub use arch::{InterruptGuard, PAGE_SIZE, USER_STACK_TOP};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, EmulatedTlb, TLB_SLOTS};

/// Number of pages in every user stack.
pub const STACK_PAGES: usize = 12;

/// Maximum number of loadable segments in an address space.
pub const MAX_SEGMENTS: usize = 2;
