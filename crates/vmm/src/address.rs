//! Physical and virtual addresses, and how the kernel reaches physical memory.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch::{self, PAGE_SIZE};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Maps physical frames into the kernel's view of memory.
///
/// On hardware, all of physical memory is mapped at a fixed offset. Under emulation,
/// "physical memory" is a host buffer and addresses are offsets into it. Each
/// [`FrameAllocator`](crate::FrameAllocator) owns its translator.
pub enum AddressTranslator {
    /// Physical memory mapped linearly at `offset` in the kernel address space.
    DirectMap { offset: usize },
    /// Physical memory emulated by a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn direct_map(offset: usize) -> Self {
        Self::DirectMap { offset }
    }

    /// Emulates `size` bytes of physical memory, starting at physical address zero.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Returns the kernel virtual address at which `paddr` can be accessed.
    pub fn phys_to_virt(&self, paddr: PhysicalAddress) -> VirtualAddress {
        let vaddr = match self {
            Self::DirectMap { offset } => paddr.0.wrapping_add(*offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(ram) => ram.translate(paddr.0) as usize,
        };
        VirtualAddress::new(vaddr)
    }

    /// Inverse of [`phys_to_virt`](Self::phys_to_virt).
    pub fn virt_to_phys(&self, vaddr: VirtualAddress) -> PhysicalAddress {
        let paddr = match self {
            Self::DirectMap { offset } => vaddr.0.wrapping_sub(*offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(ram) => ram.ptr_to_phys(vaddr.as_ptr()),
        };
        PhysicalAddress::new(paddr)
    }

    pub fn phys_to_ptr<T>(&self, paddr: PhysicalAddress) -> *mut T {
        self.phys_to_virt(paddr).as_mut_ptr()
    }
}

/// Defines an address newtype whose constructor checks the value with `$valid`.
macro_rules! address_type {
    ($(#[$attr:meta])* $name:ident, $valid:path, $invalid:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[doc = concat!("Creates a ", stringify!($name), ".")]
            ///
            /// # Panics
            ///
            #[doc = concat!("Panics with \"", $invalid, "\" if the architecture rejects `addr`.")]
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!($valid(addr), $invalid);
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// `align` must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                debug_assert!(align.is_power_of_two());
                self.0 % align == 0
            }

            /// `align` must be a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                debug_assert!(align.is_power_of_two());
                Self(self.0 - self.0 % align)
            }

            /// `align` must be a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                Self::new(self.0.next_multiple_of(align))
            }

            /// Byte offset within the containing page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 % PAGE_SIZE
            }

            /// Start of the containing page.
            #[inline]
            pub const fn page_base(self) -> Self {
                self.align_down(PAGE_SIZE)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))?;
                write!(f, "({:#x})", self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<usize> for $name {
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, bytes: usize) -> Self {
                Self::new(self.0 + bytes)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, bytes: usize) -> Self {
                Self::new(self.0 - bytes)
            }
        }

        /// Distance in bytes between two addresses.
        impl Sub for $name {
            type Output = usize;

            fn sub(self, other: Self) -> usize {
                self.0 - other.0
            }
        }
    };
}

address_type!(
    /// An address in physical memory.
    PhysicalAddress,
    arch::validate_physical,
    "physical address exceeds maximum width"
);

address_type!(
    /// An address in a virtual address space, user or kernel.
    VirtualAddress,
    arch::validate_virtual,
    "address is not canonical"
);

impl VirtualAddress {
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}
