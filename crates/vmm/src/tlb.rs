//! Software-managed TLB programming.
//!
//! The hardware keeps a small, fully associative table of translations that the kernel
//! fills on every fault. Entries are not tagged with an address-space identity, so the
//! whole table is invalidated whenever a different address space is activated.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::{InterruptGuard, PAGE_SIZE};
use crate::{PhysicalAddress, VirtualAddress};

/// A single TLB translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    page: VirtualAddress,
    frame: PhysicalAddress,
    flags: u8,
}

impl TlbEntry {
    const VALID: u8 = 1 << 0;
    const DIRTY: u8 = 1 << 1;

    /// An entry that translates nothing.
    pub const INVALID: Self = Self {
        page: VirtualAddress::new(0),
        frame: PhysicalAddress::new(0),
        flags: 0,
    };

    /// Creates a valid entry mapping the page containing `page` to the frame containing
    /// `frame`.
    ///
    /// `dirty` is the hardware's writable bit: without it, stores to the page fault.
    pub fn new(page: VirtualAddress, frame: PhysicalAddress, dirty: bool) -> Self {
        Self {
            page: page.page_base(),
            frame: frame.page_base(),
            flags: Self::VALID | if dirty { Self::DIRTY } else { 0 },
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags & Self::VALID != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & Self::DIRTY != 0
    }

    pub fn page(&self) -> VirtualAddress {
        self.page
    }

    pub fn frame(&self) -> PhysicalAddress {
        self.frame
    }
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Access to a hardware TLB.
///
/// Writes must happen with interrupts masked on the current CPU; [`TlbManager`] takes care
/// of that.
pub trait Tlb {
    /// Returns the number of slots in the TLB.
    fn slot_count(&self) -> usize;

    /// Reads the entry in `slot`.
    fn read(&self, slot: usize) -> TlbEntry;

    /// Overwrites the entry in `slot`.
    fn write(&self, slot: usize, entry: TlbEntry);

    /// Overwrites the slot chosen by the hardware's random-replacement register and
    /// returns its index.
    fn write_random(&self, entry: TlbEntry) -> usize;
}

/// Where [`TlbManager::install`] placed a translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbSlot {
    /// An invalid slot found by the linear scan.
    Free(usize),
    /// A slot picked by random replacement, evicting whatever it held.
    Replaced(usize),
}

impl TlbSlot {
    pub fn index(self) -> usize {
        match self {
            TlbSlot::Free(slot) | TlbSlot::Replaced(slot) => slot,
        }
    }
}

/// A request to invalidate a single translation on another CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shootdown {
    pub page: VirtualAddress,
}

/// Programs a [`Tlb`] with first-free, then random, replacement.
///
/// Once a scan finds every slot valid, the manager remembers that the TLB is full and
/// goes straight to random replacement until the next [`invalidate_all`].
///
/// [`invalidate_all`]: Self::invalidate_all
pub struct TlbManager<T> {
    tlb: T,
    full: AtomicBool,
}

impl<T: Tlb> TlbManager<T> {
    pub fn new(tlb: T) -> Self {
        Self {
            tlb,
            full: AtomicBool::new(false),
        }
    }

    /// Returns the underlying TLB.
    pub fn hardware(&self) -> &T {
        &self.tlb
    }

    /// Returns whether the last scan found no free slot.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Installs a translation for the page containing `page`.
    ///
    /// Runs with interrupts masked. Must not allocate or take the frame allocator lock.
    pub fn install(&self, page: VirtualAddress, frame: PhysicalAddress, writable: bool) -> TlbSlot {
        let entry = TlbEntry::new(page, frame, writable);
        let _guard = InterruptGuard::new();

        if !self.is_full() {
            for slot in 0..self.tlb.slot_count() {
                if !self.tlb.read(slot).is_valid() {
                    self.tlb.write(slot, entry);
                    return TlbSlot::Free(slot);
                }
            }

            self.full.store(true, Ordering::Release);
            log::debug!(
                "tlb: all {} slots valid, switching to random replacement",
                self.tlb.slot_count()
            );
        }

        TlbSlot::Replaced(self.tlb.write_random(entry))
    }

    /// Invalidates every slot and clears the full flag.
    pub fn invalidate_all(&self) {
        let _guard = InterruptGuard::new();
        for slot in 0..self.tlb.slot_count() {
            self.tlb.write(slot, TlbEntry::INVALID);
        }
        self.full.store(false, Ordering::Release);
    }

    /// Invalidates every translation on every CPU.
    ///
    /// # Panics
    ///
    /// Always; cross-CPU invalidation is not supported.
    pub fn shootdown_all(&self) -> ! {
        panic!("tlb shootdown of all entries is not supported");
    }

    /// Invalidates one translation on another CPU.
    ///
    /// # Panics
    ///
    /// Always; cross-CPU invalidation is not supported.
    pub fn shootdown(&self, request: &Shootdown) -> ! {
        panic!(
            "tlb shootdown of page {} is not supported",
            request.page.align_down(PAGE_SIZE)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedTlb, TLB_SLOTS, interrupts_enabled};

    fn page(n: usize) -> VirtualAddress {
        VirtualAddress::new(0x40_0000 + n * PAGE_SIZE)
    }

    fn frame(n: usize) -> PhysicalAddress {
        PhysicalAddress::new(0x10_0000 + n * PAGE_SIZE)
    }

    #[test]
    fn entry_is_page_granular() {
        let entry = TlbEntry::new(VirtualAddress::new(0x1234), PhysicalAddress::new(0x5678), true);
        assert_eq!(entry.page(), VirtualAddress::new(0x1000));
        assert_eq!(entry.frame(), PhysicalAddress::new(0x5000));
        assert!(entry.is_valid());
        assert!(entry.is_dirty());
        assert!(!TlbEntry::INVALID.is_valid());
    }

    #[test]
    fn fills_free_slots_in_order() {
        let manager = TlbManager::new(EmulatedTlb::new());
        assert_eq!(manager.install(page(0), frame(0), false), TlbSlot::Free(0));
        assert_eq!(manager.install(page(1), frame(1), true), TlbSlot::Free(1));

        let (slot, entry) = manager.hardware().lookup(page(1)).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(entry.frame(), frame(1));
        assert!(entry.is_dirty());
        assert!(!manager.is_full());
    }

    #[test]
    fn saturation_switches_to_random_replacement() {
        let manager = TlbManager::new(EmulatedTlb::new());
        for n in 0..TLB_SLOTS {
            assert_eq!(manager.install(page(n), frame(n), false), TlbSlot::Free(n));
        }
        assert!(!manager.is_full());

        let slot = manager.install(page(TLB_SLOTS), frame(TLB_SLOTS), false);
        assert!(matches!(slot, TlbSlot::Replaced(_)));
        assert!(manager.is_full());
        assert_eq!(manager.hardware().valid_count(), TLB_SLOTS);
        assert_eq!(
            manager.hardware().lookup(page(TLB_SLOTS)).map(|(s, _)| s),
            Some(slot.index())
        );

        // Still full: no scan, straight to replacement.
        assert!(matches!(
            manager.install(page(TLB_SLOTS + 1), frame(0), false),
            TlbSlot::Replaced(_)
        ));
    }

    #[test]
    fn invalidate_all_clears_slots_and_full_flag() {
        let manager = TlbManager::new(EmulatedTlb::new());
        for n in 0..=TLB_SLOTS {
            manager.install(page(n), frame(n), false);
        }
        assert!(manager.is_full());

        manager.invalidate_all();
        assert!(!manager.is_full());
        assert_eq!(manager.hardware().valid_count(), 0);
        assert_eq!(manager.install(page(7), frame(7), false), TlbSlot::Free(0));
    }

    #[test]
    fn interrupts_are_restored_after_install() {
        let manager = TlbManager::new(EmulatedTlb::new());
        manager.install(page(0), frame(0), false);
        assert!(interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn shootdown_is_fatal() {
        let manager = TlbManager::new(EmulatedTlb::new());
        manager.shootdown(&Shootdown { page: page(3) });
    }
}
