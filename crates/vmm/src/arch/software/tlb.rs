//! Emulated software-managed TLB.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::tlb::{Tlb, TlbEntry};

use super::{TLB_SLOTS, interrupts_enabled};

/// A software-managed TLB with [`TLB_SLOTS`] fully associative slots.
///
/// Like the hardware it models, the TLB keeps a random-replacement register that moves
/// to a different slot on every random write, counting down and wrapping around.
pub struct EmulatedTlb {
    slots: spin::Mutex<[TlbEntry; TLB_SLOTS]>,
    random: AtomicUsize,
}

impl EmulatedTlb {
    /// Creates a TLB with every slot invalid.
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new([TlbEntry::INVALID; TLB_SLOTS]),
            random: AtomicUsize::new(TLB_SLOTS - 1),
        }
    }

    /// Returns a snapshot of every slot.
    pub fn entries(&self) -> [TlbEntry; TLB_SLOTS] {
        *self.slots.lock()
    }

    /// Returns the number of valid slots.
    pub fn valid_count(&self) -> usize {
        self.slots.lock().iter().filter(|e| e.is_valid()).count()
    }

    /// Finds the valid slot translating the page containing `page`, if any.
    pub fn lookup(&self, page: crate::VirtualAddress) -> Option<(usize, TlbEntry)> {
        let page = page.align_down(super::PAGE_SIZE);
        self.slots
            .lock()
            .iter()
            .enumerate()
            .find(|(_, e)| e.is_valid() && e.page() == page)
            .map(|(slot, e)| (slot, *e))
    }

    fn next_random(&self) -> usize {
        self.random
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| {
                Some(if r == 0 { TLB_SLOTS - 1 } else { r - 1 })
            })
            .unwrap_or_else(|r| r)
    }
}

impl Default for EmulatedTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for EmulatedTlb {
    fn slot_count(&self) -> usize {
        TLB_SLOTS
    }

    fn read(&self, slot: usize) -> TlbEntry {
        self.slots.lock()[slot]
    }

    fn write(&self, slot: usize, entry: TlbEntry) {
        debug_assert!(!interrupts_enabled(), "TLB written with interrupts enabled");
        self.slots.lock()[slot] = entry;
    }

    fn write_random(&self, entry: TlbEntry) -> usize {
        let slot = self.next_random();
        self.write(slot, entry);
        slot
    }
}
