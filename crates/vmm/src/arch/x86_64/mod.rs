//! The x86_64 hardware: 4 KiB pages, 48-bit canonical virtual addresses and the
//! interrupt flag.

use ::x86_64::instructions::interrupts;

/// Physical address bits assumed by the kernel. CPUs may support up to 52.
pub const MAX_PHYSICAL_BITS: usize = 48;

pub const PAGE_SIZE: usize = 4096;

/// Top of the user stack: the last page boundary of the canonical lower half.
pub const USER_STACK_TOP: usize = 0x0000_7fff_ffff_f000;

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Returns whether `addr` is canonical, i.e. bits 48..64 copy bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let upper = addr >> 47;
    upper == 0 || upper == (usize::MAX >> 47)
}

/// Returns whether interrupts are enabled on the current CPU.
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// RAII guard that disables interrupts on the current CPU.
///
/// Interrupts are re-enabled on drop only if they were enabled when the guard was
/// created, so guards nest.
pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    /// Disables interrupts until the guard is dropped.
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts::are_enabled();
        if were_enabled {
            interrupts::disable();
        }
        Self { were_enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            interrupts::enable();
        }
    }
}
