//! Page fault resolution.

use crate::address_space::AddressSpace;
use crate::tlb::{Tlb, TlbSlot};
use crate::{VirtualAddress, VirtualMemory, VmError};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// A store to a page whose translation lacks the writable bit.
    ReadOnly,
}

impl TryFrom<u32> for FaultKind {
    type Error = VmError;

    /// Decodes the fault code passed by the trap dispatcher.
    fn try_from(code: u32) -> Result<Self, VmError> {
        match code {
            0 => Ok(FaultKind::Read),
            1 => Ok(FaultKind::Write),
            2 => Ok(FaultKind::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

/// The process running on the faulting CPU, as seen by the fault resolver.
pub trait Process {
    /// Returns the process's address space, if it has one yet.
    fn address_space(&self) -> Option<&AddressSpace<'_>>;
}

impl<T: Tlb> VirtualMemory<T> {
    /// Resolves a fault at `addr` in the `current` process by installing a translation
    /// into the TLB.
    ///
    /// # Errors
    ///
    /// - [`VmError::HardFault`] if there is no current process or it has no address
    ///   space.
    /// - [`VmError::BadAddress`] if `addr` is outside every region of the address space.
    ///
    /// # Panics
    ///
    /// Panics on a [`FaultKind::ReadOnly`] fault, or if the address space has not been
    /// prepared.
    pub fn handle_fault(
        &self,
        kind: FaultKind,
        addr: VirtualAddress,
        current: Option<&dyn Process>,
    ) -> Result<TlbSlot, VmError> {
        if kind == FaultKind::ReadOnly {
            panic!("read-only fault at {}", addr);
        }

        let space = current
            .and_then(|process| process.address_space())
            .ok_or(VmError::HardFault)?;
        assert!(
            space.is_prepared(),
            "fault at {} in an address space that was never prepared",
            addr
        );

        let page = addr.page_base();
        let translation = space.resolve(page).ok_or(VmError::BadAddress)?;
        let slot = self
            .tlb()
            .install(page, translation.paddr, translation.writable);

        log::trace!(
            "fault: {:?} at {} -> {} ({:?}, writable: {}) in {:?}",
            kind,
            addr,
            translation.paddr,
            translation.region,
            translation.writable,
            slot
        );
        Ok(slot)
    }

    /// Resolves a fault reported with a raw fault code.
    ///
    /// # Errors
    ///
    /// [`VmError::InvalidArgument`] for an unknown code; otherwise as
    /// [`handle_fault`](Self::handle_fault).
    pub fn handle_raw_fault(
        &self,
        code: u32,
        addr: VirtualAddress,
        current: Option<&dyn Process>,
    ) -> Result<TlbSlot, VmError> {
        let kind = FaultKind::try_from(code)?;
        self.handle_fault(kind, addr, current)
    }
}
