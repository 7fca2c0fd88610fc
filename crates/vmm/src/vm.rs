use crate::address_space::AddressSpace;
use crate::tlb::{Shootdown, Tlb, TlbManager};
use crate::{AllocError, FrameAllocator, VirtualAddress};

/// The virtual memory subsystem of one machine.
///
/// Owns the frame allocator that backs every address space and the manager of the
/// current CPU's TLB. Address spaces borrow the frame allocator, so they cannot outlive
/// the subsystem that created them.
pub struct VirtualMemory<T> {
    frames: FrameAllocator,
    tlb: TlbManager<T>,
}

impl<T: Tlb> VirtualMemory<T> {
    pub fn new(frames: FrameAllocator, tlb: T) -> Self {
        Self {
            frames,
            tlb: TlbManager::new(tlb),
        }
    }

    /// Bootstraps the frame allocator. See [`FrameAllocator::bootstrap`].
    pub fn bootstrap(&self) {
        self.frames.bootstrap();
    }

    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    pub fn tlb(&self) -> &TlbManager<T> {
        &self.tlb
    }

    /// Creates an empty address space backed by this subsystem's frames.
    pub fn create_address_space(&self) -> AddressSpace<'_> {
        AddressSpace::new(&self.frames)
    }

    /// Makes `space` the current address space on this CPU.
    ///
    /// TLB entries carry no address-space tag, so every slot is invalidated. Activating
    /// no address space (a kernel-only thread) leaves the TLB alone.
    pub fn activate(&self, space: Option<&AddressSpace<'_>>) {
        if space.is_some() {
            self.tlb.invalidate_all();
        }
    }

    /// Stops using the current address space. Its TLB entries stay until the next
    /// [`activate`](Self::activate).
    pub fn deactivate(&self) {}

    /// Marks `space` as loaded and flushes every translation cached while it was still
    /// writable throughout.
    pub fn complete_load(&self, space: &mut AddressSpace<'_>) {
        space.complete_load();
        self.tlb.invalidate_all();
    }

    /// Allocates kernel pages. See [`FrameAllocator::alloc_kpages`].
    pub fn alloc_kpages(&self, npages: usize) -> Result<VirtualAddress, AllocError> {
        self.frames.alloc_kpages(npages)
    }

    pub fn free_kpages(&self, vaddr: VirtualAddress) {
        self.frames.free_kpages(vaddr);
    }

    /// Invalidates every translation on every CPU. Not supported; always panics.
    pub fn tlb_shootdown_all(&self) -> ! {
        self.tlb.shootdown_all()
    }

    /// Invalidates one translation on another CPU. Not supported; always panics.
    pub fn tlb_shootdown(&self, request: &Shootdown) -> ! {
        self.tlb.shootdown(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::Permissions;
    use crate::arch::{EmulatedTlb, PAGE_SIZE, USER_STACK_TOP};
    use crate::fault::{FaultKind, Process};
    use crate::{AddressTranslator, BootRam, PhysicalAddress, STACK_PAGES, VmError};

    struct Child<'a>(AddressSpace<'a>);

    impl Process for Child<'_> {
        fn address_space(&self) -> Option<&AddressSpace<'_>> {
            Some(&self.0)
        }
    }

    fn machine(pages: usize) -> VirtualMemory<EmulatedTlb> {
        let frames = FrameAllocator::new(
            BootRam::new(PhysicalAddress::new(PAGE_SIZE), (pages - 1) * PAGE_SIZE),
            AddressTranslator::emulated(pages * PAGE_SIZE),
        );
        VirtualMemory::new(frames, EmulatedTlb::new())
    }

    #[test]
    fn kernel_pages_before_and_after_bootstrap() {
        let vm = machine(64);
        let early = vm.alloc_kpages(1).unwrap();
        vm.bootstrap();
        assert!(vm.frames().is_bootstrapped());

        let late = vm.alloc_kpages(3).unwrap();
        assert!(late.as_usize() > early.as_usize());
        assert_eq!(vm.frames().used_frames(), 3);

        vm.free_kpages(late);
        vm.free_kpages(early);
        assert_eq!(vm.frames().used_frames(), 0);
    }

    #[test]
    fn activation_flushes_the_tlb() {
        let vm = machine(64);
        vm.bootstrap();
        vm.tlb()
            .install(VirtualAddress::new(0x1000), PhysicalAddress::new(0x2000), true);

        vm.deactivate();
        assert_eq!(vm.tlb().hardware().valid_count(), 1);
        vm.activate(None);
        assert_eq!(vm.tlb().hardware().valid_count(), 1);

        let space = vm.create_address_space();
        vm.activate(Some(&space));
        assert_eq!(vm.tlb().hardware().valid_count(), 0);
    }

    #[test]
    fn program_lifecycle() {
        let vm = machine(128);
        vm.bootstrap();

        let mut space = vm.create_address_space();
        space
            .define_region(
                VirtualAddress::new(0x40_0000),
                0x1800,
                Permissions::READ | Permissions::EXECUTE,
            )
            .unwrap();
        space
            .define_region(
                VirtualAddress::new(0x50_0000),
                0x100,
                Permissions::READ | Permissions::WRITE,
            )
            .unwrap();
        space.prepare_load().unwrap();
        space.copy_in(VirtualAddress::new(0x40_0000), &[0x13; 0x1800]).unwrap();
        vm.complete_load(&mut space);
        let sp = space.define_stack();
        assert_eq!(sp, VirtualAddress::new(USER_STACK_TOP));
        assert_eq!(vm.frames().used_frames(), 2 + 1 + STACK_PAGES);

        let parent = Child(space);
        vm.activate(parent.address_space());
        vm.handle_fault(FaultKind::Read, VirtualAddress::new(0x40_1000), Some(&parent))
            .unwrap();

        // Fork: the child gets private copies of every region.
        let child = Child(parent.0.copy().unwrap());
        assert_eq!(vm.frames().used_frames(), 2 * (2 + 1 + STACK_PAGES));
        vm.activate(child.address_space());
        let slot = vm
            .handle_fault(FaultKind::Write, sp - 8, Some(&child))
            .unwrap();
        assert_eq!(slot.index(), 0);

        let mut byte = [0u8; 1];
        child.0.copy_out(VirtualAddress::new(0x40_17ff), &mut byte).unwrap();
        assert_eq!(byte, [0x13]);
        assert_eq!(
            vm.handle_fault(FaultKind::Read, VirtualAddress::new(0x60_0000), Some(&child)),
            Err(VmError::BadAddress)
        );

        vm.deactivate();
        child.0.destroy();
        parent.0.destroy();
        assert_eq!(vm.frames().used_frames(), 0);
    }

    #[test]
    #[should_panic(expected = "not supported")]
    fn shootdown_all_is_fatal() {
        let vm = machine(16);
        vm.tlb_shootdown_all();
    }
}
