//! Coremap-based physical frame allocator.
//!
//! The coremap is a flat table with one [`FrameEntry`] per allocatable physical frame.
//! The table itself lives in physical memory stolen from [`BootRam`] at bootstrap, right
//! below the first frame it describes.
//!
//! Allocations of more than one frame are not contiguous: the allocator scans the table
//! from the bottom, claims the first `n` free frames it finds and links them into a chain
//! through their entries. The address of the first frame is the only handle a caller
//! needs; [`FrameAllocator::free`] walks the chain and releases all of it, and
//! [`FrameAllocator::translate`] walks it to find the frame backing the `k`-th page. That
//! walk is O(k), which is an accepted cost for the small memories this allocator serves.

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::slice;

use crate::arch::PAGE_SIZE;
use crate::{
    AddressTranslator, BootRam, FrameEntry, HumanSize, MemoryRegion, PhysicalAddress,
    VirtualAddress,
};

/// Errors that can occur during physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough free frames to satisfy the request.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "out of physical memory"),
        }
    }
}

/// The frame table, placed in stolen physical memory.
struct FrameTable {
    entries: NonNull<FrameEntry>,
    len: usize,
    free: usize,
    base: PhysicalAddress,
}

// SAFETY: The table is only reached through the allocator's lock, and the memory it
// points to is stolen for good, so no other owner exists.
unsafe impl Send for FrameTable {}

impl FrameTable {
    fn entries(&self) -> &[FrameEntry] {
        // SAFETY: `entries` points to `len` initialized entries owned by this table.
        unsafe { slice::from_raw_parts(self.entries.as_ptr(), self.len) }
    }

    fn entries_mut(&mut self) -> &mut [FrameEntry] {
        // SAFETY: As above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.entries.as_ptr(), self.len) }
    }

    fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.base, self.len * PAGE_SIZE)
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.base + index * PAGE_SIZE
    }

    /// Returns the coremap index of the frame at `paddr`.
    ///
    /// # Panics
    ///
    /// Panics if `paddr` is not the start of a managed frame.
    fn index_of(&self, paddr: PhysicalAddress) -> usize {
        assert!(
            paddr.is_aligned(PAGE_SIZE),
            "frame address {} is not page-aligned",
            paddr
        );
        assert!(
            self.region().contains(paddr, PAGE_SIZE),
            "frame address {} is outside managed memory {}..{}",
            paddr,
            self.region().base(),
            self.region().end()
        );
        (paddr - self.base) / PAGE_SIZE
    }

    /// Claims `npages` free frames, linked in the order found, and returns the head index.
    ///
    /// If the table runs out part way, the frames claimed so far are released again.
    fn claim_chain(&mut self, npages: usize) -> Option<usize> {
        let mut head = None;
        let mut previous: Option<usize> = None;
        let mut remaining = npages;

        let entries = self.entries_mut();
        for index in 0..entries.len() {
            if remaining == 0 {
                break;
            }
            if entries[index].is_in_use() {
                continue;
            }

            entries[index].claim(previous.is_none());
            match previous {
                Some(prev) => entries[prev].link(index),
                None => head = Some(index),
            }
            previous = Some(index);
            remaining -= 1;
        }

        if remaining > 0 {
            if let Some(head) = head {
                // Never counted as taken, so undo the count the release adds back.
                let released = self.release_chain(head);
                self.free -= released;
            }
            return None;
        }

        self.free -= npages;
        head
    }

    /// Releases the whole chain starting at `head`, returning the number of frames freed.
    fn release_chain(&mut self, head: usize) -> usize {
        let entries = self.entries_mut();
        assert!(
            entries[head].is_in_use(),
            "double free of coremap frame {}",
            head
        );
        assert!(
            entries[head].is_head(),
            "coremap frame {} does not start an allocation",
            head
        );

        let mut freed = 0;
        let mut current = Some(head);
        while let Some(index) = current {
            current = entries[index].release();
            freed += 1;
        }

        self.free += freed;
        freed
    }

    /// Follows the chain from `head` for `steps` links.
    ///
    /// # Panics
    ///
    /// Panics if the chain is shorter than `steps + 1` frames.
    fn walk(&self, head: usize, steps: usize) -> usize {
        let entries = self.entries();
        let mut index = head;
        for _ in 0..steps {
            index = entries[index]
                .next()
                .expect("frame chain is shorter than the region it backs");
        }
        index
    }

    fn chain(&self, head: usize) -> Chain<'_> {
        Chain {
            entries: self.entries(),
            current: Some(head),
        }
    }
}

/// Iterator over the coremap indices of a frame chain.
struct Chain<'a> {
    entries: &'a [FrameEntry],
    current: Option<usize>,
}

impl Iterator for Chain<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let index = self.current?;
        self.current = self.entries[index].next();
        Some(index)
    }
}

struct Coremap {
    ram: BootRam,
    table: Option<FrameTable>,
}

/// The physical frame allocator.
///
/// Until [`bootstrap`](Self::bootstrap) runs, allocations are served by stealing pages
/// from boot RAM; these can never be freed. Afterwards every request goes through the
/// coremap. All operations are serialized by a single spin lock.
pub struct FrameAllocator {
    coremap: spin::Mutex<Coremap>,
    translator: AddressTranslator,
}

impl FrameAllocator {
    /// Creates a frame allocator over `ram`, reaching frame contents through `translator`.
    ///
    /// The allocator is not bootstrapped yet.
    pub fn new(ram: BootRam, translator: AddressTranslator) -> Self {
        Self {
            coremap: spin::Mutex::new(Coremap { ram, table: None }),
            translator,
        }
    }

    /// Builds the coremap and switches allocation over to it.
    ///
    /// The frame table is placed in pages stolen from the bottom of the remaining boot
    /// RAM; every frame above it becomes allocatable and the boot RAM is sealed.
    ///
    /// # Panics
    ///
    /// Panics if called twice, or if the remaining RAM cannot even hold its own table.
    pub fn bootstrap(&self) {
        let mut coremap = self.coremap.lock();
        assert!(!coremap.ram.is_sealed(), "frame allocator bootstrapped twice");

        let total_pages = coremap.ram.region().pages();
        let table_pages = (total_pages * size_of::<FrameEntry>()).div_ceil(PAGE_SIZE);
        let table_paddr = coremap
            .ram
            .steal_pages(table_pages)
            .expect("not enough boot RAM to hold the coremap");

        let managed = coremap.ram.region();
        let len = managed.pages();
        let entries = NonNull::new(self.translator.phys_to_ptr::<FrameEntry>(table_paddr))
            .expect("coremap placed at a null address");
        for index in 0..len {
            // SAFETY: The stolen pages hold `table_pages * PAGE_SIZE` bytes, enough for
            // `total_pages >= len` entries, and are page-aligned.
            unsafe { entries.as_ptr().add(index).write(FrameEntry::FREE) };
        }

        coremap.ram.seal();
        coremap.table = Some(FrameTable {
            entries,
            len,
            free: len,
            base: managed.base(),
        });

        log::info!(
            "coremap: {} frames ({}) at {}..{}, table uses {} pages",
            len,
            HumanSize(managed.size()),
            managed.base(),
            managed.end(),
            table_pages
        );
    }

    /// Returns whether the coremap is in charge of allocation.
    pub fn is_bootstrapped(&self) -> bool {
        self.coremap.lock().table.is_some()
    }

    /// Returns the translator used to reach physical memory.
    pub fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    /// Allocates `npages` frames and returns the physical address of the first one.
    ///
    /// Before bootstrap the pages are stolen from boot RAM and are contiguous. After
    /// bootstrap they form a chain in the coremap.
    ///
    /// With the `oom-panic` feature, running out of frames halts the kernel instead of
    /// returning [`AllocError::OutOfMemory`].
    ///
    /// # Panics
    ///
    /// Panics if `npages` is zero.
    pub fn allocate(&self, npages: usize) -> Result<PhysicalAddress, AllocError> {
        assert!(npages > 0, "allocation of zero pages");

        let mut coremap = self.coremap.lock();
        let Coremap { ram, table } = &mut *coremap;
        let Some(table) = table else {
            return ram.steal_pages(npages).ok_or(AllocError::OutOfMemory);
        };

        match table.claim_chain(npages) {
            Some(head) => Ok(table.address_of(head)),
            None => {
                log::error!(
                    "coremap: cannot allocate {} frames, {} of {} free",
                    npages,
                    table.free,
                    table.len
                );
                if cfg!(feature = "oom-panic") {
                    panic!("out of memory; no more frames to allocate");
                }
                Err(AllocError::OutOfMemory)
            }
        }
    }

    /// Frees the allocation whose first frame is at `paddr`, including every chained
    /// frame.
    ///
    /// Freeing memory that was stolen before bootstrap is ignored with a warning; stolen
    /// memory is never reclaimed.
    ///
    /// # Panics
    ///
    /// Panics if `paddr` is misaligned or outside managed memory, if the frame is already
    /// free, or if it is not the first frame of an allocation.
    pub fn free(&self, paddr: PhysicalAddress) {
        let mut coremap = self.coremap.lock();
        let Coremap { ram, table } = &mut *coremap;
        if ram.stolen().contains(paddr, 1) {
            log::warn!("coremap: ignoring free of stolen boot memory at {}", paddr);
            return;
        }

        let table = table
            .as_mut()
            .expect("frame freed before the frame allocator was bootstrapped");
        let head = table.index_of(paddr);
        let freed = table.release_chain(head);
        log::trace!("coremap: freed {} frames from {}", freed, paddr);
    }

    /// Allocates `npages` pages for kernel use and returns their kernel virtual address.
    pub fn alloc_kpages(&self, npages: usize) -> Result<VirtualAddress, AllocError> {
        let paddr = self.allocate(npages)?;
        Ok(self.translator.phys_to_virt(paddr))
    }

    /// Frees pages obtained from [`alloc_kpages`](Self::alloc_kpages).
    pub fn free_kpages(&self, vaddr: VirtualAddress) {
        self.free(self.translator.virt_to_phys(vaddr));
    }

    /// Returns the physical address of the frame backing page `page` of the allocation
    /// starting at `head`, by walking its chain.
    ///
    /// # Panics
    ///
    /// Panics if `head` is not managed memory or the chain has no such page.
    pub fn translate(&self, head: PhysicalAddress, page: usize) -> PhysicalAddress {
        let coremap = self.coremap.lock();
        let table = coremap
            .table
            .as_ref()
            .expect("frame chains exist only after bootstrap");
        let index = table.walk(table.index_of(head), page);
        table.address_of(index)
    }

    /// Calls `f` with the address of every frame in the chain starting at `head`, in
    /// chain order.
    pub fn for_each_frame(&self, head: PhysicalAddress, mut f: impl FnMut(PhysicalAddress)) {
        let coremap = self.coremap.lock();
        let table = coremap
            .table
            .as_ref()
            .expect("frame chains exist only after bootstrap");
        for index in table.chain(table.index_of(head)) {
            f(table.address_of(index));
        }
    }

    /// Fills every frame of the chain starting at `head` with zeroes.
    pub fn zero_chain(&self, head: PhysicalAddress) {
        self.for_each_frame(head, |frame| {
            // SAFETY: `frame` is an allocated, page-sized frame reachable through the
            // translator.
            unsafe { ptr::write_bytes(self.translator.phys_to_ptr::<u8>(frame), 0, PAGE_SIZE) };
        });
    }

    /// Copies the contents of the chain starting at `src` into the chain starting at
    /// `dst`, frame by frame.
    ///
    /// # Panics
    ///
    /// Panics if the chains are the same or have different lengths.
    pub fn copy_chain(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        assert_ne!(src, dst, "frame chain copied onto itself");

        let coremap = self.coremap.lock();
        let table = coremap
            .table
            .as_ref()
            .expect("frame chains exist only after bootstrap");

        let mut from = table.chain(table.index_of(src));
        let mut to = table.chain(table.index_of(dst));
        loop {
            match (from.next(), to.next()) {
                (Some(s), Some(d)) => {
                    let s = self.translator.phys_to_ptr::<u8>(table.address_of(s));
                    let d = self.translator.phys_to_ptr::<u8>(table.address_of(d));
                    // SAFETY: Both are distinct allocated frames of PAGE_SIZE bytes; two
                    // live chains never share a frame.
                    unsafe { ptr::copy_nonoverlapping(s, d, PAGE_SIZE) };
                }
                (None, None) => break,
                _ => panic!("frame chains {} and {} differ in length", src, dst),
            }
        }
    }

    /// Writes `bytes` to physical memory at `paddr`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves its frame or the frame is not allocated.
    pub fn write_physical(&self, paddr: PhysicalAddress, bytes: &[u8]) {
        self.check_frame_range(paddr, bytes.len());
        // SAFETY: The range lies within one allocated frame.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.translator.phys_to_ptr::<u8>(paddr),
                bytes.len(),
            )
        };
    }

    /// Reads physical memory at `paddr` into `buf`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves its frame or the frame is not allocated.
    pub fn read_physical(&self, paddr: PhysicalAddress, buf: &mut [u8]) {
        self.check_frame_range(paddr, buf.len());
        // SAFETY: The range lies within one allocated frame.
        unsafe {
            ptr::copy_nonoverlapping(
                self.translator.phys_to_ptr::<u8>(paddr),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
    }

    fn check_frame_range(&self, paddr: PhysicalAddress, len: usize) {
        assert!(
            paddr.page_offset() + len <= PAGE_SIZE,
            "physical access at {} crosses a frame boundary",
            paddr
        );
        assert!(
            self.is_frame_in_use(paddr.page_base()),
            "physical access at {} to a frame that is not allocated",
            paddr
        );
    }

    /// Returns whether the frame at `paddr` is currently allocated.
    ///
    /// Addresses outside managed memory are never in use.
    pub fn is_frame_in_use(&self, paddr: PhysicalAddress) -> bool {
        let coremap = self.coremap.lock();
        coremap.table.as_ref().is_some_and(|table| {
            let frame = paddr.page_base();
            table.region().contains(frame, PAGE_SIZE)
                && table.entries()[table.index_of(frame)].is_in_use()
        })
    }

    /// Returns the physical memory managed by the coremap, once bootstrapped.
    pub fn managed_region(&self) -> Option<MemoryRegion> {
        self.coremap.lock().table.as_ref().map(FrameTable::region)
    }

    /// Returns the number of frames managed by the coremap.
    pub fn total_frames(&self) -> usize {
        self.coremap.lock().table.as_ref().map_or(0, |t| t.len)
    }

    /// Returns the number of free frames.
    pub fn free_frames(&self) -> usize {
        self.coremap.lock().table.as_ref().map_or(0, |t| t.free)
    }

    /// Returns the number of allocated frames.
    pub fn used_frames(&self) -> usize {
        self.coremap
            .lock()
            .table
            .as_ref()
            .map_or(0, |t| t.len - t.free)
    }
}

/// Builds a bootstrapped allocator over emulated RAM with `pages` pages, the first of
/// which is left to the "kernel" and never managed.
#[cfg(test)]
pub(crate) fn emulated_allocator(pages: usize) -> FrameAllocator {
    let allocator = FrameAllocator::new(
        BootRam::new(PhysicalAddress::new(PAGE_SIZE), (pages - 1) * PAGE_SIZE),
        AddressTranslator::emulated(pages * PAGE_SIZE),
    );
    allocator.bootstrap();
    allocator
}
