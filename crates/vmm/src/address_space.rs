//! Per-process address spaces.
//!
//! An address space has a fixed layout: up to [`MAX_SEGMENTS`] loadable segments defined
//! by the program loader, and a stack of [`STACK_PAGES`] pages ending at
//! [`USER_STACK_TOP`]. Each region is backed by one frame chain from the
//! [`FrameAllocator`], owned exclusively by the address space and freed when it is
//! dropped.
//!
//! There is no lazy loading: [`AddressSpace::prepare_load`] backs every region up front,
//! and faults only ever install translations for memory that already exists.

use core::fmt;
use core::ops::BitOr;

use crate::arch::{PAGE_SIZE, USER_STACK_TOP};
use crate::{FrameAllocator, MAX_SEGMENTS, PhysicalAddress, STACK_PAGES, VirtualAddress, VmError};

/// Access permissions requested for a region.
///
/// Only [`Permissions::WRITE`] has an effect; reads and execution are always allowed.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);

    /// Returns whether every permission in `other` is also in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |p, c| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXECUTE, 'x')
        )
    }
}

/// A loadable segment of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    base: VirtualAddress,
    pages: usize,
    writable: bool,
    frames: Option<PhysicalAddress>,
}

impl Segment {
    /// Returns the page-aligned start of the segment.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the end (exclusive) of the segment.
    pub fn end(&self) -> VirtualAddress {
        self.base + self.pages * PAGE_SIZE
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the head of the frame chain backing the segment, once prepared.
    pub fn frames(&self) -> Option<PhysicalAddress> {
        self.frames
    }

    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }
}

/// The region of an address space a virtual address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// One of the loadable segments, by definition order.
    Segment(usize),
    Stack,
}

/// The result of translating a user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the byte, including its offset within the page.
    pub paddr: PhysicalAddress,
    /// Whether the hardware entry may allow stores.
    pub writable: bool,
    pub region: Region,
}

/// Returns the lowest address of the user stack.
pub fn stack_base() -> VirtualAddress {
    VirtualAddress::new(USER_STACK_TOP - STACK_PAGES * PAGE_SIZE)
}

/// A process's virtual address space.
///
/// Dropping an address space frees every frame chain it owns. It must not be dropped
/// while it is still the active address space on some CPU.
pub struct AddressSpace<'a> {
    frames: &'a FrameAllocator,
    segments: [Option<Segment>; MAX_SEGMENTS],
    stack: Option<PhysicalAddress>,
    ready: bool,
}

impl<'a> AddressSpace<'a> {
    /// Creates an empty address space whose memory will come from `frames`.
    pub fn new(frames: &'a FrameAllocator) -> Self {
        Self {
            frames,
            segments: [None; MAX_SEGMENTS],
            stack: None,
            ready: false,
        }
    }

    /// Defines a loadable segment covering `size` bytes at `vaddr`.
    ///
    /// The segment is widened to whole pages. Only the write permission is recorded.
    ///
    /// # Errors
    ///
    /// - [`VmError::InvalidArgument`] if the segment would cover no page, or would reach
    ///   into the stack or beyond the user address space.
    /// - [`VmError::Unimplemented`] if [`MAX_SEGMENTS`] segments are already defined.
    ///
    /// The address space is left untouched on error.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        permissions: Permissions,
    ) -> Result<(), VmError> {
        let base = vaddr.page_base();
        let end = vaddr
            .as_usize()
            .checked_add(size)
            .and_then(|end| end.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(VmError::InvalidArgument)?;
        let pages = (end - base.as_usize()) / PAGE_SIZE;
        if pages == 0 {
            return Err(VmError::InvalidArgument);
        }
        if end > stack_base().as_usize() {
            log::warn!(
                "address space: region {}..{:#x} overlaps the stack at {}",
                base,
                end,
                stack_base()
            );
            return Err(VmError::InvalidArgument);
        }

        let Some(slot) = self.segments.iter_mut().find(|s| s.is_none()) else {
            log::warn!(
                "address space: only {} regions supported, ignoring {}..{:#x} ({:?})",
                MAX_SEGMENTS,
                base,
                end,
                permissions
            );
            return Err(VmError::Unimplemented);
        };

        *slot = Some(Segment {
            base,
            pages,
            writable: permissions.contains(Permissions::WRITE),
            frames: None,
        });
        Ok(())
    }

    /// Backs every defined segment and the stack with zeroed frames.
    ///
    /// Chains are allocated segment by segment, then the stack. If allocation fails part
    /// way, the chains obtained so far stay owned by the address space and are released
    /// when it is dropped.
    ///
    /// # Panics
    ///
    /// Panics if any region is already backed.
    pub fn prepare_load(&mut self) -> Result<(), VmError> {
        assert!(
            self.stack.is_none() && self.segments.iter().flatten().all(|s| s.frames.is_none()),
            "address space prepared twice"
        );

        for segment in self.segments.iter_mut().flatten() {
            segment.frames = Some(self.frames.allocate(segment.pages)?);
        }
        let stack = self.frames.allocate(STACK_PAGES)?;
        self.stack = Some(stack);

        for head in self.segments.iter().flatten().filter_map(|s| s.frames) {
            self.frames.zero_chain(head);
        }
        self.frames.zero_chain(stack);
        Ok(())
    }

    /// Marks the program image as loaded.
    ///
    /// From now on, faults in read-only segments produce read-only translations. Any
    /// writable translation already cached in the TLB is not revoked here;
    /// [`VirtualMemory::complete_load`](crate::VirtualMemory::complete_load) also flushes
    /// the TLB.
    pub fn complete_load(&mut self) {
        self.ready = true;
    }

    /// Returns the initial user stack pointer.
    ///
    /// # Panics
    ///
    /// Panics if the stack has not been backed by [`prepare_load`](Self::prepare_load).
    pub fn define_stack(&self) -> VirtualAddress {
        assert!(self.stack.is_some(), "stack defined before prepare_load");
        VirtualAddress::new(USER_STACK_TOP)
    }

    /// Creates a deep copy of this address space.
    ///
    /// The copy has the same layout, permissions and readiness, and fresh frames holding
    /// the same contents. No frame is shared with `self`.
    ///
    /// # Panics
    ///
    /// Panics if `self` has not been prepared.
    pub fn copy(&self) -> Result<AddressSpace<'a>, VmError> {
        assert!(self.is_prepared(), "copied an address space that was never prepared");

        let mut copy = AddressSpace::new(self.frames);
        for (dst, src) in copy.segments.iter_mut().zip(&self.segments) {
            *dst = src.map(|segment| Segment {
                frames: None,
                ..segment
            });
        }

        if let Err(err) = copy.prepare_load() {
            log::debug!("address space: copy failed: {}", err);
            return Err(VmError::OutOfMemory);
        }

        for (dst, src) in copy.segments.iter().zip(&self.segments) {
            let chains = (dst.and_then(|s| s.frames), src.and_then(|s| s.frames));
            if let (Some(dst), Some(src)) = chains {
                self.frames.copy_chain(src, dst);
            }
        }
        if let (Some(dst), Some(src)) = (copy.stack, self.stack) {
            self.frames.copy_chain(src, dst);
        }
        copy.ready = self.ready;

        log::debug!("address space: copied {} frames", self.frame_count());
        Ok(copy)
    }

    /// Frees every frame chain of this address space.
    pub fn destroy(self) {
        log::debug!("address space: destroying, {} frames", self.frame_count());
        drop(self);
    }

    /// Translates `vaddr` through the segment and stack chains.
    ///
    /// Segments are tried in definition order, then the stack; the first match wins.
    /// Returns `None` if the address is outside every backed region.
    pub fn resolve(&self, vaddr: VirtualAddress) -> Option<Translation> {
        let page = vaddr.page_base();

        for (index, segment) in self.segments.iter().enumerate() {
            let Some(segment) = segment.filter(|s| s.contains(page)) else {
                continue;
            };
            let frame = self
                .frames
                .translate(segment.frames?, (page - segment.base) / PAGE_SIZE);
            return Some(Translation {
                paddr: frame + vaddr.page_offset(),
                writable: segment.writable || !self.ready,
                region: Region::Segment(index),
            });
        }

        if page >= stack_base() && page.as_usize() < USER_STACK_TOP {
            let frame = self
                .frames
                .translate(self.stack?, (page - stack_base()) / PAGE_SIZE);
            return Some(Translation {
                paddr: frame + vaddr.page_offset(),
                writable: true,
                region: Region::Stack,
            });
        }

        None
    }

    /// Writes `bytes` into user memory at `vaddr`, regardless of segment permissions.
    ///
    /// # Errors
    ///
    /// [`VmError::BadAddress`] if any part of the range is not backed; bytes before the
    /// first unbacked page have already been written.
    pub fn copy_in(&self, vaddr: VirtualAddress, bytes: &[u8]) -> Result<(), VmError> {
        let mut offset = 0;
        while offset < bytes.len() {
            let at = vaddr + offset;
            let chunk = (PAGE_SIZE - at.page_offset()).min(bytes.len() - offset);
            let translation = self.resolve(at).ok_or(VmError::BadAddress)?;
            self.frames
                .write_physical(translation.paddr, &bytes[offset..offset + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    /// Reads user memory at `vaddr` into `buf`.
    pub fn copy_out(&self, vaddr: VirtualAddress, buf: &mut [u8]) -> Result<(), VmError> {
        let mut offset = 0;
        while offset < buf.len() {
            let at = vaddr + offset;
            let chunk = (PAGE_SIZE - at.page_offset()).min(buf.len() - offset);
            let translation = self.resolve(at).ok_or(VmError::BadAddress)?;
            self.frames
                .read_physical(translation.paddr, &mut buf[offset..offset + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    /// Returns the segment defined in `index`th position.
    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)?.as_ref()
    }

    /// Returns the head of the stack's frame chain, once prepared.
    pub fn stack_frames(&self) -> Option<PhysicalAddress> {
        self.stack
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Returns whether the stack and every defined segment are backed.
    pub fn is_prepared(&self) -> bool {
        self.stack.is_some() && self.segments.iter().flatten().all(|s| s.frames.is_some())
    }

    fn frame_count(&self) -> usize {
        let segments: usize = self
            .segments
            .iter()
            .flatten()
            .filter(|s| s.frames.is_some())
            .map(|s| s.pages)
            .sum();
        segments + if self.stack.is_some() { STACK_PAGES } else { 0 }
    }
}

impl Drop for AddressSpace<'_> {
    fn drop(&mut self) {
        for segment in self.segments.iter_mut().flatten() {
            if let Some(head) = segment.frames.take() {
                self.frames.free(head);
            }
        }
        if let Some(stack) = self.stack.take() {
            self.frames.free(stack);
        }
    }
}

impl fmt::Debug for AddressSpace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("segments", &self.segments)
            .field("stack", &self.stack)
            .field("ready", &self.ready)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coremap::emulated_allocator;

    const RW: Permissions = Permissions(Permissions::READ.0 | Permissions::WRITE.0);

    fn loaded(frames: &FrameAllocator) -> AddressSpace<'_> {
        let mut space = AddressSpace::new(frames);
        space
            .define_region(
                VirtualAddress::new(0x1000),
                0x2000,
                Permissions::READ | Permissions::EXECUTE,
            )
            .unwrap();
        space.define_region(VirtualAddress::new(0x3000), 0x1000, RW).unwrap();
        space.prepare_load().unwrap();
        space
    }

    #[test]
    fn define_region_widens_to_pages() {
        let frames = emulated_allocator(64);
        let mut space = AddressSpace::new(&frames);
        space
            .define_region(VirtualAddress::new(0x1ff0), 0x20, Permissions::READ)
            .unwrap();

        let segment = space.segment(0).unwrap();
        assert_eq!(segment.base(), VirtualAddress::new(0x1000));
        assert_eq!(segment.pages(), 2);
        assert!(!segment.is_writable());
    }

    #[test]
    fn third_region_is_rejected() {
        let frames = emulated_allocator(64);
        let mut space = AddressSpace::new(&frames);
        space.define_region(VirtualAddress::new(0x1000), 1, RW).unwrap();
        space.define_region(VirtualAddress::new(0x2000), 1, RW).unwrap();

        assert_eq!(
            space.define_region(VirtualAddress::new(0x3000), 1, RW),
            Err(VmError::Unimplemented)
        );
        assert!(space.segment(2).is_none());
        assert_eq!(space.segment(1).unwrap().base(), VirtualAddress::new(0x2000));
    }

    #[test]
    fn empty_region_is_invalid() {
        let frames = emulated_allocator(64);
        let mut space = AddressSpace::new(&frames);
        assert_eq!(
            space.define_region(VirtualAddress::new(0x1000), 0, RW),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn oversized_region_is_invalid() {
        let frames = emulated_allocator(64);
        let mut space = AddressSpace::new(&frames);
        assert_eq!(
            space.define_region(VirtualAddress::new(0x1000), usize::MAX - 0x10, RW),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(0x1000), usize::MAX - 0x2000, RW),
            Err(VmError::InvalidArgument)
        );
        assert!(space.segment(0).is_none());

        // Both slots are still free.
        space.define_region(VirtualAddress::new(0x1000), 1, RW).unwrap();
        space.define_region(VirtualAddress::new(0x2000), 1, RW).unwrap();
    }

    #[test]
    fn region_reaching_into_the_stack_is_invalid() {
        let frames = emulated_allocator(64);
        let mut space = AddressSpace::new(&frames);
        assert_eq!(
            space.define_region(stack_base() - PAGE_SIZE, 2 * PAGE_SIZE, RW),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(USER_STACK_TOP), 2 * PAGE_SIZE, RW),
            Err(VmError::InvalidArgument)
        );
        assert!(space.segment(0).is_none());

        space.define_region(stack_base() - PAGE_SIZE, PAGE_SIZE, RW).unwrap();
        assert_eq!(space.segment(0).unwrap().end(), stack_base());
    }

    #[test]
    fn prepare_load_backs_and_zeroes_every_region() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);

        assert!(space.is_prepared());
        assert_eq!(frames.used_frames(), 2 + 1 + STACK_PAGES);

        let mut buf = [0xffu8; 16];
        space.copy_out(VirtualAddress::new(0x1ff8), &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);
        space
            .copy_out(VirtualAddress::new(USER_STACK_TOP - 16), &mut buf)
            .unwrap();
        assert_eq!(buf, [0; 16]);
    }

    #[test]
    #[should_panic(expected = "prepared twice")]
    fn prepare_load_twice_panics() {
        let frames = emulated_allocator(64);
        let mut space = loaded(&frames);
        let _ = space.prepare_load();
    }

    #[test]
    #[cfg(not(feature = "oom-panic"))]
    fn prepare_load_reports_exhaustion() {
        let frames = emulated_allocator(14);
        let mut space = AddressSpace::new(&frames);
        space.define_region(VirtualAddress::new(0x1000), 0x1000, RW).unwrap();

        // 12 managed frames cannot hold one segment page plus the stack.
        assert_eq!(space.prepare_load(), Err(VmError::OutOfMemory));
        assert_eq!(frames.used_frames(), 1);

        drop(space);
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn resolve_classifies_regions() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);

        let t = space.resolve(VirtualAddress::new(0x1500)).unwrap();
        assert_eq!(t.region, Region::Segment(0));
        assert_eq!(t.paddr.page_offset(), 0x500);

        let t = space.resolve(VirtualAddress::new(0x3500)).unwrap();
        assert_eq!(t.region, Region::Segment(1));

        let t = space.resolve(VirtualAddress::new(USER_STACK_TOP - 1)).unwrap();
        assert_eq!(t.region, Region::Stack);
        let top = frames.translate(space.stack_frames().unwrap(), STACK_PAGES - 1);
        assert_eq!(t.paddr, top + 0xfff);

        assert_eq!(space.resolve(VirtualAddress::new(0x5000)), None);
        assert_eq!(space.resolve(stack_base() - 1), None);
    }

    #[test]
    fn resolve_walks_the_chain() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);
        let head = space.segment(0).unwrap().frames().unwrap();

        let t = space.resolve(VirtualAddress::new(0x2010)).unwrap();
        assert_eq!(t.paddr, frames.translate(head, 1) + 0x10);
    }

    #[test]
    fn readiness_gates_the_writable_bit() {
        let frames = emulated_allocator(64);
        let mut space = loaded(&frames);
        let text = VirtualAddress::new(0x1000);
        let data = VirtualAddress::new(0x3000);

        assert!(space.resolve(text).unwrap().writable);

        space.complete_load();
        assert!(space.is_ready());
        assert!(!space.resolve(text).unwrap().writable);
        assert!(space.resolve(data).unwrap().writable);
        assert!(space.resolve(stack_base()).unwrap().writable);
    }

    #[test]
    fn define_stack_returns_the_stack_top() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);
        assert_eq!(space.define_stack(), VirtualAddress::new(USER_STACK_TOP));
    }

    #[test]
    #[should_panic(expected = "before prepare_load")]
    fn define_stack_requires_backing() {
        let frames = emulated_allocator(64);
        let space = AddressSpace::new(&frames);
        space.define_stack();
    }

    #[test]
    fn copy_is_isolated() {
        let frames = emulated_allocator(96);
        let mut parent = loaded(&frames);
        parent.copy_in(VirtualAddress::new(0x1ffe), b"text").unwrap();
        parent.copy_in(VirtualAddress::new(USER_STACK_TOP - 4), b"top!").unwrap();
        parent.complete_load();

        let child = parent.copy().unwrap();
        assert!(child.is_ready());
        assert_eq!(child.segment(0).map(Segment::pages), Some(2));
        assert!(!child.segment(0).unwrap().is_writable());

        let mut parent_frames = Vec::new();
        for head in [
            parent.segment(0).unwrap().frames().unwrap(),
            parent.segment(1).unwrap().frames().unwrap(),
            parent.stack_frames().unwrap(),
        ] {
            frames.for_each_frame(head, |f| parent_frames.push(f));
        }
        for head in [
            child.segment(0).unwrap().frames().unwrap(),
            child.segment(1).unwrap().frames().unwrap(),
            child.stack_frames().unwrap(),
        ] {
            frames.for_each_frame(head, |f| assert!(!parent_frames.contains(&f)));
        }

        let mut buf = [0u8; 4];
        child.copy_out(VirtualAddress::new(0x1ffe), &mut buf).unwrap();
        assert_eq!(&buf, b"text");
        child.copy_out(VirtualAddress::new(USER_STACK_TOP - 4), &mut buf).unwrap();
        assert_eq!(&buf, b"top!");

        parent.copy_in(VirtualAddress::new(0x1ffe), b"TEXT").unwrap();
        child.copy_out(VirtualAddress::new(0x1ffe), &mut buf).unwrap();
        assert_eq!(&buf, b"text");
    }

    #[test]
    #[cfg(not(feature = "oom-panic"))]
    fn failed_copy_releases_partial_frames() {
        // Room for the parent and a little more, not for a second stack.
        let frames = emulated_allocator(29);
        let parent = loaded(&frames);
        let used = frames.used_frames();

        assert_eq!(parent.copy().err(), Some(VmError::OutOfMemory));
        assert_eq!(frames.used_frames(), used);
    }

    #[test]
    fn destroy_frees_every_chain() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);
        assert_ne!(frames.used_frames(), 0);

        space.destroy();
        assert_eq!(frames.used_frames(), 0);
    }

    #[test]
    fn copy_in_outside_regions_is_a_bad_address() {
        let frames = emulated_allocator(64);
        let space = loaded(&frames);
        assert_eq!(
            space.copy_in(VirtualAddress::new(0x3ffe), b"spill"),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn permissions_debug() {
        assert_eq!(format!("{:?}", RW), "rw-");
        assert_eq!(format!("{:?}", Permissions::READ | Permissions::EXECUTE), "r-x");
    }
}
