/// Holds the coremap metadata for a physical memory frame.
///
/// Frames that belong to the same allocation form a singly-linked chain through `next`,
/// in the order the allocator claimed them (not necessarily address order). A free frame
/// never links anywhere, and the last frame of a chain has no `next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FrameEntry {
    /// Flags identifying the state of this frame.
    flags: FrameFlags,
    /// Coremap index of the next frame in this frame's allocation.
    next: Option<usize>,
}

impl FrameEntry {
    /// A free, unlinked frame.
    pub const FREE: Self = Self {
        flags: FrameFlags::new(),
        next: None,
    };

    /// Returns whether this frame is allocated.
    pub fn is_in_use(&self) -> bool {
        self.flags.test(FrameFlag::Allocated)
    }

    /// Returns whether this frame is the first frame of an allocation.
    pub fn is_head(&self) -> bool {
        self.flags.test(FrameFlag::ChainHead)
    }

    /// Returns the coremap index of the next frame in the chain.
    pub fn next(&self) -> Option<usize> {
        self.next
    }

    /// Marks a free frame as allocated, optionally as the head of its chain.
    pub(crate) fn claim(&mut self, head: bool) {
        debug_assert_eq!(*self, Self::FREE, "claimed a frame that is not free");
        self.flags.set(FrameFlag::Allocated);
        if head {
            self.flags.set(FrameFlag::ChainHead);
        }
    }

    /// Links this frame to the next frame of its allocation.
    pub(crate) fn link(&mut self, next: usize) {
        debug_assert!(self.is_in_use());
        self.next = Some(next);
    }

    /// Frees this frame, returning the index of the next frame in its chain.
    ///
    /// # Panics
    ///
    /// Panics if the frame is already free.
    pub(crate) fn release(&mut self) -> Option<usize> {
        assert!(self.is_in_use(), "freed a frame that is not in use");
        let next = self.next.take();
        self.flags = FrameFlags::new();
        next
    }
}

impl Default for FrameEntry {
    fn default() -> Self {
        Self::FREE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame is the first frame of a (possibly multi-frame) allocation.
    ChainHead = 1 << 1,
}

/// Flags for a physical memory frame.
///
/// The coremap is only touched with its lock held, so the flags are plain bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Sets the given flag.
    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    /// Tests if the given flag is set.
    pub fn test(&self, flag: FrameFlag) -> bool {
        (self.0 & flag as u8) != 0
    }
}
