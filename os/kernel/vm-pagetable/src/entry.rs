use bitfield_struct::bitfield;
use vm_addresses::FrameNumber;

/// A single 64-bit page table entry.
///
/// The same format is used at every level. A leaf entry maps one virtual page
/// to one physical frame; an entry at any other level holds the frame number
/// of the next table instead. In both cases `valid` decides whether the frame
/// field means anything at all.
///
/// ### Bit layout
///
/// | Bits    | Name            | Meaning |
/// |---------|-----------------|---------|
/// | 0       | `valid`         | Entry is in use; the walk may follow it |
/// | 1       | `readable`      | Read permission (not enforced by the walk) |
/// | 2       | `writable`      | Write permission (not enforced by the walk) |
/// | 3       | `dirty`         | Page has been written |
/// | 4       | `referenced`    | Page has been accessed |
/// | 5‒29    | reserved        | Always zero |
/// | 30‒63   | `physical_frame`| Frame number (address >> page bits) |
///
/// ### Example
/// ```rust
/// # use vm_addresses::FrameNumber;
/// # use vm_pagetable::PageTableEntry;
/// let e = PageTableEntry::make_leaf(FrameNumber::new(0xf00));
/// assert!(e.valid());
/// assert!(e.readable());
/// assert_eq!(e.frame(), FrameNumber::new(0xf00));
/// assert_eq!(e.into_bits() >> 30, 0xf00);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// Set if the entry points to a valid next-level table or a valid leaf
    /// mapping. A clear bit makes the frame field meaningless.
    pub valid: bool,

    pub readable: bool,

    pub writable: bool,

    /// Set once the mapped page has been written. Meaningful for leaves only.
    pub dirty: bool,

    pub referenced: bool,

    #[bits(25)]
    __: u32,

    /// Frame number of the mapped page or of the next table.
    #[bits(34)]
    pub physical_frame: u64,
}

impl PageTableEntry {
    /// Width of the frame field.
    pub const FRAME_BITS: u32 = 34;

    /// Largest frame number the entry can hold.
    pub const MAX_FRAME: u64 = (1 << Self::FRAME_BITS) - 1;

    /// A fully zeroed (invalid) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new(self.physical_frame())
    }

    /// Point the entry at `frame`, leaving the flag bits alone.
    #[inline]
    pub fn set_frame(&mut self, frame: FrameNumber) {
        self.set_physical_frame(frame.as_u64());
    }

    /// Link to the table living in `frame`.
    #[inline]
    #[must_use]
    pub const fn make_table_link(frame: FrameNumber) -> Self {
        Self::new().with_valid(true).with_physical_frame(frame.as_u64())
    }

    /// Leaf translation to `frame`: valid, readable, clean.
    #[inline]
    #[must_use]
    pub const fn make_leaf(frame: FrameNumber) -> Self {
        Self::new()
            .with_valid(true)
            .with_readable(true)
            .with_dirty(false)
            .with_physical_frame(frame.as_u64())
    }

    /// Returns `true` if the entry has ever been populated, even if it is
    /// currently marked invalid. Frame `0` is never handed to a leaf.
    #[inline]
    #[must_use]
    pub const fn is_populated(self) -> bool {
        self.valid() || self.physical_frame() != 0
    }
}
