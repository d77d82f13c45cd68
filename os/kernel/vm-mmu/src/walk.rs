//! # Page Walk
//!
//! The hardware side of translation: given the root pointer and a virtual
//! page number, follow one entry per level down to the leaf.
//!
//! ```text
//!   root ──idx[0]──► L1 ──idx[1]──► L2 ──idx[2]──► L3 ──idx[3]──► frame
//!          valid?          valid?          valid?          valid?
//!            │               │               │               │
//!            └───────────────┴───── no ──────┴───────────────┴──► miss (page fault)
//! ```
//!
//! Walks only read page tables through [`TableMemory`]; they never allocate
//! tables and never update `dirty` or `referenced`.

use crate::MmuError;
use log::trace;
use vm_addresses::{AddressLayout, FrameNumber, PhysicalAddress, VirtualAddress, VirtualPageNumber};
use vm_pagetable::TableMemory;

/// A page-table format the MMU can walk.
///
/// All address arithmetic goes through [`layout`](Self::layout), the same
/// value the page table driver is built from.
pub trait PageWalker {
    /// The address layout the walked trees are shaped by.
    fn layout(&self) -> &AddressLayout;

    /// Walk the tree rooted at `root` for `vpn`.
    ///
    /// Returns `Ok(None)` for a miss, i.e. when an invalid entry is met on
    /// the way down. Structural corruption is an error.
    fn perform_translation(
        &self,
        memory: &dyn TableMemory,
        root: PhysicalAddress,
        vpn: VirtualPageNumber,
        is_write: bool,
    ) -> Result<Option<FrameNumber>, MmuError>;

    /// The page-size exponent `P`.
    #[inline]
    fn page_bits(&self) -> u32 {
        self.layout().page_bits()
    }

    /// The virtual address-space width `A`.
    #[inline]
    fn address_space_bits(&self) -> u32 {
        self.layout().address_space_bits()
    }

    /// Strip bits above `A` and drop the in-page offset.
    #[inline]
    fn virtual_page(&self, va: VirtualAddress) -> VirtualPageNumber {
        self.layout().virtual_page(va)
    }

    /// Splice the in-page offset of `va` onto `frame`.
    #[inline]
    fn compose(&self, frame: FrameNumber, va: VirtualAddress) -> PhysicalAddress {
        self.layout().compose(frame, va)
    }

    /// Alignment every table, the root included, must satisfy.
    #[inline]
    fn table_align(&self) -> u64 {
        self.layout().page_table_align()
    }
}

/// Walks multi-level trees described by an [`AddressLayout`].
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct TreeWalker {
    layout: AddressLayout,
}

impl TreeWalker {
    #[must_use]
    pub const fn new(layout: AddressLayout) -> Self {
        Self { layout }
    }

}

impl PageWalker for TreeWalker {
    #[inline]
    fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    fn perform_translation(
        &self,
        memory: &dyn TableMemory,
        root: PhysicalAddress,
        vpn: VirtualPageNumber,
        _is_write: bool,
    ) -> Result<Option<FrameNumber>, MmuError> {
        let indices = self.layout.split(vpn);
        let mut frame = self.layout.frame_of(root);

        for (level, index) in indices.iter().enumerate() {
            let address = self.layout.address_of(frame);
            let table = memory
                .table(frame)
                .ok_or(MmuError::DanglingTable { level, address })?;
            let entry = table
                .get(index)
                .copied()
                .ok_or(MmuError::TruncatedTable { level, address, index })?;

            if !entry.valid() {
                trace!("walk of {vpn} stops at level {level}, index {index}: entry invalid");
                return Ok(None);
            }
            frame = entry.frame();
        }

        trace!("walk of {vpn} resolved to {frame}");
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_pagetable::{PageTableArena, PageTableEntry};

    const LAYOUT: AddressLayout = AddressLayout::AARCH64_16K;

    /// Builds a chain `root → 1 → 2 → 3` for vpn 0 ending in `leaf`.
    fn chain(leaf: Option<u64>) -> PageTableArena {
        let mut arena = PageTableArena::new();
        let frames = [10u64, 11, 12, 13];
        for (level, frame) in frames.iter().enumerate() {
            let handle = arena.insert(FrameNumber::new(*frame), LAYOUT.fanout(level)).unwrap();
            let next = match frames.get(level + 1) {
                Some(next) => Some(PageTableEntry::make_table_link(FrameNumber::new(*next))),
                None => leaf.map(|f| PageTableEntry::make_leaf(FrameNumber::new(f))),
            };
            if let Some(entry) = next {
                *arena.entry_mut(handle, 0).unwrap() = entry;
            }
        }
        arena
    }

    #[test]
    fn resolves_a_full_chain() {
        let arena = chain(Some(0xf00));
        let walker = TreeWalker::new(LAYOUT);
        let root = LAYOUT.address_of(FrameNumber::new(10));

        let frame = walker
            .perform_translation(&arena, root, VirtualPageNumber::new(0), false)
            .unwrap();
        assert_eq!(frame, Some(FrameNumber::new(0xf00)));
    }

    #[test]
    fn invalid_leaf_is_a_miss() {
        let arena = chain(None);
        let walker = TreeWalker::new(LAYOUT);
        let root = LAYOUT.address_of(FrameNumber::new(10));

        assert_eq!(
            walker.perform_translation(&arena, root, VirtualPageNumber::new(0), true),
            Ok(None)
        );
    }

    #[test]
    fn invalid_intermediate_is_a_miss() {
        let arena = chain(Some(0xf00));
        let walker = TreeWalker::new(LAYOUT);
        let root = LAYOUT.address_of(FrameNumber::new(10));

        // Index 1 at the root level has never been linked.
        let vpn = VirtualPageNumber::new(1 << 33);
        assert_eq!(walker.perform_translation(&arena, root, vpn, false), Ok(None));
    }

    #[test]
    fn root_without_table_is_dangling() {
        let arena = PageTableArena::new();
        let walker = TreeWalker::new(LAYOUT);
        let root = LAYOUT.address_of(FrameNumber::new(99));

        assert_eq!(
            walker.perform_translation(&arena, root, VirtualPageNumber::new(0), false),
            Err(MmuError::DanglingTable { level: 0, address: root })
        );
    }

    #[test]
    fn link_to_missing_table_is_dangling() {
        let mut arena = PageTableArena::new();
        let root = arena.insert(FrameNumber::new(10), LAYOUT.fanout(0)).unwrap();
        *arena.entry_mut(root, 0).unwrap() = PageTableEntry::make_table_link(FrameNumber::new(77));

        let walker = TreeWalker::new(LAYOUT);
        let err = walker
            .perform_translation(&arena, LAYOUT.address_of(FrameNumber::new(10)), VirtualPageNumber::new(0), false)
            .unwrap_err();
        assert_eq!(
            err,
            MmuError::DanglingTable {
                level: 1,
                address: LAYOUT.address_of(FrameNumber::new(77))
            }
        );
    }

    #[test]
    fn provided_helpers_follow_the_layout() {
        let walker = TreeWalker::new(LAYOUT);
        assert_eq!(walker.page_bits(), 14);
        assert_eq!(walker.address_space_bits(), 48);
        let va = VirtualAddress::new(0xFFFF_8000_0000_4000 | 1234);
        assert_eq!(walker.virtual_page(va), LAYOUT.virtual_page(va));
        assert_eq!(
            walker.compose(FrameNumber::new(0xf00), va),
            LAYOUT.compose(FrameNumber::new(0xf00), va)
        );
        assert_eq!(walker.table_align(), LAYOUT.page_table_align());
    }
}
