//! # Address Layout Policy
//!
//! The page-size exponent, the address-space width and the per-level index
//! widths, bundled into one `Copy` value that is handed to both the MMU and
//! the page table driver.
//!
//! ## Invariants
//!
//! - Every non-root table holds `2^level_bits` entries of 8 bytes each.
//! - The root table receives the remaining high bits; its width is in
//!   `1..=level_bits`.
//! - `root_bits + (levels - 1) * level_bits + page_bits == address_space_bits`.

use crate::{FrameNumber, PhysicalAddress, VirtualAddress, VirtualPageNumber};
use core::fmt;

/// `log2(size_of::<PageTableEntry>())`: every entry is 64 bits wide.
pub const ENTRY_SIZE_BITS: u32 = 3;

/// Upper bound on the number of decode levels a layout may describe.
pub const MAX_LEVELS: usize = 6;

/// Errors detected when constructing an [`AddressLayout`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("a layout needs at least one decode level")]
    NoLevels,
    #[error("{levels} decode levels requested, at most {} are supported", MAX_LEVELS)]
    TooManyLevels { levels: usize },
    #[error("page size 2^{page_bits} cannot hold a page table")]
    PageTooSmall { page_bits: u32 },
    #[error("address space of {address_space_bits} bits does not fit into 64 bits")]
    AddressSpaceTooWide { address_space_bits: u32 },
    #[error("address space of {address_space_bits} bits leaves no page number above {page_bits} offset bits")]
    AddressSpaceTooNarrow {
        address_space_bits: u32,
        page_bits: u32,
    },
    #[error("level width of {level_bits} bits does not fit a table into one page of 2^{page_bits} bytes")]
    LevelWidth { level_bits: u32, page_bits: u32 },
    #[error("root level would decode {root_bits} bits, expected 1..={level_bits}")]
    RootWidth { root_bits: i64, level_bits: u32 },
}

/// Shared address decoding configuration.
///
/// Levels are numbered from the root: level `0` is the root table, level
/// `levels() - 1` is the leaf level whose entries hold data frames.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct AddressLayout {
    page_bits: u32,
    address_space_bits: u32,
    level_bits: u32,
    levels: usize,
}

/// Per-level table indices of one virtual page, most-significant level first.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct LevelIndices {
    indices: [usize; MAX_LEVELS],
    len: usize,
}

impl AddressLayout {
    /// 16 KiB pages, 48-bit address space, four levels decoding `{1, 11, 11, 11}` bits.
    pub const AARCH64_16K: Self = Self {
        page_bits: 14,
        address_space_bits: 48,
        level_bits: 11,
        levels: 4,
    };

    /// Build a layout in which every non-root table fills exactly one page.
    ///
    /// The non-root index width is `page_bits - ENTRY_SIZE_BITS`; the root
    /// decodes the remaining high bits.
    ///
    /// # Errors
    /// Returns a [`LayoutError`] if the parameters do not describe a valid tree.
    pub fn new(page_bits: u32, address_space_bits: u32, levels: usize) -> Result<Self, LayoutError> {
        if page_bits <= ENTRY_SIZE_BITS {
            return Err(LayoutError::PageTooSmall { page_bits });
        }
        Self::with_level_bits(page_bits, address_space_bits, page_bits - ENTRY_SIZE_BITS, levels)
    }

    /// Build a layout with an explicit non-root index width.
    ///
    /// Tables are still allocated with page alignment, so `level_bits` may be
    /// smaller than a full page worth of entries but never larger.
    ///
    /// # Errors
    /// Returns a [`LayoutError`] if the parameters do not describe a valid tree.
    pub fn with_level_bits(
        page_bits: u32,
        address_space_bits: u32,
        level_bits: u32,
        levels: usize,
    ) -> Result<Self, LayoutError> {
        if levels == 0 {
            return Err(LayoutError::NoLevels);
        }
        if levels > MAX_LEVELS {
            return Err(LayoutError::TooManyLevels { levels });
        }
        if page_bits <= ENTRY_SIZE_BITS {
            return Err(LayoutError::PageTooSmall { page_bits });
        }
        if address_space_bits > 64 {
            return Err(LayoutError::AddressSpaceTooWide { address_space_bits });
        }
        if address_space_bits <= page_bits {
            return Err(LayoutError::AddressSpaceTooNarrow {
                address_space_bits,
                page_bits,
            });
        }
        if level_bits == 0 || level_bits > page_bits - ENTRY_SIZE_BITS {
            return Err(LayoutError::LevelWidth {
                level_bits,
                page_bits,
            });
        }

        #[allow(clippy::cast_possible_wrap)]
        let root_bits = i64::from(address_space_bits)
            - i64::from(page_bits)
            - (levels as i64 - 1) * i64::from(level_bits);
        if root_bits < 1 || root_bits > i64::from(level_bits) {
            return Err(LayoutError::RootWidth {
                root_bits,
                level_bits,
            });
        }

        Ok(Self {
            page_bits,
            address_space_bits,
            level_bits,
            levels,
        })
    }

    /// The page-size exponent `P`.
    #[inline]
    #[must_use]
    pub const fn page_bits(&self) -> u32 {
        self.page_bits
    }

    /// The virtual address-space width `A` in bits.
    #[inline]
    #[must_use]
    pub const fn address_space_bits(&self) -> u32 {
        self.address_space_bits
    }

    /// The index width `W` of every non-root level.
    #[inline]
    #[must_use]
    pub const fn level_bits(&self) -> u32 {
        self.level_bits
    }

    /// Number of decode levels, root included.
    #[inline]
    #[must_use]
    pub const fn levels(&self) -> usize {
        self.levels
    }

    /// The reduced index width of the root level.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn root_bits(&self) -> u32 {
        self.address_space_bits - self.page_bits - (self.levels as u32 - 1) * self.level_bits
    }

    /// Index width of `level`.
    #[inline]
    #[must_use]
    pub const fn index_bits(&self, level: usize) -> u32 {
        debug_assert!(level < self.levels);
        if level == 0 {
            self.root_bits()
        } else {
            self.level_bits
        }
    }

    /// Returns `true` if `level` is the deepest level of the tree.
    #[inline]
    #[must_use]
    pub const fn is_leaf(&self, level: usize) -> bool {
        level + 1 == self.levels
    }

    /// Number of entries in a table at `level`.
    #[inline]
    #[must_use]
    pub const fn fanout(&self, level: usize) -> usize {
        1 << self.index_bits(level)
    }

    /// Size in bytes of a table at `level`.
    #[inline]
    #[must_use]
    pub const fn table_bytes(&self, level: usize) -> u64 {
        (self.fanout(level) as u64) << ENTRY_SIZE_BITS
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        1 << self.page_bits
    }

    /// Required alignment of every table, the root included.
    #[inline]
    #[must_use]
    pub const fn page_table_align(&self) -> u64 {
        self.page_size()
    }

    #[inline]
    #[must_use]
    pub const fn offset_mask(&self) -> u64 {
        self.page_size() - 1
    }

    /// Number of distinct virtual pages in the address space.
    #[inline]
    #[must_use]
    pub const fn virtual_pages(&self) -> u64 {
        1 << (self.address_space_bits - self.page_bits)
    }

    /// Clear (not reject) all bits above the address-space width.
    #[inline]
    #[must_use]
    pub const fn strip(&self, va: VirtualAddress) -> VirtualAddress {
        if self.address_space_bits == 64 {
            va
        } else {
            VirtualAddress::new(va.as_u64() & ((1 << self.address_space_bits) - 1))
        }
    }

    #[inline]
    #[must_use]
    pub const fn virtual_page(&self, va: VirtualAddress) -> VirtualPageNumber {
        VirtualPageNumber::new(self.strip(va).as_u64() >> self.page_bits)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(&self, va: VirtualAddress) -> u64 {
        va.as_u64() & self.offset_mask()
    }

    /// The first address of virtual page `vpn`.
    #[inline]
    #[must_use]
    pub const fn page_base(&self, vpn: VirtualPageNumber) -> VirtualAddress {
        VirtualAddress::new(vpn.as_u64() << self.page_bits)
    }

    /// Split a virtual page number into per-level indices, root first.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn split(&self, vpn: VirtualPageNumber) -> LevelIndices {
        let mut indices = [0; MAX_LEVELS];
        let mut rest = vpn.as_u64();
        for level in (0..self.levels).rev() {
            let bits = self.index_bits(level);
            indices[level] = (rest & ((1 << bits) - 1)) as usize;
            rest >>= bits;
        }
        LevelIndices {
            indices,
            len: self.levels,
        }
    }

    /// Strip, drop the offset and split `va` in one go.
    #[inline]
    #[must_use]
    pub fn decode(&self, va: VirtualAddress) -> LevelIndices {
        self.split(self.virtual_page(va))
    }

    #[inline]
    #[must_use]
    pub const fn frame_of(&self, pa: PhysicalAddress) -> FrameNumber {
        FrameNumber::new(pa.as_u64() >> self.page_bits)
    }

    #[inline]
    #[must_use]
    pub const fn address_of(&self, frame: FrameNumber) -> PhysicalAddress {
        PhysicalAddress::new(frame.as_u64() << self.page_bits)
    }

    /// `(frame << P) | (va & (page_size - 1))`.
    #[inline]
    #[must_use]
    pub const fn compose(&self, frame: FrameNumber, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new((frame.as_u64() << self.page_bits) | self.page_offset(va))
    }

    #[inline]
    #[must_use]
    pub const fn is_table_aligned(&self, pa: PhysicalAddress) -> bool {
        pa.is_aligned_to(self.page_table_align())
    }
}

impl Default for AddressLayout {
    fn default() -> Self {
        Self::AARCH64_16K
    }
}

impl fmt::Debug for AddressLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressLayout")
            .field("page_bits", &self.page_bits)
            .field("address_space_bits", &self.address_space_bits)
            .field("root_bits", &self.root_bits())
            .field("level_bits", &self.level_bits)
            .field("levels", &self.levels)
            .finish()
    }
}

impl LevelIndices {
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.indices[..self.len]
    }

    /// Index at `level`, root being `0`.
    #[inline]
    #[must_use]
    pub fn get(&self, level: usize) -> Option<usize> {
        self.as_slice().get(level).copied()
    }

    /// Index into the leaf table.
    #[inline]
    #[must_use]
    pub fn leaf(&self) -> usize {
        self.indices[self.len - 1]
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn iter(&self) -> core::iter::Copied<core::slice::Iter<'_, usize>> {
        self.as_slice().iter().copied()
    }
}

impl fmt::Debug for LevelIndices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl<'a> IntoIterator for &'a LevelIndices {
    type Item = usize;
    type IntoIter = core::iter::Copied<core::slice::Iter<'a, usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
