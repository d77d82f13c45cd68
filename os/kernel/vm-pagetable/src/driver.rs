//! # Page Table Driver
//!
//! OS-side owner of one page table tree per process. The driver allocates
//! the root table when a process is created, grows the tree lazily while
//! page faults are resolved, flips leaf validity for paging decisions and
//! tears the whole tree down when the process goes away.
//!
//! ## Tree growth
//!
//! ```text
//!   establish_mapping(pid, va, page)
//!        │
//!        ▼
//!   root ──[i0]──► L1 ──[i1]──► L2 ──[i2]──► L3 ──[i3]──► frame of `page`
//!          ▲              ▲              ▲
//!          └──────────────┴──────────────┴── allocated on first reference
//! ```
//!
//! Only a valid leaf entry is rejected; an invalidated leaf is overwritten and
//! intermediate tables are reused whenever their parent entry is valid.

use crate::arena::{PageTableArena, TableHandle, TableMemory};
use crate::frame_alloc::PhysicalMemory;
use crate::{ArenaError, PageTableEntry};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, error, trace, warn};
use vm_addresses::{AddressLayout, FrameNumber, PhysicalAddress, VirtualAddress};

/// Process identifier owning one page table tree.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(pub u64);

/// Location of the leaf entry that maps a [`PhysicalPage`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LeafRef {
    pub table: TableHandle,
    pub slot: usize,
}

/// A physical data frame as handed out by the memory allocator.
///
/// The driver records where the frame got mapped ([`mapping`](Self::mapping))
/// so that later validity changes do not require a page walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalPage {
    pid: ProcessId,
    address: PhysicalAddress,
    mapping: Option<LeafRef>,
}

/// Errors reported by the [`PageTableDriver`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("{pid} already has a page table")]
    DuplicateRoot { pid: ProcessId },
    #[error("{pid} has no page table")]
    UnknownProcess { pid: ProcessId },
    #[error("out of memory allocating a level {level} table ({bytes} bytes) for {pid}")]
    OutOfMemory {
        pid: ProcessId,
        level: usize,
        bytes: u64,
    },
    #[error("allocator returned {address} for {pid}, which is not aligned to {align:#x}")]
    Misaligned {
        pid: ProcessId,
        address: PhysicalAddress,
        align: u64,
    },
    #[error("{pid} cannot map the null frame")]
    NullFrame { pid: ProcessId },
    #[error("{frame} of {pid} does not fit into a page table entry")]
    FrameOutOfRange { pid: ProcessId, frame: FrameNumber },
    #[error("page of {owner} cannot be mapped into {pid}")]
    ForeignPage { pid: ProcessId, owner: ProcessId },
    #[error("virtual address {address} of {pid} is already mapped")]
    AlreadyMapped {
        pid: ProcessId,
        address: VirtualAddress,
    },
    #[error("virtual address {address} of {pid} is not mapped")]
    NotMapped {
        pid: ProcessId,
        address: VirtualAddress,
    },
    #[error("physical page {address} has no mapping")]
    PageNotMapped { address: PhysicalAddress },
    #[error("mapping of physical page {address} no longer exists")]
    StaleMapping { address: PhysicalAddress },
    #[error("page table entry for physical page {address} is already invalid")]
    EntryAlreadyInvalid { address: PhysicalAddress },
    #[error("level {level} entry of {pid} points to {frame}, which holds no page table")]
    DanglingTable {
        pid: ProcessId,
        level: usize,
        frame: FrameNumber,
    },
    #[error(transparent)]
    Arena(#[from] ArenaError),
}

/// Owner of all page table trees.
pub struct PageTableDriver {
    layout: AddressLayout,
    arena: PageTableArena,
    roots: BTreeMap<ProcessId, TableHandle>,
    bytes_allocated: u64,
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl From<u64> for ProcessId {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl PhysicalPage {
    /// A fresh, unmapped page of `pid` at `address`.
    #[inline]
    #[must_use]
    pub const fn new(pid: ProcessId, address: PhysicalAddress) -> Self {
        Self {
            pid,
            address,
            mapping: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        self.address
    }

    /// The leaf entry currently mapping this page, as set by the driver.
    #[inline]
    #[must_use]
    pub const fn mapping(&self) -> Option<LeafRef> {
        self.mapping
    }
}

impl PageTableDriver {
    #[must_use]
    pub fn new(layout: AddressLayout) -> Self {
        Self {
            layout,
            arena: PageTableArena::new(),
            roots: BTreeMap::new(),
            bytes_allocated: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.layout.page_size()
    }

    /// Bytes ever allocated for page tables. Never decreases.
    #[inline]
    #[must_use]
    pub const fn bytes_allocated(&self) -> u64 {
        self.bytes_allocated
    }

    /// Number of live tables across all processes.
    #[inline]
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.arena.len()
    }

    /// Number of tables in the tree of `pid`, the root included.
    ///
    /// # Errors
    /// [`DriverError::UnknownProcess`] if `pid` owns no tree.
    pub fn tables_of(&self, pid: ProcessId) -> Result<usize, DriverError> {
        Ok(self.count_subtree(self.root(pid)?, 0))
    }

    /// Processes that currently own a tree.
    pub fn processes(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.roots.keys().copied()
    }

    /// Allocate an empty root table for `pid` and return its address.
    ///
    /// # Errors
    /// - [`DriverError::DuplicateRoot`] if `pid` already owns a tree.
    /// - Allocation errors, see [`DriverError::OutOfMemory`] and [`DriverError::Misaligned`].
    pub fn allocate_root_table<A: PhysicalMemory>(
        &mut self,
        alloc: &mut A,
        pid: ProcessId,
    ) -> Result<PhysicalAddress, DriverError> {
        if self.roots.contains_key(&pid) {
            warn!("{pid} requested a second root table");
            return Err(DriverError::DuplicateRoot { pid });
        }

        let (root, address) = self.allocate_table(alloc, pid, 0)?;
        self.roots.insert(pid, root);
        Ok(address)
    }

    /// Release the root table of `pid` and every table reachable from it.
    ///
    /// Data frames referenced by leaf entries are not touched; they belong to
    /// whoever allocated them.
    ///
    /// # Errors
    /// [`DriverError::UnknownProcess`] if `pid` owns no tree.
    pub fn release_root_table<A: PhysicalMemory>(
        &mut self,
        alloc: &mut A,
        pid: ProcessId,
    ) -> Result<(), DriverError> {
        let Some(root) = self.roots.remove(&pid) else {
            warn!("release of page table requested for {pid}, which has none");
            return Err(DriverError::UnknownProcess { pid });
        };

        let released = self.release_subtree(alloc, pid, root, 0);
        debug!("released {released} page tables of {pid}");
        Ok(())
    }

    /// Address of the root table of `pid`, or `None` for an unknown process.
    #[must_use]
    pub fn root_table_address(&self, pid: ProcessId) -> Option<PhysicalAddress> {
        let root = self.roots.get(&pid)?;
        self.arena.frame(*root).map(|f| self.layout.address_of(f))
    }

    /// Install the translation `va → page` into the tree of `pid`, allocating
    /// missing intermediate tables on the way down.
    ///
    /// On success `page` carries a back-reference to its leaf entry.
    ///
    /// # Errors
    /// - [`DriverError::UnknownProcess`] if `pid` owns no tree.
    /// - [`DriverError::AlreadyMapped`] if the leaf entry for `va` is valid.
    ///   An invalidated leaf is overwritten, which leaves the back-reference
    ///   of the page it used to map stale.
    /// - [`DriverError::ForeignPage`], [`DriverError::NullFrame`],
    ///   [`DriverError::Misaligned`] and [`DriverError::FrameOutOfRange`] for
    ///   pages that cannot be mapped.
    /// - Allocation errors for intermediate tables.
    pub fn establish_mapping<A: PhysicalMemory>(
        &mut self,
        alloc: &mut A,
        pid: ProcessId,
        va: VirtualAddress,
        page: &mut PhysicalPage,
    ) -> Result<(), DriverError> {
        let frame = self.check_page(pid, page)?;
        let mut table = self.root(pid)?;
        let indices = self.layout.decode(va);

        for level in 0..self.layout.levels() - 1 {
            let index = indices.as_slice()[level];
            let entry = self.entry(table, index);

            table = if entry.valid() {
                self.arena
                    .frame_to_table_handle(entry.frame())
                    .ok_or(DriverError::DanglingTable {
                        pid,
                        level,
                        frame: entry.frame(),
                    })?
            } else {
                let (child, address) = self.allocate_table(alloc, pid, level + 1)?;
                let link = PageTableEntry::make_table_link(self.layout.frame_of(address));
                self.set_entry(table, index, link);
                trace!("{pid}: linked level {} table at {address} into slot {index}", level + 1);
                child
            };
        }

        let slot = indices.leaf();
        if self.entry(table, slot).valid() {
            warn!("{pid}: refusing to remap {va}");
            return Err(DriverError::AlreadyMapped { pid, address: va });
        }

        self.set_entry(table, slot, PageTableEntry::make_leaf(frame));
        page.mapping = Some(LeafRef { table, slot });
        debug!("{pid}: mapped {va} to {}", page.address);
        Ok(())
    }

    /// Set the `valid` bit of the leaf entry mapping `page`.
    ///
    /// # Errors
    /// - [`DriverError::PageNotMapped`] if `page` was never mapped.
    /// - [`DriverError::StaleMapping`] if its leaf entry no longer maps it.
    /// - [`DriverError::EntryAlreadyInvalid`] when invalidating an entry that
    ///   is already invalid.
    pub fn set_mapping_valid(&mut self, page: &PhysicalPage, valid: bool) -> Result<(), DriverError> {
        let address = page.address;
        let leaf = page.mapping.ok_or(DriverError::PageNotMapped { address })?;
        let frame = self.layout.frame_of(address);

        let entry = self
            .arena
            .entry_mut(leaf.table, leaf.slot)
            .filter(|e| e.is_populated() && e.frame() == frame)
            .ok_or(DriverError::StaleMapping { address })?;

        if !valid && !entry.valid() {
            error!("double invalidation of the mapping of {address}");
            return Err(DriverError::EntryAlreadyInvalid { address });
        }

        entry.set_valid(valid);
        trace!("mapping of {address} set {}", if valid { "valid" } else { "invalid" });
        Ok(())
    }

    /// Clear the leaf entry for `va` and return the frame it mapped.
    ///
    /// Intermediate tables stay in place until the tree is released.
    ///
    /// # Errors
    /// - [`DriverError::UnknownProcess`] if `pid` owns no tree.
    /// - [`DriverError::NotMapped`] if no leaf entry for `va` is populated.
    pub fn unmap(&mut self, pid: ProcessId, va: VirtualAddress) -> Result<FrameNumber, DriverError> {
        let (table, slot) = self
            .find_leaf(pid, va)?
            .ok_or(DriverError::NotMapped { pid, address: va })?;

        let entry = self.entry(table, slot);
        if !entry.is_populated() {
            return Err(DriverError::NotMapped { pid, address: va });
        }

        self.set_entry(table, slot, PageTableEntry::zero());
        debug!("{pid}: unmapped {va}");
        Ok(entry.frame())
    }

    /// Software walk: the frame `va` currently translates to in the tree of `pid`.
    ///
    /// # Errors
    /// [`DriverError::UnknownProcess`] if `pid` owns no tree.
    pub fn mapping_of(&self, pid: ProcessId, va: VirtualAddress) -> Result<Option<FrameNumber>, DriverError> {
        Ok(self
            .find_leaf(pid, va)?
            .map(|(table, slot)| self.entry(table, slot))
            .filter(|e| e.valid())
            .map(PageTableEntry::frame))
    }

    fn root(&self, pid: ProcessId) -> Result<TableHandle, DriverError> {
        self.roots
            .get(&pid)
            .copied()
            .ok_or(DriverError::UnknownProcess { pid })
    }

    fn check_page(&self, pid: ProcessId, page: &PhysicalPage) -> Result<FrameNumber, DriverError> {
        if page.pid != pid {
            return Err(DriverError::ForeignPage {
                pid,
                owner: page.pid,
            });
        }
        if page.address.is_null() {
            return Err(DriverError::NullFrame { pid });
        }
        if !page.address.is_aligned_to(self.layout.page_size()) {
            return Err(DriverError::Misaligned {
                pid,
                address: page.address,
                align: self.layout.page_size(),
            });
        }

        let frame = self.layout.frame_of(page.address);
        if frame.as_u64() > PageTableEntry::MAX_FRAME {
            return Err(DriverError::FrameOutOfRange { pid, frame });
        }
        Ok(frame)
    }

    /// Walk to the leaf table of `va` without allocating.
    fn find_leaf(&self, pid: ProcessId, va: VirtualAddress) -> Result<Option<(TableHandle, usize)>, DriverError> {
        let mut table = self.root(pid)?;
        let indices = self.layout.decode(va);

        for level in 0..self.layout.levels() - 1 {
            let entry = self.entry(table, indices.as_slice()[level]);
            if !entry.valid() {
                return Ok(None);
            }
            match self.arena.frame_to_table_handle(entry.frame()) {
                Some(next) => table = next,
                None => {
                    return Err(DriverError::DanglingTable {
                        pid,
                        level,
                        frame: entry.frame(),
                    });
                }
            }
        }

        Ok(Some((table, indices.leaf())))
    }

    fn allocate_table<A: PhysicalMemory>(
        &mut self,
        alloc: &mut A,
        pid: ProcessId,
        level: usize,
    ) -> Result<(TableHandle, PhysicalAddress), DriverError> {
        let bytes = self.layout.table_bytes(level);
        let align = self.layout.page_table_align();

        let address = match alloc.allocate(bytes, align) {
            Some(address) if !address.is_null() => address,
            _ => {
                error!("{pid}: out of memory allocating a level {level} page table");
                return Err(DriverError::OutOfMemory { pid, level, bytes });
            }
        };

        if !self.layout.is_table_aligned(address) {
            alloc.release(address, bytes);
            return Err(DriverError::Misaligned { pid, address, align });
        }

        let frame = self.layout.frame_of(address);
        let handle = match self.arena.insert(frame, self.layout.fanout(level)) {
            Ok(handle) => handle,
            Err(e) => {
                alloc.release(address, bytes);
                return Err(e.into());
            }
        };

        self.bytes_allocated += bytes;
        debug!("{pid}: allocated level {level} page table at {address} ({bytes} bytes)");
        Ok((handle, address))
    }

    /// Release `table` at `level` after all tables below it, returning how many were freed.
    fn release_subtree<A: PhysicalMemory>(
        &mut self,
        alloc: &mut A,
        pid: ProcessId,
        table: TableHandle,
        level: usize,
    ) -> usize {
        let mut released = 0;

        if !self.layout.is_leaf(level) {
            let children: Vec<FrameNumber> = self
                .arena
                .entries(table)
                .unwrap_or_default()
                .iter()
                .filter(|e| e.valid())
                .map(|e| e.frame())
                .collect();

            for frame in children {
                match self.arena.frame_to_table_handle(frame) {
                    Some(child) => released += self.release_subtree(alloc, pid, child, level + 1),
                    None => error!("{pid}: level {level} entry points to {frame}, which holds no page table"),
                }
            }
        }

        if let Some(frame) = self.arena.remove(table) {
            alloc.release(self.layout.address_of(frame), self.layout.table_bytes(level));
            released += 1;
        }
        released
    }

    fn count_subtree(&self, table: TableHandle, level: usize) -> usize {
        if self.layout.is_leaf(level) {
            return 1;
        }
        1 + self
            .arena
            .entries(table)
            .unwrap_or_default()
            .iter()
            .filter(|e| e.valid())
            .filter_map(|e| self.arena.frame_to_table_handle(e.frame()))
            .map(|child| self.count_subtree(child, level + 1))
            .sum::<usize>()
    }

    fn entry(&self, table: TableHandle, slot: usize) -> PageTableEntry {
        self.arena
            .entries(table)
            .and_then(|entries| entries.get(slot))
            .copied()
            .unwrap_or_default()
    }

    fn set_entry(&mut self, table: TableHandle, slot: usize, value: PageTableEntry) {
        if let Some(entry) = self.arena.entry_mut(table, slot) {
            *entry = value;
        }
    }
}

impl TableMemory for PageTableDriver {
    #[inline]
    fn frame_to_table_handle(&self, frame: FrameNumber) -> Option<TableHandle> {
        self.arena.frame_to_table_handle(frame)
    }

    #[inline]
    fn entries(&self, handle: TableHandle) -> Option<&[PageTableEntry]> {
        self.arena.entries(handle)
    }
}

impl Drop for PageTableDriver {
    fn drop(&mut self) {
        if !self.roots.is_empty() {
            error!(
                "page table driver dropped while {} process(es) still own page tables",
                self.roots.len()
            );
        }
    }
}
