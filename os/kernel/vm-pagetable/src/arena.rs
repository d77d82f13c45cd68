//! # Page Table Arena
//!
//! Owner of every table of every tree. Tables live in slots addressed by a
//! [`TableHandle`]; the physical frame a table was allocated at is only used
//! as a lookup key ([`PageTableArena::frame_to_table_handle`]), never
//! reinterpreted as a pointer.
//!
//! Handles carry a generation counter. Releasing a table bumps the
//! generation of its slot, so a handle kept across a release (for example
//! in a [`PhysicalPage`](crate::PhysicalPage) back-reference) is detected as
//! stale instead of silently aliasing whatever table reuses the slot.

use crate::PageTableEntry;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use vm_addresses::FrameNumber;

/// Stable reference to one table in a [`PageTableArena`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableHandle {
    index: u32,
    generation: u32,
}

/// Read-only view on page tables, keyed by the frame they live in.
///
/// This is the only path through which the MMU sees the tree: it can look
/// tables up and read entries, but never allocate, free or write them.
pub trait TableMemory {
    /// Decode a frame number into the handle of the table stored there.
    fn frame_to_table_handle(&self, frame: FrameNumber) -> Option<TableHandle>;

    /// Entries of a live table.
    fn entries(&self, handle: TableHandle) -> Option<&[PageTableEntry]>;

    /// Entries of the table stored in `frame`, if any.
    #[inline]
    fn table(&self, frame: FrameNumber) -> Option<&[PageTableEntry]> {
        self.entries(self.frame_to_table_handle(frame)?)
    }
}

/// Errors raised by the arena itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("{frame} already holds a page table")]
    FrameInUse { frame: FrameNumber },
    #[error("page table slots exhausted")]
    SlotsExhausted,
}

struct Table {
    frame: FrameNumber,
    entries: Vec<PageTableEntry>,
}

struct Slot {
    generation: u32,
    table: Option<Table>,
}

/// Slot storage for page tables.
#[derive(Default)]
pub struct PageTableArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_frame: BTreeMap<FrameNumber, TableHandle>,
}

impl TableHandle {
    /// Slot index; only meaningful together with the generation.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableHandle({}#{})", self.index, self.generation)
    }
}

impl PageTableArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live tables.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_frame.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }

    /// Store a zero-initialized table of `fanout` entries that lives in `frame`.
    ///
    /// # Errors
    /// - [`ArenaError::FrameInUse`] if another live table already claims `frame`.
    /// - [`ArenaError::SlotsExhausted`] if no further slot index is available.
    pub fn insert(&mut self, frame: FrameNumber, fanout: usize) -> Result<TableHandle, ArenaError> {
        if self.by_frame.contains_key(&frame) {
            return Err(ArenaError::FrameInUse { frame });
        }

        let table = Table {
            frame,
            entries: vec![PageTableEntry::zero(); fanout],
        };

        let handle = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.table = Some(table);
            TableHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = u32::try_from(self.slots.len()).map_err(|_| ArenaError::SlotsExhausted)?;
            self.slots.push(Slot {
                generation: 0,
                table: Some(table),
            });
            TableHandle {
                index,
                generation: 0,
            }
        };

        self.by_frame.insert(frame, handle);
        Ok(handle)
    }

    /// Drop the table behind `handle`, returning the frame it lived in.
    ///
    /// Returns `None` for a stale handle.
    pub fn remove(&mut self, handle: TableHandle) -> Option<FrameNumber> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let table = slot.table.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_frame.remove(&table.frame);
        Some(table.frame)
    }

    #[inline]
    #[must_use]
    pub fn is_live(&self, handle: TableHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Frame the table behind `handle` lives in.
    #[must_use]
    pub fn frame(&self, handle: TableHandle) -> Option<FrameNumber> {
        self.get(handle).map(|t| t.frame)
    }

    pub fn entries_mut(&mut self, handle: TableHandle) -> Option<&mut [PageTableEntry]> {
        self.get_mut(handle).map(|t| t.entries.as_mut_slice())
    }

    /// Mutable access to one entry of a live table.
    pub fn entry_mut(&mut self, handle: TableHandle, slot: usize) -> Option<&mut PageTableEntry> {
        self.entries_mut(handle)?.get_mut(slot)
    }

    fn get(&self, handle: TableHandle) -> Option<&Table> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.table.as_ref()
        } else {
            None
        }
    }

    fn get_mut(&mut self, handle: TableHandle) -> Option<&mut Table> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation == handle.generation {
            slot.table.as_mut()
        } else {
            None
        }
    }
}

impl TableMemory for PageTableArena {
    #[inline]
    fn frame_to_table_handle(&self, frame: FrameNumber) -> Option<TableHandle> {
        self.by_frame.get(&frame).copied()
    }

    #[inline]
    fn entries(&self, handle: TableHandle) -> Option<&[PageTableEntry]> {
        self.get(handle).map(|t| t.entries.as_slice())
    }
}
