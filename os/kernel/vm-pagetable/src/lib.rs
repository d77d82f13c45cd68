//! # Page Tables
//!
//! The data side of the paging simulator: the entry format, the storage for
//! page tables and the OS-side driver that owns one tree per process.
//!
//! ## What you get
//! - [`PageTableEntry`]: the packed 64-bit entry (`valid`, permissions,
//!   `dirty`, `referenced`, 34-bit frame number).
//! - [`PageTableArena`]: slot storage for tables with generation-checked
//!   [`TableHandle`]s and a frame → handle index.
//! - [`TableMemory`]: the read-only view the MMU walks.
//! - [`PhysicalMemory`]: the allocator contract, plus [`BumpAllocator`].
//! - [`PageTableDriver`]: root allocation, lazy tree growth, validity
//!   toggles and full teardown.
//!
//! ## Tree shape
//!
//! With [`AddressLayout::AARCH64_16K`](vm_addresses::AddressLayout::AARCH64_16K)
//! the root table has 2 entries and every other table 2048, so that a
//! non-root table is exactly one 16 KiB page:
//!
//! ```text
//!  root (2)  →  L1 (2048)  →  L2 (2048)  →  L3 (2048)  →  data frame
//!    │             │             │             │
//!    │             │             │             └── leaf entry: frame of the data page
//!    └─────────────┴─────────────┴──────────────── link entry: frame of the next table
//! ```
//!
//! A table is reachable if and only if its parent entry is valid. Tables are
//! always page aligned, which is what lets a link entry store a frame
//! number instead of a byte address.
//!
//! ## Example
//!
//! ```rust
//! use vm_addresses::{AddressLayout, FrameNumber, PhysicalAddress, VirtualAddress};
//! use vm_pagetable::{BumpAllocator, PageTableDriver, PhysicalPage, ProcessId};
//!
//! let mut alloc = BumpAllocator::with_capacity(1 << 24);
//! let mut driver = PageTableDriver::new(AddressLayout::AARCH64_16K);
//! let pid = ProcessId(1);
//!
//! driver.allocate_root_table(&mut alloc, pid).unwrap();
//! let mut page = PhysicalPage::new(pid, PhysicalAddress::new(0xf00 << 14));
//! driver
//!     .establish_mapping(&mut alloc, pid, VirtualAddress::new(0), &mut page)
//!     .unwrap();
//!
//! assert_eq!(
//!     driver.mapping_of(pid, VirtualAddress::new(1234)).unwrap(),
//!     Some(FrameNumber::new(0xf00))
//! );
//! driver.release_root_table(&mut alloc, pid).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod arena;
mod driver;
mod entry;
pub mod frame_alloc;

pub use crate::arena::{ArenaError, PageTableArena, TableHandle, TableMemory};
pub use crate::driver::{DriverError, LeafRef, PageTableDriver, PhysicalPage, ProcessId};
pub use crate::entry::PageTableEntry;
pub use crate::frame_alloc::{BumpAllocator, PhysicalMemory};
