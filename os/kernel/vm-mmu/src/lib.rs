//! # MMU
//!
//! The hardware half of the paging simulator: a translation lookaside buffer,
//! a page walker and the fault-retry loop that ties them to the OS.
//!
//! ## Components
//! - [`Tlb`]: fully associative, recency ordered, optionally tagged with an
//!   [`AddressSpaceId`].
//! - [`PageWalker`]: the walk algorithm, with [`TreeWalker`] for the
//!   multi-level trees of `vm-pagetable`.
//! - [`Mmu`]: root pointer, TLB and walker; [`Mmu::translate`] for single
//!   lookups, [`Mmu::process_access`] for the full protocol against a
//!   [`FaultHandler`].
//!
//! ## Example
//!
//! ```rust
//! use vm_addresses::{AddressLayout, PhysicalAddress, VirtualAddress};
//! use vm_mmu::{Mmu, MmuConfig};
//! use vm_pagetable::{BumpAllocator, PageTableDriver, PhysicalPage, ProcessId};
//!
//! let layout = AddressLayout::AARCH64_16K;
//! let mut alloc = BumpAllocator::with_capacity(1 << 24);
//! let mut driver = PageTableDriver::new(layout);
//! let pid = ProcessId(1);
//!
//! let root = driver.allocate_root_table(&mut alloc, pid).unwrap();
//! let mut page = PhysicalPage::new(pid, PhysicalAddress::new(0xf00 << 14));
//! driver
//!     .establish_mapping(&mut alloc, pid, VirtualAddress::new(0), &mut page)
//!     .unwrap();
//!
//! let mut mmu = Mmu::new(layout, MmuConfig::default());
//! mmu.set_root_pointer(root);
//! assert_eq!(
//!     mmu.translate(&driver, VirtualAddress::new(1234), false).unwrap(),
//!     Some(PhysicalAddress::new((0xf00 << 14) | 1234))
//! );
//! assert_eq!(mmu.translate(&driver, VirtualAddress::new(1 << 14), false).unwrap(), None);
//!
//! driver.release_root_table(&mut alloc, pid).unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod access;
pub mod config;
mod error;
mod mmu;
mod tlb;
mod walk;

pub use crate::access::{AccessKind, MemoryAccess};
pub use crate::config::{MmuConfig, TlbConfig};
pub use crate::error::MmuError;
pub use crate::mmu::{FaultHandler, Mmu};
pub use crate::tlb::{AddressSpaceId, Tlb, TlbStatistics};
pub use crate::walk::{PageWalker, TreeWalker};
