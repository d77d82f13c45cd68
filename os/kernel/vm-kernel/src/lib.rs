//! # Reference Kernel
//!
//! A minimal OS layer for the paging simulator: processes with their own
//! page table trees, demand paging through the MMU fault protocol and page
//! eviction that honours the TLB ordering rule.
//!
//! ```rust
//! use vm_addresses::{AddressLayout, VirtualAddress};
//! use vm_kernel::Kernel;
//! use vm_mmu::{MemoryAccess, Mmu, MmuConfig};
//! use vm_pagetable::{BumpAllocator, ProcessId};
//!
//! let layout = AddressLayout::AARCH64_16K;
//! let mut kernel = Kernel::new(layout, BumpAllocator::with_capacity(1 << 24));
//! let mut mmu = Mmu::new(layout, MmuConfig::default());
//!
//! let pid = ProcessId(1);
//! kernel.create_process(pid).unwrap();
//! kernel.switch_to(&mut mmu, pid).unwrap();
//!
//! let va = VirtualAddress::new(0x1234);
//! let pa = mmu.process_access(&mut kernel, MemoryAccess::load(va)).unwrap();
//! assert_eq!(pa.as_u64() & 0x3FFF, 0x1234);
//! assert_eq!(kernel.faults(), 1);
//!
//! let alloc = kernel.shutdown(&mut mmu).unwrap();
//! assert_eq!(alloc.live_bytes(), 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
mod kernel;

pub use crate::error::KernelError;
pub use crate::kernel::Kernel;
