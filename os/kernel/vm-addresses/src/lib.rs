//! # Virtual and Physical Memory Addresses
//!
//! Strongly typed wrappers for the raw `u64` values that flow between the
//! simulated MMU and the OS-side page table driver, plus the one piece of
//! configuration both of them must agree on bit for bit: the
//! [`AddressLayout`].
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | A virtual byte address as issued by a memory access. |
//! | [`PhysicalAddress`] | A physical byte address (table base, data frame, result). |
//! | [`VirtualPageNumber`] | A virtual address with the in-page offset bits removed. |
//! | [`FrameNumber`] | A physical address divided by the page size. |
//!
//! None of these types know the page size. Conversions between byte
//! addresses and page/frame numbers always go through an [`AddressLayout`],
//! so there is exactly one place that decides how many bits an offset has.
//!
//! ## Address decoding
//!
//! With the [`AddressLayout::AARCH64_16K`] preset, a virtual address is decoded as
//!
//! ```text
//! | 63‒48    | 47  | 46‒36 | 35‒25 | 24‒14 | 13‒0   |
//! | ignored  | L0  |  L1   |  L2   |  L3   | Offset |
//! ```
//!
//! The root level (`L0`) only receives the single high bit that remains after
//! the three full levels of 11 bits each and the 14 offset bits are taken.
//!
//! ```rust
//! # use vm_addresses::*;
//! let layout = AddressLayout::AARCH64_16K;
//! let va = VirtualAddress::new(0xFFFF_8000_0000_4000 | 1234);
//!
//! // Sign-extension bits are stripped, not rejected.
//! let vpn = layout.virtual_page(va);
//! assert_eq!(vpn.as_u64(), (0x8000_0000_4000 >> 14));
//!
//! let indices = layout.split(vpn);
//! assert_eq!(indices.as_slice(), &[1, 0, 0, 1]);
//! assert_eq!(layout.page_offset(va), 1234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod layout;
mod page_number;
mod physical_address;
mod virtual_address;

pub use crate::layout::{AddressLayout, ENTRY_SIZE_BITS, LayoutError, LevelIndices, MAX_LEVELS};
pub use crate::page_number::{FrameNumber, VirtualPageNumber};
pub use crate::physical_address::PhysicalAddress;
pub use crate::virtual_address::VirtualAddress;
