//! # Physical Memory Allocation
//!
//! The page table driver does not own physical memory. Every table (and
//! every data frame the OS hands out) is obtained through a
//! [`PhysicalMemory`] implementation supplied by the caller.
//!
//! [`BumpAllocator`] is the reference implementation: a cursor over a fixed
//! physical range that never reuses memory. It is enough to drive the
//! simulator and keeps the arithmetic trivially checkable in tests.

use vm_addresses::PhysicalAddress;

/// Source of physical memory for page tables and data frames.
///
/// Returned addresses **must** honor `align` and must never be
/// [`PhysicalAddress::NULL`]. Returns `None` on out-of-memory.
pub trait PhysicalMemory {
    /// Allocate `size` bytes aligned to `align` (a non-zero power of two).
    fn allocate(&mut self, size: u64, align: u64) -> Option<PhysicalAddress>;

    /// Return `size` bytes at `address`, previously obtained from [`allocate`](Self::allocate).
    fn release(&mut self, address: PhysicalAddress, size: u64);
}

impl<T: PhysicalMemory + ?Sized> PhysicalMemory for &mut T {
    #[inline]
    fn allocate(&mut self, size: u64, align: u64) -> Option<PhysicalAddress> {
        (**self).allocate(size, align)
    }

    #[inline]
    fn release(&mut self, address: PhysicalAddress, size: u64) {
        (**self).release(address, size);
    }
}

/// A trivial **bump** allocator over `[start, end)`.
///
/// Only keeps a cursor and bumps it on each allocation. Releases are
/// accounted for but the memory is never handed out again.
#[derive(Debug, Clone)]
pub struct BumpAllocator {
    next: u64,
    end: u64,
    live_bytes: u64,
    allocations: u64,
    releases: u64,
}

impl BumpAllocator {
    /// Allocator over `[start, end)`. Address `0` is skipped even if `start` is `0`.
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        let start = start.as_u64();
        Self {
            next: if start == 0 { 1 } else { start },
            end: end.as_u64(),
            live_bytes: 0,
            allocations: 0,
            releases: 0,
        }
    }

    /// Allocator over the first `bytes` of physical memory.
    #[must_use]
    pub const fn with_capacity(bytes: u64) -> Self {
        Self::new(PhysicalAddress::NULL, PhysicalAddress::new(bytes))
    }

    /// Bytes handed out and not yet released.
    #[inline]
    #[must_use]
    pub const fn live_bytes(&self) -> u64 {
        self.live_bytes
    }

    #[inline]
    #[must_use]
    pub const fn allocations(&self) -> u64 {
        self.allocations
    }

    #[inline]
    #[must_use]
    pub const fn releases(&self) -> u64 {
        self.releases
    }

    /// Bytes left between the cursor and the end of the range.
    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next)
    }
}

impl PhysicalMemory for BumpAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> Option<PhysicalAddress> {
        debug_assert!(align.is_power_of_two());
        let base = checked_align_up(self.next, align)?;
        let end = base.checked_add(size)?;
        if end > self.end {
            log::warn!("bump allocator exhausted: {size} bytes requested, {} left", self.remaining());
            return None;
        }
        self.next = end;
        self.live_bytes += size;
        self.allocations += 1;
        Some(PhysicalAddress::new(base))
    }

    fn release(&mut self, address: PhysicalAddress, size: u64) {
        debug_assert!(!address.is_null());
        self.live_bytes = self.live_bytes.saturating_sub(size);
        self.releases += 1;
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a **non-zero power of two**.
///
/// ```rust
/// # use vm_pagetable::frame_alloc::align_down;
/// assert_eq!(align_down(0, 16384), 0);
/// assert_eq!(align_down(16383, 16384), 0);
/// assert_eq!(align_down(16385, 16384), 16384);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a **non-zero power of two**.
///
/// ```rust
/// # use vm_pagetable::frame_alloc::checked_align_up;
/// assert_eq!(checked_align_up(1, 16384), Some(16384));
/// assert_eq!(checked_align_up(16384, 16384), Some(16384));
/// assert_eq!(checked_align_up(u64::MAX, 16384), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(align_down(v, a)),
        None => None,
    }
}
