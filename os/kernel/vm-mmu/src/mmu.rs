//! # Memory Management Unit
//!
//! The translating half of the simulator. An [`Mmu`] owns a [`Tlb`] and a
//! [`PageWalker`], holds the physical address of the active root table and
//! nothing else: it never allocates, frees or writes page tables. Tables are
//! read through whatever [`TableMemory`] the caller hands in.
//!
//! ## Access protocol
//!
//! ```text
//!  process_access(access)
//!    loop:
//!      translate(va) ──► TLB hit ─────────────────────────────► pa
//!                    └─► TLB miss ─► walk ─► hit ─► TLB insert ─► pa
//!                                         └─► miss
//!      handler.handle_fault(va, kind)       (extends the tree)
//! ```
//!
//! The loop is bounded by [`MmuConfig::max_fault_attempts`]: a handler that
//! returns without making the address translatable surfaces as
//! [`MmuError::NoProgress`] instead of spinning forever.
//!
//! ## Context switches
//!
//! Without address-space tagging, TLB entries are indistinguishable between
//! processes, so switching the root pointer requires a flush. Use
//! [`Mmu::context_switch`] to get that right; [`Mmu::set_root_pointer`]
//! leaves the TLB alone.

use crate::{AccessKind, AddressSpaceId, MemoryAccess, MmuConfig, MmuError, PageWalker, Tlb, TlbStatistics, TreeWalker};
use core::num::NonZeroU32;
use log::{debug, info, trace, warn};
use vm_addresses::{AddressLayout, PhysicalAddress, VirtualAddress};
use vm_pagetable::TableMemory;

/// The OS side of a page fault.
///
/// The handler owns (or borrows) the page tables. The MMU reads them through
/// [`memory`](Self::memory) and asks for them to be extended through
/// [`handle_fault`](Self::handle_fault).
pub trait FaultHandler {
    type Error;

    /// Read-only view on the tables the active root pointer refers to.
    fn memory(&self) -> &dyn TableMemory;

    /// Resolve a fault at `address`.
    ///
    /// On success, the next translation of `address` is expected to hit.
    ///
    /// # Errors
    /// Any handler-specific failure; it aborts the access.
    fn handle_fault(&mut self, address: VirtualAddress, kind: AccessKind) -> Result<(), Self::Error>;
}

/// One simulated MMU, servicing one core.
#[derive(Debug, Clone)]
pub struct Mmu<W = TreeWalker> {
    walker: W,
    root: PhysicalAddress,
    tlb: Tlb,
    max_fault_attempts: Option<NonZeroU32>,
}

impl Mmu<TreeWalker> {
    /// An MMU walking trees shaped by `layout`.
    #[must_use]
    pub fn new(layout: AddressLayout, config: MmuConfig) -> Self {
        Self::with_walker(TreeWalker::new(layout), config)
    }
}

impl<W: PageWalker> Mmu<W> {
    #[must_use]
    pub fn with_walker(walker: W, config: MmuConfig) -> Self {
        Self {
            walker,
            root: PhysicalAddress::NULL,
            tlb: Tlb::new(config.tlb),
            max_fault_attempts: config.max_fault_attempts,
        }
    }

    #[inline]
    #[must_use]
    pub const fn walker(&self) -> &W {
        &self.walker
    }

    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    #[inline]
    #[must_use]
    pub const fn statistics(&self) -> TlbStatistics {
        self.tlb.statistics()
    }

    /// The active root table, [`PhysicalAddress::NULL`] if none.
    #[inline]
    #[must_use]
    pub const fn root_pointer(&self) -> PhysicalAddress {
        self.root
    }

    /// Replace the active root table. Does not touch the TLB.
    pub fn set_root_pointer(&mut self, root: PhysicalAddress) {
        trace!("root pointer {} -> {root}", self.root);
        self.root = root;
    }

    /// Switch to another address space.
    ///
    /// Sets the root pointer and the address-space id; flushes the TLB unless
    /// entries are tagged.
    pub fn context_switch(&mut self, root: PhysicalAddress, asid: AddressSpaceId) {
        if !self.tlb.tagging_enabled() {
            self.tlb.flush();
        }
        self.tlb.set_address_space_id(asid);
        self.set_root_pointer(root);
        debug!("switched to {asid} with root table at {root}");
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
    }

    /// Flush and zero all TLB statistics.
    pub fn reset_tlb(&mut self) {
        self.tlb.reset();
    }

    pub fn set_address_space_id(&mut self, asid: AddressSpaceId) {
        self.tlb.set_address_space_id(asid);
    }

    pub fn set_address_space_tagging(&mut self, enabled: bool) {
        self.tlb.set_tagging_enabled(enabled);
    }

    /// Translate `va` against the active tree.
    ///
    /// Returns `Ok(None)` on a miss. The TLB is consulted first and filled
    /// on a successful walk; the tables themselves are never modified.
    ///
    /// # Errors
    /// - [`MmuError::NoActiveTable`] if no root pointer is set.
    /// - [`MmuError::UnalignedRoot`] if the root pointer is not table aligned.
    /// - [`MmuError::DanglingTable`] and [`MmuError::TruncatedTable`] if a
    ///   valid entry leads somewhere that is not a page table.
    pub fn translate(
        &mut self,
        memory: &dyn TableMemory,
        va: VirtualAddress,
        is_write: bool,
    ) -> Result<Option<PhysicalAddress>, MmuError> {
        if self.root.is_null() {
            return Err(MmuError::NoActiveTable);
        }

        let align = self.walker.table_align();
        if !self.root.is_aligned_to(align) {
            return Err(MmuError::UnalignedRoot { root: self.root, align });
        }

        let vpn = self.walker.virtual_page(va);
        if let Some(frame) = self.tlb.lookup(vpn) {
            return Ok(Some(self.walker.compose(frame, va)));
        }

        let Some(frame) = self.walker.perform_translation(memory, self.root, vpn, is_write)? else {
            return Ok(None);
        };
        self.tlb.insert(vpn, frame);
        Ok(Some(self.walker.compose(frame, va)))
    }

    /// Translate `access`, invoking `handler` on every miss until it hits.
    ///
    /// # Errors
    /// - Every translation error of [`translate`](Self::translate).
    /// - [`MmuError::Fault`] if the handler fails.
    /// - [`MmuError::NoProgress`] if the access still misses after the
    ///   configured number of handled faults.
    pub fn process_access<H>(
        &mut self,
        handler: &mut H,
        access: MemoryAccess,
    ) -> Result<PhysicalAddress, MmuError<H::Error>>
    where
        H: FaultHandler + ?Sized,
    {
        let mut attempts = 0;
        loop {
            if let Some(pa) = self
                .translate(handler.memory(), access.address, access.is_write())
                .map_err(MmuError::widen)?
            {
                trace!("{access} -> {pa}");
                return Ok(pa);
            }

            if self.max_fault_attempts.is_some_and(|max| attempts >= max.get()) {
                warn!("giving up on {access} after {attempts} page faults");
                return Err(MmuError::NoProgress {
                    address: access.address,
                    attempts,
                });
            }

            attempts += 1;
            debug!("page fault on {access} (attempt {attempts})");
            handler
                .handle_fault(access.address, access.kind)
                .map_err(|source| MmuError::Fault {
                    address: access.address,
                    source,
                })?;
        }
    }

    /// Emit the TLB statistics at `info` level.
    pub fn log_statistics(&self) {
        info!("TLB statistics: {}", self.tlb.statistics());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TlbConfig;
    use vm_addresses::FrameNumber;
    use vm_pagetable::{PageTableArena, PageTableEntry, TableHandle};

    const LAYOUT: AddressLayout = AddressLayout::AARCH64_16K;

    /// Hand-built trees, the way a test bench would lay them out in memory.
    struct Fixture {
        arena: PageTableArena,
        next_frame: u64,
        root: TableHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let mut arena = PageTableArena::new();
            let root = arena.insert(FrameNumber::new(1), LAYOUT.fanout(0)).unwrap();
            Self {
                arena,
                next_frame: 2,
                root,
            }
        }

        fn root_address(&self) -> PhysicalAddress {
            LAYOUT.address_of(self.arena.frame(self.root).unwrap())
        }

        fn map(&mut self, va: u64, frame: u64) {
            let indices = LAYOUT.decode(VirtualAddress::new(va));
            let mut table = self.root;
            for (level, index) in indices.iter().enumerate() {
                let entry = *self.arena.entry_mut(table, index).unwrap();
                if LAYOUT.is_leaf(level) {
                    *self.arena.entry_mut(table, index).unwrap() =
                        PageTableEntry::make_leaf(FrameNumber::new(frame));
                } else if entry.valid() {
                    table = self.arena.frame_to_table_handle(entry.frame()).unwrap();
                } else {
                    let child_frame = FrameNumber::new(self.next_frame);
                    self.next_frame += 1;
                    let child = self.arena.insert(child_frame, LAYOUT.fanout(level + 1)).unwrap();
                    *self.arena.entry_mut(table, index).unwrap() = PageTableEntry::make_table_link(child_frame);
                    table = child;
                }
            }
        }

        fn invalidate(&mut self, va: u64) {
            let indices = LAYOUT.decode(VirtualAddress::new(va));
            let mut table = self.root;
            for (level, index) in indices.iter().enumerate() {
                let entry = self.arena.entry_mut(table, index).unwrap();
                if LAYOUT.is_leaf(level) {
                    entry.set_valid(false);
                } else {
                    let frame = entry.frame();
                    table = self.arena.frame_to_table_handle(frame).unwrap();
                }
            }
        }
    }

    fn mmu() -> Mmu {
        Mmu::new(LAYOUT, MmuConfig::default())
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    #[test]
    fn translate_without_root_fails() {
        let fixture = Fixture::new();
        let mut mmu = mmu();
        assert_eq!(mmu.translate(&fixture.arena, va(0), false), Err(MmuError::NoActiveTable));
    }

    #[test]
    fn translate_with_unaligned_root_fails() {
        let fixture = Fixture::new();
        let mut mmu = mmu();
        let root = PhysicalAddress::new(fixture.root_address().as_u64() + 8);
        mmu.set_root_pointer(root);
        assert_eq!(
            mmu.translate(&fixture.arena, va(0), false),
            Err(MmuError::UnalignedRoot { root, align: 16384 })
        );
        assert_eq!(mmu.statistics().lookups, 0);
    }

    #[test]
    fn empty_tree_misses_everywhere() {
        let fixture = Fixture::new();
        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());

        for shift in 0..64 {
            let address = va(1u64 << shift);
            assert_eq!(mmu.translate(&fixture.arena, address, false), Ok(None), "{address}");
        }
        assert_eq!(mmu.statistics().hits, 0);
    }

    #[test]
    fn offsets_pass_through() {
        let mut fixture = Fixture::new();
        fixture.map(0, 0xf00);
        fixture.map(0xFFFF_FFFF_FFFF_C000, 0xa00);

        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());

        for offset in [0, 1, 1234, 0x3FFF] {
            assert_eq!(
                mmu.translate(&fixture.arena, va(offset), false),
                Ok(Some(PhysicalAddress::new((0xf00 << 14) | offset)))
            );
            assert_eq!(
                mmu.translate(&fixture.arena, va(0xFFFF_FFFF_FFFF_C000 | offset), true),
                Ok(Some(PhysicalAddress::new((0xa00 << 14) | offset)))
            );
        }
        assert_eq!(mmu.translate(&fixture.arena, va(1 << 14), false), Ok(None));
    }

    #[test]
    fn high_bits_are_stripped_not_rejected() {
        let mut fixture = Fixture::new();
        fixture.map(0x4000, 0x123);

        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());
        assert_eq!(
            mmu.translate(&fixture.arena, va(0xABCD_0000_0000_4000 | 7), false),
            Ok(Some(PhysicalAddress::new((0x123 << 14) | 7)))
        );
    }

    #[test]
    fn second_translation_hits_the_tlb() {
        let mut fixture = Fixture::new();
        fixture.map(0, 0xf00);

        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());

        let first = mmu.translate(&fixture.arena, va(12), false).unwrap();
        assert_eq!(mmu.statistics().hits, 0);
        let second = mmu.translate(&fixture.arena, va(34), false).unwrap();
        assert_eq!(mmu.statistics().hits, 1);
        assert_eq!(first.map(|pa| pa.as_u64() >> 14), second.map(|pa| pa.as_u64() >> 14));
    }

    #[test]
    fn misses_are_not_cached() {
        let mut fixture = Fixture::new();
        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());

        assert_eq!(mmu.translate(&fixture.arena, va(0), false), Ok(None));
        fixture.map(0, 0xf00);
        assert!(mmu.translate(&fixture.arena, va(0), false).unwrap().is_some());
        assert_eq!(mmu.tlb().len(), 1);
    }

    #[test]
    fn stale_entry_survives_until_flushed() {
        let mut fixture = Fixture::new();
        fixture.map(0, 0xf00);

        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());
        assert!(mmu.translate(&fixture.arena, va(0), false).unwrap().is_some());

        fixture.invalidate(0);
        assert!(
            mmu.translate(&fixture.arena, va(0), false).unwrap().is_some(),
            "the TLB still answers for the invalidated page"
        );

        mmu.flush_tlb();
        assert_eq!(mmu.translate(&fixture.arena, va(0), false), Ok(None));
    }

    #[test]
    fn context_switch_flush_rule() {
        let mut a = Fixture::new();
        a.map(0, 0xf00);
        let b = {
            let mut arena = PageTableArena::new();
            let root = arena.insert(FrameNumber::new(100), LAYOUT.fanout(0)).unwrap();
            Fixture {
                arena,
                next_frame: 101,
                root,
            }
        };

        let mut mmu = mmu();
        mmu.set_root_pointer(a.root_address());
        assert!(mmu.translate(&a.arena, va(0), false).unwrap().is_some());

        // Switching without a flush leaves process A's translation visible.
        mmu.set_root_pointer(b.root_address());
        assert!(mmu.translate(&b.arena, va(0), false).unwrap().is_some());

        mmu.context_switch(b.root_address(), AddressSpaceId(2));
        assert_eq!(mmu.translate(&b.arena, va(0), false), Ok(None));
        assert_eq!(mmu.statistics().flushes, 1);
    }

    #[test]
    fn tagged_context_switch_keeps_entries() {
        let mut a = Fixture::new();
        a.map(0, 0xf00);

        let config = MmuConfig::default().with_tlb(TlbConfig::default().with_asid_tagging(true));
        let mut mmu = Mmu::new(LAYOUT, config);
        mmu.context_switch(a.root_address(), AddressSpaceId(1));
        assert!(mmu.translate(&a.arena, va(0), false).unwrap().is_some());

        mmu.context_switch(a.root_address(), AddressSpaceId(2));
        mmu.context_switch(a.root_address(), AddressSpaceId(1));
        assert!(mmu.translate(&a.arena, va(0), false).unwrap().is_some());

        let stats = mmu.statistics();
        assert_eq!((stats.flushes, stats.hits), (0, 1));
    }

    #[test]
    fn capacity_pressure_evicts_one_entry() {
        let mut fixture = Fixture::new();
        for page in 0..33 {
            fixture.map(page << 14, 0x100 + page);
        }

        let mut mmu = mmu();
        mmu.set_root_pointer(fixture.root_address());
        for page in 0..32 {
            assert!(mmu.translate(&fixture.arena, va(page << 14), false).unwrap().is_some());
        }
        assert_eq!(mmu.statistics().evictions, 0);

        assert!(mmu.translate(&fixture.arena, va(32 << 14), false).unwrap().is_some());
        assert_eq!(mmu.statistics().evictions, 1);

        mmu.flush_tlb();
        let stats = mmu.statistics();
        assert_eq!(stats.flush_evictions, 32);
        assert_eq!(stats.evictions, 33);
    }

    struct Counting<'a> {
        fixture: &'a mut Fixture,
        faults: u32,
        resolve: bool,
    }

    impl FaultHandler for Counting<'_> {
        type Error = &'static str;

        fn memory(&self) -> &dyn TableMemory {
            &self.fixture.arena
        }

        fn handle_fault(&mut self, address: VirtualAddress, _kind: AccessKind) -> Result<(), Self::Error> {
            self.faults += 1;
            if self.resolve {
                self.fixture.map(address.as_u64(), 0x777);
            }
            Ok(())
        }
    }

    #[test]
    fn fault_then_retry() {
        let mut fixture = Fixture::new();
        let root = fixture.root_address();
        let mut handler = Counting {
            fixture: &mut fixture,
            faults: 0,
            resolve: true,
        };

        let mut mmu = mmu();
        mmu.set_root_pointer(root);
        let pa = mmu
            .process_access(&mut handler, MemoryAccess::store(va(0x8000 | 5)))
            .unwrap();
        assert_eq!(pa, PhysicalAddress::new((0x777 << 14) | 5));
        assert_eq!(handler.faults, 1);
    }

    #[test]
    fn unhelpful_handler_is_bounded() {
        let mut fixture = Fixture::new();
        let root = fixture.root_address();
        let mut handler = Counting {
            fixture: &mut fixture,
            faults: 0,
            resolve: false,
        };

        let config = MmuConfig::default().with_max_fault_attempts(NonZeroU32::new(3));
        let mut mmu = Mmu::new(LAYOUT, config);
        mmu.set_root_pointer(root);

        let err = mmu
            .process_access(&mut handler, MemoryAccess::load(va(0)))
            .unwrap_err();
        assert_eq!(
            err,
            MmuError::NoProgress {
                address: va(0),
                attempts: 3
            }
        );
        assert_eq!(handler.faults, 3);
    }

    #[test]
    fn process_access_without_root_fails_before_faulting() {
        let mut fixture = Fixture::new();
        let mut handler = Counting {
            fixture: &mut fixture,
            faults: 0,
            resolve: true,
        };

        let mut mmu = mmu();
        assert_eq!(
            mmu.process_access(&mut handler, MemoryAccess::load(va(0))),
            Err(MmuError::NoActiveTable)
        );
        assert_eq!(handler.faults, 0);
    }
}
