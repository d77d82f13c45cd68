//! # Kernel
//!
//! Ties a [`PageTableDriver`] and a physical allocator together into the
//! OS half of demand paging.
//!
//! ## Responsibilities
//! - Process lifecycle: one page table tree and one address-space id per
//!   process, created on [`Kernel::create_process`] and torn down, data
//!   frames included, on [`Kernel::exit_process`].
//! - Context switches: [`Kernel::switch_to`] points the MMU at the process
//!   tree and flushes the TLB when entries are not tagged.
//! - Page faults: a first touch backs the page with a fresh frame; a touch
//!   after [`Kernel::evict`] re-validates the existing mapping.
//!
//! ## Eviction order
//!
//! A TLB entry must never outlive the mapping it caches, so [`Kernel::evict`]
//! flushes the TLB *before* clearing the `valid` bit.

use crate::KernelError;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info, trace, warn};
use vm_addresses::{AddressLayout, PhysicalAddress, VirtualAddress, VirtualPageNumber};
use vm_mmu::{AccessKind, AddressSpaceId, FaultHandler, MemoryAccess, Mmu, MmuError, PageWalker};
use vm_pagetable::{PageTableDriver, PhysicalMemory, PhysicalPage, ProcessId, TableMemory};

/// A data page owned by a process.
#[derive(Debug, Copy, Clone)]
struct Resident {
    page: PhysicalPage,
    valid: bool,
}

#[derive(Debug, Default)]
struct Process {
    asid: AddressSpaceId,
    pages: BTreeMap<VirtualPageNumber, Resident>,
}

/// The OS layer over the page table driver.
pub struct Kernel<A: PhysicalMemory> {
    layout: AddressLayout,
    driver: PageTableDriver,
    alloc: A,
    processes: BTreeMap<ProcessId, Process>,
    current: Option<ProcessId>,
    next_asid: u16,
    faults: u64,
}

impl<A: PhysicalMemory> Kernel<A> {
    #[must_use]
    pub fn new(layout: AddressLayout, alloc: A) -> Self {
        Self {
            layout,
            driver: PageTableDriver::new(layout),
            alloc,
            processes: BTreeMap::new(),
            current: None,
            next_asid: 1,
            faults: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub const fn driver(&self) -> &PageTableDriver {
        &self.driver
    }

    #[inline]
    #[must_use]
    pub const fn allocator(&self) -> &A {
        &self.alloc
    }

    /// The process whose tree the last [`switch_to`](Self::switch_to) activated.
    #[inline]
    #[must_use]
    pub const fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// Number of page faults handled so far.
    #[inline]
    #[must_use]
    pub const fn faults(&self) -> u64 {
        self.faults
    }

    /// Number of data pages `pid` owns, evicted ones included.
    #[must_use]
    pub fn resident_pages(&self, pid: ProcessId) -> Option<usize> {
        self.processes.get(&pid).map(|p| p.pages.len())
    }

    /// Address-space id assigned to `pid`.
    #[must_use]
    pub fn address_space_id(&self, pid: ProcessId) -> Option<AddressSpaceId> {
        self.processes.get(&pid).map(|p| p.asid)
    }

    /// Create `pid` with an empty page table tree.
    ///
    /// # Errors
    /// [`KernelError::ProcessExists`] or a driver error if the root table
    /// cannot be allocated.
    pub fn create_process(&mut self, pid: ProcessId) -> Result<PhysicalAddress, KernelError> {
        if self.processes.contains_key(&pid) {
            return Err(KernelError::ProcessExists { pid });
        }

        let root = self.driver.allocate_root_table(&mut self.alloc, pid)?;
        let asid = AddressSpaceId(self.next_asid);
        self.next_asid = self.next_asid.wrapping_add(1).max(1);
        self.processes.insert(
            pid,
            Process {
                asid,
                pages: BTreeMap::new(),
            },
        );

        info!("created {pid} ({asid}) with root table at {root}");
        Ok(root)
    }

    /// Make `pid` the running process on `mmu`.
    ///
    /// # Errors
    /// [`KernelError::UnknownProcess`] if `pid` does not exist.
    pub fn switch_to<W: PageWalker>(&mut self, mmu: &mut Mmu<W>, pid: ProcessId) -> Result<(), KernelError> {
        let asid = self.address_space_id(pid).ok_or(KernelError::UnknownProcess { pid })?;
        let root = self
            .driver
            .root_table_address(pid)
            .ok_or(KernelError::UnknownProcess { pid })?;

        mmu.context_switch(root, asid);
        self.current = Some(pid);
        Ok(())
    }

    /// Tear down `pid`: release every data frame it owns, then its tree.
    ///
    /// The TLB is flushed before anything is released. If `mmu` was
    /// translating for `pid`, its root pointer is cleared and no process is
    /// current afterwards.
    ///
    /// # Errors
    /// [`KernelError::UnknownProcess`] if `pid` does not exist.
    pub fn exit_process<W: PageWalker>(&mut self, mmu: &mut Mmu<W>, pid: ProcessId) -> Result<(), KernelError> {
        let process = self
            .processes
            .remove(&pid)
            .ok_or(KernelError::UnknownProcess { pid })?;

        mmu.flush_tlb();
        let root = self.driver.root_table_address(pid);
        if self.current == Some(pid) || root == Some(mmu.root_pointer()) {
            mmu.set_root_pointer(PhysicalAddress::NULL);
            self.current = None;
        }

        let page_size = self.layout.page_size();
        for resident in process.pages.values() {
            self.alloc.release(resident.page.address(), page_size);
        }
        self.driver.release_root_table(&mut self.alloc, pid)?;

        info!("{pid} exited, {} data pages released", process.pages.len());
        Ok(())
    }

    /// Invalidate the mapping of `va` in `pid`, keeping its frame.
    ///
    /// The next access to the page faults and re-validates it.
    ///
    /// # Errors
    /// - [`KernelError::UnknownProcess`] if `pid` does not exist.
    /// - [`KernelError::NotResident`] if the page was never touched.
    /// - A driver error if the page is already evicted.
    pub fn evict<W: PageWalker>(
        &mut self,
        mmu: &mut Mmu<W>,
        pid: ProcessId,
        va: VirtualAddress,
    ) -> Result<(), KernelError> {
        let vpn = self.layout.virtual_page(va);
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(KernelError::UnknownProcess { pid })?;
        let resident = process
            .pages
            .get_mut(&vpn)
            .ok_or(KernelError::NotResident { pid, address: va })?;

        mmu.flush_tlb();
        self.driver.set_mapping_valid(&resident.page, false)?;
        resident.valid = false;
        debug!("{pid}: evicted {vpn}");
        Ok(())
    }

    /// Run `accesses` against `mmu` as the current process.
    ///
    /// Returns the number of accesses performed.
    ///
    /// # Errors
    /// The first access that fails.
    pub fn run<W, I>(&mut self, mmu: &mut Mmu<W>, accesses: I) -> Result<u64, MmuError<KernelError>>
    where
        W: PageWalker,
        I: IntoIterator<Item = MemoryAccess>,
    {
        let mut count = 0;
        for access in accesses {
            mmu.process_access(self, access)?;
            count += 1;
        }
        Ok(count)
    }

    /// Exit every remaining process and hand the allocator back.
    ///
    /// # Errors
    /// The first process that fails to exit.
    pub fn shutdown<W: PageWalker>(mut self, mmu: &mut Mmu<W>) -> Result<A, KernelError> {
        let pids: Vec<_> = self.processes.keys().copied().collect();
        for pid in pids {
            self.exit_process(mmu, pid)?;
        }
        Ok(self.alloc)
    }

    fn back_page(&mut self, pid: ProcessId, vpn: VirtualPageNumber) -> Result<Resident, KernelError> {
        let address = self.layout.page_base(vpn);
        let page_size = self.layout.page_size();
        let frame = self
            .alloc
            .allocate(page_size, page_size)
            .ok_or(KernelError::OutOfMemory { pid, address })?;

        let mut page = PhysicalPage::new(pid, frame);
        if let Err(e) = self
            .driver
            .establish_mapping(&mut self.alloc, pid, address, &mut page)
        {
            self.alloc.release(frame, page_size);
            return Err(e.into());
        }

        trace!("{pid}: {vpn} backed by {frame}");
        Ok(Resident { page, valid: true })
    }
}

impl<A: PhysicalMemory> FaultHandler for Kernel<A> {
    type Error = KernelError;

    fn memory(&self) -> &dyn TableMemory {
        &self.driver
    }

    fn handle_fault(&mut self, address: VirtualAddress, kind: AccessKind) -> Result<(), Self::Error> {
        let pid = self.current.ok_or(KernelError::NoCurrentProcess)?;
        let vpn = self.layout.virtual_page(address);
        self.faults += 1;
        trace!("{pid}: {kind} fault at {address}");

        let existing = self
            .processes
            .get(&pid)
            .ok_or(KernelError::UnknownProcess { pid })?
            .pages
            .get(&vpn)
            .copied();

        let resident = match existing {
            Some(resident) if resident.valid => {
                warn!("{pid}: fault on {address}, which is mapped and valid");
                return Err(KernelError::SpuriousFault { pid, address });
            }
            Some(resident) => {
                self.driver.set_mapping_valid(&resident.page, true)?;
                debug!("{pid}: {vpn} paged back in");
                Resident { valid: true, ..resident }
            }
            None => self.back_page(pid, vpn)?,
        };

        if let Some(process) = self.processes.get_mut(&pid) {
            process.pages.insert(vpn, resident);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_mmu::MmuConfig;
    use vm_pagetable::{BumpAllocator, DriverError};

    /// Fails every allocation once `budget` is used up.
    struct Limited {
        inner: BumpAllocator,
        budget: usize,
    }

    impl PhysicalMemory for Limited {
        fn allocate(&mut self, size: u64, align: u64) -> Option<PhysicalAddress> {
            self.budget = self.budget.checked_sub(1)?;
            self.inner.allocate(size, align)
        }

        fn release(&mut self, address: PhysicalAddress, size: u64) {
            self.inner.release(address, size);
        }
    }

    fn kernel(budget: usize) -> (Kernel<Limited>, Mmu) {
        let alloc = Limited {
            inner: BumpAllocator::with_capacity(1 << 24),
            budget,
        };
        (
            Kernel::new(AddressLayout::AARCH64_16K, alloc),
            Mmu::new(AddressLayout::AARCH64_16K, MmuConfig::default()),
        )
    }

    #[test]
    fn data_frame_exhaustion() {
        let (mut kernel, mut mmu) = kernel(1);
        let pid = ProcessId(1);
        kernel.create_process(pid).unwrap();
        kernel.switch_to(&mut mmu, pid).unwrap();

        let err = mmu
            .process_access(&mut kernel, MemoryAccess::load(VirtualAddress::new(0x4004)))
            .unwrap_err();
        assert_eq!(
            err,
            MmuError::Fault {
                address: VirtualAddress::new(0x4004),
                source: KernelError::OutOfMemory {
                    pid,
                    address: VirtualAddress::new(0x4000)
                }
            }
        );
        assert_eq!(kernel.resident_pages(pid), Some(0));
    }

    #[test]
    fn table_exhaustion_returns_the_data_frame() {
        let (mut kernel, mut mmu) = kernel(3);
        let pid = ProcessId(1);
        kernel.create_process(pid).unwrap();
        kernel.switch_to(&mut mmu, pid).unwrap();

        let err = mmu
            .process_access(&mut kernel, MemoryAccess::load(VirtualAddress::new(0)))
            .unwrap_err();
        assert!(matches!(
            err,
            MmuError::Fault {
                source: KernelError::Driver(DriverError::OutOfMemory { level: 2, .. }),
                ..
            }
        ));
        assert_eq!(kernel.allocator().inner.releases(), 1);
        assert_eq!(kernel.resident_pages(pid), Some(0));
    }

    #[test]
    fn spurious_fault_is_rejected() {
        let (mut kernel, mut mmu) = kernel(16);
        let pid = ProcessId(1);
        kernel.create_process(pid).unwrap();
        kernel.switch_to(&mut mmu, pid).unwrap();
        mmu.process_access(&mut kernel, MemoryAccess::load(VirtualAddress::new(0)))
            .unwrap();

        assert_eq!(
            kernel.handle_fault(VirtualAddress::new(8), AccessKind::Load),
            Err(KernelError::SpuriousFault {
                pid,
                address: VirtualAddress::new(8)
            })
        );
    }

    #[test]
    fn address_space_ids_skip_zero() {
        let (mut kernel, _) = kernel(16);
        kernel.next_asid = u16::MAX;
        kernel.create_process(ProcessId(1)).unwrap();
        kernel.create_process(ProcessId(2)).unwrap();
        assert_eq!(kernel.address_space_id(ProcessId(1)), Some(AddressSpaceId(u16::MAX)));
        assert_eq!(kernel.address_space_id(ProcessId(2)), Some(AddressSpaceId(1)));
    }
}
