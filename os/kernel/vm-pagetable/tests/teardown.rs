use std::collections::BTreeMap;
use vm_addresses::{AddressLayout, PhysicalAddress, VirtualAddress};
use vm_pagetable::{
    BumpAllocator, DriverError, PageTableDriver, PhysicalMemory, PhysicalPage, ProcessId,
};

/// Allocator double that records every live allocation and complains about
/// releases it never handed out.
struct CountingAlloc {
    inner: BumpAllocator,
    live: BTreeMap<u64, u64>,
    allocate_calls: usize,
    release_calls: usize,
    bogus_releases: usize,
}

impl CountingAlloc {
    fn new() -> Self {
        Self {
            inner: BumpAllocator::with_capacity(1 << 32),
            live: BTreeMap::new(),
            allocate_calls: 0,
            release_calls: 0,
            bogus_releases: 0,
        }
    }
}

impl PhysicalMemory for CountingAlloc {
    fn allocate(&mut self, size: u64, align: u64) -> Option<PhysicalAddress> {
        let address = self.inner.allocate(size, align)?;
        self.allocate_calls += 1;
        self.live.insert(address.as_u64(), size);
        Some(address)
    }

    fn release(&mut self, address: PhysicalAddress, size: u64) {
        self.release_calls += 1;
        match self.live.remove(&address.as_u64()) {
            Some(s) if s == size => {}
            _ => self.bogus_releases += 1,
        }
        self.inner.release(address, size);
    }
}

fn map(driver: &mut PageTableDriver, alloc: &mut CountingAlloc, pid: ProcessId, va: u64, frame: u64) {
    let mut page = PhysicalPage::new(pid, PhysicalAddress::new(frame << 14));
    driver
        .establish_mapping(alloc, pid, VirtualAddress::new(va), &mut page)
        .unwrap();
}

#[test]
fn release_frees_every_table_exactly_once() {
    let mut alloc = CountingAlloc::new();
    let mut driver = PageTableDriver::new(AddressLayout::AARCH64_16K);
    let pid = ProcessId(3);

    driver.allocate_root_table(&mut alloc, pid).unwrap();

    // Spread mappings over both root slots and several L1/L2 slots.
    let addresses = [
        0x0,
        0x4000,
        1 << 25,
        1 << 36,
        (1 << 36) | (1 << 25),
        1 << 47,
        (1 << 47) | 0x1234_5678_4000,
        0xFFFF_FFFF_FFFF_C000,
    ];
    for (i, va) in addresses.into_iter().enumerate() {
        map(&mut driver, &mut alloc, pid, va, 0x100 + i as u64);
    }

    let tables = driver.table_count();
    assert_eq!(alloc.allocate_calls, tables);
    assert!(tables > 4);

    driver.release_root_table(&mut alloc, pid).unwrap();

    assert_eq!(driver.table_count(), 0);
    assert_eq!(alloc.release_calls, alloc.allocate_calls);
    assert_eq!(alloc.bogus_releases, 0);
    assert!(alloc.live.is_empty());
}

#[test]
fn release_only_touches_the_released_process() {
    let mut alloc = CountingAlloc::new();
    let mut driver = PageTableDriver::new(AddressLayout::AARCH64_16K);
    let (a, b) = (ProcessId(1), ProcessId(2));

    driver.allocate_root_table(&mut alloc, a).unwrap();
    driver.allocate_root_table(&mut alloc, b).unwrap();
    map(&mut driver, &mut alloc, a, 0, 0x10);
    map(&mut driver, &mut alloc, b, 0, 0x20);
    map(&mut driver, &mut alloc, b, 1 << 47, 0x21);
    assert_eq!(driver.tables_of(a), Ok(4));
    assert_eq!(driver.tables_of(b), Ok(7));

    driver.release_root_table(&mut alloc, a).unwrap();
    assert_eq!(alloc.release_calls, 4);
    assert_eq!(driver.table_count(), 7);
    assert!(driver.tables_of(a).is_err());
    assert_eq!(
        driver.mapping_of(b, VirtualAddress::new(1 << 47)).unwrap().map(|f| f.as_u64()),
        Some(0x21)
    );

    driver.release_root_table(&mut alloc, b).unwrap();
    assert!(alloc.live.is_empty());
    assert_eq!(alloc.bogus_releases, 0);
}

#[test]
fn bytes_allocated_survives_release() {
    let mut alloc = CountingAlloc::new();
    let mut driver = PageTableDriver::new(AddressLayout::AARCH64_16K);
    let pid = ProcessId(0);

    driver.allocate_root_table(&mut alloc, pid).unwrap();
    map(&mut driver, &mut alloc, pid, 0, 0x10);
    let before = driver.bytes_allocated();
    assert_eq!(before, 16 + 3 * 16384);

    driver.release_root_table(&mut alloc, pid).unwrap();
    assert_eq!(driver.bytes_allocated(), before);
    assert_eq!(
        driver.release_root_table(&mut alloc, pid),
        Err(DriverError::UnknownProcess { pid })
    );
}
