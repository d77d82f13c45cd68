use vm_addresses::VirtualAddress;
use vm_pagetable::{DriverError, ProcessId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no process is running")]
    NoCurrentProcess,
    #[error("{pid} already exists")]
    ProcessExists { pid: ProcessId },
    #[error("{pid} does not exist")]
    UnknownProcess { pid: ProcessId },
    #[error("out of memory backing {address} of {pid}")]
    OutOfMemory { pid: ProcessId, address: VirtualAddress },
    #[error("{pid} has no resident page at {address}")]
    NotResident { pid: ProcessId, address: VirtualAddress },
    #[error("page fault on {address} of {pid}, which is mapped and valid")]
    SpuriousFault { pid: ProcessId, address: VirtualAddress },
    #[error(transparent)]
    Driver(#[from] DriverError),
}
