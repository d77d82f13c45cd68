use core::convert::Infallible;
use vm_addresses::{PhysicalAddress, VirtualAddress};

/// Errors raised by the MMU.
///
/// `E` is the error type of the [`FaultHandler`](crate::FaultHandler); plain
/// translation can never produce [`MmuError::Fault`] and uses the default.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MmuError<E = Infallible> {
    #[error("no page table is active")]
    NoActiveTable,
    #[error("page table root {root} is not aligned to {align:#x}")]
    UnalignedRoot { root: PhysicalAddress, align: u64 },
    #[error("level {level} refers to {address}, which holds no page table")]
    DanglingTable { level: usize, address: PhysicalAddress },
    #[error("page table at {address} has no index {index} for level {level}")]
    TruncatedTable {
        level: usize,
        address: PhysicalAddress,
        index: usize,
    },
    #[error("{address} still faults after {attempts} handled page faults")]
    NoProgress { address: VirtualAddress, attempts: u32 },
    #[error("page fault handler failed for {address}")]
    Fault {
        address: VirtualAddress,
        #[source]
        source: E,
    },
}

impl MmuError {
    /// Re-type a translation error for a handler with error type `E`.
    pub(crate) fn widen<E>(self) -> MmuError<E> {
        match self {
            Self::NoActiveTable => MmuError::NoActiveTable,
            Self::UnalignedRoot { root, align } => MmuError::UnalignedRoot { root, align },
            Self::DanglingTable { level, address } => MmuError::DanglingTable { level, address },
            Self::TruncatedTable { level, address, index } => MmuError::TruncatedTable { level, address, index },
            Self::NoProgress { address, attempts } => MmuError::NoProgress { address, attempts },
            Self::Fault { source, .. } => match source {},
        }
    }
}
