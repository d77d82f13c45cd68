use core::fmt;
use vm_addresses::VirtualAddress;

/// What a memory access does, in the categories of a Lackey-style trace.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AccessKind {
    /// Instruction fetch.
    Instruction,
    Load,
    Store,
    /// Read followed by a write to the same location.
    Modify,
}

/// A single memory access issued by the simulated CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MemoryAccess {
    pub kind: AccessKind,
    pub address: VirtualAddress,
    /// Access width in bytes.
    pub size: u8,
}

impl AccessKind {
    /// Whether the access writes to memory.
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Store | Self::Modify)
    }

    /// Single-letter code, as used in trace files.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Instruction => 'I',
            Self::Load => 'L',
            Self::Store => 'S',
            Self::Modify => 'M',
        }
    }
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl MemoryAccess {
    #[must_use]
    pub const fn new(kind: AccessKind, address: VirtualAddress, size: u8) -> Self {
        Self { kind, address, size }
    }

    /// An 8-byte load.
    #[must_use]
    pub const fn load(address: VirtualAddress) -> Self {
        Self::new(AccessKind::Load, address, 8)
    }

    /// An 8-byte store.
    #[must_use]
    pub const fn store(address: VirtualAddress) -> Self {
        Self::new(AccessKind::Store, address, 8)
    }

    #[inline]
    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.kind.is_write()
    }
}

impl fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:x},{}", self.kind, self.address, self.size)
    }
}
