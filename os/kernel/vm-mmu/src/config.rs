//! MMU and TLB configuration.

use core::num::NonZeroU32;

/// Default values used by the [`Default`] impls below.
pub mod defaults {
    use core::num::NonZeroU32;

    /// Number of TLB entries.
    pub const TLB_ENTRIES: usize = 32;

    /// Whether TLB entries are tagged with an address-space id.
    pub const ASID_TAGGING: bool = false;

    /// How many times a single access may fault before it is abandoned.
    pub const MAX_FAULT_ATTEMPTS: NonZeroU32 = NonZeroU32::MIN.saturating_add(15);
}

/// TLB sizing and tagging policy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlbConfig {
    /// Capacity in entries.
    pub entries: usize,
    /// Whether entries are tagged with the current [`AddressSpaceId`](crate::AddressSpaceId).
    pub asid_tagging: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MmuConfig {
    pub tlb: TlbConfig,
    /// Upper bound on fault handler invocations for a single access.
    /// `None` retries for as long as the handler keeps succeeding.
    pub max_fault_attempts: Option<NonZeroU32>,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            entries: defaults::TLB_ENTRIES,
            asid_tagging: defaults::ASID_TAGGING,
        }
    }
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            tlb: TlbConfig::default(),
            max_fault_attempts: Some(defaults::MAX_FAULT_ATTEMPTS),
        }
    }
}

impl TlbConfig {
    #[must_use]
    pub const fn with_entries(mut self, entries: usize) -> Self {
        self.entries = entries;
        self
    }

    #[must_use]
    pub const fn with_asid_tagging(mut self, enabled: bool) -> Self {
        self.asid_tagging = enabled;
        self
    }
}

impl MmuConfig {
    #[must_use]
    pub const fn with_tlb(mut self, tlb: TlbConfig) -> Self {
        self.tlb = tlb;
        self
    }

    #[must_use]
    pub const fn with_max_fault_attempts(mut self, attempts: Option<NonZeroU32>) -> Self {
        self.max_fault_attempts = attempts;
        self
    }
}
