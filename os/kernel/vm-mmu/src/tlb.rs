//! # Translation Lookaside Buffer
//!
//! A small, fully associative cache of `virtual page → physical frame`
//! translations with recency-based replacement.
//!
//! ## Ordering
//!
//! Entries are kept from least to most recently used. Only a **hit** and an
//! **insert** move an entry to the most-recently-used end; a full buffer
//! evicts from the other end.
//!
//! ```text
//!  oldest ─► [ e0 | e1 | e2 | … | eN ] ◄─ newest
//!             ▲                     ▲
//!             evicted on insert      hits and inserts land here
//! ```
//!
//! ## Address-space tagging
//!
//! With tagging **disabled**, entries carry no owner and match any process.
//! Whoever switches the active page table must [`flush`](Tlb::flush) first.
//! With tagging **enabled**, every entry remembers the address-space id that
//! was current when it was inserted and only matches that id again.

use crate::TlbConfig;
use alloc::collections::VecDeque;
use core::fmt;
use log::trace;
use vm_addresses::{FrameNumber, VirtualPageNumber};

/// Address-space identifier used to tag TLB entries.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(pub u16);

/// Counters since the last [`Tlb::reset`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlbStatistics {
    pub lookups: u64,
    pub hits: u64,
    /// Entries removed for any reason, flushes included.
    pub evictions: u64,
    pub flushes: u64,
    /// Entries removed by flushes only.
    pub flush_evictions: u64,
}

#[derive(Copy, Clone, Debug)]
struct TlbEntry {
    asid: Option<AddressSpaceId>,
    vpn: VirtualPageNumber,
    frame: FrameNumber,
}

/// The translation cache.
#[derive(Debug, Clone)]
pub struct Tlb {
    entries: VecDeque<TlbEntry>,
    capacity: usize,
    asid: AddressSpaceId,
    tagging: bool,
    stats: TlbStatistics,
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "asid {}", self.0)
    }
}

impl TlbStatistics {
    /// Fraction of lookups that hit, or `0.0` before the first lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }
}

impl fmt::Display for TlbStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lookups: {}, hits: {} ({:.2}%), line evictions: {}, flushes: {}, line evictions due to flush: {}",
            self.lookups,
            self.hits,
            self.hit_rate() * 100.0,
            self.evictions,
            self.flushes,
            self.flush_evictions
        )
    }
}

impl Tlb {
    #[must_use]
    pub fn new(config: TlbConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.entries),
            capacity: config.entries,
            asid: AddressSpaceId::default(),
            tagging: config.asid_tagging,
            stats: TlbStatistics::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached translations, regardless of their tag.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub const fn statistics(&self) -> TlbStatistics {
        self.stats
    }

    #[inline]
    #[must_use]
    pub const fn address_space_id(&self) -> AddressSpaceId {
        self.asid
    }

    /// Change the id used to tag and match entries. Does not flush.
    #[inline]
    pub const fn set_address_space_id(&mut self, asid: AddressSpaceId) {
        self.asid = asid;
    }

    #[inline]
    #[must_use]
    pub const fn tagging_enabled(&self) -> bool {
        self.tagging
    }

    #[inline]
    pub const fn set_tagging_enabled(&mut self, enabled: bool) {
        self.tagging = enabled;
    }

    /// Look up `vpn` for the current address space.
    ///
    /// A hit moves the entry to the most-recently-used end.
    pub fn lookup(&mut self, vpn: VirtualPageNumber) -> Option<FrameNumber> {
        self.stats.lookups += 1;

        let position = self.entries.iter().position(|e| self.matches(e, vpn))?;
        let entry = self.entries.remove(position)?;
        self.entries.push_back(entry);
        self.stats.hits += 1;
        trace!("tlb hit: {vpn} -> {}", entry.frame);
        Some(entry.frame)
    }

    /// Cache `vpn → frame` at the most-recently-used end, evicting the least
    /// recently used entry if the buffer is full.
    ///
    /// Callers only insert after a confirmed miss for the same key.
    pub fn insert(&mut self, vpn: VirtualPageNumber, frame: FrameNumber) {
        if self.capacity == 0 {
            return;
        }

        let asid = self.tagging.then_some(self.asid);
        debug_assert!(
            !self.entries.iter().any(|e| e.asid == asid && e.vpn == vpn),
            "duplicate TLB insert for {vpn}"
        );

        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                trace!("tlb evicts {} -> {}", evicted.vpn, evicted.frame);
            }
            self.stats.evictions += 1;
        }
        self.entries.push_back(TlbEntry { asid, vpn, frame });
    }

    /// Drop every entry.
    pub fn flush(&mut self) {
        let dropped = self.entries.len() as u64;
        self.entries.clear();
        self.stats.flushes += 1;
        self.stats.flush_evictions += dropped;
        self.stats.evictions += dropped;
        trace!("tlb flushed, {dropped} entries dropped");
    }

    /// [`flush`](Self::flush), then clear all statistics and the address-space id.
    pub fn reset(&mut self) {
        self.flush();
        self.stats = TlbStatistics::default();
        self.asid = AddressSpaceId::default();
    }

    fn matches(&self, entry: &TlbEntry, vpn: VirtualPageNumber) -> bool {
        entry.vpn == vpn && (!self.tagging || entry.asid == Some(self.asid))
    }
}
