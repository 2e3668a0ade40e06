//! The interval store (spec.md §4.1): an ordered, disjoint partition of
//! free virtual-address space, tagged with reachability, reservation, and
//! usage flags.
//!
//! Backed by `BTreeMap<u64, Interval>` keyed by start address rather than
//! `cranelift-entity`'s `PrimaryMap`/`cranelift-bforest`'s `BForest`: both
//! of those are dense-index- or entity-keyed, and this store needs
//! ordered neighbor lookups by virtual address (predecessor/successor,
//! "does this range fit between two entries") that a `BTreeMap` expresses
//! directly.

use crate::entities::IntervalId;
use cranelift_entity::EntityRef;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::ops::Range;

bitflags::bitflags! {
    /// Which branch flavors can reach an interval from somewhere in the
    /// original code (spec.md §4.1's two reachability windows).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Reach: u8 {
        /// Reachable by a direct branch from some original instruction.
        const DIRECT = 1 << 0;
        /// Reachable by a memory-relative reference from some original
        /// instruction.
        const REFERENCE = 1 << 1;
    }
}

/// What an interval has been earmarked for, decided once at
/// initialisation by [`IntervalStore::decide_reservation`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reservation {
    /// Not yet earmarked for anything.
    #[default]
    Unreserved,
    /// Earmarked to host relocated/inserted code.
    Code,
    /// Earmarked to host relocated/inserted data.
    Data,
}

/// What an interval (or the retained remainder of one, after a
/// [`IntervalStore::find_fit`]) is actually holding.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Usage {
    /// Not consumed by anything yet.
    #[default]
    Unused,
    /// Hosting a moved block or newly inserted code.
    Code,
    /// Hosting a data entry or global variable.
    Data,
    /// Hosting an indirect-jump trampoline (address table entry).
    Trampoline,
}

/// A single free (or formerly free, now consumed) range of virtual
/// addresses.
#[derive(Copy, Clone, Debug)]
pub struct Interval {
    id: IntervalId,
    start: u64,
    end: u64,
    reach: Reach,
    reservation: Reservation,
    usage: Usage,
}

impl Interval {
    /// A stable identity for this interval, surviving splits (the head
    /// keeps its id; the tail is assigned a fresh one) but not merges
    /// (the surviving interval keeps `a`'s id; `b`'s is retired).
    pub fn id(&self) -> IntervalId {
        self.id
    }

    /// The interval's start address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The interval's (exclusive) end address.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The interval's size in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// The interval's reachability flags.
    pub fn reach(&self) -> Reach {
        self.reach
    }

    /// The interval's reservation.
    pub fn reservation(&self) -> Reservation {
        self.reservation
    }

    /// The interval's usage.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// True if nothing has been carved out of this interval yet.
    pub fn is_unused(&self) -> bool {
        matches!(self.usage, Usage::Unused)
    }
}

/// The store itself: disjoint intervals keyed by start address (spec.md
/// §3 invariant 5: "Intervals in the store are pairwise disjoint, sorted
/// by address").
#[derive(Default)]
pub struct IntervalStore {
    intervals: BTreeMap<u64, Interval>,
    /// Dead gaps inside existing code sections (spec.md §2 supplement
    /// "Instruction gap tracking"): too small/scattered to ever be handed
    /// out by `find_fit`, but counted towards "is there really no room"
    /// decisions via `gap_bytes_in_window`.
    gaps: Vec<Range<u64>>,
    /// The two reachability windows last computed by
    /// `compute_reachability`, kept around so `decide_reservation` can
    /// report gap bytes inside them on oversubscription.
    direct_window: Option<Range<u64>>,
    reference_window: Option<Range<u64>>,
    next_id: u32,
}

impl IntervalStore {
    /// Build a store from the binfile back end's free-space map. Every
    /// interval starts unreached, unreserved, unused; call
    /// [`IntervalStore::compute_reachability`] and
    /// [`IntervalStore::decide_reservation`] to finish initialisation.
    pub fn new(free: impl IntoIterator<Item = (u64, u64)>) -> Self {
        let mut intervals = BTreeMap::new();
        let mut next_id = 0u32;
        for (start, end) in free {
            debug_assert!(start < end, "free interval must be non-empty");
            intervals.insert(
                start,
                Interval {
                    id: IntervalId::new(next_id as usize),
                    start,
                    end,
                    reach: Reach::empty(),
                    reservation: Reservation::Unreserved,
                    usage: Usage::Unused,
                },
            );
            next_id += 1;
        }
        Self {
            intervals,
            gaps: Vec::new(),
            direct_window: None,
            reference_window: None,
            next_id,
        }
    }

    fn fresh_id(&mut self) -> IntervalId {
        let id = IntervalId::new(self.next_id as usize);
        self.next_id += 1;
        id
    }

    /// Record the disassembler's instruction gaps (spec.md §2 supplement).
    pub fn set_gaps(&mut self, gaps: Vec<Range<u64>>) {
        self.gaps = gaps;
    }

    /// Total bytes of dead instruction-gap space overlapping `window`.
    /// Never contributes usable capacity to `find_fit`; only informs
    /// "genuinely no room" diagnostics.
    pub fn gap_bytes_in_window(&self, window: &Range<u64>) -> u64 {
        self.gaps
            .iter()
            .filter_map(|g| {
                let start = g.start.max(window.start);
                let end = g.end.min(window.end);
                (end > start).then_some(end - start)
            })
            .sum()
    }

    /// Flag every interval inside `[lowest_code_addr - back_reach,
    /// highest_code_addr + fwd_reach)` as [`Reach::DIRECT`], and every
    /// interval inside the analogous memory-relative window as
    /// [`Reach::REFERENCE`] (spec.md §4.1).
    pub fn compute_reachability(
        &mut self,
        lowest_code_addr: u64,
        highest_code_addr: u64,
        direct_back_reach: u64,
        direct_fwd_reach: u64,
        mem_rel_back_reach: u64,
        mem_rel_fwd_reach: u64,
    ) {
        let direct_window = lowest_code_addr.saturating_sub(direct_back_reach)
            ..highest_code_addr.saturating_add(direct_fwd_reach);
        let reference_window = lowest_code_addr.saturating_sub(mem_rel_back_reach)
            ..highest_code_addr.saturating_add(mem_rel_fwd_reach);
        for iv in self.intervals.values_mut() {
            if overlaps(&direct_window, iv.start, iv.end) {
                iv.reach.insert(Reach::DIRECT);
            }
            if overlaps(&reference_window, iv.start, iv.end) {
                iv.reach.insert(Reach::REFERENCE);
            }
        }
        trace!(
            "reachability windows: direct={:?} reference={:?}",
            direct_window, reference_window
        );
        self.direct_window = Some(direct_window);
        self.reference_window = Some(reference_window);
    }

    /// Decide the reservation strategy (spec.md §4.1): reserve exact
    /// estimates if they both fit, otherwise reserve all reference-
    /// reachable space for data and all remaining direct-reachable space
    /// for code (spec.md S6: warns rather than aborting when
    /// oversubscribed).
    pub fn decide_reservation(&mut self, codesize_estimate: u64, ref_data_size_estimate: u64) {
        let direct_capacity: u64 = self
            .intervals
            .values()
            .filter(|iv| iv.reach.contains(Reach::DIRECT))
            .map(Interval::size)
            .sum();
        let reference_capacity: u64 = self
            .intervals
            .values()
            .filter(|iv| iv.reach.contains(Reach::REFERENCE))
            .map(Interval::size)
            .sum();

        let fits_exactly =
            2 * codesize_estimate <= direct_capacity && 2 * ref_data_size_estimate <= reference_capacity;

        if fits_exactly {
            debug!(
                "interval store: reserving exact estimates (code={}, data={})",
                2 * codesize_estimate,
                2 * ref_data_size_estimate
            );
            self.reserve_budget(Reach::DIRECT, Reservation::Code, 2 * codesize_estimate);
            self.reserve_budget(Reach::REFERENCE, Reservation::Data, 2 * ref_data_size_estimate);
        } else {
            let direct_gaps = self.direct_window.as_ref().map(|w| self.gap_bytes_in_window(w)).unwrap_or(0);
            let reference_gaps =
                self.reference_window.as_ref().map(|w| self.gap_bytes_in_window(w)).unwrap_or(0);
            warn!(
                "interval store oversubscribed (need code={}, data={}, have direct={}, reference={}, \
                 plus {} dead direct-window bytes and {} dead reference-window bytes that can never help); \
                 reserving all reference-reachable space for data and remaining direct-reachable space for code",
                2 * codesize_estimate,
                2 * ref_data_size_estimate,
                direct_capacity,
                reference_capacity,
                direct_gaps,
                reference_gaps,
            );
            for iv in self.intervals.values_mut() {
                if iv.reach.contains(Reach::REFERENCE) {
                    iv.reservation = Reservation::Data;
                } else if iv.reach.contains(Reach::DIRECT) {
                    iv.reservation = Reservation::Code;
                }
            }
        }
    }

    fn reserve_budget(&mut self, reach: Reach, reservation: Reservation, mut budget: u64) {
        let starts: Vec<u64> = self
            .intervals
            .iter()
            .filter(|(_, iv)| iv.reach.contains(reach))
            .map(|(s, _)| *s)
            .collect();
        for start in starts {
            if budget == 0 {
                break;
            }
            let iv = self.intervals.get_mut(&start).expect("start came from self.intervals");
            iv.reservation = reservation;
            budget = budget.saturating_sub(iv.size());
        }
    }

    /// Split the interval starting at `start` at address `at`, inserting
    /// a new interval `[at, old.end)` that inherits the original's flags,
    /// and truncating the original to `[start, at)`.
    pub fn split(&mut self, start: u64, at: u64) -> Option<()> {
        let iv = self.intervals.get(&start).copied()?;
        if at <= iv.start || at >= iv.end {
            return None;
        }
        let tail_id = self.fresh_id();
        let tail = Interval {
            id: tail_id,
            start: at,
            end: iv.end,
            ..iv
        };
        self.intervals.get_mut(&start).unwrap().end = at;
        self.intervals.insert(at, tail);
        Some(())
    }

    /// Merge two adjacent intervals, only if they share a reservation and
    /// neither is in use (spec.md §4.1). `b_start` is removed.
    pub fn merge(&mut self, a_start: u64, b_start: u64) -> Option<()> {
        let a = self.intervals.get(&a_start)?;
        let b = self.intervals.get(&b_start)?;
        if a.end != b.start {
            return None;
        }
        if a.reservation != b.reservation || !a.is_unused() || !b.is_unused() {
            return None;
        }
        let new_end = b.end;
        self.intervals.remove(&b_start);
        self.intervals.get_mut(&a_start).unwrap().end = new_end;
        Some(())
    }

    /// Find the first interval satisfying `size`, `alignment`,
    /// `required_reach`, and `required_reservation`, splitting it so the
    /// returned range is exactly the request (padded up for alignment),
    /// and marking the retained portion with `usage` (spec.md §4.1).
    pub fn find_fit(
        &mut self,
        size: u64,
        alignment: u64,
        required_reach: Reach,
        required_reservation: Reservation,
        usage: Usage,
    ) -> Option<Range<u64>> {
        let candidate_start = self.intervals.iter().find_map(|(start, iv)| {
            if !iv.is_unused() || iv.reservation != required_reservation {
                return None;
            }
            if !iv.reach.contains(required_reach) {
                return None;
            }
            let aligned_start = align_up(iv.start, alignment);
            let padding = aligned_start - iv.start;
            if aligned_start + size <= iv.end {
                Some((*start, padding))
            } else {
                None
            }
        })?;

        let (start, padding) = candidate_start;
        let consumed = padding + size;
        let iv = *self.intervals.get(&start).unwrap();

        if consumed < iv.size() {
            self.split(start, start + consumed);
        }
        let out_start = start + padding;
        let out_end = out_start + size;
        let iv_mut = self.intervals.get_mut(&start).unwrap();
        iv_mut.usage = usage;
        Some(out_start..out_end)
    }

    /// Iterate all intervals in address order (for diagnostics and the
    /// `IntervalsSortedAndDisjoint` invariant check in tests).
    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.values()
    }
}

fn overlaps(window: &Range<u64>, start: u64, end: u64) -> bool {
    start < window.end && end > window.start
}

fn align_up(addr: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return addr;
    }
    let rem = addr % alignment;
    if rem == 0 {
        addr
    } else {
        addr + (alignment - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_fit_splits_larger_interval() {
        let mut store = IntervalStore::new([(0x1000, 0x2000)]);
        for iv in store.intervals.values_mut() {
            iv.reach = Reach::DIRECT;
            iv.reservation = Reservation::Code;
        }
        let got = store
            .find_fit(0x10, 1, Reach::DIRECT, Reservation::Code, Usage::Code)
            .unwrap();
        assert_eq!(got, 0x1000..0x1010);
        assert_eq!(store.intervals.len(), 2);
        assert!(!store.intervals[&0x1000].is_unused());
        assert!(store.intervals[&0x1010].is_unused());
    }

    #[test]
    fn find_fit_respects_alignment_padding() {
        let mut store = IntervalStore::new([(0x1001, 0x2000)]);
        for iv in store.intervals.values_mut() {
            iv.reach = Reach::DIRECT;
            iv.reservation = Reservation::Code;
        }
        let got = store
            .find_fit(0x10, 0x10, Reach::DIRECT, Reservation::Code, Usage::Code)
            .unwrap();
        assert_eq!(got.start % 0x10, 0);
        assert_eq!(got.end - got.start, 0x10);
    }

    #[test]
    fn find_fit_exact_match_does_not_split() {
        let mut store = IntervalStore::new([(0x2000, 0x2010)]);
        for iv in store.intervals.values_mut() {
            iv.reach = Reach::DIRECT;
            iv.reservation = Reservation::Code;
        }
        store
            .find_fit(0x10, 1, Reach::DIRECT, Reservation::Code, Usage::Code)
            .unwrap();
        assert_eq!(store.intervals.len(), 1);
    }

    #[test]
    fn merge_requires_adjacency_and_same_reservation() {
        let mut store = IntervalStore::new([(0x1000, 0x1010), (0x1010, 0x1020)]);
        assert!(store.merge(0x1000, 0x1010).is_some());
        assert_eq!(store.intervals.len(), 1);
        assert_eq!(store.intervals[&0x1000].end(), 0x1020);
    }

    #[test]
    fn decide_reservation_falls_back_when_oversubscribed() {
        let mut store = IntervalStore::new([(0x1000, 0x1010)]);
        store.compute_reachability(0x1000, 0x1000, 0, 0x10, 0, 0x10);
        store.decide_reservation(0x1000, 0x1000);
        let iv = &store.intervals[&0x1000];
        assert_eq!(iv.reservation(), Reservation::Data);
    }

    #[test]
    fn gap_bytes_in_window_sums_overlap_only() {
        let mut store = IntervalStore::new([(0x1000, 0x2000)]);
        store.set_gaps(vec![0x900..0x910, 0x1500..0x1510, 0x3000..0x3010]);
        assert_eq!(store.gap_bytes_in_window(&(0x1000..0x2000)), 0x10);
    }
}
