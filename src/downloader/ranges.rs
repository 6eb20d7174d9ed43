//! Disjoint byte-range bookkeeping for download tasks
//!
//! A [`RangeMap`] is a sorted map of `offset → length` whose entries never
//! overlap and never touch (adjacent ranges coalesce on insert). Tasks keep
//! one map of wanted bytes, one of downloaded bytes, and per-peer maps of
//! advertised and in-flight ranges.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sorted map of disjoint, non-adjacent byte ranges
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeMap {
    ranges: BTreeMap<u64, u64>,
}

impl RangeMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a map holding one range
    pub fn with_range(offset: u64, length: u64) -> Self {
        let mut map = Self::new();
        map.insert(offset, length);
        map
    }

    /// True when no bytes are held
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total bytes covered
    pub fn total(&self) -> u64 {
        self.ranges.values().sum()
    }

    /// Iterate ranges in ascending offset order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&o, &l)| (o, l))
    }

    /// The lowest range, if any
    pub fn first(&self) -> Option<(u64, u64)> {
        self.ranges.iter().next().map(|(&o, &l)| (o, l))
    }

    /// Whether the byte at `offset` is covered
    pub fn contains(&self, offset: u64) -> bool {
        self.ranges
            .range(..=offset)
            .next_back()
            .is_some_and(|(&s, &l)| offset < s + l)
    }

    /// Whether `[offset, offset+length)` is fully covered by one range
    pub fn covers(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return true;
        }
        self.ranges
            .range(..=offset)
            .next_back()
            .is_some_and(|(&s, &l)| offset >= s && offset + length <= s + l)
    }

    /// Union a range into the map, coalescing with neighbours
    ///
    /// Returns true when the map grew (some byte was newly covered).
    pub fn insert(&mut self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let mut start = offset;
        let mut end = offset + length;

        if self.covers(offset, length) {
            return false;
        }

        // merge a left neighbour that overlaps or touches the new range
        if let Some((&s, &l)) = self.ranges.range(..=offset).next_back()
            && s + l >= offset
        {
            start = s;
            end = end.max(s + l);
        }

        // swallow every range starting inside (or right at the end of) the
        // merged span
        let overlapping: Vec<u64> = self
            .ranges
            .range(start..=end)
            .map(|(&s, _)| s)
            .collect();
        for s in overlapping {
            if let Some(l) = self.ranges.remove(&s) {
                end = end.max(s + l);
            }
        }

        self.ranges.insert(start, end - start);
        true
    }

    /// Subtract a range from the map
    ///
    /// Returns true when any byte was removed; partially-overlapping entries
    /// are split.
    pub fn remove(&mut self, offset: u64, length: u64) -> bool {
        if length == 0 || self.ranges.is_empty() {
            return false;
        }
        let end = offset + length;

        // disjoint + sorted: walking down from `end`, the first range that
        // ends at or before `offset` terminates the scan
        let affected: Vec<(u64, u64)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(&s, &l)| s + l > offset)
            .map(|(&s, &l)| (s, l))
            .collect();
        if affected.is_empty() {
            return false;
        }

        for (s, _) in &affected {
            self.ranges.remove(s);
        }

        // left remainder of the lowest affected range
        let (low_s, _) = affected[affected.len() - 1];
        if low_s < offset {
            self.ranges.insert(low_s, offset - low_s);
        }
        // right remainder of the highest affected range
        let (high_s, high_l) = affected[0];
        if high_s + high_l > end {
            self.ranges.insert(end, high_s + high_l - end);
        }
        true
    }

    /// Subtract every range of `other` from this map
    pub fn subtract(&mut self, other: &RangeMap) {
        for (offset, length) in other.iter() {
            self.remove(offset, length);
        }
    }

    /// Union every range of `other` into this map; returns true if it grew
    pub fn merge(&mut self, other: &RangeMap) -> bool {
        let mut grew = false;
        for (offset, length) in other.iter() {
            grew |= self.insert(offset, length);
        }
        grew
    }
}

impl FromIterator<(u64, u64)> for RangeMap {
    fn from_iter<I: IntoIterator<Item = (u64, u64)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (offset, length) in iter {
            map.insert(offset, length);
        }
        map
    }
}
