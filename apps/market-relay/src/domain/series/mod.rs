//! Windowed Series Store
//!
//! An in-memory, timestamp-ordered container for any timestamped record
//! (trades, klines). It backs both live roll-forward (`append`) and history
//! catch-up (`prepend`, `patch`), so every mutation preserves one invariant:
//! the sequence is strictly ascending by `ts` with no duplicate timestamps.
//!
//! # Sections
//!
//! - Reads: `first_ts`, `last_ts`, `ts_range`, `latest`, `by_range`, `before`
//! - Trimming: `keep_latest`, `check_and_strip`
//! - Merging: `reset`, `append`, `prepend`, `patch`
//!
//! The store is owned by one caller context. Reads hand out borrowed slices,
//! never the backing vector.

use std::collections::HashSet;

// =============================================================================
// Timed Records
// =============================================================================

/// A record carrying a millisecond timestamp.
pub trait Timed {
    /// Record timestamp (ms). Unique within one store.
    fn ts(&self) -> i64;
}

/// Options for batch merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Sort the incoming batch by `ts` before merging.
    pub sort: bool,
    /// The incoming batch overlaps existing records and replaces them.
    pub duplicated: bool,
}

impl MergeOptions {
    /// Sort the incoming batch.
    #[must_use]
    pub const fn sorted() -> Self {
        Self {
            sort: true,
            duplicated: false,
        }
    }

    /// Let the incoming batch replace the overlapping edge.
    #[must_use]
    pub const fn duplicated() -> Self {
        Self {
            sort: false,
            duplicated: true,
        }
    }

    /// Set the `sort` flag.
    #[must_use]
    pub const fn with_sort(mut self, sort: bool) -> Self {
        self.sort = sort;
        self
    }
}

// =============================================================================
// Series Store
// =============================================================================

/// Strictly ascending, duplicate-free sequence of timed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesStore<T> {
    records: Vec<T>,
}

impl<T> Default for SeriesStore<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<T: Timed> SeriesStore<T> {
    /// Create an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Create a store from a batch, normalizing it first.
    #[must_use]
    pub fn from_records(records: Vec<T>, sort: bool) -> Self {
        Self {
            records: normalize(records, sort),
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, oldest first.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.records
    }

    /// Timestamp of the oldest record.
    #[must_use]
    pub fn first_ts(&self) -> Option<i64> {
        self.records.first().map(Timed::ts)
    }

    /// Timestamp of the newest record.
    #[must_use]
    pub fn last_ts(&self) -> Option<i64> {
        self.records.last().map(Timed::ts)
    }

    /// `(first_ts, last_ts)`.
    #[must_use]
    pub fn ts_range(&self) -> Option<(i64, i64)> {
        Some((self.first_ts()?, self.last_ts()?))
    }

    /// Retain only the newest `count` records.
    pub fn keep_latest(&mut self, count: usize) {
        let len = self.records.len();
        if len > count {
            self.records.drain(..len - count);
        }
    }

    /// Trim to `keep_count` once the length reaches `trigger_count`.
    ///
    /// Returns whether a trim happened.
    pub fn check_and_strip(&mut self, trigger_count: usize, keep_count: usize) -> bool {
        if self.records.len() < trigger_count {
            return false;
        }
        self.keep_latest(keep_count);
        true
    }

    /// The newest `max_count` records.
    #[must_use]
    pub fn latest(&self, max_count: usize) -> &[T] {
        let start = self.records.len().saturating_sub(max_count);
        &self.records[start..]
    }

    /// Records with `from <= ts <= to`; `to = None` is open-ended.
    #[must_use]
    pub fn by_range(&self, from: i64, to: Option<i64>) -> &[T] {
        let start = self.records.partition_point(|r| r.ts() < from);
        let end = to.map_or(self.records.len(), |to| {
            self.records.partition_point(|r| r.ts() <= to)
        });
        if start >= end {
            return &[];
        }
        &self.records[start..end]
    }

    /// Up to `max_count` records strictly before the record whose `ts` equals
    /// `before_ts` exactly.
    ///
    /// Returns `None` when no record has that exact timestamp.
    #[must_use]
    pub fn before(&self, before_ts: i64, max_count: usize) -> Option<&[T]> {
        let index = self
            .records
            .binary_search_by_key(&before_ts, Timed::ts)
            .ok()?;
        let start = index.saturating_sub(max_count);
        Some(&self.records[start..index])
    }

    /// Replace all records.
    pub fn reset(&mut self, records: Vec<T>, sort: bool) {
        self.records = normalize(records, sort);
    }

    /// Merge a batch at the tail.
    ///
    /// With `duplicated`, existing records at or after the batch's first `ts`
    /// are dropped and replaced by the batch. Without it, batch records at or
    /// before the current last `ts` are ignored.
    pub fn append(&mut self, records: Vec<T>, options: MergeOptions) {
        let mut batch = normalize(records, options.sort);
        let Some(first_new) = batch.first().map(Timed::ts) else {
            return;
        };

        if options.duplicated {
            let cut = self.records.partition_point(|r| r.ts() < first_new);
            self.records.truncate(cut);
        } else if let Some(last) = self.last_ts() {
            batch.retain(|r| r.ts() > last);
        }

        self.records.extend(batch);
    }

    /// Merge a batch at the head.
    ///
    /// With `duplicated`, existing records at or before the batch's last `ts`
    /// are dropped and replaced by the batch. Without it, batch records at or
    /// after the current first `ts` are ignored.
    pub fn prepend(&mut self, records: Vec<T>, options: MergeOptions) {
        let mut batch = normalize(records, options.sort);
        let Some(last_new) = batch.last().map(Timed::ts) else {
            return;
        };

        if options.duplicated {
            let cut = self.records.partition_point(|r| r.ts() <= last_new);
            self.records.drain(..cut);
        } else if let Some(first) = self.first_ts() {
            batch.retain(|r| r.ts() < first);
        }

        batch.append(&mut self.records);
        self.records = batch;
    }

    /// Apply out-of-order corrections.
    ///
    /// Existing records sharing a `ts` with the patch are replaced; the result
    /// is re-sorted.
    pub fn patch(&mut self, records: Vec<T>) {
        let batch = normalize(records, true);
        if batch.is_empty() {
            return;
        }

        let patched: HashSet<i64> = batch.iter().map(Timed::ts).collect();
        self.records.retain(|r| !patched.contains(&r.ts()));
        self.records.extend(batch);
        self.records.sort_by_key(Timed::ts);
    }

    /// Consume the store, returning its records.
    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        self.records
    }
}

/// Bring a batch into store order.
///
/// Sorting is stable, so among equal timestamps the later record wins when
/// collapsing. Without sorting, records going backwards in time are dropped.
fn normalize<T: Timed>(mut records: Vec<T>, sort: bool) -> Vec<T> {
    if sort {
        records.sort_by_key(Timed::ts);
    }

    let mut out: Vec<T> = Vec::with_capacity(records.len());
    for record in records {
        match out.last() {
            Some(last) if last.ts() == record.ts() => {
                out.pop();
                out.push(record);
            }
            Some(last) if last.ts() > record.ts() => {}
            _ => out.push(record),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Rec {
        ts: i64,
        tag: &'static str,
    }

    impl Timed for Rec {
        fn ts(&self) -> i64 {
            self.ts
        }
    }

    fn rec(ts: i64) -> Rec {
        Rec { ts, tag: "" }
    }

    fn tagged(ts: i64, tag: &'static str) -> Rec {
        Rec { ts, tag }
    }

    fn store(ts: &[i64]) -> SeriesStore<Rec> {
        SeriesStore::from_records(ts.iter().copied().map(rec).collect(), false)
    }

    fn timestamps(records: &[Rec]) -> Vec<i64> {
        records.iter().map(Timed::ts).collect()
    }

    #[test]
    fn empty_store_has_no_range() {
        let s: SeriesStore<Rec> = SeriesStore::new();
        assert_eq!(s.first_ts(), None);
        assert_eq!(s.last_ts(), None);
        assert_eq!(s.ts_range(), None);
        assert!(s.latest(5).is_empty());
    }

    #[test]
    fn ts_range_reports_bounds() {
        let s = store(&[90, 100, 110]);
        assert_eq!(s.ts_range(), Some((90, 110)));
    }

    #[test]
    fn append_duplicated_replaces_overlapping_tail() {
        let mut s = SeriesStore::from_records(vec![tagged(90, "old"), tagged(100, "old")], false);
        s.append(
            vec![tagged(100, "new"), tagged(110, "new")],
            MergeOptions::duplicated(),
        );
        assert_eq!(
            s.as_slice(),
            &[tagged(90, "old"), tagged(100, "new"), tagged(110, "new")]
        );
    }

    #[test]
    fn append_without_duplicated_ignores_stale_records() {
        let mut s = store(&[90, 100]);
        s.append(vec![rec(95), rec(100), rec(120)], MergeOptions::default());
        assert_eq!(timestamps(s.as_slice()), vec![90, 100, 120]);
    }

    #[test]
    fn append_sorts_when_asked() {
        let mut s = store(&[10]);
        s.append(vec![rec(30), rec(20)], MergeOptions::sorted());
        assert_eq!(timestamps(s.as_slice()), vec![10, 20, 30]);
    }

    #[test]
    fn unsorted_batch_drops_backwards_records() {
        let mut s = SeriesStore::new();
        s.append(vec![rec(30), rec(20), rec(40)], MergeOptions::default());
        assert_eq!(timestamps(s.as_slice()), vec![30, 40]);
    }

    #[test]
    fn prepend_duplicated_replaces_overlapping_head() {
        let mut s = SeriesStore::from_records(vec![tagged(100, "old"), tagged(110, "old")], false);
        s.prepend(
            vec![tagged(90, "new"), tagged(100, "new")],
            MergeOptions::duplicated(),
        );
        assert_eq!(
            s.as_slice(),
            &[tagged(90, "new"), tagged(100, "new"), tagged(110, "old")]
        );
    }

    #[test]
    fn prepend_without_duplicated_keeps_existing_head() {
        let mut s = store(&[100, 110]);
        s.prepend(vec![rec(80), rec(90), rec(100)], MergeOptions::default());
        assert_eq!(timestamps(s.as_slice()), vec![80, 90, 100, 110]);
    }

    #[test]
    fn patch_replaces_and_resorts() {
        let mut s = SeriesStore::from_records(
            vec![tagged(90, "old"), tagged(100, "old"), tagged(120, "old")],
            false,
        );
        s.patch(vec![tagged(110, "new"), tagged(100, "new")]);
        assert_eq!(
            s.as_slice(),
            &[
                tagged(90, "old"),
                tagged(100, "new"),
                tagged(110, "new"),
                tagged(120, "old")
            ]
        );
    }

    #[test]
    fn by_range_is_inclusive() {
        let s = store(&[90, 100, 110, 120]);
        assert_eq!(timestamps(s.by_range(100, Some(110))), vec![100, 110]);
        assert_eq!(timestamps(s.by_range(100, None)), vec![100, 110, 120]);
        assert!(s.by_range(121, None).is_empty());
        assert!(s.by_range(111, Some(100)).is_empty());
    }

    #[test]
    fn before_requires_exact_match() {
        let s = store(&[90, 100, 110, 120]);
        assert_eq!(s.before(110, 5).map(timestamps), Some(vec![90, 100]));
        assert_eq!(s.before(120, 1).map(timestamps), Some(vec![110]));
        assert_eq!(s.before(90, 5).map(timestamps), Some(vec![]));
        assert!(s.before(105, 5).is_none());
    }

    #[test]
    fn latest_returns_tail() {
        let s = store(&[1, 2, 3, 4]);
        assert_eq!(timestamps(s.latest(2)), vec![3, 4]);
        assert_eq!(timestamps(s.latest(10)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn check_and_strip_uses_hysteresis() {
        let mut s = store(&[1, 2, 3, 4]);
        assert!(!s.check_and_strip(5, 2));
        assert_eq!(s.len(), 4);

        s.append(vec![rec(5)], MergeOptions::default());
        assert!(s.check_and_strip(5, 2));
        assert_eq!(timestamps(s.as_slice()), vec![4, 5]);
    }

    #[test]
    fn reset_collapses_duplicates_keeping_later() {
        let mut s = store(&[1]);
        s.reset(vec![tagged(3, "a"), tagged(2, "b"), tagged(3, "c")], true);
        assert_eq!(s.as_slice(), &[tagged(2, "b"), tagged(3, "c")]);
    }
}
