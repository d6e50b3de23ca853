//! Interval deduplication index
//!
//! Maps interval external ids to internal ids within one assembly. The
//! index is preloaded with the assembly's existing intervals and grows as
//! the import creates new ones, so repeated ids inside a single file also
//! collapse onto the first row.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DedupIndex {
    existing: HashMap<String, i64>,
    imported: HashMap<String, i64>,
    deduplicate: bool,
}

impl DedupIndex {
    /// Build from `(external_id, id)` pairs in id order; the earliest id wins
    pub fn new(existing: impl IntoIterator<Item = (String, i64)>, deduplicate: bool) -> Self {
        let mut ids = HashMap::new();
        for (external_id, id) in existing {
            ids.entry(external_id).or_insert(id);
        }
        Self {
            existing: ids,
            imported: HashMap::new(),
            deduplicate,
        }
    }

    /// Interval to reuse for `external_id`.
    ///
    /// Always `None` with deduplication disabled, so every row creates a new interval.
    pub fn resolve(&self, external_id: &str) -> Option<i64> {
        if self.deduplicate {
            self.lookup(external_id)
        } else {
            None
        }
    }

    /// Register an interval created by this import; the first one per id is kept
    pub fn record(&mut self, external_id: &str, id: i64) {
        if !self.imported.contains_key(external_id) {
            self.imported.insert(external_id.to_string(), id);
        }
    }

    /// Interval named by a signal row's `interval_external_id`.
    ///
    /// Works regardless of the dedup setting; this import's intervals shadow older ones.
    pub fn lookup(&self, external_id: &str) -> Option<i64> {
        self.imported
            .get(external_id)
            .or_else(|| self.existing.get(external_id))
            .copied()
    }

    /// Distinct external ids known to the index
    pub fn len(&self) -> usize {
        self.existing.len()
            + self
                .imported
                .keys()
                .filter(|k| !self.existing.contains_key(*k))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.existing.is_empty() && self.imported.is_empty()
    }
}
