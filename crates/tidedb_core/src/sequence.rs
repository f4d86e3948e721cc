//! Sequence log: commit ordering for the whole store.

use crate::revision::ChangeEntry;
use crate::types::Sequence;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Assigns a monotonically increasing sequence to every committed revision
/// and maintains the by-sequence index of *current* leaf revisions.
///
/// When a committed revision supersedes its parent leaf, the parent's
/// index entry is removed, so a scan of the index yields each document's
/// live leaves exactly once, in commit order. This is the backbone of the
/// change feed and of view checkpoints.
///
/// The counter only advances at commit: writers stage sequence values
/// starting at `last_sequence() + 1` and publish them through
/// [`SequenceLog::commit`] once the storage transaction succeeds, so an
/// aborted batch leaves the counter untouched.
#[derive(Debug, Default)]
pub struct SequenceLog {
    last: AtomicU64,
    by_seq: RwLock<BTreeMap<u64, ChangeEntry>>,
}

impl SequenceLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restores a log from recovered state.
    #[must_use]
    pub fn with_state(last: Sequence, entries: Vec<ChangeEntry>) -> Self {
        let by_seq = entries
            .into_iter()
            .map(|e| (e.seq.as_u64(), e))
            .collect();
        Self {
            last: AtomicU64::new(last.as_u64()),
            by_seq: RwLock::new(by_seq),
        }
    }

    /// The highest committed sequence (0 before any commit).
    #[must_use]
    pub fn last_sequence(&self) -> Sequence {
        Sequence::new(self.last.load(Ordering::SeqCst))
    }

    /// Publishes a committed batch.
    ///
    /// `superseded` are sequences of parent leaves replaced by this batch;
    /// their index entries are dropped. The counter advances to the
    /// highest sequence in `entries`.
    pub fn commit(&self, entries: Vec<ChangeEntry>, superseded: Vec<Sequence>) {
        let mut by_seq = self.by_seq.write();
        for seq in superseded {
            by_seq.remove(&seq.as_u64());
        }
        let mut max = self.last.load(Ordering::SeqCst);
        for entry in entries {
            max = max.max(entry.seq.as_u64());
            by_seq.insert(entry.seq.as_u64(), entry);
        }
        self.last.store(max, Ordering::SeqCst);
    }

    /// Drops every index entry for `doc_id` (document purge).
    pub fn remove_doc(&self, doc_id: &str) {
        self.by_seq.write().retain(|_, e| e.doc_id != doc_id);
    }

    /// Current leaf entries with sequence strictly greater than `since`,
    /// ascending, up to `limit` when given.
    #[must_use]
    pub fn since(&self, since: Sequence, limit: Option<usize>) -> Vec<ChangeEntry> {
        let by_seq = self.by_seq.read();
        let iter = by_seq
            .range(since.as_u64() + 1..)
            .map(|(_, e)| e.clone());
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    /// Snapshot of every current index entry, ascending.
    #[must_use]
    pub fn all(&self) -> Vec<ChangeEntry> {
        self.since(Sequence::new(0), None)
    }

    /// Number of current index entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_seq.read().len()
    }

    /// Returns true if no revision has ever been indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_seq.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RevId;

    fn entry(seq: u64, doc: &str, rev: &str, deleted: bool) -> ChangeEntry {
        ChangeEntry {
            seq: Sequence::new(seq),
            doc_id: doc.to_string(),
            rev_id: RevId::parse(rev).unwrap(),
            deleted,
        }
    }

    #[test]
    fn commit_advances_counter() {
        let log = SequenceLog::new();
        assert_eq!(log.last_sequence().as_u64(), 0);

        log.commit(vec![entry(1, "a", "1-x", false)], vec![]);
        assert_eq!(log.last_sequence().as_u64(), 1);

        log.commit(
            vec![entry(2, "b", "1-y", false), entry(3, "c", "1-z", false)],
            vec![],
        );
        assert_eq!(log.last_sequence().as_u64(), 3);
    }

    #[test]
    fn superseded_entries_are_dropped() {
        let log = SequenceLog::new();
        log.commit(vec![entry(1, "a", "1-x", false)], vec![]);
        log.commit(
            vec![entry(2, "a", "2-y", false)],
            vec![Sequence::new(1)],
        );

        let entries = log.since(Sequence::new(0), None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seq.as_u64(), 2);
        assert_eq!(entries[0].rev_id, RevId::parse("2-y").unwrap());
    }

    #[test]
    fn since_is_exclusive_and_ordered() {
        let log = SequenceLog::new();
        for i in 1..=5 {
            log.commit(vec![entry(i, &format!("d{i}"), "1-a", false)], vec![]);
        }

        let entries = log.since(Sequence::new(2), None);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq.as_u64()).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn since_respects_limit() {
        let log = SequenceLog::new();
        for i in 1..=10 {
            log.commit(vec![entry(i, &format!("d{i}"), "1-a", false)], vec![]);
        }
        assert_eq!(log.since(Sequence::new(0), Some(4)).len(), 4);
    }

    #[test]
    fn remove_doc_clears_index() {
        let log = SequenceLog::new();
        log.commit(vec![entry(1, "a", "1-x", false)], vec![]);
        log.commit(vec![entry(2, "b", "1-y", false)], vec![]);

        log.remove_doc("a");
        let entries = log.all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].doc_id, "b");
        // Purge never rewinds the counter.
        assert_eq!(log.last_sequence().as_u64(), 2);
    }

    #[test]
    fn with_state_restores() {
        let log = SequenceLog::with_state(
            Sequence::new(7),
            vec![entry(5, "a", "2-x", false), entry(7, "b", "1-y", true)],
        );
        assert_eq!(log.last_sequence().as_u64(), 7);
        assert_eq!(log.len(), 2);
    }
}
