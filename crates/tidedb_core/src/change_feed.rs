//! The change feed: sequence-ordered document change notifications.
//!
//! Three consumption modes share one row shape: `normal` returns the
//! committed backlog and ends, `longpoll` blocks until at least one row
//! exists (or a timeout passes), `continuous` yields a subscription that
//! streams rows as commits land. Commit notifications are delivered over
//! plain mpsc channels; a subscriber that drops its receiver is pruned on
//! the next send.

use crate::error::{EngineError, EngineResult};
use crate::revision::{ChangeEntry, Revision};
use crate::store::RevisionStore;
use crate::types::{Body, RevId, Sequence};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// How a conflicted document is reported in the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeStyle {
    /// One entry per document, winning revision only.
    #[default]
    MainOnly,
    /// One entry per document listing every live leaf, winner first.
    AllDocs,
}

/// Options shared by every feed mode.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Exclusive lower bound; `0` means from the beginning.
    pub since: Sequence,
    /// Maximum number of rows to return or stream.
    pub limit: Option<usize>,
    /// Conflict reporting style.
    pub style: ChangeStyle,
    /// Embed the winning revision's properties in each row.
    pub include_docs: bool,
    /// Named filter to apply; rows failing it are dropped.
    pub filter: Option<String>,
    /// Parameters passed to the filter.
    pub filter_params: Body,
}

/// One row of the change feed.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChangeRow {
    /// Sequence of the document's latest change.
    pub seq: Sequence,
    /// Document ID.
    pub id: String,
    /// Leaf revisions: just the winner, or every live leaf under
    /// [`ChangeStyle::AllDocs`].
    pub changes: Vec<RevId>,
    /// Whether the document currently reads as deleted.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Winning revision's properties, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Body>,
}

/// Result of a `normal` or `longpoll` feed request.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChangesResult {
    /// Rows in ascending sequence order, one per document.
    pub results: Vec<ChangeRow>,
    /// Resume cursor: the highest sequence observed, or the request's
    /// `since` when no rows matched.
    pub last_seq: Sequence,
}

/// Fan-out of committed change entries to live feed subscribers.
pub(crate) struct CommitNotifier {
    subscribers: RwLock<Vec<Sender<ChangeEntry>>>,
}

impl CommitNotifier {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<ChangeEntry> {
        let (tx, rx) = channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends each entry to every subscriber, dropping senders whose
    /// receiver has gone away.
    pub(crate) fn notify(&self, entries: &[ChangeEntry]) {
        if entries.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| {
            entries
                .iter()
                .all(|entry| tx.send(entry.clone()).is_ok())
        });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl RevisionStore {
    /// The `normal` feed: all changes after `since`, then done.
    pub fn changes_since(&self, opts: &ChangesOptions) -> EngineResult<ChangesResult> {
        let entries = self.sequence_log().since(opts.since, None);
        let mut rows = self.build_rows(&entries, opts)?;
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }
        let last_seq = rows.last().map_or(opts.since, |r| r.seq);
        Ok(ChangesResult {
            results: rows,
            last_seq,
        })
    }

    /// The `longpoll` feed: like `normal`, but when the backlog is empty
    /// it blocks until a matching commit lands or `timeout` passes. A
    /// timeout returns an empty result with `last_seq == since`.
    pub fn changes_longpoll(
        &self,
        opts: &ChangesOptions,
        timeout: Duration,
    ) -> EngineResult<ChangesResult> {
        // Subscribe before the backlog scan so a commit in between is
        // observed on the channel rather than missed.
        let rx = self.notifier().subscribe();

        let initial = self.changes_since(opts)?;
        if !initial.results.is_empty() {
            return Ok(initial);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ChangesResult {
                    results: Vec::new(),
                    last_seq: opts.since,
                });
            }
            match rx.recv_timeout(remaining) {
                Ok(entry) if entry.seq > opts.since => {
                    let result = self.changes_since(opts)?;
                    if !result.results.is_empty() {
                        return Ok(result);
                    }
                    // Filtered out; keep waiting.
                }
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return Ok(ChangesResult {
                        results: Vec::new(),
                        last_seq: opts.since,
                    });
                }
            }
        }
    }

    /// The `continuous` feed: catches up past `since`, then streams rows
    /// as commits land. Dropping the subscription cancels it.
    pub fn changes_continuous(
        &self,
        opts: ChangesOptions,
    ) -> EngineResult<ChangesSubscription<'_>> {
        let rx = self.notifier().subscribe();
        let backlog_entries = self.sequence_log().since(opts.since, None);
        let mut backlog: VecDeque<ChangeRow> =
            self.build_rows(&backlog_entries, &opts)?.into();
        if let Some(limit) = opts.limit {
            backlog.truncate(limit);
        }
        let seen = backlog_entries
            .last()
            .map_or(opts.since, |e| e.seq)
            .max(opts.since);

        Ok(ChangesSubscription {
            store: self,
            opts,
            backlog,
            rx,
            seen,
            emitted: 0,
        })
    }

    /// Collapses ascending change entries into per-document rows, ordered
    /// by each document's latest sequence, applying style and filter.
    fn build_rows(
        &self,
        entries: &[ChangeEntry],
        opts: &ChangesOptions,
    ) -> EngineResult<Vec<ChangeRow>> {
        // One row per document keyed by its highest sequence.
        let mut latest: BTreeMap<String, Sequence> = BTreeMap::new();
        for entry in entries {
            let slot = latest.entry(entry.doc_id.clone()).or_insert(entry.seq);
            if entry.seq > *slot {
                *slot = entry.seq;
            }
        }
        let mut ordered: Vec<(Sequence, &str)> = latest
            .iter()
            .map(|(doc_id, seq)| (*seq, doc_id.as_str()))
            .collect();
        ordered.sort_unstable_by_key(|(seq, _)| *seq);

        let filter = self.resolve_filter(opts)?;
        let mut rows = Vec::with_capacity(ordered.len());
        for (seq, doc_id) in ordered {
            // The document may have been purged since the entry landed.
            let Some(winner) = self.winner(doc_id) else {
                continue;
            };
            if let Some(filter) = &filter {
                if !filter(&winner, &opts.filter_params) {
                    continue;
                }
            }
            rows.push(self.make_row(seq, doc_id, &winner, opts));
        }
        Ok(rows)
    }

    fn resolve_filter<'a>(
        &'a self,
        opts: &ChangesOptions,
    ) -> EngineResult<Option<&'a crate::registry::FilterFn>> {
        match &opts.filter {
            None => Ok(None),
            Some(name) => self
                .registries()
                .get_filter(name)
                .map(Some)
                .ok_or_else(|| EngineError::not_found(format!("filter {name:?}"))),
        }
    }

    fn make_row(
        &self,
        seq: Sequence,
        doc_id: &str,
        winner: &Revision,
        opts: &ChangesOptions,
    ) -> ChangeRow {
        let changes = match opts.style {
            ChangeStyle::MainOnly => vec![winner.rev_id.clone()],
            ChangeStyle::AllDocs => self
                .get_all_leaves(doc_id, false)
                .map(|leaves| {
                    if leaves.is_empty() {
                        vec![winner.rev_id.clone()]
                    } else {
                        leaves.into_iter().map(|r| r.rev_id).collect()
                    }
                })
                .unwrap_or_else(|_| vec![winner.rev_id.clone()]),
        };
        let doc = opts.include_docs.then(|| winner.properties());
        ChangeRow {
            seq,
            id: doc_id.to_string(),
            changes,
            deleted: winner.deleted,
            doc,
        }
    }
}

/// A live `continuous` feed. Rows are pulled with
/// [`ChangesSubscription::next_timeout`]; dropping the subscription
/// unsubscribes (the store prunes the channel on its next commit).
pub struct ChangesSubscription<'a> {
    store: &'a RevisionStore,
    opts: ChangesOptions,
    backlog: VecDeque<ChangeRow>,
    rx: Receiver<ChangeEntry>,
    /// Highest sequence already surfaced; live entries at or below it
    /// were covered by the catch-up backlog.
    seen: Sequence,
    emitted: usize,
}

impl ChangesSubscription<'_> {
    /// Returns the next row, waiting up to `timeout` for a commit.
    /// `None` means the wait timed out or the row limit was reached.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ChangeRow> {
        if self
            .opts
            .limit
            .is_some_and(|limit| self.emitted >= limit)
        {
            return None;
        }
        if let Some(row) = self.backlog.pop_front() {
            self.emitted += 1;
            return Some(row);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let entry = match self.rx.recv_timeout(remaining) {
                Ok(entry) => entry,
                Err(_) => return None,
            };
            if entry.seq <= self.seen {
                continue;
            }
            self.seen = entry.seq;
            if let Some(row) = self.row_for(&entry) {
                self.emitted += 1;
                return Some(row);
            }
        }
    }

    fn row_for(&self, entry: &ChangeEntry) -> Option<ChangeRow> {
        // Prefer the revision the entry names; it may already have been
        // superseded, in which case the winner stands in.
        let revision = self
            .store
            .get_revision(&entry.doc_id, Some(&entry.rev_id), &Default::default())
            .ok()
            .or_else(|| self.store.winner(&entry.doc_id))?;
        if let Some(name) = &self.opts.filter {
            let filter = self.store.registries().get_filter(name)?;
            if !filter(&revision, &self.opts.filter_params) {
                return None;
            }
        }
        let changes = match self.opts.style {
            ChangeStyle::MainOnly => vec![entry.rev_id.clone()],
            ChangeStyle::AllDocs => self
                .store
                .get_all_leaves(&entry.doc_id, false)
                .map(|leaves| leaves.into_iter().map(|r| r.rev_id).collect())
                .unwrap_or_else(|_| vec![entry.rev_id.clone()]),
        };
        let doc = self
            .opts
            .include_docs
            .then(|| self.store.winner(&entry.doc_id).map(|w| w.properties()))
            .flatten();
        Some(ChangeRow {
            seq: entry.seq,
            id: entry.doc_id.clone(),
            changes,
            deleted: entry.deleted,
            doc,
        })
    }
}

impl std::fmt::Debug for ChangesSubscription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangesSubscription")
            .field("seen", &self.seen)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl serde::Serialize for ChangeStyle {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::MainOnly => serializer.serialize_str("main_only"),
            Self::AllDocs => serializer.serialize_str("all_docs"),
        }
    }
}

impl ChangeStyle {
    /// Parses the wire name of a style (`main_only` or `all_docs`).
    pub fn parse(s: &str) -> EngineResult<Self> {
        match s {
            "main_only" => Ok(Self::MainOnly),
            "all_docs" => Ok(Self::AllDocs),
            other => Err(EngineError::bad_request(format!(
                "unknown changes style {other:?}"
            ))),
        }
    }
}

/// Serializes a row's revision list the way peers expect:
/// `[{"rev": "..."}]`.
#[must_use]
pub fn changes_field(revs: &[RevId]) -> Value {
    Value::Array(
        revs.iter()
            .map(|r| {
                let mut obj = Body::new();
                obj.insert("rev".into(), Value::String(r.to_string()));
                Value::Object(obj)
            })
            .collect(),
    )
}
