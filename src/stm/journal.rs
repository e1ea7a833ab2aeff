//! The transaction journal and commit protocol.
//!
//! A journal stages one transaction attempt: the first touch of a ref
//! snapshots its committed value and version; later reads and writes stay
//! inside the journal (reads-your-writes). Commit acquires the touched
//! refs' locks in id order (ids are globally allocation-ordered, so no
//! two commits can deadlock), verifies every read version, and either
//! applies all writes and collects the waiters to wake, or reports a
//! conflict without touching anything.

use crate::stm::tref::{StmWakeup, TRefInner};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

#[derive(Clone)]
struct Entry {
    tref: Arc<TRefInner>,
    /// The committed version observed on first touch.
    read_version: u64,
    /// The transaction-local value: the snapshot, or the staged write.
    value: Arc<dyn Any + Send + Sync>,
    written: bool,
}

/// The staged reads and writes of one transaction attempt.
pub(crate) struct Journal {
    entries: HashMap<u64, Entry>,
}

/// A saved journal state, for `or_else` rollback.
pub(crate) struct Snapshot {
    entries: HashMap<u64, Entry>,
}

pub(crate) enum CommitOutcome {
    /// All writes applied; `woken` holds the retry wakeups to fire after
    /// every lock is released.
    Committed { woken: Vec<StmWakeup> },
    /// A touched ref changed since it was read; nothing was applied.
    Conflict,
}

impl Journal {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Reads a ref, snapshotting its committed state on first touch.
    pub(crate) fn read(&mut self, tref: &Arc<TRefInner>) -> Arc<dyn Any + Send + Sync> {
        let entry = self.entries.entry(tref.id).or_insert_with(|| {
            let state = tref.state.lock();
            Entry {
                tref: Arc::clone(tref),
                read_version: state.version,
                value: Arc::clone(&state.value),
                written: false,
            }
        });
        Arc::clone(&entry.value)
    }

    /// Stages a write, snapshotting the ref's version on first touch.
    pub(crate) fn write(&mut self, tref: &Arc<TRefInner>, value: Arc<dyn Any + Send + Sync>) {
        let entry = self.entries.entry(tref.id).or_insert_with(|| {
            let state = tref.state.lock();
            Entry {
                tref: Arc::clone(tref),
                read_version: state.version,
                value: Arc::clone(&state.value),
                written: false,
            }
        });
        entry.value = value;
        entry.written = true;
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            entries: self.entries.clone(),
        }
    }

    pub(crate) fn restore(&mut self, snapshot: Snapshot) {
        self.entries = snapshot.entries;
    }

    /// The refs touched by this attempt with their observed versions,
    /// for retry parking.
    pub(crate) fn watch_list(&self) -> Vec<(Arc<TRefInner>, u64)> {
        self.entries
            .values()
            .map(|entry| (Arc::clone(&entry.tref), entry.read_version))
            .collect()
    }

    /// Attempts to commit this attempt's staged state.
    pub(crate) fn commit(self) -> CommitOutcome {
        let mut entries: Vec<Entry> = self.entries.into_values().collect();
        if entries.is_empty() {
            return CommitOutcome::Committed { woken: Vec::new() };
        }
        entries.sort_by_key(|entry| entry.tref.id);

        // Id order is a global total order, so concurrent commits cannot
        // deadlock against each other.
        let mut guards = Vec::with_capacity(entries.len());
        for entry in &entries {
            guards.push(entry.tref.state.lock());
        }

        for (entry, guard) in entries.iter().zip(&guards) {
            if guard.version != entry.read_version {
                trace!(tref = entry.tref.id, "stm conflict");
                return CommitOutcome::Conflict;
            }
        }

        let mut woken = Vec::new();
        for (entry, guard) in entries.iter().zip(guards.iter_mut()) {
            if entry.written {
                guard.value = Arc::clone(&entry.value);
                guard.version += 1;
                woken.append(&mut guard.waiters);
            }
        }
        CommitOutcome::Committed { woken }
    }
}
