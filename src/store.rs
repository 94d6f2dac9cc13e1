//! In-memory correlation state: outstanding requests and consumed assertions.
//!
//! Both stores lock per key, so unrelated ids never contend. Expiry is checked
//! on every lookup; sweeping only bounds memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::{mapref::entry::Entry, DashMap};
use time::OffsetDateTime;

const SWEEP_INTERVAL: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRequestKind {
    Authn,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequestRecord {
    pub id: String,
    pub kind: PendingRequestKind,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    /// Where to send the user once the flow completes.
    pub return_url: Option<String>,
    pub relay_state: Option<String>,
}

impl PendingRequestRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Requests sent to the IdP that are still waiting for an answer.
#[derive(Debug, Default)]
pub struct PendingRequestStore {
    records: DashMap<String, PendingRequestRecord>,
    inserts: AtomicUsize,
}

impl PendingRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a record with the same id already exists.
    pub fn insert(&self, record: PendingRequestRecord) -> bool {
        let now = record.created_at;
        let inserted = match self.records.entry(record.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        };
        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }
        inserted
    }

    /// Removes and returns the record, at most once per id.
    ///
    /// A record of another kind is left in place; an expired one is dropped.
    pub fn consume(
        &self,
        id: &str,
        kind: PendingRequestKind,
        now: OffsetDateTime,
    ) -> Option<PendingRequestRecord> {
        let (_, record) = self.records.remove_if(id, |_, record| record.kind == kind)?;
        if record.is_expired(now) {
            tracing::debug!(request_id = %id, "pending request expired");
            return None;
        }
        Some(record)
    }

    pub fn contains(&self, id: &str, now: OffsetDateTime) -> bool {
        self.records
            .get(id)
            .is_some_and(|record| !record.is_expired(now))
    }

    /// Drops expired records, returning how many were removed.
    pub fn sweep(&self, now: OffsetDateTime) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            tracing::debug!(removed, "swept expired pending requests");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Assertion ids already accepted, remembered until they could no longer
/// pass the conditions check anyway.
#[derive(Debug, Default)]
pub struct ReplayCache {
    entries: DashMap<String, OffsetDateTime>,
    inserts: AtomicUsize,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as consumed. Returns `false` if it was already consumed
    /// and that entry has not expired.
    pub fn check_and_insert(
        &self,
        id: &str,
        expires_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> bool {
        let fresh = match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(expires_at);
                    true
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        };
        if fresh
            && self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1
        {
            self.sweep(now);
        }
        fresh
    }

    pub fn contains(&self, id: &str, now: OffsetDateTime) -> bool {
        self.entries.get(id).is_some_and(|expires_at| *expires_at > now)
    }

    pub fn sweep(&self, now: OffsetDateTime) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
