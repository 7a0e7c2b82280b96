// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Sparse Index
//!
//! Ordinal → key samples over an append log, taken every `spacing` records.
//! Positional reads start from the closest sample at or below the wanted
//! ordinal instead of from the head of the log.
//!
//! The index is advisory. A missing, stale or half-written index only costs
//! a longer scan; it never changes what a read returns.
//!
//! Entries are only added for records older than the grace period: records
//! carry writer wall-clock timestamps, so a young tail may still receive
//! records that sort before it.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::domain::record::{RecordKey, Timestamp};
use crate::domain::store::StoreError;

/// Column on the collection subject that holds the persisted index.
pub const INDEX_COLUMN: &str = "index:sparse";

pub const DEFAULT_INDEX_SPACING: u64 = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseIndex {
    spacing: u64,
    entries: BTreeMap<u64, RecordKey>,
}

impl SparseIndex {
    /// Empty index. Ordinal 0 always maps to [`RecordKey::MIN`], the head of
    /// the log.
    pub fn new(spacing: u64) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(0, RecordKey::MIN);
        Self {
            spacing: spacing.max(1),
            entries,
        }
    }

    pub fn spacing(&self) -> u64 {
        self.spacing
    }

    pub fn max_ordinal(&self) -> u64 {
        self.entries.keys().next_back().copied().unwrap_or(0)
    }

    pub fn ordinals(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() <= 1
    }

    pub fn get(&self, ordinal: u64) -> Option<RecordKey> {
        self.entries.get(&ordinal).copied()
    }

    /// Greatest sample at or below `ordinal`.
    pub fn floor(&self, ordinal: u64) -> (u64, RecordKey) {
        self.entries
            .range(..=ordinal)
            .next_back()
            .map(|(o, k)| (*o, *k))
            .unwrap_or((0, RecordKey::MIN))
    }

    /// Whether `ordinal` is the next sample position this index would accept.
    pub fn wants(&self, ordinal: u64) -> bool {
        ordinal > self.max_ordinal() && ordinal % self.spacing == 0
    }

    /// Append a sample. Rejects anything that would break the strictly
    /// increasing ordinal/key invariant.
    pub fn push(&mut self, ordinal: u64, key: RecordKey) -> bool {
        if !self.wants(ordinal) {
            return false;
        }
        let (_, last_key) = self.floor(ordinal);
        if key <= last_key {
            return false;
        }
        self.entries.insert(ordinal, key);
        true
    }

    pub fn to_persisted(&self, built_at: Timestamp) -> PersistedIndex {
        PersistedIndex {
            built_at: built_at.as_micros(),
            spacing: self.spacing,
            entries: self
                .entries
                .iter()
                .map(|(o, k)| (*o, k.column()))
                .collect(),
        }
    }
}

/// Whether a record written at `record_ts` is old enough to be indexed.
pub fn past_grace(record_ts: Timestamp, now: Timestamp, grace_period: Duration) -> bool {
    record_ts < now.minus(grace_period)
}

/// What a log handle knows about its index.
///
/// Matching on this decides whether a positional read can seek or has to
/// scan from the head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    /// Nothing loaded yet.
    Absent,
    /// Built or extended by this handle.
    Partial(SparseIndex),
    /// Loaded from the store as written at `built_at`; another process may
    /// have extended it since.
    Stale {
        index: SparseIndex,
        built_at: Timestamp,
    },
}

impl IndexState {
    pub fn index(&self) -> Option<&SparseIndex> {
        match self {
            IndexState::Absent => None,
            IndexState::Partial(index) | IndexState::Stale { index, .. } => Some(index),
        }
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, IndexState::Absent)
    }
}

/// Wire form of the index column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub built_at: i64,
    pub spacing: u64,
    pub entries: BTreeMap<u64, String>,
}

impl PersistedIndex {
    pub fn to_bytes(&self) -> Result<Bytes, StoreError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(subject: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            subject: subject.to_string(),
            column: INDEX_COLUMN.to_string(),
            reason: e.to_string(),
        })
    }

    /// Rebuild the in-memory index. Entries that do not parse or break the
    /// ordering invariant are dropped along with everything after them.
    pub fn into_index(self) -> (SparseIndex, Timestamp) {
        let mut index = SparseIndex::new(self.spacing);
        for (ordinal, key) in self.entries {
            if ordinal == 0 {
                continue;
            }
            match key.parse::<RecordKey>() {
                Ok(key) if index.push(ordinal, key) => {}
                _ => break,
            }
        }
        (index, Timestamp(self.built_at))
    }
}
