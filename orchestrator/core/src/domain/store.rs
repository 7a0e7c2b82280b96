// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Store Adapter Contract
//!
//! The shared key/value store is the only coordination medium between
//! orchestrator processes. Everything in the task-distribution layer talks to
//! it through the [`Store`] trait defined here; backends live in
//! `crate::infrastructure`.
//!
//! The data model is a sorted two-level map:
//!
//! ```text
//! subject (String) ──► column (String) ──► Cell { value, timestamp }
//! ```
//!
//! Subjects and columns are ordered lexicographically. Atomicity is per
//! cell only: [`Store::compare_and_set`] is the strongest primitive and it
//! covers exactly one `(subject, column)` pair.

use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;

use crate::domain::record::{RecordKeyError, Timestamp};

/// One stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: String,
    pub value: Bytes,
    pub timestamp: Timestamp,
}

/// Cell returned by a scan, together with the subject it lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedCell {
    pub subject: String,
    pub cell: Cell,
}

/// Column selection for scans and range deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnFilter {
    All,
    Prefix(String),
    Range {
        start: Bound<String>,
        end: Bound<String>,
    },
}

impl ColumnFilter {
    /// Columns strictly after `column`.
    pub fn after(column: impl Into<String>) -> Self {
        ColumnFilter::Range {
            start: Bound::Excluded(column.into()),
            end: Bound::Unbounded,
        }
    }

    /// Columns at or after `column`.
    pub fn from(column: impl Into<String>) -> Self {
        ColumnFilter::Range {
            start: Bound::Included(column.into()),
            end: Bound::Unbounded,
        }
    }

    pub fn matches(&self, column: &str) -> bool {
        match self {
            ColumnFilter::All => true,
            ColumnFilter::Prefix(prefix) => column.starts_with(prefix.as_str()),
            ColumnFilter::Range { start, end } => {
                let after_start = match start {
                    Bound::Included(s) => column >= s.as_str(),
                    Bound::Excluded(s) => column > s.as_str(),
                    Bound::Unbounded => true,
                };
                let before_end = match end {
                    Bound::Included(e) => column <= e.as_str(),
                    Bound::Excluded(e) => column < e.as_str(),
                    Bound::Unbounded => true,
                };
                after_start && before_end
            }
        }
    }
}

/// Cell-timestamp window: `start` inclusive, `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Corrupt cell {subject}/{column}: {reason}")]
    Corrupt {
        subject: String,
        column: String,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid record key: {0}")]
    InvalidKey(#[from] RecordKeyError),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Sorted key/value store consumed by the task-distribution layer.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single cell.
    async fn get(&self, subject: &str, column: &str) -> Result<Option<Cell>, StoreError>;

    /// Batched point reads; result order matches `columns`.
    async fn multi_get(
        &self,
        subject: &str,
        columns: &[String],
    ) -> Result<Vec<Option<Cell>>, StoreError> {
        let mut out = Vec::with_capacity(columns.len());
        for column in columns {
            out.push(self.get(subject, column).await?);
        }
        Ok(out)
    }

    /// Write a single cell, replacing any previous value.
    async fn set(
        &self,
        subject: &str,
        column: &str,
        value: Bytes,
        timestamp: Timestamp,
    ) -> Result<(), StoreError>;

    /// Write several cells of one subject in a single round trip.
    async fn multi_set(
        &self,
        subject: &str,
        cells: Vec<(String, Bytes)>,
        timestamp: Timestamp,
    ) -> Result<(), StoreError>;

    /// Atomically replace a cell if its current value equals `expected`
    /// (`None` meaning "absent"). A `value` of `None` deletes the cell.
    /// Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        subject: &str,
        column: &str,
        expected: Option<&Bytes>,
        value: Option<Bytes>,
        timestamp: Timestamp,
    ) -> Result<bool, StoreError>;

    /// Cells of every subject starting with `subject_prefix`, ordered by
    /// `(subject, column)`, restricted to `columns` and `time_range`, at most
    /// `limit` cells.
    async fn scan_range(
        &self,
        subject_prefix: &str,
        columns: &ColumnFilter,
        time_range: TimeRange,
        limit: Option<usize>,
    ) -> Result<Vec<ScannedCell>, StoreError>;

    /// Remove named columns of a subject. Missing columns are ignored.
    async fn delete_attributes(&self, subject: &str, columns: &[String]) -> Result<(), StoreError>;

    /// Remove every column of `subject` matched by `columns`; returns the
    /// number of cells removed.
    async fn delete_range(&self, subject: &str, columns: &ColumnFilter) -> Result<usize, StoreError>;

    /// Remove a subject entirely.
    async fn delete_subject(&self, subject: &str) -> Result<(), StoreError>;
}
