// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Store
//!
//! `BTreeMap`-backed implementation of [`Store`] for development and tests.
//! Subjects and columns keep the lexicographic order the trait promises and
//! `compare_and_set` is atomic under the map's write lock.
//!
//! Data is lost on restart. Production deployments plug a shared backend in
//! behind the same trait.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::domain::record::Timestamp;
use crate::domain::store::{Cell, ColumnFilter, ScannedCell, Store, StoreError, TimeRange};

type Subjects = BTreeMap<String, BTreeMap<String, Cell>>;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    subjects: Arc<RwLock<Subjects>>,
    fail_writes: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Backend`] until
    /// switched off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of cells across all subjects.
    pub fn cell_count(&self) -> usize {
        self.subjects.read().values().map(|cols| cols.len()).sum()
    }

    /// Number of subjects starting with `prefix`.
    pub fn subject_count(&self, prefix: &str) -> usize {
        self.subjects
            .read()
            .keys()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

fn matching_columns<'a>(
    columns: &'a BTreeMap<String, Cell>,
    filter: &'a ColumnFilter,
) -> Box<dyn Iterator<Item = &'a Cell> + 'a> {
    match filter {
        ColumnFilter::Range { start, end } => {
            let lower = match start {
                Bound::Included(s) => Bound::Included(s.as_str()),
                Bound::Excluded(s) => Bound::Excluded(s.as_str()),
                Bound::Unbounded => Bound::Unbounded,
            };
            Box::new(
                columns
                    .range::<str, _>((lower, Bound::Unbounded))
                    .map(|(_, cell)| cell)
                    .take_while(move |cell| match end {
                        Bound::Included(e) => cell.column.as_str() <= e.as_str(),
                        Bound::Excluded(e) => cell.column.as_str() < e.as_str(),
                        Bound::Unbounded => true,
                    }),
            )
        }
        ColumnFilter::Prefix(prefix) => Box::new(
            columns
                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                .map(|(_, cell)| cell)
                .take_while(move |cell| cell.column.starts_with(prefix.as_str())),
        ),
        ColumnFilter::All => Box::new(columns.values()),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, subject: &str, column: &str) -> Result<Option<Cell>, StoreError> {
        let subjects = self.subjects.read();
        Ok(subjects.get(subject).and_then(|cols| cols.get(column)).cloned())
    }

    async fn multi_get(
        &self,
        subject: &str,
        columns: &[String],
    ) -> Result<Vec<Option<Cell>>, StoreError> {
        let subjects = self.subjects.read();
        let cols = subjects.get(subject);
        Ok(columns
            .iter()
            .map(|c| cols.and_then(|cols| cols.get(c)).cloned())
            .collect())
    }

    async fn set(
        &self,
        subject: &str,
        column: &str,
        value: Bytes,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut subjects = self.subjects.write();
        subjects.entry(subject.to_string()).or_default().insert(
            column.to_string(),
            Cell {
                column: column.to_string(),
                value,
                timestamp,
            },
        );
        Ok(())
    }

    async fn multi_set(
        &self,
        subject: &str,
        cells: Vec<(String, Bytes)>,
        timestamp: Timestamp,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut subjects = self.subjects.write();
        let cols = subjects.entry(subject.to_string()).or_default();
        for (column, value) in cells {
            cols.insert(
                column.clone(),
                Cell {
                    column,
                    value,
                    timestamp,
                },
            );
        }
        Ok(())
    }

    async fn compare_and_set(
        &self,
        subject: &str,
        column: &str,
        expected: Option<&Bytes>,
        value: Option<Bytes>,
        timestamp: Timestamp,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut subjects = self.subjects.write();
        let current = subjects
            .get(subject)
            .and_then(|cols| cols.get(column))
            .map(|cell| &cell.value);
        if current != expected {
            return Ok(false);
        }
        match value {
            Some(value) => {
                subjects.entry(subject.to_string()).or_default().insert(
                    column.to_string(),
                    Cell {
                        column: column.to_string(),
                        value,
                        timestamp,
                    },
                );
            }
            None => {
                if let Some(cols) = subjects.get_mut(subject) {
                    cols.remove(column);
                    if cols.is_empty() {
                        subjects.remove(subject);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn scan_range(
        &self,
        subject_prefix: &str,
        columns: &ColumnFilter,
        time_range: TimeRange,
        limit: Option<usize>,
    ) -> Result<Vec<ScannedCell>, StoreError> {
        let subjects = self.subjects.read();
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        let in_prefix = subjects
            .range::<str, _>((Bound::Included(subject_prefix), Bound::Unbounded))
            .take_while(|(subject, _)| subject.starts_with(subject_prefix));

        'subjects: for (subject, cols) in in_prefix {
            for cell in matching_columns(cols, columns) {
                if !time_range.contains(cell.timestamp) {
                    continue;
                }
                if out.len() >= limit {
                    break 'subjects;
                }
                out.push(ScannedCell {
                    subject: subject.clone(),
                    cell: cell.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn delete_attributes(&self, subject: &str, columns: &[String]) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut subjects = self.subjects.write();
        if let Some(cols) = subjects.get_mut(subject) {
            for column in columns {
                cols.remove(column);
            }
            if cols.is_empty() {
                subjects.remove(subject);
            }
        }
        Ok(())
    }

    async fn delete_range(&self, subject: &str, columns: &ColumnFilter) -> Result<usize, StoreError> {
        self.check_writable()?;
        let mut subjects = self.subjects.write();
        let Some(cols) = subjects.get_mut(subject) else {
            return Ok(0);
        };
        let doomed: Vec<String> = matching_columns(cols, columns)
            .map(|cell| cell.column.clone())
            .collect();
        for column in &doomed {
            cols.remove(column);
        }
        if cols.is_empty() {
            subjects.remove(subject);
        }
        Ok(doomed.len())
    }

    async fn delete_subject(&self, subject: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.subjects.write().remove(subject);
        Ok(())
    }
}
