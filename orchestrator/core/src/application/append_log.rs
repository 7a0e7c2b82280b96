// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Append Log
//!
//! An unbounded, append-only sequence of records under one
//! [`CollectionId`], ordered by `(timestamp, suffix)`.
//!
//! Any writer can append without coordinating with other writers: the key is
//! its own wall-clock timestamp plus a random 24-bit suffix. The price is a
//! negligible collision probability and no total order between writers that
//! pick the same microsecond.
//!
//! # Store Layout
//!
//! ```text
//! <collection_id>/Records   <16 hex ts>.<6 hex suffix>   payload
//! ```
//!
//! Side columns (`#lease`, `#claims`) share the key slot and are skipped by
//! plain scans.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::domain::clock::Clock;
use crate::domain::index::INDEX_COLUMN;
use crate::domain::lease::{claims_column, lease_column};
use crate::domain::record::{CollectionId, RecordKey, Timestamp};
use crate::domain::store::{ColumnFilter, Store, StoreError, TimeRange};

/// Cells fetched per store round trip while scanning.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Options for [`AppendLog::scan`].
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Resume strictly after this key.
    pub after: Option<RecordKey>,
    pub max_records: Option<usize>,
    pub time_range: TimeRange,
}

impl ScanOptions {
    pub fn after(key: RecordKey) -> Self {
        Self {
            after: Some(key),
            ..Self::default()
        }
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = Some(max_records);
        self
    }
}

/// Column just past every column of `key`'s slot.
pub(crate) fn slot_end(key: &RecordKey) -> String {
    format!("{}~", key.column())
}

/// Handle to one append log. Cheap to clone; clones share the length cache.
#[derive(Clone)]
pub struct AppendLog {
    id: CollectionId,
    subject: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    page_size: usize,
    cached_len: Arc<Mutex<Option<u64>>>,
}

impl AppendLog {
    pub fn new(id: CollectionId, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let subject = id.records_subject();
        Self {
            id,
            subject,
            store,
            clock,
            page_size: DEFAULT_PAGE_SIZE,
            cached_len: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(4);
        self
    }

    pub fn id(&self) -> &CollectionId {
        &self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Append `value` at the current time with a random suffix.
    pub async fn add(&self, value: Bytes) -> Result<RecordKey, StoreError> {
        self.add_at(value, None, None).await
    }

    /// Append `value`, optionally fixing the timestamp and/or suffix.
    ///
    /// A key collision overwrites the older record and is only logged.
    pub async fn add_at(
        &self,
        value: Bytes,
        timestamp: Option<Timestamp>,
        suffix: Option<u32>,
    ) -> Result<RecordKey, StoreError> {
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());
        let key = match suffix {
            Some(suffix) => RecordKey::new(timestamp, suffix)?,
            None => RecordKey::random(timestamp)?,
        };
        let column = key.column();

        let inserted = self
            .store
            .compare_and_set(&self.subject, &column, None, Some(value.clone()), timestamp)
            .await?;
        if !inserted {
            warn!(
                collection = %self.id,
                key = %key,
                "Record key collision, overwriting existing record"
            );
            self.store.set(&self.subject, &column, value, timestamp).await?;
        }

        self.invalidate_len();
        metrics::counter!("aegis_fleet_log_records_appended_total").increment(1);
        Ok(key)
    }

    /// Append several values in one store round trip.
    ///
    /// The batch occupies consecutive microseconds starting at the current
    /// time, so it scans back in input order.
    pub async fn add_many(&self, values: Vec<Bytes>) -> Result<Vec<RecordKey>, StoreError> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let base = self.clock.now();
        let mut keys = Vec::with_capacity(values.len());
        let mut cells = Vec::with_capacity(values.len());
        for (i, value) in values.into_iter().enumerate() {
            let key = RecordKey::random(Timestamp(base.as_micros() + i as i64))?;
            cells.push((key.column(), value));
            keys.push(key);
        }
        let count = keys.len() as u64;
        self.store.multi_set(&self.subject, cells, base).await?;
        self.invalidate_len();
        metrics::counter!("aegis_fleet_log_records_appended_total").increment(count);
        Ok(keys)
    }

    /// Lazily scan records in ascending key order.
    pub fn scan(&self, options: ScanOptions) -> BoxStream<'static, Result<(RecordKey, Bytes), StoreError>> {
        let cursor = ScanCursor {
            store: self.store.clone(),
            subject: self.subject.clone(),
            start: options
                .after
                .map(|k| Bound::Excluded(slot_end(&k)))
                .unwrap_or(Bound::Unbounded),
            remaining: options.max_records,
            time_range: options.time_range,
            page_size: self.page_size,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(cursor, |mut cursor| async move {
            let next = cursor.next().await?;
            Ok(next.map(|item| (item, cursor)))
        })
        .boxed()
    }

    /// Scan starting at `key` itself rather than after it.
    pub(crate) fn scan_from(
        &self,
        key: RecordKey,
        max_records: Option<usize>,
    ) -> BoxStream<'static, Result<(RecordKey, Bytes), StoreError>> {
        let cursor = ScanCursor {
            store: self.store.clone(),
            subject: self.subject.clone(),
            start: Bound::Included(key.column()),
            remaining: max_records,
            time_range: TimeRange::all(),
            page_size: self.page_size,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        stream::try_unfold(cursor, |mut cursor| async move {
            let next = cursor.next().await?;
            Ok(next.map(|item| (item, cursor)))
        })
        .boxed()
    }

    /// Records written strictly after every record at `timestamp`.
    pub fn scan_after_timestamp(
        &self,
        timestamp: Timestamp,
    ) -> BoxStream<'static, Result<(RecordKey, Bytes), StoreError>> {
        match RecordKey::last_at(timestamp) {
            Some(key) => self.scan(ScanOptions::after(key)),
            None => self.scan(ScanOptions::default()),
        }
    }

    /// Materialize the whole log.
    pub async fn read_all(&self) -> Result<Vec<(RecordKey, Bytes)>, StoreError> {
        self.scan(ScanOptions::default()).try_collect().await
    }

    /// Number of records. Forces a full scan the first time and caches the
    /// count until this handle writes or deletes.
    pub async fn len(&self) -> Result<u64, StoreError> {
        let cached = *self.cached_len.lock();
        if let Some(len) = cached {
            return Ok(len);
        }
        let len = self
            .scan(ScanOptions::default())
            .try_fold(0u64, |n, _| async move { Ok(n + 1) })
            .await?;
        *self.cached_len.lock() = Some(len);
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        let mut head = self.scan(ScanOptions::default().with_max_records(1));
        Ok(head.try_next().await?.is_none())
    }

    /// Point lookups in input order. Missing records come back as `None`.
    pub async fn multi_resolve(&self, keys: &[RecordKey]) -> Result<Vec<Option<Bytes>>, StoreError> {
        let columns: Vec<String> = keys.iter().map(|k| k.column()).collect();
        let cells = self.store.multi_get(&self.subject, &columns).await?;
        Ok(cells.into_iter().map(|c| c.map(|c| c.value)).collect())
    }

    /// Remove the whole collection, records and side data.
    pub async fn delete(&self) -> Result<(), StoreError> {
        self.store.delete_subject(&self.subject).await?;
        self.store.delete_subject(self.id.as_str()).await?;
        self.invalidate_len();
        debug!(collection = %self.id, "Deleted collection");
        Ok(())
    }

    /// Remove named records together with their lease and claim columns.
    ///
    /// Ordinals shift once records disappear, so any persisted sparse index
    /// is dropped along with them.
    pub async fn delete_records(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = keys
            .iter()
            .flat_map(|k| [k.column(), lease_column(k), claims_column(k)])
            .collect();
        self.store.delete_attributes(&self.subject, &columns).await?;
        self.invalidate_len();
        self.drop_index().await
    }

    /// Remove every record with `start <= key <= end`.
    pub async fn delete_range(&self, start: RecordKey, end: RecordKey) -> Result<usize, StoreError> {
        let filter = ColumnFilter::Range {
            start: Bound::Included(start.column()),
            end: Bound::Excluded(slot_end(&end)),
        };
        let removed = self.store.delete_range(&self.subject, &filter).await?;
        self.invalidate_len();
        if removed > 0 {
            self.drop_index().await?;
        }
        Ok(removed)
    }

    /// Forget the persisted sparse index. The next indexed walk rebuilds it.
    pub(crate) async fn drop_index(&self) -> Result<(), StoreError> {
        self.store
            .delete_attributes(self.id.as_str(), &[INDEX_COLUMN.to_string()])
            .await?;
        debug!(collection = %self.id, "Dropped sparse index");
        Ok(())
    }

    fn invalidate_len(&self) {
        *self.cached_len.lock() = None;
    }
}

/// Paging state behind [`AppendLog::scan`].
struct ScanCursor {
    store: Arc<dyn Store>,
    subject: String,
    start: Bound<String>,
    remaining: Option<usize>,
    time_range: TimeRange,
    page_size: usize,
    buffered: VecDeque<(RecordKey, Bytes)>,
    exhausted: bool,
}

impl ScanCursor {
    async fn next(&mut self) -> Result<Option<(RecordKey, Bytes)>, StoreError> {
        loop {
            if self.remaining == Some(0) {
                return Ok(None);
            }
            if let Some(item) = self.buffered.pop_front() {
                if let Some(n) = self.remaining.as_mut() {
                    *n -= 1;
                }
                return Ok(Some(item));
            }
            if self.exhausted {
                return Ok(None);
            }
            self.fetch_page().await?;
        }
    }

    async fn fetch_page(&mut self) -> Result<(), StoreError> {
        let filter = ColumnFilter::Range {
            start: self.start.clone(),
            end: Bound::Unbounded,
        };
        let cells = self
            .store
            .scan_range(&self.subject, &filter, self.time_range, Some(self.page_size))
            .await?;
        if cells.len() < self.page_size {
            self.exhausted = true;
        }

        for scanned in cells {
            // Our subject sorts first among those sharing its prefix.
            if scanned.subject != self.subject {
                self.exhausted = true;
                break;
            }
            let column = scanned.cell.column;
            self.start = Bound::Excluded(column.clone());
            if column.contains('#') {
                continue;
            }
            let key = column.parse::<RecordKey>().map_err(|e| StoreError::Corrupt {
                subject: self.subject.clone(),
                column: column.clone(),
                reason: e.to_string(),
            })?;
            self.buffered.push_back((key, scanned.cell.value));
        }
        Ok(())
    }
}
