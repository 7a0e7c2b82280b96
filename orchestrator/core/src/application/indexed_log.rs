// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Indexed Log
//!
//! An [`AppendLog`] with positional access backed by a [`SparseIndex`].
//!
//! - The persisted index is loaded on the first positional access and never
//!   rebuilt eagerly, so reads near the head of the log stay cheap.
//! - Every positional scan extends the index as it walks past sample
//!   positions whose records are older than the grace period, then persists
//!   the extension with a single write.
//! - [`IndexedLog::calculate_length`] and [`IndexedLog::update_index`] start
//!   at the greatest indexed ordinal, so their cost tracks the unindexed tail.
//!
//! Appends register the log with the [`BackgroundIndexer`] when one is
//! attached.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::application::append_log::{AppendLog, ScanOptions};
use crate::application::background_indexer::BackgroundIndexer;
use crate::domain::config::IndexConfig;
use crate::domain::index::{past_grace, IndexState, PersistedIndex, SparseIndex, INDEX_COLUMN};
use crate::domain::record::{RecordKey, Timestamp};
use crate::domain::store::StoreError;

#[derive(Clone)]
pub struct IndexedLog {
    log: AppendLog,
    state: Arc<Mutex<IndexState>>,
    spacing: u64,
    grace_period: Duration,
    indexer: Option<Arc<BackgroundIndexer>>,
}

impl IndexedLog {
    pub fn new(log: AppendLog, config: &IndexConfig) -> Self {
        Self {
            log,
            state: Arc::new(Mutex::new(IndexState::Absent)),
            spacing: config.spacing.max(1),
            grace_period: config.grace_period,
            indexer: None,
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<BackgroundIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn log(&self) -> &AppendLog {
        &self.log
    }

    pub fn index_state(&self) -> IndexState {
        self.state.lock().clone()
    }

    /// Ordinals currently known to this handle (empty when nothing loaded).
    pub fn index_ordinals(&self) -> Vec<u64> {
        self.state
            .lock()
            .index()
            .map(SparseIndex::ordinals)
            .unwrap_or_default()
    }

    pub async fn add(&self, value: Bytes) -> Result<RecordKey, StoreError> {
        let key = self.log.add(value).await?;
        if let Some(indexer) = &self.indexer {
            indexer.register(self.log.id().clone());
        }
        Ok(key)
    }

    /// Delete records by key; see [`AppendLog::delete_records`].
    pub async fn delete_records(&self, keys: &[RecordKey]) -> Result<(), StoreError> {
        self.log.delete_records(keys).await?;
        *self.state.lock() = IndexState::Absent;
        Ok(())
    }

    /// Delete a key range; see [`AppendLog::delete_range`].
    pub async fn delete_range(&self, start: RecordKey, end: RecordKey) -> Result<usize, StoreError> {
        let removed = self.log.delete_range(start, end).await?;
        *self.state.lock() = IndexState::Absent;
        Ok(removed)
    }

    /// Plain ordered scan; see [`AppendLog::scan`].
    pub fn scan(
        &self,
        options: ScanOptions,
    ) -> BoxStream<'static, Result<(RecordKey, Bytes), StoreError>> {
        self.log.scan(options)
    }

    /// Authoritative record count.
    pub async fn calculate_length(&self) -> Result<u64, StoreError> {
        self.load_index().await?;
        let start = self.max_indexed();
        self.walk(start, None, |_, _, _| true).await
    }

    /// Record at position `i`, or `None` past the end.
    pub async fn get(&self, i: u64) -> Result<Option<Bytes>, StoreError> {
        let mut found = None;
        self.walk(i, Some(1), |_, _, value| {
            found = Some(value);
            false
        })
        .await?;
        Ok(found)
    }

    /// Up to `limit` records starting at position `offset`.
    pub async fn items_from(&self, offset: u64, limit: usize) -> Result<Vec<Bytes>, StoreError> {
        let mut items = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(items);
        }
        self.walk(offset, Some(limit), |_, _, value| {
            items.push(value);
            items.len() < limit
        })
        .await?;
        Ok(items)
    }

    /// Extend the index over the tail of the log; returns how many samples
    /// were added.
    ///
    /// A persisted index longer than the one held here is adopted first.
    pub async fn update_index(&self) -> Result<usize, StoreError> {
        self.adopt_persisted().await?;
        let before = self.index_ordinals().len();
        let start = self.max_indexed();
        self.walk(start, None, |_, _, _| true).await?;
        let after = self.index_ordinals().len();
        Ok(after.saturating_sub(before))
    }

    /// Load the persisted index if this handle has none yet.
    pub async fn load_index(&self) -> Result<(), StoreError> {
        if self.state.lock().is_loaded() {
            return Ok(());
        }
        self.reload_index().await
    }

    async fn reload_index(&self) -> Result<(), StoreError> {
        let loaded = self.read_persisted().await?;
        let mut state = self.state.lock();
        if state.is_loaded() {
            return Ok(());
        }
        *state = match loaded {
            Some((index, built_at)) => IndexState::Stale { index, built_at },
            None => IndexState::Partial(SparseIndex::new(self.spacing)),
        };
        Ok(())
    }

    async fn adopt_persisted(&self) -> Result<(), StoreError> {
        let Some((theirs, built_at)) = self.read_persisted().await? else {
            return self.load_index().await;
        };
        let mut state = self.state.lock();
        let ours = state.index().map(SparseIndex::max_ordinal);
        if ours.map_or(true, |max| theirs.max_ordinal() > max) {
            *state = IndexState::Stale {
                index: theirs,
                built_at,
            };
        }
        Ok(())
    }

    async fn read_persisted(&self) -> Result<Option<(SparseIndex, Timestamp)>, StoreError> {
        let subject = self.log.id().as_str();
        let cell = self.log.store().get(subject, INDEX_COLUMN).await?;
        match cell {
            Some(cell) => {
                let persisted = PersistedIndex::from_bytes(subject, &cell.value)?;
                Ok(Some(persisted.into_index()))
            }
            None => Ok(None),
        }
    }

    fn max_indexed(&self) -> u64 {
        self.state
            .lock()
            .index()
            .map(SparseIndex::max_ordinal)
            .unwrap_or(0)
    }

    /// Where a walk towards `target` can start.
    fn seek(&self, target: u64) -> (u64, RecordKey) {
        match &*self.state.lock() {
            IndexState::Absent => (0, RecordKey::MIN),
            IndexState::Partial(index) | IndexState::Stale { index, .. } => index.floor(target),
        }
    }

    /// Visit records from position `target` onwards until `visit` returns
    /// `false` or `max_records` records were visited. Returns the ordinal
    /// just past the last record read.
    ///
    /// A walk that starts from a sample whose record no longer exists drops
    /// the index and restarts from the head of the log.
    async fn walk<F>(&self, target: u64, max_records: Option<usize>, mut visit: F) -> Result<u64, StoreError>
    where
        F: FnMut(u64, RecordKey, Bytes) -> bool,
    {
        self.load_index().await?;
        let mut restarted = false;
        loop {
            let (mut ordinal, start_key) = self.seek(target);
            let skip = (target - ordinal) as usize;
            let limit = max_records.map(|n| n + skip);

            let mut records = if start_key == RecordKey::MIN {
                self.log.scan(ScanOptions {
                    max_records: limit,
                    ..Default::default()
                })
            } else {
                self.log.scan_from(start_key, limit)
            };

            let now = self.log.clock().now();
            let mut extended = false;
            let mut first = true;
            let mut stale = false;
            while let Some((key, value)) = records.try_next().await? {
                if first && start_key != RecordKey::MIN && key != start_key {
                    stale = true;
                    break;
                }
                first = false;
                extended |= self.maybe_index(ordinal, key, now);
                let keep_going = if ordinal >= target {
                    visit(ordinal, key, value)
                } else {
                    true
                };
                ordinal += 1;
                if !keep_going {
                    break;
                }
            }
            // An emptied tail also means the sampled record is gone.
            stale |= first && start_key != RecordKey::MIN;

            if stale && !restarted {
                warn!(
                    collection = %self.log.id(),
                    sample = %start_key,
                    "Index sample no longer in the log, rebuilding index"
                );
                self.reset_index().await?;
                restarted = true;
                continue;
            }

            if extended {
                self.persist_index(now).await?;
            }
            return Ok(ordinal);
        }
    }

    /// Throw away the index held here and the persisted copy.
    async fn reset_index(&self) -> Result<(), StoreError> {
        *self.state.lock() = IndexState::Partial(SparseIndex::new(self.spacing));
        self.log.drop_index().await
    }

    fn maybe_index(&self, ordinal: u64, key: RecordKey, now: Timestamp) -> bool {
        let mut state = self.state.lock();
        if let Some(index) = state.index() {
            if !index.wants(ordinal) {
                return false;
            }
        }
        if !past_grace(key.timestamp, now, self.grace_period) {
            return false;
        }
        let mut index = match std::mem::replace(&mut *state, IndexState::Absent) {
            IndexState::Partial(index) | IndexState::Stale { index, .. } => index,
            IndexState::Absent => SparseIndex::new(self.spacing),
        };
        let pushed = index.push(ordinal, key);
        *state = IndexState::Partial(index);
        pushed
    }

    async fn persist_index(&self, now: Timestamp) -> Result<(), StoreError> {
        let ours = match self.state.lock().index() {
            Some(index) => index.clone(),
            None => return Ok(()),
        };

        // Another process may have written a longer index meanwhile.
        if let Some((theirs, built_at)) = self.read_persisted().await? {
            if theirs.max_ordinal() > ours.max_ordinal() {
                *self.state.lock() = IndexState::Stale {
                    index: theirs,
                    built_at,
                };
                return Ok(());
            }
        }

        let bytes = ours.to_persisted(now).to_bytes()?;
        self.log
            .store()
            .set(self.log.id().as_str(), INDEX_COLUMN, bytes, now)
            .await?;
        metrics::counter!("aegis_fleet_index_writes_total").increment(1);
        debug!(
            collection = %self.log.id(),
            max_ordinal = ours.max_ordinal(),
            samples = ours.len(),
            "Persisted sparse index"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::record::CollectionId;
    use crate::infrastructure::memory_store::InMemoryStore;
    use crate::domain::store::Store;

    fn config(spacing: u64) -> IndexConfig {
        IndexConfig {
            spacing,
            grace_period: Duration::from_secs(60),
            ..IndexConfig::default()
        }
    }

    fn fixture(spacing: u64) -> (IndexedLog, Arc<InMemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp(10_000_000)));
        let log = AppendLog::new(CollectionId::new("idx"), store.clone(), clock.clone());
        (IndexedLog::new(log, &config(spacing)), store, clock)
    }

    fn n(i: u32) -> Bytes {
        Bytes::from(i.to_string())
    }

    #[tokio::test]
    async fn test_get_at_and_between_boundaries() {
        let (log, _, clock) = fixture(4);
        for i in 0..20 {
            log.add(n(i)).await.unwrap();
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(log.calculate_length().await.unwrap(), 20);
        assert_eq!(log.index_ordinals(), vec![0, 4, 8, 12, 16]);

        for i in 0..20 {
            assert_eq!(log.get(i as u64).await.unwrap(), Some(n(i)), "position {}", i);
        }
        assert_eq!(log.get(20).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_first_access_loads_without_rebuilding() {
        let (log, store, clock) = fixture(4);
        for i in 0..10 {
            log.add(n(i)).await.unwrap();
        }
        assert_eq!(log.index_state(), IndexState::Absent);
        assert_eq!(log.get(0).await.unwrap(), Some(n(0)));
        // Young records: nothing persisted, nothing indexed.
        assert_eq!(log.index_ordinals(), vec![0]);
        assert!(store.get("idx", INDEX_COLUMN).await.unwrap().is_none());

        clock.advance(Duration::from_secs(61));
        assert_eq!(log.update_index().await.unwrap(), 2);
        assert_eq!(log.index_ordinals(), vec![0, 4, 8]);
    }

    #[tokio::test]
    async fn test_items_from_offset() {
        let (log, _, clock) = fixture(3);
        for i in 0..10 {
            log.add(n(i)).await.unwrap();
        }
        clock.advance(Duration::from_secs(61));
        log.update_index().await.unwrap();
        let items = log.items_from(4, 3).await.unwrap();
        assert_eq!(items, vec![n(4), n(5), n(6)]);
        assert!(log.items_from(9, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reload_prefers_longer_persisted_index() {
        let (first, store, clock) = fixture(2);
        for i in 0..9 {
            first.add(n(i)).await.unwrap();
        }
        let second = IndexedLog::new(first.log().clone(), &config(2));
        second.load_index().await.unwrap();

        clock.advance(Duration::from_secs(61));
        first.update_index().await.unwrap();
        assert_eq!(first.index_ordinals(), vec![0, 2, 4, 6, 8]);

        // `second` loaded before the extension; updating adopts it.
        assert_eq!(second.index_ordinals(), vec![0]);
        assert_eq!(second.update_index().await.unwrap(), 0);
        assert_eq!(second.index_ordinals(), vec![0, 2, 4, 6, 8]);
        assert!(matches!(second.index_state(), IndexState::Stale { .. }));
        assert!(store.get("idx", INDEX_COLUMN).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleting_records_drops_the_index() {
        let (log, store, clock) = fixture(4);
        let mut keys = Vec::new();
        for i in 0..12 {
            keys.push(log.add(n(i)).await.unwrap());
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(log.calculate_length().await.unwrap(), 12);
        assert_eq!(log.index_ordinals(), vec![0, 4, 8]);

        log.delete_records(&keys[..1]).await.unwrap();
        assert!(store.get("idx", INDEX_COLUMN).await.unwrap().is_none());

        let reopened = IndexedLog::new(log.log().clone(), &config(4));
        assert_eq!(reopened.calculate_length().await.unwrap(), 11);
        assert_eq!(reopened.get(4).await.unwrap(), Some(n(5)));
        assert_eq!(log.get(4).await.unwrap(), Some(n(5)));
        assert_eq!(log.items_from(8, 10).await.unwrap(), vec![n(9), n(10), n(11)]);
    }

    #[tokio::test]
    async fn test_missing_sample_forces_a_rebuild() {
        let (log, _, clock) = fixture(4);
        let mut keys = Vec::new();
        for i in 0..12 {
            keys.push(log.add(n(i)).await.unwrap());
        }
        clock.advance(Duration::from_secs(61));
        log.update_index().await.unwrap();
        assert_eq!(log.index_ordinals(), vec![0, 4, 8]);

        // Another handle removes the record sampled at ordinal 8.
        let other = IndexedLog::new(log.log().clone(), &config(4));
        other.delete_range(keys[8], keys[8]).await.unwrap();

        assert_eq!(log.get(8).await.unwrap(), Some(n(9)));
        assert_eq!(log.calculate_length().await.unwrap(), 11);
        assert_eq!(log.index_ordinals(), vec![0, 4, 8]);
        assert_eq!(log.get(10).await.unwrap(), Some(n(11)));
        assert_eq!(log.get(11).await.unwrap(), None);
    }
}
