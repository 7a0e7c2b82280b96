// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lease Queue
//!
//! Competing-consumer queue over an [`AppendLog`]. Any number of processes
//! may claim from the same collection: a claim stamps `now + lease` on the
//! record's lease column with a single-cell compare-and-set, so exactly one
//! claimant wins each record and losers silently move on.
//!
//! Delivery is at-least-once. A claimant that dies leaves its records
//! leased until expiry, after which they are handed out again. Records that
//! keep coming back are tracked with a claim counter and handled per
//! [`PoisonPolicy`].

use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use tracing::{debug, warn};

use crate::application::append_log::{AppendLog, ScanOptions};
use crate::domain::config::{PoisonPolicy, QueueConfig};
use crate::domain::events::QueueEvent;
use crate::domain::lease::{
    claims_column, decode_claims, decode_expiry, encode_claims, encode_expiry, lease_column,
    ClaimOptions, ClaimedRecord, LockError, RecordId,
};
use crate::domain::record::{CollectionId, RecordKey, Timestamp};
use crate::domain::store::StoreError;
use crate::infrastructure::event_bus::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl QueueError {
    /// Whether the error only means the caller lost a lease.
    pub fn is_lock(&self) -> bool {
        matches!(self, QueueError::Lock(_))
    }
}

#[derive(Clone)]
pub struct LeaseQueue {
    log: AppendLog,
    config: QueueConfig,
    event_bus: Option<EventBus>,
}

impl LeaseQueue {
    pub fn new(log: AppendLog, config: QueueConfig) -> Self {
        let log = log.with_page_size(config.page_size);
        Self {
            log,
            config,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn log(&self) -> &AppendLog {
        &self.log
    }

    pub fn id(&self) -> &CollectionId {
        self.log.id()
    }

    /// Claim options seeded from this queue's configuration.
    pub fn claim_options(&self) -> ClaimOptions {
        ClaimOptions::default()
            .with_lease(self.config.default_lease)
            .with_limit(self.config.claim_limit)
            .with_max_filtered(self.config.max_filtered)
    }

    pub async fn add(&self, value: Bytes) -> Result<RecordKey, QueueError> {
        Ok(self.log.add(value).await?)
    }

    pub async fn add_many(&self, values: Vec<Bytes>) -> Result<Vec<RecordKey>, QueueError> {
        Ok(self.log.add_many(values).await?)
    }

    /// Claim up to `options.limit` unleased records in key order.
    pub async fn claim_records(&self, options: ClaimOptions) -> Result<Vec<ClaimedRecord>, QueueError> {
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut claimed = Vec::new();
        if limit == 0 {
            return Ok(claimed);
        }

        let clock = self.log.clock().clone();
        let scan_options = match options
            .start_time
            .and_then(|start| RecordKey::last_at(Timestamp(start.as_micros().saturating_sub(1))))
        {
            Some(before_start) => ScanOptions::after(before_start),
            None => ScanOptions::default(),
        };
        let mut pages = self
            .log
            .scan(scan_options)
            .try_chunks(self.config.page_size.max(1))
            .map_err(|e| e.1);

        let mut filtered = 0usize;
        let mut lost = 0usize;
        'scan: while let Some(page) = pages.try_next().await? {
            let side_columns: Vec<String> = page
                .iter()
                .flat_map(|(key, _)| [lease_column(key), claims_column(key)])
                .collect();
            let side = self
                .log
                .store()
                .multi_get(self.log.subject(), &side_columns)
                .await?;

            if side.len() != side_columns.len() {
                return Err(StoreError::Backend(format!(
                    "multi_get on {} returned {} cells for {} columns",
                    self.log.subject(),
                    side.len(),
                    side_columns.len()
                ))
                .into());
            }

            for ((key, value), cells) in page.into_iter().zip(side.chunks_exact(2)) {
                let lease_cell = cells[0].as_ref().map(|c| c.value.clone());
                let claims = cells[1]
                    .as_ref()
                    .map(|c| decode_claims(&c.value))
                    .unwrap_or(0);

                let now = clock.now();
                let leased = lease_cell
                    .as_deref()
                    .and_then(decode_expiry)
                    .map_or(false, |expiry| expiry > now);
                if leased {
                    continue;
                }
                if self.parked(&key, claims) {
                    continue;
                }
                if let Some(filter) = &options.filter {
                    if !filter(&key, &value) {
                        filtered += 1;
                        if filtered >= options.max_filtered {
                            debug!(
                                collection = %self.id(),
                                filtered,
                                "Claim scan stopped after too many filtered records"
                            );
                            break 'scan;
                        }
                        continue;
                    }
                }

                let expiry = now.plus(options.lease);
                let won = self
                    .log
                    .store()
                    .compare_and_set(
                        self.log.subject(),
                        &lease_column(&key),
                        lease_cell.as_ref(),
                        Some(encode_expiry(expiry)),
                        now,
                    )
                    .await?;
                if !won {
                    lost += 1;
                    continue;
                }

                let claim_count = claims.saturating_add(1);
                self.log
                    .store()
                    .set(
                        self.log.subject(),
                        &claims_column(&key),
                        encode_claims(claim_count),
                        now,
                    )
                    .await?;
                self.check_poison(&key, claim_count);

                claimed.push(ClaimedRecord {
                    id: RecordId {
                        key,
                        lease_expiry: expiry,
                    },
                    value,
                    claim_count,
                });
                if claimed.len() >= limit {
                    break 'scan;
                }
            }
        }

        metrics::counter!("aegis_fleet_queue_claims_total").increment(claimed.len() as u64);
        if lost > 0 {
            metrics::counter!("aegis_fleet_queue_claims_lost_total").increment(lost as u64);
        }
        debug!(
            collection = %self.id(),
            claimed = claimed.len(),
            lost,
            filtered,
            "Claimed records"
        );
        Ok(claimed)
    }

    /// Extend held leases by `lease` from now. Fails on the first lease that
    /// is no longer ours; leases before it stay extended.
    pub async fn refresh_claims(&self, ids: &[RecordId], lease: Duration) -> Result<Vec<RecordId>, QueueError> {
        let mut refreshed = Vec::with_capacity(ids.len());
        for id in ids {
            let now = self.log.clock().now();
            if id.lease_expiry <= now {
                return Err(LockError::Expired {
                    key: id.key,
                    expired_at: id.lease_expiry,
                }
                .into());
            }
            let expiry = now.plus(lease);
            let current = encode_expiry(id.lease_expiry);
            let swapped = self
                .log
                .store()
                .compare_and_set(
                    self.log.subject(),
                    &lease_column(&id.key),
                    Some(&current),
                    Some(encode_expiry(expiry)),
                    now,
                )
                .await?;
            if !swapped {
                return Err(self.lost_lease(id).await?.into());
            }
            refreshed.push(RecordId {
                key: id.key,
                lease_expiry: expiry,
            });
        }
        Ok(refreshed)
    }

    /// Drop leases so the records can be claimed again right away.
    pub async fn release_records(&self, ids: &[RecordId]) -> Result<(), QueueError> {
        for id in ids {
            self.verify(id).await?;
            let current = encode_expiry(id.lease_expiry);
            let released = self
                .log
                .store()
                .compare_and_set(
                    self.log.subject(),
                    &lease_column(&id.key),
                    Some(&current),
                    None,
                    self.log.clock().now(),
                )
                .await?;
            if !released {
                return Err(self.lost_lease(id).await?.into());
            }
        }
        metrics::counter!("aegis_fleet_queue_releases_total").increment(ids.len() as u64);
        Ok(())
    }

    /// Remove leased records for good.
    pub async fn delete_records(&self, ids: &[RecordId]) -> Result<(), QueueError> {
        for id in ids {
            self.verify(id).await?;
        }
        let keys: Vec<RecordKey> = ids.iter().map(|id| id.key).collect();
        self.log.delete_records(&keys).await?;
        metrics::counter!("aegis_fleet_queue_deletes_total").increment(ids.len() as u64);
        Ok(())
    }

    /// Overwrite the payload of a record we hold the lease on.
    pub async fn replace_record(&self, id: &RecordId, value: Bytes) -> Result<(), QueueError> {
        self.verify(id).await?;
        let now = self.log.clock().now();
        self.log
            .store()
            .set(self.log.subject(), &id.key.column(), value, now)
            .await?;
        Ok(())
    }

    /// Current lease expiry on `key`, if any lease was ever written and not
    /// released.
    pub async fn lease_of(&self, key: &RecordKey) -> Result<Option<Timestamp>, QueueError> {
        let cell = self
            .log
            .store()
            .get(self.log.subject(), &lease_column(key))
            .await?;
        Ok(cell.and_then(|c| decode_expiry(&c.value)))
    }

    pub async fn claim_count(&self, key: &RecordKey) -> Result<u32, QueueError> {
        let cell = self
            .log
            .store()
            .get(self.log.subject(), &claims_column(key))
            .await?;
        Ok(cell.map(|c| decode_claims(&c.value)).unwrap_or(0))
    }

    /// Check that `id` still names a live lease we wrote.
    pub async fn verify(&self, id: &RecordId) -> Result<(), QueueError> {
        match self.lease_of(&id.key).await? {
            None => Err(LockError::NotHeld { key: id.key }.into()),
            Some(expiry) if expiry != id.lease_expiry => Err(LockError::Stolen { key: id.key }.into()),
            Some(expiry) if expiry <= self.log.clock().now() => Err(LockError::Expired {
                key: id.key,
                expired_at: expiry,
            }
            .into()),
            Some(_) => Ok(()),
        }
    }

    async fn lost_lease(&self, id: &RecordId) -> Result<LockError, QueueError> {
        Ok(match self.lease_of(&id.key).await? {
            None => LockError::NotHeld { key: id.key },
            Some(_) => LockError::Stolen { key: id.key },
        })
    }

    fn parked(&self, key: &RecordKey, claims: u32) -> bool {
        match self.config.poison.max_claims {
            Some(max) if claims >= max => {
                debug!(collection = %self.id(), key = %key, claims, "Skipping parked record");
                true
            }
            _ => false,
        }
    }

    fn check_poison(&self, key: &RecordKey, claim_count: u32) {
        let PoisonPolicy {
            warn_after_claims,
            max_claims,
        } = &self.config.poison;
        if claim_count <= *warn_after_claims {
            return;
        }
        warn!(
            collection = %self.id(),
            key = %key,
            claim_count,
            max_claims = ?max_claims,
            "Record keeps being reclaimed"
        );
        metrics::counter!("aegis_fleet_queue_poisoned_claims_total").increment(1);
        if let Some(bus) = &self.event_bus {
            bus.publish_queue_event(QueueEvent::RecordPoisoned {
                collection: self.id().to_string(),
                key: key.to_string(),
                claim_count,
                parked: max_claims.map_or(false, |max| claim_count >= max),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::record::RecordKeyError;
    use crate::domain::store::{Cell, ColumnFilter, ScannedCell, Store, TimeRange};
    use std::sync::Arc;
    use crate::infrastructure::memory_store::InMemoryStore;

    fn queue(config: QueueConfig) -> (LeaseQueue, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Timestamp(5_000_000)));
        let log = AppendLog::new(CollectionId::new("q"), store, clock.clone());
        (LeaseQueue::new(log, config), clock)
    }

    async fn fill(queue: &LeaseQueue, n: u32) -> Vec<RecordKey> {
        let mut keys = Vec::new();
        for i in 0..n {
            keys.push(queue.add(Bytes::from(i.to_string())).await.unwrap());
        }
        keys
    }

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_expiry() {
        let (queue, clock) = queue(QueueConfig::default());
        fill(&queue, 5).await;

        let first = queue
            .claim_records(ClaimOptions::default().with_lease(minutes(1)))
            .await
            .unwrap();
        assert_eq!(first.len(), 5);
        assert!(queue.claim_records(ClaimOptions::default()).await.unwrap().is_empty());

        clock.advance(minutes(2));
        let again = queue.claim_records(ClaimOptions::default()).await.unwrap();
        assert_eq!(again.len(), 5);
        assert!(again.iter().all(|r| r.claim_count == 2));
    }

    #[tokio::test]
    async fn test_stale_ids_raise_lock_errors() {
        let (queue, clock) = queue(QueueConfig::default());
        fill(&queue, 1).await;
        let claimed = queue
            .claim_records(ClaimOptions::default().with_lease(minutes(1)))
            .await
            .unwrap();
        let stale = claimed[0].id;

        clock.advance(minutes(2));
        let err = queue.refresh_claims(&[stale], minutes(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Lock(LockError::Expired { .. })));

        let reclaimed = queue.claim_records(ClaimOptions::default()).await.unwrap();
        assert_eq!(reclaimed.len(), 1);

        let err = queue.release_records(&[stale]).await.unwrap_err();
        assert!(matches!(err, QueueError::Lock(LockError::Stolen { .. })));
        let err = queue
            .replace_record(&stale, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert!(err.is_lock());

        queue.release_records(&[reclaimed[0].id]).await.unwrap();
        let err = queue.delete_records(&[reclaimed[0].id]).await.unwrap_err();
        assert!(matches!(err, QueueError::Lock(LockError::NotHeld { .. })));
    }

    #[tokio::test]
    async fn test_refresh_extends_and_reissues_ids() {
        let (queue, clock) = queue(QueueConfig::default());
        fill(&queue, 2).await;
        let claimed = queue
            .claim_records(ClaimOptions::default().with_lease(minutes(1)))
            .await
            .unwrap();
        let ids: Vec<RecordId> = claimed.iter().map(|r| r.id).collect();

        clock.advance(Duration::from_secs(30));
        let refreshed = queue.refresh_claims(&ids, minutes(5)).await.unwrap();
        clock.advance(minutes(2));
        assert!(queue.claim_records(ClaimOptions::default()).await.unwrap().is_empty());
        queue.replace_record(&refreshed[0], Bytes::from_static(b"new")).await.unwrap();
        let values = queue.log().multi_resolve(&[refreshed[0].key]).await.unwrap();
        assert_eq!(values[0], Some(Bytes::from_static(b"new")));
    }

    #[tokio::test]
    async fn test_max_filtered_stops_scan() {
        let (queue, _) = queue(QueueConfig::default());
        fill(&queue, 20).await;
        let claimed = queue
            .claim_records(
                ClaimOptions::default()
                    .with_filter(|_, value| &value[..] == b"15")
                    .with_max_filtered(10),
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_poison_policy_parks_records() {
        let config = QueueConfig {
            poison: PoisonPolicy {
                warn_after_claims: 1,
                max_claims: Some(2),
            },
            ..QueueConfig::default()
        };
        let (queue, clock) = queue(config);
        let bus = EventBus::with_default_capacity();
        let mut events = bus.subscribe();
        let queue = queue.with_event_bus(bus);
        let keys = fill(&queue, 1).await;

        for expected in 1..=2 {
            let claimed = queue
                .claim_records(ClaimOptions::default().with_lease(minutes(1)))
                .await
                .unwrap();
            assert_eq!(claimed[0].claim_count, expected);
            clock.advance(minutes(2));
        }
        assert!(queue.claim_records(ClaimOptions::default()).await.unwrap().is_empty());
        assert_eq!(queue.claim_count(&keys[0]).await.unwrap(), 2);
        assert_eq!(queue.log().len().await.unwrap(), 1);

        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            crate::infrastructure::event_bus::FleetEvent::Queue(QueueEvent::RecordPoisoned {
                claim_count: 2,
                parked: true,
                ..
            })
        ));
    }

    /// Drops the last cell of every batched read.
    struct ShortReads(InMemoryStore);

    #[async_trait::async_trait]
    impl Store for ShortReads {
        async fn get(&self, subject: &str, column: &str) -> Result<Option<Cell>, StoreError> {
            self.0.get(subject, column).await
        }

        async fn multi_get(&self, subject: &str, columns: &[String]) -> Result<Vec<Option<Cell>>, StoreError> {
            let mut cells = self.0.multi_get(subject, columns).await?;
            cells.pop();
            Ok(cells)
        }

        async fn set(&self, subject: &str, column: &str, value: Bytes, timestamp: Timestamp) -> Result<(), StoreError> {
            self.0.set(subject, column, value, timestamp).await
        }

        async fn multi_set(
            &self,
            subject: &str,
            cells: Vec<(String, Bytes)>,
            timestamp: Timestamp,
        ) -> Result<(), StoreError> {
            self.0.multi_set(subject, cells, timestamp).await
        }

        async fn compare_and_set(
            &self,
            subject: &str,
            column: &str,
            expected: Option<&Bytes>,
            value: Option<Bytes>,
            timestamp: Timestamp,
        ) -> Result<bool, StoreError> {
            self.0.compare_and_set(subject, column, expected, value, timestamp).await
        }

        async fn scan_range(
            &self,
            subject_prefix: &str,
            columns: &ColumnFilter,
            time_range: TimeRange,
            limit: Option<usize>,
        ) -> Result<Vec<ScannedCell>, StoreError> {
            self.0.scan_range(subject_prefix, columns, time_range, limit).await
        }

        async fn delete_attributes(&self, subject: &str, columns: &[String]) -> Result<(), StoreError> {
            self.0.delete_attributes(subject, columns).await
        }

        async fn delete_range(&self, subject: &str, columns: &ColumnFilter) -> Result<usize, StoreError> {
            self.0.delete_range(subject, columns).await
        }

        async fn delete_subject(&self, subject: &str) -> Result<(), StoreError> {
            self.0.delete_subject(subject).await
        }
    }

    #[tokio::test]
    async fn test_short_batched_read_is_an_error() {
        let store = Arc::new(ShortReads(InMemoryStore::new()));
        let clock = Arc::new(ManualClock::new(Timestamp(5_000_000)));
        let queue = LeaseQueue::new(
            AppendLog::new(CollectionId::new("q"), store, clock),
            QueueConfig::default(),
        );
        fill(&queue, 3).await;

        let err = queue.claim_records(ClaimOptions::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Store(StoreError::Backend(_))));
        assert!(!err.is_lock());
    }

    #[tokio::test]
    async fn test_start_time_at_the_epoch_claims_everything() {
        let (queue, _) = queue(QueueConfig::default());
        queue
            .log()
            .add_at(Bytes::from_static(b"first"), Some(Timestamp(0)), Some(0))
            .await
            .unwrap();
        fill(&queue, 2).await;

        let claimed = queue
            .claim_records(ClaimOptions::default().with_start_time(Timestamp(0)))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 3);
        assert_eq!(claimed[0].id.key, RecordKey::MIN);

        let err = queue
            .log()
            .add_at(Bytes::from_static(b"x"), Some(Timestamp(-1)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(RecordKeyError::NegativeTimestamp(-1))));
    }
}
