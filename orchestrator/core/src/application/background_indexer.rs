// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Background Indexer - keeps sparse indexes of busy logs current
//!
//! Logs register themselves on append. Every poll interval the indexer walks
//! the registrations old enough to be worth looking at, extends each log's
//! index over its tail and drops the registration once less than one index
//! spacing of unindexed records is left. Index writes are spread out by
//! `write_delay` so a burst of registrations does not turn into a burst of
//! store writes.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Amortizes index maintenance away from the read path

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::append_log::AppendLog;
use crate::application::indexed_log::IndexedLog;
use crate::domain::clock::Clock;
use crate::domain::config::IndexConfig;
use crate::domain::record::{CollectionId, Timestamp};
use crate::domain::store::Store;

/// Outcome of one indexer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerCycle {
    pub visited: usize,
    pub samples_added: usize,
    pub unregistered: usize,
}

pub struct BackgroundIndexer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: IndexConfig,
    /// Collection → when it was first registered since its last visit.
    registered: DashMap<CollectionId, Timestamp>,
    shutdown_token: CancellationToken,
}

impl BackgroundIndexer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: IndexConfig) -> Self {
        Self {
            store,
            clock,
            config,
            registered: DashMap::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Mark `collection` as having a tail worth indexing. Re-registering
    /// keeps the original registration time.
    pub fn register(&self, collection: CollectionId) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now();
        self.registered.entry(collection).or_insert(now);
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn is_registered(&self, collection: &CollectionId) -> bool {
        self.registered.contains_key(collection)
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Index loop; returns once the shutdown token fires.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Background indexer is disabled");
            return;
        }

        info!(
            poll_interval = ?self.config.poll_interval,
            spacing = self.config.spacing,
            "Starting background indexer"
        );

        let mut tick = interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.run_once().await {
                        Ok(cycle) if cycle.visited > 0 => {
                            info!(
                                visited = cycle.visited,
                                samples_added = cycle.samples_added,
                                unregistered = cycle.unregistered,
                                "Background indexer cycle completed"
                            );
                        }
                        Ok(_) => debug!("Background indexer cycle had nothing to do"),
                        Err(e) => warn!("Background indexer cycle failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping background indexer");
                    break;
                }
            }
        }

        info!("Background indexer stopped");
    }

    /// One pass over the due registrations.
    ///
    /// A failure on one collection is logged and leaves it registered; the
    /// pass carries on with the others.
    pub async fn run_once(&self) -> Result<IndexerCycle> {
        let cutoff = self.clock.now().minus(self.config.registration_delay);
        let due: Vec<CollectionId> = self
            .registered
            .iter()
            .filter(|entry| *entry.value() <= cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        let mut cycle = IndexerCycle::default();
        for collection in due {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            if cycle.samples_added > 0 && !self.pause().await {
                break;
            }

            cycle.visited += 1;
            match self.index_collection(&collection).await {
                Ok((added, done)) => {
                    cycle.samples_added += added;
                    if done {
                        self.registered.remove(&collection);
                        cycle.unregistered += 1;
                    }
                }
                Err(e) => {
                    warn!(collection = %collection, "Failed to index collection: {}", e);
                }
            }
        }

        metrics::gauge!("aegis_fleet_indexer_registered_collections").set(self.registered.len() as f64);
        Ok(cycle)
    }

    /// Returns whether the tail is now too short to need another visit.
    async fn index_collection(&self, collection: &CollectionId) -> Result<(usize, bool)> {
        let log = AppendLog::new(collection.clone(), self.store.clone(), self.clock.clone());
        let indexed = IndexedLog::new(log, &self.config);
        let added = indexed.update_index().await?;
        let length = indexed.calculate_length().await?;
        let max_ordinal = indexed.index_ordinals().last().copied().unwrap_or(0);
        let done = length < max_ordinal + self.config.spacing.max(1);

        debug!(
            collection = %collection,
            added,
            length,
            max_ordinal,
            "Indexed collection"
        );
        Ok((added, done))
    }

    /// Wait out `write_delay`. Returns `false` when shut down meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.write_delay) => true,
            _ = self.shutdown_token.cancelled() => false,
        }
    }
}
