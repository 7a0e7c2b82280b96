// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Leases
//!
//! A lease is an expiry timestamp stored next to a record's payload, in the
//! same key slot:
//!
//! ```text
//! <key>          payload bytes
//! <key>#lease    expiry, i64 microseconds, big-endian
//! <key>#claims   number of times the record was claimed, u32 big-endian
//! ```
//!
//! No lease, or an expired one, makes the record claimable. Whoever wrote the
//! current expiry owns the lease; a [`RecordId`] remembers the expiry its
//! holder wrote so every lease-requiring operation can check it is still the
//! owner.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::domain::record::{RecordKey, Timestamp};

pub const LEASE_SUFFIX: &str = "#lease";
pub const CLAIMS_SUFFIX: &str = "#claims";

/// Default lease for queue claims.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30 * 60);

pub fn lease_column(key: &RecordKey) -> String {
    format!("{}{}", key.column(), LEASE_SUFFIX)
}

pub fn claims_column(key: &RecordKey) -> String {
    format!("{}{}", key.column(), CLAIMS_SUFFIX)
}

pub fn encode_expiry(expiry: Timestamp) -> Bytes {
    Bytes::copy_from_slice(&expiry.as_micros().to_be_bytes())
}

pub fn decode_expiry(bytes: &[u8]) -> Option<Timestamp> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(Timestamp(i64::from_be_bytes(raw)))
}

pub fn encode_claims(count: u32) -> Bytes {
    Bytes::copy_from_slice(&count.to_be_bytes())
}

pub fn decode_claims(bytes: &[u8]) -> u32 {
    bytes
        .try_into()
        .map(u32::from_be_bytes)
        .unwrap_or(0)
}

/// Handle to a claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub key: RecordKey,
    /// Expiry written by the holder's latest claim or refresh.
    pub lease_expiry: Timestamp,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedRecord {
    pub id: RecordId,
    pub value: Bytes,
    /// How many times this record has been claimed, this claim included.
    pub claim_count: u32,
}

/// Raised when a lease-requiring operation runs without a valid lease.
///
/// Always recoverable: the caller drops the attempt and tries again on a
/// later cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("No lease held on record {key}")]
    NotHeld { key: RecordKey },

    #[error("Lease on record {key} expired at {expired_at}")]
    Expired {
        key: RecordKey,
        expired_at: Timestamp,
    },

    #[error("Lease on record {key} was taken over by another claimant")]
    Stolen { key: RecordKey },
}

/// Predicate deciding whether an otherwise-eligible record may be claimed.
pub type RecordFilter = Arc<dyn Fn(&RecordKey, &Bytes) -> bool + Send + Sync>;

/// Parameters of a claim scan.
#[derive(Clone)]
pub struct ClaimOptions {
    /// Maximum number of records to claim. `None` claims everything eligible.
    pub limit: Option<usize>,
    pub lease: Duration,
    /// Only consider records at or after this timestamp.
    pub start_time: Option<Timestamp>,
    /// Records for which this returns `false` are skipped, unclaimed.
    pub filter: Option<RecordFilter>,
    /// Stop scanning after this many records were rejected by `filter`.
    pub max_filtered: usize,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            limit: None,
            lease: DEFAULT_LEASE,
            start_time: None,
            filter: None,
            max_filtered: 1000,
        }
    }
}

impl ClaimOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_start_time(mut self, start_time: Timestamp) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RecordKey, &Bytes) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_max_filtered(mut self, max_filtered: usize) -> Self {
        self.max_filtered = max_filtered;
        self
    }
}

impl fmt::Debug for ClaimOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimOptions")
            .field("limit", &self.limit)
            .field("lease", &self.lease)
            .field("start_time", &self.start_time)
            .field("filter", &self.filter.is_some())
            .field("max_filtered", &self.max_filtered)
            .finish()
    }
}
