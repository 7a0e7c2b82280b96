// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Record Model
//!
//! Value objects shared by every log in the task-distribution layer:
//!
//! - [`Timestamp`]: microseconds since the Unix epoch.
//! - [`RecordKey`]: `(timestamp, suffix)` pair whose rendered form sorts the
//!   same way as its numeric value.
//! - [`CollectionId`]: opaque name of one append log.
//!
//! Keys render as `<16 hex>.<6 hex>`, e.g. `00060a1b2c3d4e5f.00abcd`. Store
//! adapters only ever compare them as strings.

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Largest value a 24-bit suffix may take.
pub const MAX_SUFFIX: u32 = 0x00FF_FFFF;

/// Microsecond wall-clock timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> i64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_micros())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_micros(self.0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Saturating addition of a duration.
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration_micros(duration)))
    }

    /// Saturating subtraction of a duration.
    pub fn minus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration_micros(duration)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

pub(crate) fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Errors produced while parsing a rendered record key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordKeyError {
    #[error("malformed record key '{0}': expected <16 hex>.<6 hex>")]
    Malformed(String),

    #[error("record key suffix {0:#x} exceeds 24 bits")]
    SuffixOutOfRange(u32),

    #[error("record key timestamp {0} is before the epoch")]
    NegativeTimestamp(i64),
}

/// Position of a record inside its collection.
///
/// Ordering is `(timestamp, suffix)`, matching the lexicographic order of
/// the rendered column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub timestamp: Timestamp,
    pub suffix: u32,
}

impl RecordKey {
    /// Sorts before every record a writer can produce.
    pub const MIN: RecordKey = RecordKey {
        timestamp: Timestamp::ZERO,
        suffix: 0,
    };

    pub fn new(timestamp: Timestamp, suffix: u32) -> Result<Self, RecordKeyError> {
        if timestamp.0 < 0 {
            return Err(RecordKeyError::NegativeTimestamp(timestamp.0));
        }
        if suffix > MAX_SUFFIX {
            return Err(RecordKeyError::SuffixOutOfRange(suffix));
        }
        Ok(Self { timestamp, suffix })
    }

    /// Key with a random non-zero suffix.
    pub fn random(timestamp: Timestamp) -> Result<Self, RecordKeyError> {
        Self::new(timestamp, random_suffix())
    }

    /// The last key a writer could produce at `timestamp`, or `None` before
    /// the epoch where no writer can produce one.
    pub fn last_at(timestamp: Timestamp) -> Option<Self> {
        (timestamp.0 >= 0).then_some(Self {
            timestamp,
            suffix: MAX_SUFFIX,
        })
    }

    /// Rendered column name.
    pub fn column(&self) -> String {
        format!("{:016x}.{:06x}", self.timestamp.0 as u64, self.suffix)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{:06x}", self.timestamp.0 as u64, self.suffix)
    }
}

impl FromStr for RecordKey {
    type Err = RecordKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || RecordKeyError::Malformed(s.to_string());
        let (ts, suffix) = s.split_once('.').ok_or_else(malformed)?;
        if ts.len() != 16 || suffix.len() != 6 {
            return Err(malformed());
        }
        let ts = u64::from_str_radix(ts, 16).map_err(|_| malformed())?;
        let suffix = u32::from_str_radix(suffix, 16).map_err(|_| malformed())?;
        RecordKey::new(Timestamp(ts as i64), suffix)
    }
}

/// Random suffix in `1..=MAX_SUFFIX`.
pub fn random_suffix() -> u32 {
    (OsRng.next_u32() % MAX_SUFFIX) + 1
}

/// Identifier of one append log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Child collection, e.g. `flows:1234` → `flows:1234/responses`.
    pub fn child(&self, name: &str) -> Self {
        Self(format!("{}/{}", self.0, name))
    }

    /// Store subject that holds the records of this collection.
    pub fn records_subject(&self) -> String {
        format!("{}/Records", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for CollectionId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
