//! Domain identifiers (strongly-typed IDs).
//!
//! IDs are ULID-backed and share one generic implementation, `Id<T>`, where
//! `T` is a zero-sized marker type. `JobId` and `RunId` therefore cannot be
//! mixed up even though they have the same representation.
//!
//! Text form (Display, `FromStr`, serde) is the marker prefix followed by the
//! ULID: `job-01J9Z3...`, `run-01J9Z3...`.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use ulid::Ulid;

/// Marker trait for ID kinds.
pub trait IdMarker: Send + Sync + 'static {
    /// Text prefix ("job-", "run-").
    const PREFIX: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdError {
    #[error("id {input:?} does not start with {expected:?}")]
    Prefix {
        input: String,
        expected: &'static str,
    },

    #[error("id {input:?} has an invalid ulid: {reason}")]
    Ulid { input: String, reason: String },
}

/// Generic ULID-backed identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    kind: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Fresh identifier; later calls sort after earlier ones (ULID time prefix).
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            kind: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::PREFIX, self.ulid)
    }
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::PREFIX).ok_or_else(|| ParseIdError::Prefix {
            input: s.to_string(),
            expected: T::PREFIX,
        })?;
        let ulid = Ulid::from_string(raw).map_err(|e| ParseIdError::Ulid {
            input: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<Ser: Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Marker for jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    const PREFIX: &'static str = "job-";
}

/// Marker for scenario runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    const PREFIX: &'static str = "run-";
}

/// Identifier of a job (a node in one scenario's dependency graph).
pub type JobId = Id<Job>;

/// Identifier of one scenario run.
pub type RunId = Id<Run>;
