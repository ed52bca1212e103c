use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::timestamp;

/// Value of `defect_count` meaning the producer could not count defects.
/// Such events count towards event totals but never towards defect sums.
pub const DEFECT_COUNT_UNKNOWN: i64 = -1;

/// An event as decoded by the ingress, before validation.
///
/// Identity and time fields are optional so the validator can report which one is missing.
/// Numeric fields default to 0 when absent. Anything else the caller sends, including a
/// `receivedTime`, is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default)]
    pub defect_count: i64,
}

/// A validated event, as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub machine_id: String,
    pub event_time: DateTime<Utc>,
    /// Assigned at ingestion, acts as the logical clock when reconciling.
    pub received_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub defect_count: i64,
}

impl Event {
    /// Compare everything the producer sent, ignoring `received_time`.
    pub fn same_payload(&self, other: &Event) -> bool {
        self.machine_id == other.machine_id
            && self.event_time == other.event_time
            && self.duration_ms == other.duration_ms
            && self.defect_count == other.defect_count
    }

    /// Defects this event contributes to a sum: the unknown sentinel contributes nothing.
    pub fn counted_defects(&self) -> i64 {
        if self.defect_count == DEFECT_COUNT_UNKNOWN {
            0
        } else {
            self.defect_count
        }
    }

    /// Whether `event_time` falls in `[start, end)`.
    pub fn in_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.event_time >= start && self.event_time < end
    }
}

/// Static reference data joining machines to their factory and production line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub machine_id: String,
    pub factory_id: String,
    pub line_id: String,
}

impl Machine {
    pub fn new(machine_id: &str, factory_id: &str, line_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_owned(),
            factory_id: factory_id.to_owned(),
            line_id: line_id.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionReason {
    NullEventTime,
    EventTimeTooFarInFuture,
    InvalidDuration,
    NullEventId,
    NullMachineId,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::NullEventTime => "NULL_EVENT_TIME",
            RejectionReason::EventTimeTooFarInFuture => "EVENT_TIME_TOO_FAR_IN_FUTURE",
            RejectionReason::InvalidDuration => "INVALID_DURATION",
            RejectionReason::NullEventId => "NULL_EVENT_ID",
            RejectionReason::NullMachineId => "NULL_MACHINE_ID",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub event_id: Option<String>,
    pub reason: RejectionReason,
}

/// Summary returned for one ingested batch.
///
/// `deduped` adds up in-batch duplicates and duplicates of what was already stored.
/// `updated` is a subset of `accepted`. `stale` and `superseded` count records that were
/// dropped without being rejected, so that every record of the batch shows up in exactly
/// one of `rejected`, `deduped`, `superseded`, `stale` or `accepted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub accepted: usize,
    pub deduped: usize,
    pub updated: usize,
    pub rejected: usize,
    pub stale: usize,
    pub superseded: usize,
    pub rejections: Vec<Rejection>,
}
