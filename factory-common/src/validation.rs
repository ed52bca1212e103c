use chrono::{DateTime, Duration, SubsecRound, Utc};

use crate::event::{Event, EventRecord, Rejection, RejectionReason};

/// How far ahead of the server clock an event time may be, to absorb producer clock skew.
pub const MAX_FUTURE_SKEW_MINUTES: i64 = 15;

/// Longest accepted event duration: six hours.
pub const MAX_DURATION_MS: i64 = 6 * 60 * 60 * 1000;

/// Fractional second digits kept on timestamps, the precision of a `TIMESTAMPTZ` column.
pub const TIMESTAMP_SUBSEC_DIGITS: u16 = 6;

/// Check one record and normalize it into an `Event` stamped with `now` as received time.
///
/// Both timestamps are truncated to microseconds, so a resubmitted record compares equal
/// to what the store kept the first time.
///
/// Checks run in a fixed order and the first failure is reported:
/// event time present, event time not too far in the future, duration in range,
/// event id present, machine id present.
pub fn validate(record: EventRecord, now: DateTime<Utc>) -> Result<Event, Rejection> {
    let reject = |reason: RejectionReason, event_id: Option<String>| Rejection { event_id, reason };

    let Some(event_time) = record.event_time else {
        return Err(reject(RejectionReason::NullEventTime, record.event_id));
    };

    if event_time > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
        return Err(reject(
            RejectionReason::EventTimeTooFarInFuture,
            record.event_id,
        ));
    }

    if !(0..=MAX_DURATION_MS).contains(&record.duration_ms) {
        return Err(reject(RejectionReason::InvalidDuration, record.event_id));
    }

    let Some(event_id) = record.event_id else {
        return Err(reject(RejectionReason::NullEventId, None));
    };

    let Some(machine_id) = record.machine_id else {
        return Err(reject(RejectionReason::NullMachineId, Some(event_id)));
    };

    Ok(Event {
        event_id,
        machine_id,
        event_time: event_time.trunc_subsecs(TIMESTAMP_SUBSEC_DIGITS),
        received_time: now.trunc_subsecs(TIMESTAMP_SUBSEC_DIGITS),
        duration_ms: record.duration_ms,
        defect_count: record.defect_count,
    })
}
