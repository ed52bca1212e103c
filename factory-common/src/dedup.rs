use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::debug;

use crate::event::Event;

/// Result of folding one batch of validated events by event id.
#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// One representative per event id: the last one seen in the batch.
    pub events: HashMap<String, Event>,
    /// Later occurrences whose payload matched the representative they replaced.
    pub duplicates: usize,
    /// Later occurrences that replaced a representative with a different payload.
    pub superseded: usize,
}

/// Collapse events sharing an id within a batch, last writer wins.
///
/// Payload conflicts are not resolved here: the surviving record is reconciled against the
/// store afterwards.
pub fn dedup_batch<I>(events: I) -> DedupOutcome
where
    I: IntoIterator<Item = Event>,
{
    let mut outcome = DedupOutcome::default();

    for event in events {
        match outcome.events.entry(event.event_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(event);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().same_payload(&event) {
                    outcome.duplicates += 1;
                } else {
                    debug!(event_id = %event.event_id, "in-batch record superseded by later payload");
                    outcome.superseded += 1;
                }
                slot.insert(event);
            }
        }
    }

    outcome
}
