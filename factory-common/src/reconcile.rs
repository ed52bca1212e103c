use std::collections::HashMap;

use tracing::debug;

use crate::event::Event;

/// What to do with a candidate given what the store currently holds for its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    SaveAsNew,
    SaveAsUpdate,
    SkipAsDuplicate,
    /// The candidate was received before the stored record; the stored record stays.
    SkipAsStale,
}

pub fn decide(candidate: &Event, existing: Option<&Event>) -> Decision {
    match existing {
        None => Decision::SaveAsNew,
        Some(existing) if candidate.same_payload(existing) => Decision::SkipAsDuplicate,
        Some(existing) if candidate.received_time < existing.received_time => {
            Decision::SkipAsStale
        }
        Some(_) => Decision::SaveAsUpdate,
    }
}

/// Decisions for a whole batch, with the records that must be written.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub to_save: Vec<Event>,
    pub created: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub stale: usize,
}

pub fn reconcile(
    candidates: HashMap<String, Event>,
    existing: &HashMap<String, Event>,
) -> Reconciliation {
    let mut reconciliation = Reconciliation::default();

    for (event_id, candidate) in candidates {
        match decide(&candidate, existing.get(&event_id)) {
            Decision::SaveAsNew => {
                reconciliation.created += 1;
                reconciliation.to_save.push(candidate);
            }
            Decision::SaveAsUpdate => {
                reconciliation.updated += 1;
                reconciliation.to_save.push(candidate);
            }
            Decision::SkipAsDuplicate => reconciliation.duplicates += 1,
            Decision::SkipAsStale => {
                debug!(event_id = %event_id, "skipping record received before the stored one");
                reconciliation.stale += 1;
            }
        }
    }

    reconciliation
}
