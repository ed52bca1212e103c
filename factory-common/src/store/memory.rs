use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{EventStore, EventTransaction, StoreResult};
use crate::event::{Event, Machine};
use crate::stats::StatsAggregate;
use crate::top_lines::{top_n, LineAggregate};

#[derive(Debug, Default)]
struct MemoryState {
    events: HashMap<String, Event>,
    machines: HashMap<String, Machine>,
}

/// An EventStore kept in process memory, for local runs and tests.
///
/// A transaction holds the store-wide writer lock from `begin` until it is committed or
/// dropped, which serializes every read-decide-write cycle. Committed state sits behind a
/// separate read-write lock, so aggregations never wait on an open transaction; they only
/// see what has been committed.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    state: Arc<RwLock<MemoryState>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machines<I>(machines: I) -> Self
    where
        I: IntoIterator<Item = Machine>,
    {
        let state = MemoryState {
            events: HashMap::new(),
            machines: machines
                .into_iter()
                .map(|machine| (machine.machine_id.clone(), machine))
                .collect(),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            writer: Arc::default(),
        }
    }

    pub async fn get(&self, event_id: &str) -> Option<Event> {
        self.state.read().await.events.get(event_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct MemoryTransaction {
    _writer: OwnedMutexGuard<()>,
    state: Arc<RwLock<MemoryState>>,
    staged: Vec<Event>,
}

#[async_trait]
impl EventTransaction for MemoryTransaction {
    async fn get_by_keys(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>> {
        let state = self.state.read().await;

        Ok(ids
            .iter()
            .filter_map(|id| state.events.get(id).map(|event| (id.clone(), event.clone())))
            .collect())
    }

    async fn put_all(&mut self, events: &[Event]) -> StoreResult<u64> {
        self.staged.extend_from_slice(events);
        Ok(events.len() as u64)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTransaction {
            _writer,
            state,
            staged,
        } = *self;

        let mut state = state.write().await;
        for event in staged {
            state.events.insert(event.event_id.clone(), event);
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>> {
        let writer = self.writer.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            _writer: writer,
            state: self.state.clone(),
            staged: Vec::new(),
        }))
    }

    async fn query_stats(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<StatsAggregate> {
        let state = self.state.read().await;

        Ok(state
            .events
            .values()
            .filter(|event| event.machine_id == machine_id && event.in_window(start, end))
            .fold(StatsAggregate::default(), |mut aggregate, event| {
                aggregate.events_count += 1;
                aggregate.defects_count += event.counted_defects();
                aggregate
            }))
    }

    async fn query_top_lines(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<LineAggregate>> {
        let state = self.state.read().await;
        let mut lines: HashMap<&str, LineAggregate> = HashMap::new();

        for event in state.events.values().filter(|event| event.in_window(from, to)) {
            let Some(machine) = state.machines.get(&event.machine_id) else {
                continue;
            };
            if machine.factory_id != factory_id {
                continue;
            }

            let line = lines
                .entry(machine.line_id.as_str())
                .or_insert_with(|| LineAggregate {
                    line_id: machine.line_id.clone(),
                    event_count: 0,
                    total_defects: 0,
                });
            line.event_count += 1;
            line.total_defects += event.counted_defects();
        }

        Ok(top_n(lines.into_values().collect(), limit))
    }
}
