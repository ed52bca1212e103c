use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};

use factory_common::event::Machine;
use factory_common::service::EventService;
use factory_common::stats::StatsAggregate;
use factory_common::store::{
    EventStore, EventTransaction, MemoryEventStore, StoreError, StoreResult,
};
use factory_common::time::FixedTime;
use factory_common::top_lines::LineAggregate;

use super::add_routes;

pub const MAX_BODY_SIZE: usize = 1_000_000;

/// The instant every test request is received at.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn router_for(store: MemoryEventStore) -> Router {
    let service = EventService::new(store, FixedTime::new(now()));
    add_routes(Router::new(), service, MAX_BODY_SIZE, 10)
}

pub fn app() -> Router {
    router_for(MemoryEventStore::new())
}

pub fn factory_store() -> MemoryEventStore {
    MemoryEventStore::with_machines(vec![
        Machine::new("M-001", "F01", "L-1"),
        Machine::new("M-002", "F01", "L-2"),
        Machine::new("M-003", "F02", "L-9"),
    ])
}

/// A store whose every call fails as if the database were unreachable.
pub struct UnavailableStore;

fn unavailable(command: &str) -> StoreError {
    StoreError::QueryError {
        command: command.to_owned(),
        error: sqlx::Error::PoolTimedOut,
    }
}

#[async_trait]
impl EventStore for UnavailableStore {
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>> {
        Err(StoreError::ConnectionError {
            error: sqlx::Error::PoolTimedOut,
        })
    }

    async fn query_stats(
        &self,
        _machine_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> StoreResult<StatsAggregate> {
        Err(unavailable("SELECT"))
    }

    async fn query_top_lines(
        &self,
        _factory_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
        _limit: usize,
    ) -> StoreResult<Vec<LineAggregate>> {
        Err(unavailable("SELECT"))
    }
}

pub fn unavailable_app() -> Router {
    let service = EventService::new(UnavailableStore, FixedTime::new(now()));
    add_routes(Router::new(), service, MAX_BODY_SIZE, 10)
}

