//! # Event store
//!
//! The keyed persistent store the reconciler and the aggregations run against.
//!
//! Writes go through an [`EventTransaction`]: reading existing events takes a lock on
//! their ids that is held until the transaction commits or is dropped, so two batches
//! carrying the same event id cannot both decide on stale reads. Dropping a transaction
//! without committing discards everything it staged.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::event::Event;
use crate::stats::StatsAggregate;
use crate::top_lines::LineAggregate;

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

/// Enumeration of errors for operations with an EventStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Open a transaction for one read-decide-write cycle.
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>>;

    /// Count events of `machine_id` with `event_time` in `[start, end)` and sum their defects.
    async fn query_stats(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<StatsAggregate>;

    /// Per-line counts for machines of `factory_id` over `[from, to)`, best ranked first,
    /// at most `limit` lines.
    async fn query_top_lines(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<LineAggregate>>;
}

#[async_trait]
pub trait EventTransaction: Send {
    /// Lock `ids` for the rest of the transaction and return the stored events among them.
    /// Ids with no stored event are simply absent from the result.
    async fn get_by_keys(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>>;

    /// Stage events for writing, replacing any stored event with the same id.
    async fn put_all(&mut self, events: &[Event]) -> StoreResult<u64>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
