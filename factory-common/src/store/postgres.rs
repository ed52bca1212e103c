use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;

use super::{EventStore, EventTransaction, StoreError, StoreResult};
use crate::event::Event;
use crate::stats::StatsAggregate;
use crate::top_lines::LineAggregate;

/// An EventStore backed by the `events` and `machines` tables in PostgreSQL.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self { pool })
    }

    pub async fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgEventTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl EventTransaction for PgEventTransaction {
    async fn get_by_keys(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>> {
        // Rows that do not exist yet cannot be locked with FOR UPDATE, so every id gets a
        // transaction-scoped advisory lock instead. Keys are taken in hash order, the order
        // the locks themselves are keyed by, so colliding ids cannot deadlock two batches.
        let lock_query = r#"
SELECT
    pg_advisory_xact_lock(lock_key)
FROM
    (SELECT DISTINCT hashtextextended(event_id, 0) AS lock_key
     FROM UNNEST($1::text[]) AS ids(event_id)
     ORDER BY lock_key) AS sorted_keys
        "#;

        sqlx::query(lock_query)
            .bind(ids)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "LOCK".to_owned(),
                error,
            })?;

        let select_query = r#"
SELECT
    event_id, machine_id, event_time, received_time, duration_ms, defect_count
FROM
    events
WHERE
    event_id = ANY($1)
        "#;

        let events: Vec<Event> = sqlx::query_as(select_query)
            .bind(ids)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(events
            .into_iter()
            .map(|event| (event.event_id.clone(), event))
            .collect())
    }

    async fn put_all(&mut self, events: &[Event]) -> StoreResult<u64> {
        let mut event_ids = Vec::with_capacity(events.len());
        let mut machine_ids = Vec::with_capacity(events.len());
        let mut event_times = Vec::with_capacity(events.len());
        let mut received_times = Vec::with_capacity(events.len());
        let mut durations = Vec::with_capacity(events.len());
        let mut defect_counts = Vec::with_capacity(events.len());

        for event in events {
            event_ids.push(event.event_id.clone());
            machine_ids.push(event.machine_id.clone());
            event_times.push(event.event_time);
            received_times.push(event.received_time);
            durations.push(event.duration_ms);
            defect_counts.push(event.defect_count);
        }

        let base_query = r#"
INSERT INTO events
    (event_id, machine_id, event_time, received_time, duration_ms, defect_count)
    (SELECT * FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::timestamptz[],
        $4::timestamptz[],
        $5::bigint[],
        $6::bigint[]))
ON CONFLICT (event_id) DO UPDATE SET
    machine_id = EXCLUDED.machine_id,
    event_time = EXCLUDED.event_time,
    received_time = EXCLUDED.received_time,
    duration_ms = EXCLUDED.duration_ms,
    defect_count = EXCLUDED.defect_count
        "#;

        let start_time = Instant::now();

        let result = sqlx::query(base_query)
            .bind(&event_ids)
            .bind(&machine_ids)
            .bind(&event_times)
            .bind(&received_times)
            .bind(&durations)
            .bind(&defect_counts)
            .execute(&mut *self.tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        metrics::histogram!("factory_store_put_all_seconds")
            .record(start_time.elapsed().as_secs_f64());

        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Box::new(PgEventTransaction { tx }))
    }

    async fn query_stats(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<StatsAggregate> {
        let base_query = r#"
SELECT
    COUNT(*) AS events_count,
    COALESCE(SUM(CASE WHEN defect_count = -1 THEN 0 ELSE defect_count END), 0)::BIGINT AS defects_count
FROM
    events
WHERE
    machine_id = $1
    AND event_time >= $2
    AND event_time < $3
        "#;

        let start_time = Instant::now();

        let aggregate: StatsAggregate = sqlx::query_as(base_query)
            .bind(machine_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        metrics::histogram!("factory_store_query_stats_seconds")
            .record(start_time.elapsed().as_secs_f64());

        Ok(aggregate)
    }

    async fn query_top_lines(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<LineAggregate>> {
        let base_query = r#"
SELECT
    m.line_id AS line_id,
    COUNT(*) AS event_count,
    COALESCE(SUM(CASE WHEN e.defect_count = -1 THEN 0 ELSE e.defect_count END), 0)::BIGINT AS total_defects
FROM
    events e
    JOIN machines m ON e.machine_id = m.machine_id
WHERE
    m.factory_id = $1
    AND e.event_time >= $2
    AND e.event_time < $3
GROUP BY
    m.line_id
ORDER BY
    total_defects DESC,
    m.line_id
LIMIT $4
        "#;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let start_time = Instant::now();

        let lines: Vec<LineAggregate> = sqlx::query_as(base_query)
            .bind(factory_id)
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        metrics::histogram!("factory_store_query_top_lines_seconds")
            .record(start_time.elapsed().as_secs_f64());

        Ok(lines)
    }
}
