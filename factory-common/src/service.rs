use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{debug, error, instrument};

use crate::dedup::{dedup_batch, DedupOutcome};
use crate::event::{BatchResponse, Event, EventRecord, Rejection};
use crate::reconcile::{reconcile, Reconciliation};
use crate::stats::MachineStats;
use crate::store::{EventStore, StoreResult};
use crate::time::TimeSource;
use crate::top_lines::TopDefectLine;
use crate::validation::validate;

/// Entry point for batch ingestion and the health queries.
#[derive(Clone)]
pub struct EventService {
    store: Arc<dyn EventStore>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl EventService {
    pub fn new<S, T>(store: S, timesource: T) -> Self
    where
        S: EventStore + 'static,
        T: TimeSource + Send + Sync + 'static,
    {
        Self {
            store: Arc::new(store),
            timesource: Arc::new(timesource),
        }
    }

    /// Validate, deduplicate and reconcile one batch, then write the winners in one transaction.
    ///
    /// Store failures abort the whole batch and nothing is written.
    #[instrument(skip_all, fields(batch_size = records.len()))]
    pub async fn process_batch(&self, records: Vec<EventRecord>) -> StoreResult<BatchResponse> {
        let now = self.timesource.current_time();
        counter!("factory_events_received_total").increment(records.len() as u64);

        let mut rejections: Vec<Rejection> = Vec::new();
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match validate(record, now) {
                Ok(event) => valid.push(event),
                Err(rejection) => {
                    debug!(event_id = ?rejection.event_id, reason = %rejection.reason, "rejected event");
                    rejections.push(rejection);
                }
            }
        }

        let mut dedup = dedup_batch(valid);
        let candidates = std::mem::take(&mut dedup.events);
        let reconciliation = if candidates.is_empty() {
            Reconciliation::default()
        } else {
            self.reconcile_and_write(candidates).await.map_err(|err| {
                error!("failed to reconcile batch: {}", err);
                err
            })?
        };

        let response = batch_response(rejections, &dedup, &reconciliation);
        report_batch(&response);

        Ok(response)
    }

    async fn reconcile_and_write(
        &self,
        candidates: HashMap<String, Event>,
    ) -> StoreResult<Reconciliation> {
        let ids: Vec<String> = candidates.keys().cloned().collect();

        let mut tx = self.store.begin().await?;
        let existing = tx.get_by_keys(&ids).await?;
        let reconciliation = reconcile(candidates, &existing);

        if !reconciliation.to_save.is_empty() {
            tx.put_all(&reconciliation.to_save).await?;
        }
        tx.commit().await?;

        Ok(reconciliation)
    }

    /// Event and defect counts for one machine over `[start, end)`, with its health status.
    #[instrument(skip(self))]
    pub async fn stats(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<MachineStats> {
        let aggregate = self
            .store
            .query_stats(machine_id, start, end)
            .await
            .map_err(|err| {
                error!("failed to query stats: {}", err);
                err
            })?;

        Ok(MachineStats::from_aggregate(machine_id, start, end, aggregate))
    }

    /// Lines of `factory_id` with the most defects over `[from, to)`, at most `limit` of them.
    #[instrument(skip(self))]
    pub async fn top_defect_lines(
        &self,
        factory_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TopDefectLine>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let lines = self
            .store
            .query_top_lines(factory_id, from, to, limit)
            .await
            .map_err(|err| {
                error!("failed to query top defect lines: {}", err);
                err
            })?;

        Ok(lines.into_iter().map(TopDefectLine::from).collect())
    }
}

fn batch_response(
    rejections: Vec<Rejection>,
    dedup: &DedupOutcome,
    reconciliation: &Reconciliation,
) -> BatchResponse {
    BatchResponse {
        accepted: reconciliation.to_save.len(),
        deduped: dedup.duplicates + reconciliation.duplicates,
        updated: reconciliation.updated,
        rejected: rejections.len(),
        stale: reconciliation.stale,
        superseded: dedup.superseded,
        rejections,
    }
}

fn report_batch(response: &BatchResponse) {
    let outcomes = [
        ("accepted", response.accepted),
        ("deduped", response.deduped),
        ("updated", response.updated),
        ("rejected", response.rejected),
        ("stale", response.stale),
        ("superseded", response.superseded),
    ];

    for (outcome, count) in outcomes {
        counter!("factory_events_processed_total", "outcome" => outcome).increment(count as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use crate::event::{Machine, RejectionReason, DEFECT_COUNT_UNKNOWN};
    use crate::stats::{HealthStatus, StatsAggregate};
    use crate::store::{EventTransaction, MemoryEventStore, StoreError};
    use crate::time::FixedTime;
    use crate::top_lines::LineAggregate;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(id: &str, defect_count: i64) -> EventRecord {
        EventRecord {
            event_id: Some(id.to_owned()),
            machine_id: Some("M-001".to_owned()),
            event_time: Some(now() - Duration::minutes(5)),
            duration_ms: 1000,
            defect_count,
        }
    }

    fn service() -> (EventService, MemoryEventStore, FixedTime) {
        let store = MemoryEventStore::with_machines(vec![
            Machine::new("M-001", "F-01", "L-01"),
            Machine::new("M-002", "F-01", "L-02"),
            Machine::new("M-003", "F-01", "L-03"),
            Machine::new("M-900", "F-09", "L-90"),
        ]);
        let clock = FixedTime::new(now());
        let service = EventService::new(store.clone(), clock.clone());
        (service, store, clock)
    }

    fn accounted(response: &BatchResponse) -> usize {
        response.rejected
            + response.deduped
            + response.superseded
            + response.stale
            + response.accepted
    }

    #[tokio::test]
    async fn identical_records_in_one_batch_are_deduped() {
        let (service, store, _) = service();

        let response = service
            .process_batch(vec![record("E-1", 1), record("E-1", 1)])
            .await
            .unwrap();

        assert_eq!(response.accepted, 1);
        assert_eq!(response.deduped, 1);
        assert_eq!(response.updated, 0);
        assert_eq!(response.rejected, 0);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn later_submission_with_new_payload_updates() {
        let (service, store, clock) = service();

        let first = service.process_batch(vec![record("E-2", 1)]).await.unwrap();
        assert_eq!(first.accepted, 1);
        assert_eq!(first.updated, 0);

        clock.advance(Duration::seconds(1));
        let second = service.process_batch(vec![record("E-2", 5)]).await.unwrap();

        assert_eq!(second.accepted, 1);
        assert_eq!(second.updated, 1);
        assert_eq!(second.deduped, 0);

        let stored = store.get("E-2").await.unwrap();
        assert_eq!(stored.defect_count, 5);
        assert_eq!(stored.received_time, now() + Duration::seconds(1));
    }

    #[tokio::test]
    async fn invalid_duration_is_reported() {
        let (service, store, _) = service();
        let mut bad = record("E-4", 1);
        bad.duration_ms = -10;

        let response = service.process_batch(vec![bad]).await.unwrap();

        assert_eq!(response.rejected, 1);
        assert_eq!(response.accepted, 0);
        assert_eq!(
            response.rejections,
            vec![Rejection {
                event_id: Some("E-4".to_owned()),
                reason: RejectionReason::InvalidDuration,
            }]
        );
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rejections_do_not_abort_the_batch() {
        let (service, store, _) = service();
        let mut no_machine = record("E-2", 1);
        no_machine.machine_id = None;
        let mut no_id = record("ignored", 1);
        no_id.event_id = None;

        let response = service
            .process_batch(vec![record("E-1", 1), no_machine, no_id, record("E-3", 1)])
            .await
            .unwrap();

        assert_eq!(response.accepted, 2);
        assert_eq!(response.rejected, 2);
        assert_eq!(
            response.rejections,
            vec![
                Rejection {
                    event_id: Some("E-2".to_owned()),
                    reason: RejectionReason::NullMachineId,
                },
                Rejection {
                    event_id: None,
                    reason: RejectionReason::NullEventId,
                },
            ]
        );
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn resubmitting_a_batch_changes_nothing() {
        let (service, store, clock) = service();
        let batch = vec![record("E-1", 1), record("E-2", 0), record("E-3", 3)];

        service.process_batch(batch.clone()).await.unwrap();
        let stored_before = store.get("E-2").await.unwrap();

        clock.advance(Duration::minutes(1));
        let response = service.process_batch(batch.clone()).await.unwrap();

        assert_eq!(response.deduped, batch.len());
        assert_eq!(response.accepted, 0);
        assert_eq!(response.updated, 0);
        assert_eq!(store.len().await, 3);
        assert_eq!(store.get("E-2").await.unwrap(), stored_before);
    }

    #[tokio::test]
    async fn earlier_received_update_is_skipped_as_stale() {
        let (service, store, clock) = service();

        service.process_batch(vec![record("E-5", 1)]).await.unwrap();

        clock.set(now() - Duration::seconds(30));
        let response = service.process_batch(vec![record("E-5", 9)]).await.unwrap();

        assert_eq!(response.stale, 1);
        assert_eq!(response.accepted, 0);
        assert_eq!(response.updated, 0);
        assert_eq!(response.deduped, 0);
        assert_eq!(response.rejected, 0);

        let stored = store.get("E-5").await.unwrap();
        assert_eq!(stored.defect_count, 1);
        assert_eq!(stored.received_time, now());
    }

    #[tokio::test]
    async fn every_record_is_accounted_for_once() {
        let (service, _, clock) = service();
        service
            .process_batch(vec![record("E-dup", 1), record("E-stale", 1)])
            .await
            .unwrap();

        clock.set(now() - Duration::minutes(1));
        let mut rejected = record("E-bad", 1);
        rejected.event_time = None;
        let batch = vec![
            record("E-new", 1),
            record("E-new", 1),   // in-batch duplicate
            record("E-multi", 1), // superseded by the next one
            record("E-multi", 2),
            record("E-dup", 1),   // duplicate of stored
            record("E-stale", 8), // received before the stored one
            rejected,
        ];
        let batch_size = batch.len();

        let response = service.process_batch(batch).await.unwrap();

        assert_eq!(response.rejected, 1);
        assert_eq!(response.deduped, 2);
        assert_eq!(response.superseded, 1);
        assert_eq!(response.stale, 1);
        assert_eq!(response.accepted, 2);
        assert_eq!(response.updated, 0);
        assert_eq!(accounted(&response), batch_size);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batches_for_one_new_id_store_one_record() {
        let (service, store, _) = service();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .process_batch(vec![record("E-CONCURRENT", 1)])
                        .await
                })
            })
            .collect();

        let responses: Vec<BatchResponse> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(store.len().await, 1);
        assert_eq!(responses.iter().map(|r| r.accepted).sum::<usize>(), 1);
        assert_eq!(responses.iter().map(|r| r.deduped).sum::<usize>(), 9);

        let stats = service
            .stats("M-001", now() - Duration::hours(1), now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(stats.events_count, 1);
    }

    #[tokio::test]
    async fn stats_window_includes_start_and_excludes_end() {
        let (service, _, _) = service();
        let start = now() - Duration::minutes(10);
        let end = now();

        let mut inside = record("E-7", 1);
        inside.event_time = Some(start);
        let mut outside = record("E-8", 1);
        outside.event_time = Some(end);
        service.process_batch(vec![inside, outside]).await.unwrap();

        let stats = service.stats("M-001", start, end).await.unwrap();

        assert_eq!(stats.events_count, 1);
        assert_eq!(stats.defects_count, 1);
    }

    #[tokio::test]
    async fn unknown_defect_count_counts_as_event_only() {
        let (service, _, _) = service();
        service
            .process_batch(vec![record("E-9", DEFECT_COUNT_UNKNOWN)])
            .await
            .unwrap();

        let stats = service
            .stats("M-001", now() - Duration::hours(1), now())
            .await
            .unwrap();

        assert_eq!(stats.events_count, 1);
        assert_eq!(stats.defects_count, 0);
        assert_eq!(stats.avg_defect_rate, 0.0);
        assert_eq!(stats.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn many_defects_raise_a_warning() {
        let (service, _, _) = service();
        service
            .process_batch(vec![record("E-1", 3), record("E-2", 1)])
            .await
            .unwrap();

        let stats = service
            .stats("M-001", now() - Duration::hours(2), now())
            .await
            .unwrap();

        assert_eq!(stats.defects_count, 4);
        assert_eq!(stats.avg_defect_rate, 2.0);
        assert_eq!(stats.status, HealthStatus::Warning);
    }

    fn on_machine(id: &str, machine_id: &str, defect_count: i64) -> EventRecord {
        let mut record = record(id, defect_count);
        record.machine_id = Some(machine_id.to_owned());
        record
    }

    #[tokio::test]
    async fn top_defect_lines_are_ranked_and_truncated() {
        let (service, _, _) = service();
        service
            .process_batch(vec![
                on_machine("E-1", "M-001", 2),
                on_machine("E-2", "M-001", DEFECT_COUNT_UNKNOWN),
                on_machine("E-3", "M-002", 5),
                on_machine("E-4", "M-003", 1),
                on_machine("E-5", "M-900", 40),
            ])
            .await
            .unwrap();

        let lines = service
            .top_defect_lines("F-01", now() - Duration::hours(1), now(), 2)
            .await
            .unwrap();

        assert_eq!(
            lines,
            vec![
                TopDefectLine {
                    line_id: "L-02".to_owned(),
                    total_defects: 5,
                    event_count: 1,
                    defects_percent: 500.0,
                },
                TopDefectLine {
                    line_id: "L-01".to_owned(),
                    total_defects: 2,
                    event_count: 2,
                    defects_percent: 100.0,
                },
            ]
        );
    }

    #[tokio::test]
    async fn zero_limit_returns_no_lines() {
        let (service, _, _) = service();
        service.process_batch(vec![record("E-1", 1)]).await.unwrap();

        let lines = service
            .top_defect_lines("F-01", now() - Duration::hours(1), now(), 0)
            .await
            .unwrap();

        assert!(lines.is_empty());
    }

    struct FailingStore;

    fn unavailable() -> StoreError {
        StoreError::ConnectionError {
            error: sqlx::Error::PoolTimedOut,
        }
    }

    #[async_trait]
    impl EventStore for FailingStore {
        async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>> {
            Err(unavailable())
        }

        async fn query_stats(
            &self,
            _machine_id: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> StoreResult<StatsAggregate> {
            Err(unavailable())
        }

        async fn query_top_lines(
            &self,
            _factory_id: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            _limit: usize,
        ) -> StoreResult<Vec<LineAggregate>> {
            Err(unavailable())
        }
    }

    struct FailingWrites {
        inner: MemoryEventStore,
    }

    struct FailingWritesTransaction {
        inner: Box<dyn EventTransaction>,
    }

    #[async_trait]
    impl EventTransaction for FailingWritesTransaction {
        async fn get_by_keys(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>> {
            self.inner.get_by_keys(ids).await
        }

        async fn put_all(&mut self, _events: &[Event]) -> StoreResult<u64> {
            Err(StoreError::QueryError {
                command: "INSERT".to_owned(),
                error: sqlx::Error::PoolTimedOut,
            })
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            self.inner.commit().await
        }
    }

    #[async_trait]
    impl EventStore for FailingWrites {
        async fn begin(&self) -> StoreResult<Box<dyn EventTransaction>> {
            Ok(Box::new(FailingWritesTransaction {
                inner: self.inner.begin().await?,
            }))
        }

        async fn query_stats(
            &self,
            machine_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StoreResult<StatsAggregate> {
            self.inner.query_stats(machine_id, start, end).await
        }

        async fn query_top_lines(
            &self,
            factory_id: &str,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            limit: usize,
        ) -> StoreResult<Vec<LineAggregate>> {
            self.inner.query_top_lines(factory_id, from, to, limit).await
        }
    }

    #[tokio::test]
    async fn store_failures_are_errors_not_empty_results() {
        let service = EventService::new(FailingStore, FixedTime::new(now()));

        assert!(service.process_batch(vec![record("E-1", 1)]).await.is_err());
        assert!(service
            .stats("M-001", now() - Duration::hours(1), now())
            .await
            .is_err());
        assert!(service
            .top_defect_lines("F-01", now() - Duration::hours(1), now(), 5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn fully_rejected_batch_does_not_touch_the_store() {
        let service = EventService::new(FailingStore, FixedTime::new(now()));
        let mut bad = record("E-1", 1);
        bad.duration_ms = -1;

        let response = service.process_batch(vec![bad]).await.unwrap();

        assert_eq!(response.rejected, 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_store_untouched() {
        let store = MemoryEventStore::new();
        let service = EventService::new(
            FailingWrites {
                inner: store.clone(),
            },
            FixedTime::new(now()),
        );

        let result = service
            .process_batch(vec![record("E-1", 1), record("E-2", 1)])
            .await;

        assert!(matches!(result, Err(StoreError::QueryError { .. })));
        assert!(store.is_empty().await);
    }
}
