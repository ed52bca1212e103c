use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;

use factory_common::service::EventService;
use factory_common::stats::MachineStats;
use factory_common::timestamp;
use factory_common::top_lines::TopDefectLine;

use crate::error::ApiError;

const DEFAULT_TOP_LINES_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    machine_id: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    start: DateTime<Utc>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopLinesQuery {
    factory_id: String,
    #[serde(deserialize_with = "timestamp::deserialize")]
    from: DateTime<Utc>,
    #[serde(deserialize_with = "timestamp::deserialize")]
    to: DateTime<Utc>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_TOP_LINES_LIMIT
}

#[instrument(skip_all, fields(machine_id = %query.machine_id))]
pub async fn get_stats(
    State(service): State<EventService>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<MachineStats>, ApiError> {
    let stats = service
        .stats(&query.machine_id, query.start, query.end)
        .await?;

    Ok(Json(stats))
}

#[instrument(skip_all, fields(factory_id = %query.factory_id, limit = query.limit))]
pub async fn get_top_defect_lines(
    State(service): State<EventService>,
    Query(query): Query<TopLinesQuery>,
) -> Result<Json<Vec<TopDefectLine>>, ApiError> {
    let lines = service
        .top_defect_lines(&query.factory_id, query.from, query.to, query.limit)
        .await?;

    Ok(Json(lines))
}
