use axum::{extract::State, Json};
use tracing::{debug, instrument};

use factory_common::event::{BatchResponse, EventRecord};
use factory_common::service::EventService;

use crate::error::ApiError;

/// Ingest one batch of machine events.
///
/// A `null` body is treated like an empty batch.
#[instrument(skip_all, fields(batch_size))]
pub async fn post_batch(
    State(service): State<EventService>,
    Json(records): Json<Option<Vec<EventRecord>>>,
) -> Result<Json<BatchResponse>, ApiError> {
    let records = records.unwrap_or_default();
    tracing::Span::current().record("batch_size", records.len());

    if records.is_empty() {
        debug!("rejecting empty batch");
        return Err(ApiError::EmptyBatch);
    }

    let response = service.process_batch(records).await?;

    Ok(Json(response))
}
