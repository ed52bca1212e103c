use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use factory_common::store::StoreError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request holds no event")]
    EmptyBatch,

    #[error("event store unavailable, please retry")]
    StoreUnavailable(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::EmptyBatch => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
