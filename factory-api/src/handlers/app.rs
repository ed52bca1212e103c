use std::convert::Infallible;

use axum::{extract::DefaultBodyLimit, middleware, routing, Router};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use factory_common::metrics::track_metrics;
use factory_common::service::EventService;

use super::{events, stats};

pub fn add_routes(
    router: Router,
    service: EventService,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index)) // No background loop to check, only axum health
        .route(
            "/events/batch",
            routing::post(events::post_batch)
                .with_state(service.clone())
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/stats",
            routing::get(stats::get_stats).with_state(service.clone()),
        )
        .route(
            "/stats/top-defect-lines",
            routing::get(stats::get_top_defect_lines).with_state(service),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(track_metrics))
}

pub async fn index() -> &'static str {
    "factory events api"
}
