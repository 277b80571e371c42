mod analyze_image;
mod health;
mod metrics;

use crate::{
    model_service::{Captioner, Detector},
    server::SharedState,
};
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes<D: Detector, C: Captioner>() -> Router<SharedState<D, C>> {
    Router::new()
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<D, C>))
        .route(
            analyze_image::ANALYZE_IMAGE_ROUTE,
            post(analyze_image::analyze_image::<D, C>),
        )
}
