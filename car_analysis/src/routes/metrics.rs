use crate::{
    model_service::{Captioner, Detector},
    server::SharedState,
};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<D: Detector, C: Captioner>(
    State(state): State<SharedState<D, C>>,
) -> Response {
    let metric_families = state.metrics.registry.gather();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {:?}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}
