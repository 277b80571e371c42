use crate::{
    analyzer::{AnalysisError, AnalysisResult},
    model_service::{Captioner, Detector},
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tracing::instrument;

pub const ANALYZE_IMAGE_ROUTE: &str = "/analyze-image/";
const IMAGE_FIELD: &str = "image";

#[derive(Serialize)]
struct ErrorDetail {
    detail: String,
}

#[derive(Error, Debug)]
pub enum AnalyzeImageError {
    #[error("Invalid multipart payload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing form field `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl AnalyzeImageError {
    fn status_code(&self) -> StatusCode {
        match self {
            AnalyzeImageError::Multipart(_) | AnalyzeImageError::MissingField(_) => {
                StatusCode::BAD_REQUEST
            }
            AnalyzeImageError::Analysis(err) => match err {
                AnalysisError::Decode(_) | AnalysisError::RedCars(_) => StatusCode::BAD_REQUEST,
                AnalysisError::Detection(_) | AnalysisError::Caption(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AnalyzeImageError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Image analysis failed: {:?}", self);
        } else {
            tracing::warn!("Rejected image analysis request: {}", self);
        }
        (
            status,
            Json(ErrorDetail {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, AnalyzeImageError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }
    Err(AnalyzeImageError::MissingField(IMAGE_FIELD))
}

#[instrument(skip(state, multipart))]
pub async fn analyze_image<D: Detector, C: Captioner>(
    State(state): State<SharedState<D, C>>,
    mut multipart: Multipart,
) -> Result<Json<AnalysisResult>, AnalyzeImageError> {
    state.metrics.record_request(ANALYZE_IMAGE_ROUTE);

    let image_data = read_image_field(&mut multipart).await?;

    let start = Instant::now();
    let result = state.analyzer.analyze(&image_data).await;
    state
        .metrics
        .record_analysis_duration(start.elapsed().as_millis() as u64, ANALYZE_IMAGE_ROUTE);

    let result = result?;
    state.metrics.record_cars(result.total_cars, result.red_cars);

    Ok(Json(result))
}
