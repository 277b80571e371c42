mod analyzer;
mod bounding_box;
mod image_utils;
mod model_service;
mod onnx;
mod ort_captioner;
mod ort_detector;
mod red_cars;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;

pub use analyzer::{AnalysisError, AnalysisResult, ImageAnalyzer};
pub use app::start_app;
pub use bounding_box::Detection;
pub use model_service::{Captioner, Detector, ModelError};
