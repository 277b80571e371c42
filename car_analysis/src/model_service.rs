use crate::bounding_box::Detection;
use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("onnx runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("session mutex poisoned")]
    Poisoned,
    #[error("inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ndarray::ShapeError> for ModelError {
    fn from(err: ndarray::ShapeError) -> Self {
        ModelError::Output(err.to_string())
    }
}

/// Object detector. Returns every detection regardless of class.
#[async_trait]
pub trait Detector: Send + Sync + Clone + 'static {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<Detection>, ModelError>;
}

/// Whole-image caption generator.
#[async_trait]
pub trait Captioner: Send + Sync + Clone + 'static {
    async fn caption(&self, image: Arc<RgbImage>) -> Result<String, ModelError>;
}

#[cfg(test)]
pub(crate) mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    pub struct MockDetector {
        pub detections: Vec<Detection>,
        pub fail: bool,
        pub delay: Option<Duration>,
        pub calls: Arc<AtomicUsize>,
    }

    impl MockDetector {
        pub fn with_detections(detections: Vec<Detection>) -> Self {
            Self {
                detections,
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn with_delay(self, delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..self
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Detector for MockDetector {
        async fn detect(&self, _image: Arc<RgbImage>) -> Result<Vec<Detection>, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ModelError::Output("detector exploded".into()));
            }
            Ok(self.detections.clone())
        }
    }

    #[derive(Clone, Default)]
    pub struct MockCaptioner {
        pub caption: String,
        pub fail: bool,
        pub calls: Arc<AtomicUsize>,
    }

    impl MockCaptioner {
        pub fn with_caption(caption: &str) -> Self {
            Self {
                caption: caption.to_string(),
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Captioner for MockCaptioner {
        async fn caption(&self, _image: Arc<RgbImage>) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModelError::Tokenizer("captioner exploded".into()));
            }
            Ok(self.caption.clone())
        }
    }
}
