use crate::{
    bounding_box::Detection,
    config::AnalysisConfig,
    image_utils::decode_rgb,
    model_service::{Captioner, Detector, ModelError},
    red_cars::{count_red_cars, HeuristicError},
};
use image::{ImageError, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub total_cars: u32,
    pub red_cars: u32,
    pub description: String,
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Error decoding image: {0}")]
    Decode(#[from] ImageError),
    #[error("Error detecting red cars: {0}")]
    RedCars(#[from] HeuristicError),
    #[error("Error detecting cars: {0}")]
    Detection(#[source] ModelError),
    #[error("Error generating caption: {0}")]
    Caption(#[source] ModelError),
}

/// Decode, detect, colour-classify and caption one uploaded image.
#[derive(Clone)]
pub struct ImageAnalyzer<D: Detector, C: Captioner> {
    detector: Arc<D>,
    captioner: Arc<C>,
    car_class_id: u32,
}

impl<D: Detector, C: Captioner> ImageAnalyzer<D, C> {
    pub fn new(detector: D, captioner: C, config: &AnalysisConfig) -> Self {
        Self {
            detector: Arc::new(detector),
            captioner: Arc::new(captioner),
            car_class_id: config.car_class_id,
        }
    }

    /// Nothing is sent to the models unless the bytes decode.
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub async fn analyze(&self, image_data: &[u8]) -> Result<AnalysisResult, AnalysisError> {
        let image = Arc::new(decode_rgb(image_data)?);
        tracing::debug!("Decoded {}x{} image", image.width(), image.height());

        // Detection-side errors take precedence over caption errors.
        let (cars, description) =
            tokio::join!(self.count_cars(image.clone()), self.caption(image));
        let (total_cars, red_cars) = cars?;
        let description = description?;

        tracing::info!(total_cars, red_cars, "Image analysed");

        Ok(AnalysisResult {
            total_cars,
            red_cars,
            description,
        })
    }

    async fn count_cars(&self, image: Arc<RgbImage>) -> Result<(u32, u32), AnalysisError> {
        let detections = self
            .detector
            .detect(image.clone())
            .await
            .map_err(AnalysisError::Detection)?;

        let cars = select_class(detections, self.car_class_id);
        let red_cars = count_red_cars(&image, &cars)?;

        Ok((cars.len() as u32, red_cars))
    }

    async fn caption(&self, image: Arc<RgbImage>) -> Result<String, AnalysisError> {
        self.captioner
            .caption(image)
            .await
            .map_err(AnalysisError::Caption)
    }
}

fn select_class(detections: Vec<Detection>, class_id: u32) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|detection| detection.class_id == class_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_utils::encode_png;
    use crate::model_service::mocks::{MockCaptioner, MockDetector};
    use image::Rgb;
    use std::time::Duration;

    fn detection(class_id: u32, x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            class_id,
            confidence: 0.9,
            x1,
            y1,
            x2,
            y2,
        }
    }

    /// Left half red, right half blue.
    fn street_png() -> Vec<u8> {
        let mut img = RgbImage::from_pixel(100, 60, Rgb([20, 40, 220]));
        for y in 0..60 {
            for x in 0..50 {
                img.put_pixel(x, y, Rgb([220, 30, 30]));
            }
        }
        encode_png(&img)
    }

    fn analyzer(
        detector: MockDetector,
        captioner: MockCaptioner,
    ) -> ImageAnalyzer<MockDetector, MockCaptioner> {
        ImageAnalyzer::new(detector, captioner, &AnalysisConfig::default())
    }

    #[tokio::test]
    async fn test_counts_only_cars() {
        let detector = MockDetector::with_detections(vec![
            detection(2, 0.0, 0.0, 50.0, 60.0),
            detection(2, 50.0, 0.0, 100.0, 60.0),
            detection(2, 10.0, 10.0, 40.0, 50.0),
            detection(0, 0.0, 0.0, 50.0, 60.0),
        ]);
        let analyzer = analyzer(detector, MockCaptioner::with_caption("two cars on a road"));

        let result = analyzer.analyze(&street_png()).await.unwrap();

        assert_eq!(
            result,
            AnalysisResult {
                total_cars: 3,
                red_cars: 2,
                description: "two cars on a road".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_car_class_is_configurable() {
        let detector = MockDetector::with_detections(vec![
            detection(2, 0.0, 0.0, 50.0, 60.0),
            detection(7, 0.0, 0.0, 50.0, 60.0),
        ]);
        let analyzer = ImageAnalyzer::new(
            detector,
            MockCaptioner::default(),
            &AnalysisConfig { car_class_id: 7 },
        );

        let result = analyzer.analyze(&street_png()).await.unwrap();

        assert_eq!(result.total_cars, 1);
        assert_eq!(result.red_cars, 1);
        assert_eq!(result.description, "");
    }

    #[tokio::test]
    async fn test_undecodable_image_skips_models() {
        let detector = MockDetector::default();
        let captioner = MockCaptioner::default();
        let analyzer = analyzer(detector.clone(), captioner.clone());

        let err = analyzer.analyze(b"\x89PNG broken").await.unwrap_err();

        assert!(matches!(err, AnalysisError::Decode(_)));
        assert!(!err.to_string().is_empty());
        assert_eq!(detector.calls(), 0);
        assert_eq!(captioner.calls(), 0);
    }

    #[tokio::test]
    async fn test_detector_failure() {
        let analyzer = analyzer(MockDetector::failing(), MockCaptioner::default());

        let err = analyzer.analyze(&street_png()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::Detection(_)));
    }

    #[tokio::test]
    async fn test_captioner_failure() {
        let analyzer = analyzer(MockDetector::default(), MockCaptioner::failing());

        let err = analyzer.analyze(&street_png()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::Caption(_)));
    }

    #[tokio::test]
    async fn test_detection_error_wins_over_caption_error() {
        let slow_detector =
            MockDetector::with_detections(vec![detection(2, f32::NAN, 0.0, 5.0, 5.0)])
                .with_delay(Duration::from_millis(50));
        let heuristic_first = analyzer(slow_detector.clone(), MockCaptioner::failing());

        let err = heuristic_first.analyze(&street_png()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::RedCars(_)));
        assert_eq!(slow_detector.calls(), 1);

        let slow_failing = MockDetector::failing().with_delay(Duration::from_millis(50));
        let detector_first = analyzer(slow_failing, MockCaptioner::failing());

        let err = detector_first.analyze(&street_png()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::Detection(_)));
    }

    #[tokio::test]
    async fn test_malformed_box_is_a_heuristic_error() {
        let detector = MockDetector::with_detections(vec![detection(2, f32::NAN, 0.0, 5.0, 5.0)]);
        let analyzer = analyzer(detector, MockCaptioner::default());

        let err = analyzer.analyze(&street_png()).await.unwrap_err();

        assert!(matches!(err, AnalysisError::RedCars(_)));
    }

    #[tokio::test]
    async fn test_zero_area_car_is_counted_but_not_red() {
        let detector = MockDetector::with_detections(vec![detection(2, 10.0, 10.0, 10.0, 40.0)]);
        let analyzer = analyzer(detector, MockCaptioner::default());

        let result = analyzer.analyze(&street_png()).await.unwrap();

        assert_eq!(result.total_cars, 1);
        assert_eq!(result.red_cars, 0);
    }

    #[test]
    fn test_select_class() {
        let detections = vec![
            detection(2, 0.0, 0.0, 1.0, 1.0),
            detection(3, 0.0, 0.0, 1.0, 1.0),
            detection(2, 1.0, 1.0, 2.0, 2.0),
        ];

        let cars = select_class(detections, 2);

        assert_eq!(cars.len(), 2);
        assert!(cars.iter().all(|car| car.class_id == 2));
    }
}
