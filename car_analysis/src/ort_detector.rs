use crate::{
    bounding_box::Detection,
    config::{DetectorConfig, OutputLayout, RuntimeConfig},
    image_utils::to_nchw_tensor,
    model_service::{Detector, ModelError},
    onnx::{load_session, require_output},
};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::{Array, ArrayD, ArrayView2, Axis, Ix3, Ix4};
use ort::{session::Session, value::TensorRef};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Rows of `x1, y1, x2, y2, score, class`.
fn decode_end_to_end(
    rows: ArrayView2<f32>,
    min_probability: f32,
) -> Result<Vec<Detection>, ModelError> {
    if rows.ncols() < 6 {
        return Err(ModelError::Output(format!(
            "expected 6 values per detection, got {}",
            rows.ncols()
        )));
    }

    Ok(rows
        .outer_iter()
        .filter(|row| row[4] >= min_probability)
        .map(|row| Detection {
            class_id: row[5].max(0.0) as u32,
            confidence: row[4],
            x1: row[0],
            y1: row[1],
            x2: row[2],
            y2: row[3],
        })
        .collect())
}

/// Columns of `xc, yc, w, h` followed by one score per class.
fn decode_anchors(
    predictions: ArrayView2<f32>,
    min_probability: f32,
) -> Result<Vec<Detection>, ModelError> {
    if predictions.nrows() <= 4 {
        return Err(ModelError::Output(format!(
            "expected box and class rows, got {} rows",
            predictions.nrows()
        )));
    }

    let mut boxes = Vec::new();
    for anchor in predictions.axis_iter(Axis(1)) {
        let Some((class_id, prob)) = anchor
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
        else {
            continue;
        };

        if prob < min_probability {
            continue;
        }

        let (xc, yc, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        boxes.push(Detection {
            class_id: class_id as u32,
            confidence: prob,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(boxes)
}

/// Greedy, class-agnostic suppression keeping the most confident box of each cluster.
fn non_max_suppression(mut boxes: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result = Vec::new();
    while !boxes.is_empty() {
        let best = boxes.remove(0);
        boxes.retain(|candidate| best.iou(candidate) < iou_threshold);
        result.push(best);
    }
    result
}

#[derive(Clone)]
pub struct OrtDetector {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_size: u32,
    min_probability: f32,
    iou_threshold: f32,
    output_layout: OutputLayout,
}

impl OrtDetector {
    pub fn new(config: &DetectorConfig, runtime: &RuntimeConfig) -> Result<Self, ort::Error> {
        let num_instances = config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = load_session(&config.get_path(), runtime)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} detector sessions from {:?}",
            num_instances,
            config.get_path()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            input_size: config.input_size,
            min_probability: config.min_probability,
            iou_threshold: config.iou_threshold,
            output_layout: config.output_layout,
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, ModelError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|_| ModelError::Poisoned)?;

        tracing::debug!("Handling request with detector session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;
        let output = require_output(outputs.get("output0"), "output0")?
            .try_extract_array::<f32>()?
            .to_owned();

        Ok(output)
    }

    fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>, ModelError> {
        let input = to_nchw_tensor(image, self.input_size, |_, value| value as f32 / 255.);
        let output = self.run_inference(&input)?.into_dimensionality::<Ix3>()?;
        if output.shape()[0] == 0 {
            return Err(ModelError::Output("detector returned an empty batch".into()));
        }
        let output = output.index_axis(Axis(0), 0);

        let candidates = match self.output_layout {
            OutputLayout::EndToEnd => decode_end_to_end(output, self.min_probability)?,
            OutputLayout::Anchors => non_max_suppression(
                decode_anchors(output, self.min_probability)?,
                self.iou_threshold,
            ),
        };

        let (width, height) = image.dimensions();
        let scale_x = width as f32 / self.input_size as f32;
        let scale_y = height as f32 / self.input_size as f32;
        let detections: Vec<Detection> = candidates
            .iter()
            .map(|candidate| candidate.rescaled(scale_x, scale_y, width, height))
            .collect();

        tracing::debug!("Returning {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
        }

        Ok(detections)
    }
}

#[async_trait]
impl Detector for OrtDetector {
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<Detection>, ModelError> {
        let detector = self.clone();
        tokio::task::spawn_blocking(move || detector.infer(&image)).await?
    }
}
