//! BLIP-style image captioning on ONNX Runtime.
//!
//! The model is exported as two graphs: a vision transformer mapping
//! `pixel_values` to `last_hidden_state`, and a text decoder mapping
//! `input_ids`, `attention_mask` and `encoder_hidden_states` to `logits`.
//! Captions are decoded greedily, one token per decoder pass.

use crate::{
    config::{CaptionerConfig, RuntimeConfig},
    image_utils::to_nchw_tensor,
    model_service::{Captioner, ModelError},
    onnx::{load_session, require_output},
};
use anyhow::Context;
use async_trait::async_trait;
use image::RgbImage;
use ndarray::{s, Array2, Array3, Array4, Ix3};
use ort::{
    session::Session,
    value::{Tensor, TensorRef},
};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

/// CLIP normalisation constants used by the BLIP image processor.
pub const IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

fn pixel_values(image: &RgbImage, image_size: u32) -> Array4<f32> {
    to_nchw_tensor(image, image_size, |channel, value| {
        (value as f32 / 255. - IMAGE_MEAN[channel]) / IMAGE_STD[channel]
    })
}

fn argmax(logits: &[f32]) -> Option<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(index, _)| index as u32)
}

/// Greedy decoding from `bos`. `max_length` counts the leading `bos`, so at
/// most `max_length - 1` tokens are generated. The stopping `eos` is not kept.
fn greedy_decode<F>(
    bos: u32,
    eos: u32,
    max_length: usize,
    mut next_logits: F,
) -> Result<Vec<u32>, ModelError>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>, ModelError>,
{
    let mut tokens = vec![bos];

    while tokens.len() < max_length {
        let logits = next_logits(&tokens)?;
        let next_token = argmax(&logits)
            .ok_or_else(|| ModelError::Output("decoder returned empty logits".into()))?;
        if next_token == eos {
            break;
        }
        tokens.push(next_token);
    }

    Ok(tokens)
}

#[derive(Clone)]
pub struct OrtCaptioner {
    vision: Arc<Mutex<Session>>,
    decoder: Arc<Mutex<Session>>,
    tokenizer: Arc<Tokenizer>,
    image_size: u32,
    max_tokens: usize,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl OrtCaptioner {
    pub fn new(config: &CaptionerConfig, runtime: &RuntimeConfig) -> anyhow::Result<Self> {
        let tokenizer = Tokenizer::from_file(config.get_tokenizer_path())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let vision = load_session(&config.get_vision_path(), runtime).with_context(|| {
            format!(
                "Failed to load vision model from {:?}",
                config.get_vision_path()
            )
        })?;
        let decoder = load_session(&config.get_decoder_path(), runtime).with_context(|| {
            format!(
                "Failed to load text decoder from {:?}",
                config.get_decoder_path()
            )
        })?;

        tracing::info!(
            "Loaded captioner from {:?} ({} tokens in vocabulary)",
            config.model_dir,
            tokenizer.get_vocab_size(true)
        );

        Ok(Self {
            vision: Arc::new(Mutex::new(vision)),
            decoder: Arc::new(Mutex::new(decoder)),
            tokenizer: Arc::new(tokenizer),
            image_size: config.image_size,
            max_tokens: config.max_tokens,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
        })
    }

    fn encode_image(&self, image: &RgbImage) -> Result<Array3<f32>, ModelError> {
        let input = Tensor::from_array(pixel_values(image, self.image_size))?;
        let mut session = self.vision.lock().map_err(|_| ModelError::Poisoned)?;
        let outputs = session.run(ort::inputs!["pixel_values" => input])?;
        let hidden_states = require_output(outputs.get("last_hidden_state"), "last_hidden_state")?
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<Ix3>()?;

        Ok(hidden_states)
    }

    fn next_token_logits(
        &self,
        hidden_states: &Array3<f32>,
        tokens: &[u32],
    ) -> Result<Vec<f32>, ModelError> {
        let len = tokens.len();
        let input_ids =
            Array2::from_shape_vec((1, len), tokens.iter().map(|&t| t as i64).collect())?;
        let attention_mask = Array2::<i64>::ones((1, len));

        let mut session = self.decoder.lock().map_err(|_| ModelError::Poisoned)?;
        let outputs = session.run(ort::inputs![
            "input_ids" => Tensor::from_array(input_ids)?,
            "attention_mask" => Tensor::from_array(attention_mask)?,
            "encoder_hidden_states" => TensorRef::from_array_view(hidden_states.view())?,
        ])?;
        let logits = require_output(outputs.get("logits"), "logits")?
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?;

        if logits.shape()[1] != len {
            return Err(ModelError::Output(format!(
                "decoder returned logits for {} positions, expected {}",
                logits.shape()[1],
                len
            )));
        }

        Ok(logits.slice(s![0, len - 1, ..]).to_vec())
    }

    fn generate(&self, hidden_states: &Array3<f32>) -> Result<String, ModelError> {
        let tokens = greedy_decode(
            self.bos_token_id,
            self.eos_token_id,
            self.max_tokens,
            |tokens| self.next_token_logits(hidden_states, tokens),
        )?;

        tracing::debug!("Generated {} caption tokens", tokens.len() - 1);

        let caption = self
            .tokenizer
            .decode(&tokens, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;

        Ok(caption.trim().to_string())
    }

    fn describe(&self, image: &RgbImage) -> Result<String, ModelError> {
        let hidden_states = self.encode_image(image)?;
        self.generate(&hidden_states)
    }
}

#[async_trait]
impl Captioner for OrtCaptioner {
    async fn caption(&self, image: Arc<RgbImage>) -> Result<String, ModelError> {
        let captioner = self.clone();
        tokio::task::spawn_blocking(move || captioner.describe(&image)).await?
    }
}
