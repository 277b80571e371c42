use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    pub detector: DetectorConfig,
    pub captioner: CaptionerConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    TensorRt,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub execution_provider: ExecutionProvider,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    4
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::default(),
            intra_threads: default_intra_threads(),
        }
    }
}

/// Class identifiers are those of the detector's label set (COCO for YOLO).
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_car_class_id")]
    pub car_class_id: u32,
}

fn default_car_class_id() -> u32 {
    2
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            car_class_id: default_car_class_id(),
        }
    }
}

/// Shape of the detector's `output0` tensor.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// `[1, N, 6]` rows of `x1, y1, x2, y2, score, class`, already suppressed (YOLOv10).
    #[default]
    EndToEnd,
    /// `[1, 4 + classes, anchors]` columns of `xc, yc, w, h, scores...` (YOLOv8).
    Anchors,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub model_dir: PathBuf,
    pub onnx_file: String,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_min_probability")]
    pub min_probability: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default)]
    pub output_layout: OutputLayout,
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_input_size() -> u32 {
    640
}

fn default_min_probability() -> f32 {
    0.25
}

fn default_iou_threshold() -> f32 {
    0.7
}

impl DetectorConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }
}

impl Validatable for DetectorConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Detector model file not found: {:?}", self.get_path()));
        }
        if self.num_instances == 0 {
            return Err("detector.num_instances must be at least 1".into());
        }
        if self.input_size == 0 {
            return Err("detector.input_size must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.min_probability) {
            return Err(format!(
                "detector.min_probability must be within [0, 1], got {}",
                self.min_probability
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(format!(
                "detector.iou_threshold must be within [0, 1], got {}",
                self.iou_threshold
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptionerConfig {
    pub model_dir: PathBuf,
    pub vision_onnx_file: String,
    pub decoder_onnx_file: String,
    #[serde(default = "default_tokenizer_file")]
    pub tokenizer_file: String,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    /// Caption length limit in tokens, including the start token.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
}

fn default_tokenizer_file() -> String {
    "tokenizer.json".into()
}

fn default_image_size() -> u32 {
    384
}

fn default_max_tokens() -> usize {
    20
}

// BLIP decodes from `[DEC]` and stops on `[SEP]`.
fn default_bos_token_id() -> u32 {
    30522
}

fn default_eos_token_id() -> u32 {
    102
}

impl CaptionerConfig {
    pub fn get_vision_path(&self) -> PathBuf {
        self.model_dir.join(&self.vision_onnx_file)
    }

    pub fn get_decoder_path(&self) -> PathBuf {
        self.model_dir.join(&self.decoder_onnx_file)
    }

    pub fn get_tokenizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.tokenizer_file)
    }
}

impl Validatable for CaptionerConfig {
    fn validate(&self) -> Result<(), String> {
        for path in [
            self.get_vision_path(),
            self.get_decoder_path(),
            self.get_tokenizer_path(),
        ] {
            if !path.exists() {
                return Err(format!("Captioner file not found: {:?}", path));
            }
        }
        if self.image_size == 0 {
            return Err("captioner.image_size must be positive".into());
        }
        if self.max_tokens < 2 {
            return Err("captioner.max_tokens must be at least 2 (it counts the start token)".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    get_configuration_from(&configuration_directory, environment)
}

pub fn get_configuration_from(
    configuration_directory: &Path,
    environment: Environment,
) -> Result<Config, config::ConfigError> {
    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    let validations = [config.detector.validate(), config.captioner.validate()];
    for result in validations {
        if let Err(e) = result {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}
