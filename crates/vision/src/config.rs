//! Configuration for the screen parser.
//!
//! Everything the parser needs is captured once in a `ParserConfig` value,
//! built either from CLI flags (`ParserCliArgs`) or from a JSON document.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::executor::PipelineOptions;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BATCH_SIZE: usize = 128;
const DEFAULT_BOX_THRESHOLD: f32 = 0.05;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_OCR_TEXT_THRESHOLD: f32 = 0.8;
const DEFAULT_CAPTION_MODEL: &str = "florence2";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
/// Policy deciding when the caption model may occupy accelerator memory.
pub enum ResidencyMode {
    /// Load onto the device once and keep it there.
    #[default]
    #[serde(rename = "persistent")]
    #[value(name = "persistent")]
    Persistent,
    /// Keep on the host, move to the device per request, offload when idle.
    #[serde(rename = "ondemand")]
    #[value(name = "ondemand", alias = "on-demand")]
    OnDemand,
    /// Never use the device.
    #[serde(rename = "cpu", alias = "host-only")]
    #[value(name = "cpu", alias = "host-only")]
    HostOnly,
}

impl ResidencyMode {
    pub fn label(self) -> &'static str {
        match self {
            ResidencyMode::Persistent => "persistent",
            ResidencyMode::OnDemand => "ondemand",
            ResidencyMode::HostOnly => "cpu",
        }
    }

    pub fn requires_device(self) -> bool {
        !matches!(self, ResidencyMode::HostOnly)
    }

    /// Mode actually applied given device availability at construction.
    pub fn resolve(self, device_available: bool) -> Self {
        if self.requires_device() && !device_available {
            ResidencyMode::HostOnly
        } else {
            self
        }
    }
}

impl fmt::Display for ResidencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ResidencyMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "persistent" => Ok(ResidencyMode::Persistent),
            "ondemand" | "on-demand" => Ok(ResidencyMode::OnDemand),
            "cpu" | "host-only" => Ok(ResidencyMode::HostOnly),
            other => Err(anyhow!(
                "unknown residency mode {other:?} (expected persistent, ondemand or cpu)"
            )),
        }
    }
}

/// Residency policy handed to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResidencySettings {
    pub mode: ResidencyMode,
    /// Quiet period before an on-demand model is offloaded. Zero offloads at
    /// the end of every request.
    pub idle_timeout: Duration,
}

impl ResidencySettings {
    pub fn new(mode: ResidencyMode, idle_timeout: Duration) -> Self {
        Self { mode, idle_timeout }
    }
}

/// Tracing options for the process hosting a parser, consumed by
/// `telemetry::enter_runtime`. Flatten next to `ParserCliArgs`.
#[derive(Clone, Debug, Default, Args)]
pub struct TelemetryOptions {
    /// Emit Chrome trace JSON of parser spans for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
/// Canonical configuration for a `ScreenParser`.
pub struct ParserConfig {
    #[serde(default)]
    pub residency_mode: ResidencyMode,
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Icon detector weights, passed unchanged to the backend.
    #[serde(alias = "som_model_path")]
    pub detector_model_path: PathBuf,
    #[serde(default = "default_caption_model_name")]
    pub caption_model_name: String,
    pub caption_model_path: PathBuf,
    /// Detector confidence threshold.
    #[serde(alias = "BOX_TRESHOLD", default = "default_box_threshold")]
    pub box_threshold: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_ocr_text_threshold")]
    pub ocr_text_threshold: f32,
}

fn default_idle_timeout_seconds() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_caption_model_name() -> String {
    DEFAULT_CAPTION_MODEL.to_string()
}

fn default_box_threshold() -> f32 {
    DEFAULT_BOX_THRESHOLD
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_iou_threshold() -> f32 {
    DEFAULT_IOU_THRESHOLD
}

fn default_ocr_text_threshold() -> f32 {
    DEFAULT_OCR_TEXT_THRESHOLD
}

impl ParserConfig {
    pub fn new(
        detector_model_path: impl Into<PathBuf>,
        caption_model_name: impl Into<String>,
        caption_model_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            residency_mode: ResidencyMode::default(),
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECS,
            detector_model_path: detector_model_path.into(),
            caption_model_name: caption_model_name.into(),
            caption_model_path: caption_model_path.into(),
            box_threshold: DEFAULT_BOX_THRESHOLD,
            batch_size: DEFAULT_BATCH_SIZE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            ocr_text_threshold: DEFAULT_OCR_TEXT_THRESHOLD,
        }
    }

    pub fn with_residency(mut self, mode: ResidencyMode, idle_timeout_seconds: u64) -> Self {
        self.residency_mode = mode;
        self.idle_timeout_seconds = idle_timeout_seconds;
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(document: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(document).context("invalid parser configuration document")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        for (name, value) in [
            ("box threshold", self.box_threshold),
            ("IoU threshold", self.iou_threshold),
            ("OCR text threshold", self.ocr_text_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.caption_model_name.trim().is_empty() {
            bail!("caption model name must not be empty");
        }
        Ok(())
    }

    pub fn residency(&self) -> ResidencySettings {
        ResidencySettings::new(
            self.residency_mode,
            Duration::from_secs(self.idle_timeout_seconds),
        )
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            box_threshold: self.box_threshold,
            batch_size: self.batch_size,
            iou_threshold: self.iou_threshold,
            ocr_text_threshold: self.ocr_text_threshold,
        }
    }
}

/// CLI arguments for embedding binaries; flatten into a `clap::Parser`.
#[derive(Debug, Args)]
pub struct ParserCliArgs {
    /// Where the caption model lives between requests.
    #[arg(long = "residency-mode", value_enum, default_value_t = ResidencyMode::Persistent)]
    pub residency_mode: ResidencyMode,
    /// Seconds without requests before an on-demand model is offloaded.
    #[arg(long = "idle-timeout", value_name = "SECONDS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_seconds: u64,
    /// Icon detector weights.
    #[arg(long = "detector-model", value_name = "PATH")]
    pub detector_model_path: PathBuf,
    /// Caption model family.
    #[arg(long = "caption-model-name", value_name = "NAME", default_value = DEFAULT_CAPTION_MODEL)]
    pub caption_model_name: String,
    /// Caption model weights.
    #[arg(long = "caption-model", value_name = "PATH")]
    pub caption_model_path: PathBuf,
    /// Detector confidence threshold (0-1).
    #[arg(long = "box-threshold", value_name = "SCORE")]
    pub box_threshold: Option<f32>,
    /// Caption batch size.
    #[arg(long = "batch-size", value_name = "N")]
    pub batch_size: Option<usize>,
}

impl TryFrom<ParserCliArgs> for ParserConfig {
    type Error = anyhow::Error;

    fn try_from(args: ParserCliArgs) -> Result<Self> {
        let mut config = ParserConfig::new(
            args.detector_model_path,
            args.caption_model_name,
            args.caption_model_path,
        )
        .with_residency(args.residency_mode, args.idle_timeout_seconds);

        if let Some(threshold) = args.box_threshold {
            config.box_threshold = threshold;
        }
        if let Some(batch_size) = args.batch_size {
            config.batch_size = batch_size;
        }
        config.validate()?;
        Ok(config)
    }
}
