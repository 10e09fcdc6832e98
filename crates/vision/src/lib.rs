//! Screen parsing pipeline with GPU residency management for the caption model.
//!
//! The crate is split into focused modules:
//! - `config`: parser configuration from CLI flags or JSON.
//! - `backend`: interfaces to the detection, OCR and captioning collaborators.
//! - `residency`: the guarded model owner and its idle eviction timer.
//! - `executor`: one OCR + labeling pass over a decoded image.
//! - `parser`: the base64-in, parsed-content-out entry point.
//! - `telemetry`: tracing subscriber, Chrome traces and Prometheus metrics.
//! - `error`: failure taxonomy surfaced to callers.

pub use backend::{
    BoundingBox, BoxFormat, ElementKind, LabelRequest, LabeledScreen, OcrOptions, OcrRegions,
    ParsedElement, VisionBackend,
};
pub use config::{
    ParserCliArgs, ParserConfig, ResidencyMode, ResidencySettings, TelemetryOptions,
};
pub use error::{ImageDecodeError, PipelineError, PipelineStage, VisionError};
pub use executor::{BOX_OVERLAY_REFERENCE_PX, DrawBoxConfig, ParseOutput, PipelineOptions};
pub use parser::{ScreenParser, decode_image};
pub use residency::{IdleEvictionTimer, ResidencyController};

pub use ml_core;

mod backend;
mod config;
mod error;
mod executor;
mod parser;
pub mod residency;
pub mod telemetry;
