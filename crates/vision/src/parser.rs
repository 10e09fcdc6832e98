//! Public entry point: decode a base64 screenshot and parse it under the
//! residency controller's guard.

use std::{sync::Arc, time::Instant};

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, GenericImageView};
use ml_core::{DeviceAllocator, DeviceTransferOps};
use tracing::{debug, info};

use crate::{
    backend::VisionBackend,
    config::ParserConfig,
    error::{ImageDecodeError, VisionError},
    executor::{ParseOutput, WorkloadExecutor},
    residency::ResidencyController,
};

/// Screen parser owning the detector, the caption model and its residency.
pub struct ScreenParser<B: VisionBackend>
where
    B::Captioner: 'static,
{
    controller: ResidencyController<B::Captioner>,
    executor: WorkloadExecutor<B>,
}

impl<B: VisionBackend> ScreenParser<B>
where
    B::Captioner: 'static,
{
    /// Load both models and place the caption model per the configured mode.
    pub fn new(
        config: &ParserConfig,
        backend: B,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self, VisionError> {
        config
            .validate()
            .map_err(|err| VisionError::initialization("parser configuration", err))?;

        let detector = backend
            .load_detector(&config.detector_model_path)
            .map_err(|err| VisionError::initialization("icon detector", err))?;

        let controller = ResidencyController::new(
            config.residency(),
            DeviceTransferOps::new(allocator),
            |tier| {
                backend.load_captioner(&config.caption_model_name, &config.caption_model_path, tier)
            },
        )?;

        let executor = WorkloadExecutor::new(backend, detector, config.pipeline_options());
        info!(
            "screen parser initialised (caption model {} on {})",
            config.caption_model_name,
            controller.location()
        );
        Ok(Self {
            controller,
            executor,
        })
    }

    /// Parse a base64-encoded screenshot.
    ///
    /// Decoding happens before the guard is taken, so malformed input never
    /// waits on or disturbs the caption model.
    pub fn parse(&self, image_base64: &str) -> Result<ParseOutput, VisionError> {
        let start = Instant::now();
        let result = decode_image(image_base64)
            .map_err(VisionError::from)
            .and_then(|image| {
                let (width, height) = image.dimensions();
                debug!("image size: {width}x{height}");
                self.controller
                    .run(|captioner| self.executor.execute(&image, captioner))
            });

        match &result {
            Ok(_) => {
                metrics::histogram!("vision_parse_seconds").record(start.elapsed().as_secs_f64());
            }
            Err(err) => {
                metrics::counter!("vision_parse_errors_total", "kind" => err.kind()).increment(1);
            }
        }
        result
    }

    pub fn controller(&self) -> &ResidencyController<B::Captioner> {
        &self.controller
    }
}

/// Decode base64 (standard alphabet) into an image, sniffing the container
/// format. ASCII whitespace anywhere in the input is ignored, so MIME-style
/// line-wrapped payloads decode too.
pub fn decode_image(image_base64: &str) -> Result<DynamicImage, ImageDecodeError> {
    let compact: Vec<u8> = image_base64
        .bytes()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD.decode(&compact)?;
    Ok(image::load_from_memory(&bytes)?)
}
