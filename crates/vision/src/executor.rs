//! Runs the OCR and labeling collaborators for a single image.
//!
//! The executor assumes the caption model is already on the right tier; it is
//! only ever called from inside the residency controller's guarded section.

use std::io::Cursor;

use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::Serialize;
use tracing::debug;

use crate::{
    backend::{BoundingBox, BoxFormat, LabelRequest, OcrOptions, ParsedElement, VisionBackend},
    error::{PipelineError, PipelineStage},
};

/// Image side length at which overlay elements are drawn at unit scale.
pub const BOX_OVERLAY_REFERENCE_PX: f32 = 3200.0;

/// Overlay styling scaled to the image size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DrawBoxConfig {
    pub text_scale: f32,
    pub text_thickness: u32,
    pub text_padding: u32,
    pub thickness: u32,
}

impl DrawBoxConfig {
    pub fn for_dimensions(width: u32, height: u32) -> Self {
        let ratio = width.max(height) as f32 / BOX_OVERLAY_REFERENCE_PX;
        Self {
            text_scale: 0.8 * ratio,
            text_thickness: scaled_px(2.0, ratio),
            text_padding: scaled_px(3.0, ratio),
            thickness: scaled_px(3.0, ratio),
        }
    }
}

fn scaled_px(base: f32, ratio: f32) -> u32 {
    ((base * ratio) as u32).max(1)
}

/// Thresholds forwarded to the collaborators.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineOptions {
    pub box_threshold: f32,
    pub batch_size: usize,
    pub iou_threshold: f32,
    pub ocr_text_threshold: f32,
}

/// Result of parsing one screenshot.
#[derive(Clone, Debug)]
pub struct ParseOutput {
    pub annotated: DynamicImage,
    pub label_coordinates: Vec<BoundingBox>,
    pub parsed_content: Vec<ParsedElement>,
    pub draw_config: DrawBoxConfig,
}

impl ParseOutput {
    /// Annotated image as base64-encoded PNG.
    pub fn annotated_png_base64(&self) -> image::ImageResult<String> {
        let mut png = Cursor::new(Vec::new());
        self.annotated.write_to(&mut png, ImageFormat::Png)?;
        Ok(STANDARD.encode(png.into_inner()))
    }

    pub fn content_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.parsed_content)
    }
}

pub(crate) struct WorkloadExecutor<B: VisionBackend> {
    backend: B,
    detector: B::Detector,
    options: PipelineOptions,
}

impl<B: VisionBackend> WorkloadExecutor<B> {
    pub(crate) fn new(backend: B, detector: B::Detector, options: PipelineOptions) -> Self {
        Self {
            backend,
            detector,
            options,
        }
    }

    pub(crate) fn execute(
        &self,
        image: &DynamicImage,
        captioner: &B::Captioner,
    ) -> Result<ParseOutput, PipelineError> {
        let (width, height) = image.dimensions();
        let draw_config = DrawBoxConfig::for_dimensions(width, height);

        let ocr_options = OcrOptions {
            text_threshold: self.options.ocr_text_threshold,
            box_format: BoxFormat::Xyxy,
            use_paddleocr: false,
        };
        let ocr = self
            .backend
            .detect_text_regions(image, &ocr_options)
            .map_err(|err| PipelineError::new(PipelineStage::TextRegions, err))?;
        debug!("OCR found {} text region(s)", ocr.boxes.len());

        let labeled = self
            .backend
            .label_and_describe_elements(LabelRequest {
                image,
                detector: &self.detector,
                box_threshold: self.options.box_threshold,
                ocr_boxes: &ocr.boxes,
                draw_config: &draw_config,
                captioner,
                ocr_text: &ocr.text,
                batch_size: self.options.batch_size,
                iou_threshold: self.options.iou_threshold,
            })
            .map_err(|err| PipelineError::new(PipelineStage::ElementLabeling, err))?;
        debug!("labeled {} element(s)", labeled.parsed_content.len());

        Ok(ParseOutput {
            annotated: labeled.annotated,
            label_coordinates: labeled.label_coordinates,
            parsed_content: labeled.parsed_content,
            draw_config,
        })
    }
}
