//! Interfaces to the detection, OCR and captioning collaborators.
//!
//! The parser never looks inside these algorithms; a backend supplies them
//! together with the caption model type whose residency is managed here.

use std::path::Path;

use anyhow::Result;
use image::DynamicImage;
use ml_core::{Tier, TieredModel};
use serde::{Deserialize, Serialize};

use crate::executor::DrawBoxConfig;

/// `[x1, y1, x2, y2]`, either in pixels or as ratios of the image size.
pub type BoundingBox = [f32; 4];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoxFormat {
    Xyxy,
    Xywh,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OcrOptions {
    pub text_threshold: f32,
    pub box_format: BoxFormat,
    pub use_paddleocr: bool,
}

#[derive(Clone, Debug, Default)]
pub struct OcrRegions {
    pub text: Vec<String>,
    pub boxes: Vec<BoundingBox>,
}

/// Inputs for the labeling collaborator.
pub struct LabelRequest<'a, D, C> {
    pub image: &'a DynamicImage,
    pub detector: &'a D,
    pub box_threshold: f32,
    pub ocr_boxes: &'a [BoundingBox],
    pub draw_config: &'a DrawBoxConfig,
    pub captioner: &'a C,
    pub ocr_text: &'a [String],
    pub batch_size: usize,
    pub iou_threshold: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Icon,
}

/// One entry of the parsed screen content, in reading order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Ratio coordinates, `[x1, y1, x2, y2]`.
    pub bbox: BoundingBox,
    pub interactivity: bool,
    pub content: Option<String>,
    /// Which detector produced the box and the content, e.g. `box_yolo_content_yolo`.
    pub source: String,
}

#[derive(Clone, Debug)]
pub struct LabeledScreen {
    pub annotated: DynamicImage,
    /// Normalized coordinates keyed by element index.
    pub label_coordinates: Vec<BoundingBox>,
    pub parsed_content: Vec<ParsedElement>,
}

/// Model loaders and vision algorithms consumed by the parser.
pub trait VisionBackend: Send + Sync {
    type Detector: Send + Sync;
    type Captioner: TieredModel;

    fn load_detector(&self, path: &Path) -> Result<Self::Detector>;

    /// Load the caption model with its weights on `target`.
    fn load_captioner(&self, name: &str, path: &Path, target: Tier) -> Result<Self::Captioner>;

    fn detect_text_regions(&self, image: &DynamicImage, options: &OcrOptions)
    -> Result<OcrRegions>;

    fn label_and_describe_elements(
        &self,
        request: LabelRequest<'_, Self::Detector, Self::Captioner>,
    ) -> Result<LabeledScreen>;
}
