use std::fmt;

use ml_core::TransferError;
use thiserror::Error;

use crate::config::ResidencyMode;

/// Failures surfaced by the screen parser.
#[derive(Debug, Error)]
pub enum VisionError {
    /// A model could not be loaded or placed at construction. Fatal.
    #[error("failed to initialise {component}")]
    Initialization {
        component: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    ImageDecode(#[from] ImageDecodeError),
    /// The caption model could not be migrated for this request.
    #[error("caption model migration failed ({mode} mode)")]
    Transfer {
        mode: ResidencyMode,
        #[source]
        source: TransferError,
    },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl VisionError {
    pub(crate) fn initialization(
        component: &'static str,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        VisionError::Initialization {
            component,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VisionError::Initialization { .. } => "initialization",
            VisionError::ImageDecode(_) => "image_decode",
            VisionError::Transfer { .. } => "transfer",
            VisionError::Pipeline(_) => "pipeline",
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageDecodeError {
    #[error("input is not valid base64")]
    Base64(#[from] base64::DecodeError),
    #[error("input is not a decodable image")]
    Image(#[from] image::ImageError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    TextRegions,
    ElementLabeling,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStage::TextRegions => "OCR text detection",
            PipelineStage::ElementLabeling => "element labeling",
        })
    }
}

/// A backend collaborator failed; the original error is kept as the source.
#[derive(Debug, Error)]
#[error("{stage} failed")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: anyhow::Error,
}

impl PipelineError {
    pub fn new(stage: PipelineStage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}
