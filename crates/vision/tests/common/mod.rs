#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Result, bail};
use image::DynamicImage;
use vision::{
    ElementKind, LabelRequest, LabeledScreen, OcrOptions, OcrRegions, ParsedElement,
    VisionBackend,
    ml_core::{DeviceAllocator, Precision, Tier, TieredModel},
};

/// Shared observations about a `FakeModel`.
#[derive(Default)]
pub struct Probe {
    pub placements: Mutex<Vec<Tier>>,
    pub seen_during_infer: Mutex<Vec<Tier>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub inferences: AtomicUsize,
    pub conversions: AtomicUsize,
    pub pins: AtomicUsize,
    pub fail_to_device: AtomicBool,
}

impl Probe {
    pub fn placements(&self) -> Vec<Tier> {
        self.placements.lock().unwrap().clone()
    }

    pub fn seen_during_infer(&self) -> Vec<Tier> {
        self.seen_during_infer.lock().unwrap().clone()
    }
}

pub struct FakeModel {
    location: Tier,
    precision: Precision,
    probe: Arc<Probe>,
}

impl FakeModel {
    pub fn new(location: Tier, probe: Arc<Probe>) -> Self {
        Self {
            location,
            precision: Precision::F32,
            probe,
        }
    }
}

impl TieredModel for FakeModel {
    /// Simulated inference time.
    type Input = Duration;
    /// Tier the weights were on while inferring.
    type Output = Tier;

    fn place(&mut self, tier: Tier) -> Result<()> {
        if tier == Tier::Device && self.probe.fail_to_device.load(Ordering::SeqCst) {
            bail!("CUDA out of memory");
        }
        self.probe.placements.lock().unwrap().push(tier);
        self.location = tier;
        Ok(())
    }

    fn location(&self) -> Tier {
        self.location
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn convert_precision(&mut self, precision: Precision) -> Result<()> {
        self.probe.conversions.fetch_add(1, Ordering::SeqCst);
        self.precision = precision;
        Ok(())
    }

    fn pin_host_memory(&mut self) -> Result<()> {
        self.probe.pins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn infer(&self, work: &Duration) -> Result<Tier> {
        let now = self.probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.probe.inferences.fetch_add(1, Ordering::SeqCst);
        self.probe.seen_during_infer.lock().unwrap().push(self.location);
        thread::sleep(*work);
        self.probe.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.location)
    }
}

pub struct FakeAllocator {
    pub available: bool,
    pub releases: AtomicUsize,
}

impl FakeAllocator {
    pub fn new(available: bool) -> Arc<Self> {
        Arc::new(Self {
            available,
            releases: AtomicUsize::new(0),
        })
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl DeviceAllocator for FakeAllocator {
    fn is_available(&self) -> bool {
        self.available
    }

    fn release_cached(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What the backend was asked to do on the last labeling call.
#[derive(Clone, Debug, Default)]
pub struct LabelCall {
    pub box_threshold: f32,
    pub batch_size: usize,
    pub iou_threshold: f32,
    pub text_scale: f32,
    pub thickness: u32,
    pub ocr_text: Vec<String>,
}

/// Call log and failure switches shared between a test and its backend.
#[derive(Default)]
pub struct BackendLog {
    pub fail_ocr: AtomicBool,
    pub fail_labeling: AtomicBool,
    pub ocr_calls: AtomicUsize,
    pub ocr_threshold: Mutex<Option<f32>>,
    pub last_label_call: Mutex<Option<LabelCall>>,
}

#[derive(Clone, Default)]
pub struct FakeBackend {
    pub probe: Arc<Probe>,
    pub log: Arc<BackendLog>,
    pub fail_detector_load: bool,
    pub caption_work: Duration,
}

impl FakeBackend {
    pub fn new(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            ..Default::default()
        }
    }
}

impl VisionBackend for FakeBackend {
    type Detector = String;
    type Captioner = FakeModel;

    fn load_detector(&self, path: &Path) -> Result<String> {
        if self.fail_detector_load {
            bail!("no such file: {}", path.display());
        }
        Ok(path.display().to_string())
    }

    fn load_captioner(&self, _name: &str, _path: &Path, target: Tier) -> Result<FakeModel> {
        Ok(FakeModel::new(target, self.probe.clone()))
    }

    fn detect_text_regions(&self, _image: &DynamicImage, options: &OcrOptions) -> Result<OcrRegions> {
        self.log.ocr_calls.fetch_add(1, Ordering::SeqCst);
        *self.log.ocr_threshold.lock().unwrap() = Some(options.text_threshold);
        if self.log.fail_ocr.load(Ordering::SeqCst) {
            bail!("OCR engine crashed");
        }
        Ok(OcrRegions {
            text: vec!["File".to_string(), "Edit".to_string()],
            boxes: vec![[0.0, 0.0, 10.0, 5.0], [12.0, 0.0, 22.0, 5.0]],
        })
    }

    fn label_and_describe_elements(
        &self,
        request: LabelRequest<'_, String, FakeModel>,
    ) -> Result<LabeledScreen> {
        *self.log.last_label_call.lock().unwrap() = Some(LabelCall {
            box_threshold: request.box_threshold,
            batch_size: request.batch_size,
            iou_threshold: request.iou_threshold,
            text_scale: request.draw_config.text_scale,
            thickness: request.draw_config.thickness,
            ocr_text: request.ocr_text.to_vec(),
        });
        if self.log.fail_labeling.load(Ordering::SeqCst) {
            bail!("caption batch failed");
        }

        let tier = request.captioner.infer(&self.caption_work)?;
        let mut parsed_content: Vec<ParsedElement> = request
            .ocr_text
            .iter()
            .zip(request.ocr_boxes)
            .map(|(text, bbox)| ParsedElement {
                kind: ElementKind::Text,
                bbox: *bbox,
                interactivity: false,
                content: Some(text.clone()),
                source: "box_ocr_content_ocr".to_string(),
            })
            .collect();
        parsed_content.push(ParsedElement {
            kind: ElementKind::Icon,
            bbox: [0.5, 0.5, 0.6, 0.6],
            interactivity: true,
            content: Some(format!("settings icon (captioned on {tier})")),
            source: "box_yolo_content_yolo".to_string(),
        });

        Ok(LabeledScreen {
            annotated: request.image.clone(),
            label_coordinates: parsed_content.iter().map(|element| element.bbox).collect(),
            parsed_content,
        })
    }
}
