#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use env_logger::{Builder, Env};
use ndarray::Array1;
use visprompt::{BBox, Detection, Detector, DetectorError, EmbeddingTable, ExtractionError, FeatureExtractor, ImageRef};

// Initialize test logger
pub fn init() {
    let _ = Builder::from_env(Env::default().default_filter_or("warn")).try_init();
}

/// Vector derived from box geometry only, so the same box always yields the same vector
pub fn box_vector(bbox: &BBox) -> Array1<f32> {
    Array1::from_vec(vec![bbox.x1 + 1.0, bbox.y1 + 1.0, bbox.width(), bbox.height()])
}

pub fn bbox(x1: f32, y1: f32) -> BBox {
    BBox::new(x1, y1, x1 + 10.0, y1 + 10.0)
}

pub struct GeometryExtractor {
    calls: AtomicUsize,
}

impl GeometryExtractor {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for GeometryExtractor {
    fn extract_batch(&self, _image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(boxes.iter().map(box_vector).collect())
    }
}

/// Fails every batch for the listed images
pub struct FailingOn {
    images: HashSet<String>,
}

impl FailingOn {
    pub fn images(images: &[&str]) -> Self {
        Self {
            images: images.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FeatureExtractor for FailingOn {
    fn extract_batch(&self, image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        if self.images.contains(image.as_str()) {
            return Err(ExtractionError::Backend(format!("cannot read {}", image)));
        }
        Ok(boxes.iter().map(box_vector).collect())
    }
}

/// Answers with vectors of the wrong width
pub struct WrongWidth(pub usize);

impl FeatureExtractor for WrongWidth {
    fn extract_batch(&self, _image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        Ok(boxes.iter().map(|_| Array1::ones(self.0)).collect())
    }
}

/// Answers `[value, 1]` for every box, close to the f32 limit when asked
pub struct Saturating(pub f32);

impl FeatureExtractor for Saturating {
    fn extract_batch(&self, _image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        Ok(boxes.iter().map(|_| Array1::from_vec(vec![self.0, 1.0])).collect())
    }
}

/// Sleeps before answering, to keep a rebuild in flight
pub struct SlowExtractor(pub Duration);

impl FeatureExtractor for SlowExtractor {
    fn extract_batch(&self, _image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        std::thread::sleep(self.0);
        Ok(boxes.iter().map(box_vector).collect())
    }
}

/// Returns canned detections and records the table shape it was given
pub struct ScriptedDetector {
    detections: Vec<Detection>,
    seen_rows: Mutex<Vec<usize>>,
}

impl ScriptedDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            seen_rows: Mutex::new(Vec::new()),
        }
    }

    pub fn seen_rows(&self) -> Vec<usize> {
        self.seen_rows.lock().unwrap().clone()
    }
}

impl Detector for ScriptedDetector {
    fn infer(&self, _image: &ImageRef, table: &EmbeddingTable) -> Result<Vec<Detection>, DetectorError> {
        self.seen_rows.lock().unwrap().push(table.rows());
        Ok(self.detections.clone())
    }
}
