use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::PromptError;

/// Handle to an image owned by the caller.
///
/// The cache only keeps this handle; pixel data stays with whoever loaded the image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef(Arc<str>);

impl ImageRef {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ImageRef {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Axis-aligned box in absolute pixel coordinates, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a box from a top-left corner plus width and height
    pub fn from_xywh(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    /// Returns `[x, y, width, height]`
    pub fn to_xywh(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2 - self.x1, self.y2 - self.y1]
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Coordinates are finite, non-negative and strictly ordered.
    pub fn is_valid(&self) -> bool {
        let finite = [self.x1, self.y1, self.x2, self.y2].iter().all(|v| v.is_finite());
        finite && 0.0 <= self.x1 && self.x1 < self.x2 && 0.0 <= self.y1 && self.y1 < self.y2
    }

    pub fn validate(&self) -> Result<(), PromptError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(PromptError::InvalidBox {
                x1: self.x1,
                y1: self.y1,
                x2: self.x2,
                y2: self.y2,
            })
        }
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter_w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let inter_h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if inter_w <= 0.0 || inter_h <= 0.0 {
            return 0.0;
        }
        let inter = inter_w * inter_h;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// One labeled example region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub bbox: BBox,
    pub class_id: u32,
}

impl Region {
    pub fn new(bbox: BBox, class_id: u32) -> Self {
        Self { bbox, class_id }
    }
}

/// A group of example regions taken from one image.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEntry {
    pub image_ref: ImageRef,
    pub regions: Vec<Region>,
    pub group_confidence: f32,
    pub is_seed: bool,
}

impl PromptEntry {
    /// Creates a user-supplied entry. Seeds carry full confidence.
    pub fn seed(image_ref: impl Into<ImageRef>, regions: Vec<Region>) -> Self {
        Self {
            image_ref: image_ref.into(),
            regions,
            group_confidence: 1.0,
            is_seed: true,
        }
    }

    /// Creates a self-generated entry subject to eviction
    pub fn volatile(image_ref: impl Into<ImageRef>, regions: Vec<Region>, group_confidence: f32) -> Self {
        Self {
            image_ref: image_ref.into(),
            regions,
            group_confidence,
            is_seed: false,
        }
    }

    /// Checks every box and the confidence range.
    ///
    /// # Errors
    /// - `InvalidConfidence` if the confidence is NaN or outside `[0, 1]`
    /// - `InvalidBox` for the first box that is not well-formed
    pub fn validate(&self) -> Result<(), PromptError> {
        if !(0.0..=1.0).contains(&self.group_confidence) {
            return Err(PromptError::InvalidConfidence(self.group_confidence));
        }
        self.regions.iter().try_for_each(|region| region.bbox.validate())
    }

    pub fn boxes(&self) -> Vec<BBox> {
        self.regions.iter().map(|r| r.bbox).collect()
    }

    /// Class ids in region order, duplicates included
    pub fn class_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.regions.iter().map(|r| r.class_id)
    }
}

impl From<String> for ImageRef {
    fn from(key: String) -> Self {
        Self(Arc::from(key))
    }
}
