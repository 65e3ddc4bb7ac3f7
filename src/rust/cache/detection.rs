use serde::{Deserialize, Serialize};

use super::region::BBox;
use super::registry::ClassName;

/// Raw detector output, tagged with the table row that matched
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub row_index: usize,
    pub score: f32,
}

impl Detection {
    pub fn new(bbox: BBox, row_index: usize, score: f32) -> Self {
        Self { bbox, row_index, score }
    }
}

/// Detection decoded to a user-facing class
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDetection {
    pub bbox: BBox,
    pub class_id: u32,
    pub class_name: ClassName,
    pub score: f32,
}
