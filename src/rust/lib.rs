//! Visual-prompt cache for prompt-driven auto-labeling.
//!
//! A session keeps a bounded set of example regions (visual prompts), turns
//! them into one unit-norm embedding per class, and maps detector row
//! indices back to stable class ids. Every mutation produces a new
//! generation; a generation is only exposed once registry, table and
//! aligner agree.
//!
//! # Basic Usage
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ndarray::Array1;
//! use visprompt::{BBox, CacheSession, ExtractionError, FeatureExtractor, ImageRef, PromptEntry, Region, SessionConfig};
//!
//! struct Extractor;
//!
//! impl FeatureExtractor for Extractor {
//!     fn extract_batch(&self, _image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
//!         Ok(boxes.iter().map(|b| Array1::from_vec(vec![b.x1 + 1.0, b.y1 + 1.0])).collect())
//!     }
//! }
//!
//! let mut session = CacheSession::new(SessionConfig::default())?
//!     .with_class_names(vec!["person".into(), "car".into()]);
//!
//! session.add_seed(
//!     PromptEntry::seed("frame_001.jpg", vec![
//!         Region::new(BBox::new(10.0, 10.0, 50.0, 80.0), 1),
//!         Region::new(BBox::new(60.0, 20.0, 90.0, 70.0), 0),
//!     ]),
//!     &Extractor,
//! )?;
//!
//! // Rows follow ascending class id
//! assert_eq!(session.decode(0)?, 0);
//! assert_eq!(session.get_active_table().rows(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! # Background Rebuilds
//!
//! [`SessionHandle`] wraps a session for async callers. Rebuilds run on the
//! blocking pool and can be time-boxed through
//! [`SessionConfig::rebuild_timeout_ms`]; a rebuild overtaken by a newer
//! mutation is discarded instead of committed.

pub mod autolabel;
pub mod cache;
pub mod config;

pub use autolabel::{auto_label, auto_label_shared, AutoLabelError, AutoLabelOutcome, Detector, DetectorError};
pub use cache::{
    Admission, BBox, CacheSession, ClassIdentityRegistry, ClassName, ConsistencyValidator, Detection,
    EmbeddingAggregator, EmbeddingTable, ExtractionError, FeatureExtractor, Generation, ImageRef, IndexAligner,
    LabeledDetection, PromptCache, PromptEntry, RebuildReport, RebuildStatus, Region, SessionError, SessionEvent,
    SessionHandle, SessionInfo, SessionState, TableSource,
};
pub use config::{ConfigError, SessionConfig};

pub fn init_logger() {
    env_logger::init();
}
