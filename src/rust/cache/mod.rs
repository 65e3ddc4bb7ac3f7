mod aggregator;
mod aligner;
mod detection;
mod error;
mod events;
mod extractor;
mod handle;
mod prompt_cache;
mod region;
mod registry;
mod session;
mod table;
mod utils;
mod validator;

pub use aggregator::{AggregationOutcome, Committed, EmbeddingAggregator, TableSource};
pub use aligner::IndexAligner;
pub use detection::{Detection, LabeledDetection};
pub use error::{
    AggregationError, CacheError, DecodeError, ExtractionError, InvariantViolation, PromptError, SessionError,
    ShapeMismatchError,
};
pub use events::{EventSink, SessionEvent, SessionState};
pub use extractor::{BatchError, FeatureExtractor};
pub use handle::SessionHandle;
pub use prompt_cache::{Admission, PromptCache, RejectReason, DEFAULT_CAPACITY};
pub use region::{BBox, ImageRef, PromptEntry, Region};
pub use registry::{ClassIdentityRegistry, ClassName};
pub use session::{
    CacheSession, Generation, RebuildReport, RebuildStatus, RebuiltGeneration, StagedMutation, Staging,
};
pub use table::EmbeddingTable;
pub use validator::{ConsistencyValidator, NORM_TOLERANCE};

/// Summary of the committed generation of a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub generation: u64,
    pub num_classes: usize,
    /// `(class id, display name)` in first-seen order
    pub class_names: Vec<(u32, String)>,
    pub seeds: usize,
    pub volatile: usize,
    pub capacity: usize,
    pub embedding_dim: Option<usize>,
    pub state: SessionState,
}
