use log::{debug, info};
use thiserror::Error;

use crate::cache::{
    CacheSession, Detection, EmbeddingTable, FeatureExtractor, ImageRef, LabeledDetection, RebuildReport,
    RebuildStatus, SessionError, SessionHandle,
};

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Detector failed: {0}")]
    Backend(String),
    #[error("Detector expected {expected} table columns, got {actual}")]
    TableShape { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum AutoLabelError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Open-vocabulary detector conditioned on a class embedding table.
///
/// Row `i` of the returned detections refers to row `i` of `table`.
pub trait Detector: Send + Sync {
    /// Runs detection on one image
    ///
    /// # Errors
    /// - `DetectorError::Backend` if inference fails
    /// - `DetectorError::TableShape` if the table does not fit the model
    fn infer(&self, image: &ImageRef, table: &EmbeddingTable) -> Result<Vec<Detection>, DetectorError>;
}

/// Labels produced for one image
#[derive(Debug, Clone)]
pub struct AutoLabelOutcome {
    pub image: ImageRef,
    /// Decoded detections at or above the report threshold
    pub labels: Vec<LabeledDetection>,
    /// Result of feeding confident detections back into the prompt cache
    pub promotion: Option<RebuildReport>,
    /// Whether the image was inferred again with freshly committed prototypes
    pub reinferred: bool,
    /// Generation the labels were decoded against
    pub generation: u64,
}

impl AutoLabelOutcome {
    fn skipped(image: &ImageRef, generation: u64) -> Self {
        Self {
            image: image.clone(),
            labels: Vec::new(),
            promotion: None,
            reinferred: false,
            generation,
        }
    }
}

fn report(detections: Vec<LabeledDetection>, min_confidence: f32) -> Vec<LabeledDetection> {
    let total = detections.len();
    let kept: Vec<_> = detections.into_iter().filter(|d| d.score >= min_confidence).collect();
    if kept.len() < total {
        debug!(
            "Dropped {} detections under confidence {:.2}",
            total - kept.len(),
            min_confidence
        );
    }
    kept
}

/// Runs one labeling pass on `image`.
///
/// Infers with the committed table, promotes the confident detections as one
/// volatile prompt and, if that committed fresh prototypes, infers again so
/// the reported labels use the updated table. Sessions without classes are
/// skipped without calling the detector.
///
/// # Errors
/// - `AutoLabelError::Detector` if inference fails
/// - `AutoLabelError::Session` if the promotion is malformed or the rebuild is inconsistent
pub fn auto_label(
    session: &mut CacheSession,
    image: &ImageRef,
    detector: &dyn Detector,
    extractor: &dyn FeatureExtractor,
) -> Result<AutoLabelOutcome, AutoLabelError> {
    let mut snapshot = session.snapshot();
    if snapshot.registry().is_empty() {
        debug!("No classes registered, skipping {}", image);
        return Ok(AutoLabelOutcome::skipped(image, snapshot.number()));
    }

    let mut detections = detector.infer(image, snapshot.table())?;
    debug!("{} raw detections on {}", detections.len(), image);

    let promotion = session.promote_detections(&detections, image, extractor)?;
    let reinferred = promotion.status == RebuildStatus::Committed;
    if reinferred {
        snapshot = session.snapshot();
        detections = detector.infer(image, snapshot.table())?;
    }

    let labels = report(snapshot.decode_detections(&detections), session.config().min_report_confidence);
    info!(
        "Labeled {} with {} detections (generation {})",
        image,
        labels.len(),
        snapshot.number()
    );
    Ok(AutoLabelOutcome {
        image: image.clone(),
        labels,
        promotion: Some(promotion),
        reinferred,
        generation: snapshot.number(),
    })
}

/// [`auto_label`] for a shared session. The detector runs on the calling task.
pub async fn auto_label_shared(
    handle: &SessionHandle,
    image: &ImageRef,
    detector: &dyn Detector,
) -> Result<AutoLabelOutcome, AutoLabelError> {
    let mut snapshot = handle.snapshot().await;
    if snapshot.registry().is_empty() {
        debug!("No classes registered, skipping {}", image);
        return Ok(AutoLabelOutcome::skipped(image, snapshot.number()));
    }

    let mut detections = detector.infer(image, snapshot.table())?;
    let promotion = handle.promote_detections(&detections, image).await?;
    let reinferred = promotion.status == RebuildStatus::Committed;
    if reinferred {
        snapshot = handle.snapshot().await;
        detections = detector.infer(image, snapshot.table())?;
    }

    let min_confidence = handle.config().await.min_report_confidence;
    let labels = report(snapshot.decode_detections(&detections), min_confidence);
    info!(
        "Labeled {} with {} detections (generation {})",
        image,
        labels.len(),
        snapshot.number()
    );
    Ok(AutoLabelOutcome {
        image: image.clone(),
        labels,
        promotion: Some(promotion),
        reinferred,
        generation: snapshot.number(),
    })
}
