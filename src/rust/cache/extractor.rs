use log::warn;
use ndarray::Array1;
use thiserror::Error;

use super::error::{ExtractionError, ShapeMismatchError};
use super::region::{BBox, ImageRef};

/// Why a batch could not be turned into usable vectors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error(transparent)]
    Extraction(ExtractionError),
    #[error(transparent)]
    Shape(ShapeMismatchError),
}

/// Produces raw appearance embeddings for image regions.
///
/// Implementations wrap whatever backend encodes visual prompts. The
/// aggregator only talks to the backend through this trait, so tests and
/// callers can substitute, retry or time-box it.
///
/// The backend is expected to:
/// - Return exactly one vector per requested box, in request order
/// - Return vectors of one fixed dimension for the lifetime of a session
/// - Leave normalization to the caller
pub trait FeatureExtractor: Send + Sync {
    /// Extracts one raw vector per box of `image`.
    ///
    /// # Errors
    /// - `ExtractionError` for any backend failure
    fn extract_batch(&self, image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError>;

    /// Extracts a batch and checks it against the expected layout.
    ///
    /// `expected_dim` is `None` until a dimension has been discovered; the
    /// first vector then defines it for the rest of the batch.
    ///
    /// # Errors
    /// - `ShapeMismatchError::VectorCount` if the vector count differs from the box count
    /// - `ShapeMismatchError::Dimension` if any vector has the wrong length
    /// - `ShapeMismatchError::EmptyVector` / `NonFinite` for unusable vectors
    fn extract_checked(
        &self,
        image: &ImageRef,
        boxes: &[BBox],
        expected_dim: Option<usize>,
    ) -> Result<Vec<Array1<f32>>, BatchError> {
        let vectors = self.extract_batch(image, boxes).map_err(BatchError::Extraction)?;

        if vectors.len() != boxes.len() {
            return Err(BatchError::Shape(ShapeMismatchError::VectorCount {
                expected: boxes.len(),
                actual: vectors.len(),
            }));
        }

        let mut dim = expected_dim;
        for vector in &vectors {
            if vector.is_empty() {
                return Err(BatchError::Shape(ShapeMismatchError::EmptyVector));
            }
            let expected = *dim.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(BatchError::Shape(ShapeMismatchError::Dimension {
                    expected,
                    actual: vector.len(),
                }));
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(BatchError::Shape(ShapeMismatchError::NonFinite));
            }
        }
        Ok(vectors)
    }
}

/// Runs `extract_checked` up to `attempts` times.
///
/// Only backend failures are retried; a malformed answer is returned at once
/// since asking again yields the same layout.
pub(crate) fn extract_with_retry(
    extractor: &dyn FeatureExtractor,
    image: &ImageRef,
    boxes: &[BBox],
    expected_dim: Option<usize>,
    attempts: u32,
) -> Result<Vec<Array1<f32>>, BatchError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match extractor.extract_checked(image, boxes, expected_dim) {
            Ok(vectors) => return Ok(vectors),
            Err(BatchError::Extraction(err)) if attempt < attempts => {
                warn!(
                    "Extraction attempt {}/{} for {} failed: {}",
                    attempt, attempts, image, err
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

impl<T: FeatureExtractor + ?Sized> FeatureExtractor for std::sync::Arc<T> {
    fn extract_batch(&self, image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        (**self).extract_batch(image, boxes)
    }
}
