use thiserror::Error;

/// Failure reported by the external feature backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    /// The backend refused or failed the request
    #[error("Feature backend error: {0}")]
    Backend(String),
    /// The backend did not answer within the configured time box
    #[error("Feature extraction timed out after {0} ms")]
    TimedOut(u64),
}

/// The extractor answered, but the tensors do not match the expected layout.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShapeMismatchError {
    #[error("Expected {expected} vectors for the requested boxes, got {actual}")]
    VectorCount { expected: usize, actual: usize },
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("Extractor returned an empty vector")]
    EmptyVector,
    #[error("Vector contains non-finite values")]
    NonFinite,
    #[error("Class {0} has no row in the current alignment")]
    UnalignedClass(u32),
}

/// Anything that stops a fresh aggregation from producing a table.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("Extraction failed for entry {entry}: {source}")]
    Extraction {
        entry: usize,
        #[source]
        source: ExtractionError,
    },
    #[error("Malformed features for entry {entry}: {source}")]
    Shape {
        entry: usize,
        #[source]
        source: ShapeMismatchError,
    },
    #[error("Feature backend unavailable: {0}")]
    Unavailable(ExtractionError),
    #[error("Committed table covers a different class set")]
    ClassSetChanged,
    #[error("No committed table to revert to")]
    NothingCommitted,
}

impl AggregationError {
    /// Returns true when the error came from the extractor rather than the data
    pub fn is_extraction(&self) -> bool {
        matches!(self, Self::Extraction { .. } | Self::Unavailable(_))
    }
}

/// A cross-component invariant does not hold.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("Cardinality mismatch: registry={registry}, table rows={table_rows}, row_to_class={row_to_class}, class_to_row={class_to_row}")]
    Cardinality {
        registry: usize,
        table_rows: usize,
        row_to_class: usize,
        class_to_row: usize,
    },
    #[error("Aligner maps are not inverse at row {row} (class {class_id})")]
    NotInverse { row: usize, class_id: u32 },
    #[error("Row index {row} out of range for {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },
    #[error("Registered class {0} has no table row")]
    MissingClass(u32),
    #[error("Row {row} has norm {norm}, expected 0 or 1")]
    NotNormalized { row: usize, norm: f32 },
    #[error("Row {row} holds a non-finite value at column {column}")]
    NonFinite { row: usize, column: usize },
    #[error("Table dimension {actual} differs from session dimension {expected}")]
    Dimension { expected: usize, actual: usize },
}

/// A detector row index has no class behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Row index {row} out of range for {rows} rows")]
pub struct DecodeError {
    pub row: usize,
    pub rows: usize,
}

/// A prompt entry failed validation before reaching the cache.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PromptError {
    #[error("Invalid bounding box ({x1}, {y1}, {x2}, {y2})")]
    InvalidBox { x1: f32, y1: f32, x2: f32, y2: f32 },
    #[error("Confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f32),
    #[error("A promoted prompt needs at least one region")]
    NoRegions,
}

/// Capacity configuration problems surfaced by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Seed prompts alone exceed the cache capacity ({seeds} seeds, capacity {capacity})")]
    SeedCapacityExceeded { seeds: usize, capacity: usize },
}

/// Errors that reach callers of the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Rebuild discarded: {0}")]
    Invariant(#[from] InvariantViolation),
    #[error("Rebuild of generation {generation} did not finish: {reason}")]
    Interrupted { generation: u64, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = DecodeError { row: 4, rows: 2 };
        assert_eq!(err.to_string(), "Row index 4 out of range for 2 rows");

        let err = AggregationError::Extraction {
            entry: 1,
            source: ExtractionError::Backend("offline".into()),
        };
        assert!(err.is_extraction());
        assert!(err.to_string().contains("entry 1"));
    }
}
