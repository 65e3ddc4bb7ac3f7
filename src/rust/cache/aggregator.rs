use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::{Array1, Array2};

use super::aligner::IndexAligner;
use super::error::{AggregationError, ShapeMismatchError};
use super::events::{EventSink, SessionEvent};
use super::extractor::{extract_with_retry, BatchError, FeatureExtractor};
use super::prompt_cache::PromptCache;
use super::table::EmbeddingTable;
use super::utils::normalized_mean;

/// Which strategy produced a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableSource {
    /// Aggregated from freshly extracted features
    Fresh,
    /// The previously committed table, reused because the class set is unchanged
    Reverted,
    /// All-zero table sized to the current class set
    ZeroFilled,
}

impl fmt::Display for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fresh => "fresh",
            Self::Reverted => "reverted",
            Self::ZeroFilled => "zero-filled",
        };
        f.write_str(name)
    }
}

/// Fallible strategies in the order they are tried. Zero-fill always
/// succeeds and ends the chain.
const FALLBACK_CHAIN: [TableSource; 2] = [TableSource::Fresh, TableSource::Reverted];

/// The committed table a rebuild may fall back to
#[derive(Debug, Clone, Copy)]
pub struct Committed<'a> {
    pub table: &'a Arc<EmbeddingTable>,
    pub aligner: &'a IndexAligner,
}

/// Table produced by [`EmbeddingAggregator::compute`] and how it was obtained.
#[derive(Debug, Clone)]
pub struct AggregationOutcome {
    pub table: Arc<EmbeddingTable>,
    pub source: TableSource,
    /// First failure in the chain; `None` for a fresh table
    pub failure: Option<AggregationError>,
    /// Embedding dimension known after this run
    pub embedding_dim: Option<usize>,
}

impl AggregationOutcome {
    pub fn is_degraded(&self) -> bool {
        self.failure.is_some()
    }
}

/// Turns prompt entries into one unit vector per class.
///
/// The vector of a class is the L2-normalized mean of the raw vectors of all
/// its regions across the cache. Classes without regions get a zero row.
/// Rows follow the order of the supplied [`IndexAligner`].
#[derive(Debug, Clone)]
pub struct EmbeddingAggregator {
    attempts: u32,
    expected_dim: Option<usize>,
    fallback_dim: usize,
    events: Option<(EventSink, u64)>,
}

impl EmbeddingAggregator {
    /// `fallback_dim` sizes tables before any dimension has been discovered
    pub fn new(fallback_dim: usize) -> Self {
        Self {
            attempts: 1,
            expected_dim: None,
            fallback_dim,
            events: None,
        }
    }

    /// Number of tries per entry batch before an extraction failure counts
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Dimension every extracted vector must have
    pub fn with_expected_dim(mut self, dim: Option<usize>) -> Self {
        self.expected_dim = dim;
        self
    }

    /// Publishes per-entry progress for `generation` on `sink`
    pub fn with_events(mut self, sink: EventSink, generation: u64) -> Self {
        self.events = Some((sink, generation));
        self
    }

    fn zero_dim(&self) -> usize {
        self.expected_dim.unwrap_or(self.fallback_dim)
    }

    /// Builds the class table, never failing.
    ///
    /// Tries a fresh aggregation first. If that fails the previously
    /// committed table is reused when it covers exactly the same classes;
    /// otherwise an all-zero table of the right shape is returned so no
    /// consumer ever sees a partially built table.
    pub fn compute(
        &self,
        entries: &PromptCache,
        aligner: &IndexAligner,
        extractor: &dyn FeatureExtractor,
        previous: Option<Committed<'_>>,
    ) -> AggregationOutcome {
        self.run_chain(&FALLBACK_CHAIN, Some((entries, extractor)), aligner, previous, None)
    }

    /// Skips fresh aggregation after a failure that happened outside the
    /// aggregator, such as a timed out rebuild
    pub fn fallback(
        &self,
        aligner: &IndexAligner,
        previous: Option<Committed<'_>>,
        failure: AggregationError,
    ) -> AggregationOutcome {
        self.run_chain(&FALLBACK_CHAIN[1..], None, aligner, previous, Some(failure))
    }

    fn run_chain(
        &self,
        chain: &[TableSource],
        input: Option<(&PromptCache, &dyn FeatureExtractor)>,
        aligner: &IndexAligner,
        previous: Option<Committed<'_>>,
        mut failure: Option<AggregationError>,
    ) -> AggregationOutcome {
        for &source in chain {
            let attempt = match (source, input) {
                (TableSource::Fresh, Some((entries, extractor))) => self
                    .aggregate(entries, aligner, extractor)
                    .map(|(table, dim)| (Arc::new(table), dim)),
                (TableSource::Reverted, _) => self.revert(aligner, previous).map(|table| (table, self.expected_dim)),
                _ => continue,
            };

            match attempt {
                Ok((table, embedding_dim)) => {
                    if let Some(err) = &failure {
                        warn!("Using {} table after aggregation failure: {}", source, err);
                    }
                    return AggregationOutcome {
                        table,
                        source,
                        failure,
                        embedding_dim,
                    };
                }
                Err(err) => {
                    debug!("{} strategy failed: {}", source, err);
                    failure.get_or_insert(err);
                }
            }
        }

        let dim = self.zero_dim();
        warn!(
            "Falling back to a zero table of {} classes x {} dims{}",
            aligner.len(),
            dim,
            failure.as_ref().map(|e| format!(" after: {}", e)).unwrap_or_default()
        );
        AggregationOutcome {
            table: Arc::new(EmbeddingTable::zeros(aligner.len(), dim)),
            source: TableSource::ZeroFilled,
            failure,
            embedding_dim: self.expected_dim,
        }
    }

    /// Fresh aggregation over every region in the cache.
    ///
    /// Extraction is batched per entry. Vectors are summed per class in f64,
    /// in cache order, then region order.
    ///
    /// # Errors
    /// - `AggregationError::Extraction` if the extractor fails on any entry
    /// - `AggregationError::Shape` if any batch is malformed or names a class the aligner lacks
    pub fn aggregate(
        &self,
        entries: &PromptCache,
        aligner: &IndexAligner,
        extractor: &dyn FeatureExtractor,
    ) -> Result<(EmbeddingTable, Option<usize>), AggregationError> {
        let mut dim = self.expected_dim;
        let mut sums: HashMap<u32, (Array1<f64>, usize)> = HashMap::new();
        let total = entries.len();

        for (index, entry) in entries.iter().enumerate() {
            if entry.regions.is_empty() {
                continue;
            }

            let vectors = extract_with_retry(extractor, &entry.image_ref, &entry.boxes(), dim, self.attempts)
                .map_err(|err| match err {
                    BatchError::Extraction(source) => AggregationError::Extraction { entry: index, source },
                    BatchError::Shape(source) => AggregationError::Shape { entry: index, source },
                })?;

            for (region, vector) in entry.regions.iter().zip(vectors) {
                let size = *dim.get_or_insert(vector.len());
                if aligner.row_of(region.class_id).is_none() {
                    return Err(AggregationError::Shape {
                        entry: index,
                        source: ShapeMismatchError::UnalignedClass(region.class_id),
                    });
                }
                let (sum, count) = sums
                    .entry(region.class_id)
                    .or_insert_with(|| (Array1::zeros(size), 0));
                sum.zip_mut_with(&vector, |s, &v| *s += f64::from(v));
                *count += 1;
            }

            if let Some((sink, generation)) = &self.events {
                sink.emit(SessionEvent::EntryExtracted {
                    generation: *generation,
                    entry: index,
                    total,
                });
            }
        }

        let size = dim.unwrap_or(self.fallback_dim);
        let mut data = Array2::zeros((aligner.len(), size));
        for (row, class_id) in aligner.row_to_class().iter().enumerate() {
            if let Some((sum, count)) = sums.get(class_id) {
                let prototype = normalized_mean(sum, *count);
                data.row_mut(row).assign(&prototype);
            }
        }

        info!(
            "Aggregated {} regions into {} class rows ({} with embeddings, dim {})",
            entries.region_count(),
            aligner.len(),
            sums.len(),
            size
        );
        Ok((EmbeddingTable::from_array(data), dim))
    }

    fn revert(
        &self,
        aligner: &IndexAligner,
        previous: Option<Committed<'_>>,
    ) -> Result<Arc<EmbeddingTable>, AggregationError> {
        let previous = previous.ok_or(AggregationError::NothingCommitted)?;
        if previous.aligner.same_classes(aligner) && previous.table.rows() == aligner.len() {
            Ok(Arc::clone(previous.table))
        } else {
            Err(AggregationError::ClassSetChanged)
        }
    }
}
