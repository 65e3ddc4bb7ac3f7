use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use super::aggregator::{AggregationOutcome, Committed, EmbeddingAggregator, TableSource};
use super::aligner::IndexAligner;
use super::detection::{Detection, LabeledDetection};
use super::error::{AggregationError, DecodeError, ExtractionError, InvariantViolation, PromptError, SessionError};
use super::events::{EventSink, SessionEvent, SessionState};
use super::extractor::FeatureExtractor;
use super::prompt_cache::{Admission, PromptCache, RejectReason};
use super::region::{ImageRef, PromptEntry, Region};
use super::registry::{ClassIdentityRegistry, ClassName};
use super::table::EmbeddingTable;
use super::validator::ConsistencyValidator;
use super::SessionInfo;
use crate::config::{ConfigError, SessionConfig};

/// One consistent snapshot of registry, prompts, table and aligner.
///
/// Generations are immutable once committed and shared behind `Arc`, so a
/// reader holding one keeps a valid table no matter what the session does
/// afterwards.
#[derive(Debug, Clone)]
pub struct Generation {
    number: u64,
    registry: ClassIdentityRegistry,
    entries: PromptCache,
    table: Arc<EmbeddingTable>,
    aligner: Arc<IndexAligner>,
    embedding_dim: Option<usize>,
}

impl Generation {
    fn empty(number: u64, capacity: usize, dim: usize) -> Self {
        Self {
            number,
            registry: ClassIdentityRegistry::new(),
            entries: PromptCache::new(capacity),
            table: Arc::new(EmbeddingTable::zeros(0, dim)),
            aligner: Arc::new(IndexAligner::default()),
            embedding_dim: None,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn registry(&self) -> &ClassIdentityRegistry {
        &self.registry
    }

    pub fn entries(&self) -> &PromptCache {
        &self.entries
    }

    pub fn table(&self) -> &Arc<EmbeddingTable> {
        &self.table
    }

    pub fn aligner(&self) -> &Arc<IndexAligner> {
        &self.aligner
    }

    /// Dimension reported by the extractor, once known
    pub fn embedding_dim(&self) -> Option<usize> {
        self.embedding_dim
    }

    /// Maps a detector row to a class id of this generation
    pub fn decode(&self, row: usize) -> Result<u32, DecodeError> {
        self.aligner.decode(row)
    }

    /// Decodes detections against this generation, dropping undecodable ones
    pub fn decode_detections(&self, detections: &[Detection]) -> Vec<LabeledDetection> {
        detections
            .iter()
            .filter_map(|detection| match self.decode(detection.row_index) {
                Ok(class_id) => Some(LabeledDetection {
                    bbox: detection.bbox,
                    class_id,
                    class_name: self
                        .registry
                        .name_of(class_id)
                        .cloned()
                        .unwrap_or(ClassName::Synthesized(class_id)),
                    score: detection.score,
                }),
                Err(err) => {
                    warn!("Dropping detection: {}", err);
                    None
                }
            })
            .collect()
    }
}

/// How a rebuild ended
#[derive(Debug, Clone, PartialEq)]
pub enum RebuildStatus {
    /// Fresh embeddings were committed
    Committed,
    /// A fallback table was committed after `error`
    Degraded { source: TableSource, error: AggregationError },
    /// A newer mutation was staged before this rebuild finished
    Superseded { latest: u64 },
    /// Nothing changed, so nothing was rebuilt
    Unchanged,
}

impl RebuildStatus {
    fn from_outcome(outcome: &AggregationOutcome) -> Self {
        match &outcome.failure {
            None => Self::Committed,
            Some(error) => Self::Degraded {
                source: outcome.source,
                error: error.clone(),
            },
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// What a mutating call did
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildReport {
    /// Committed generation after the call
    pub generation: u64,
    pub status: RebuildStatus,
    pub admission: Admission,
    /// Volatile entry pushed out by a seed
    pub evicted: Option<PromptEntry>,
}

/// A mutation applied to the working state, waiting for its rebuild
#[derive(Debug)]
pub struct Staging {
    pub admission: Admission,
    pub evicted: Option<PromptEntry>,
    /// `None` when the cache refused the entry
    pub mutation: Option<StagedMutation>,
}

impl Staging {
    fn rejected(reason: RejectReason) -> Self {
        Self {
            admission: Admission::Rejected(reason),
            evicted: None,
            mutation: None,
        }
    }
}

/// Immutable snapshot handed to a rebuild.
///
/// Owns everything it needs, so it can move to a worker thread while the
/// session keeps accepting mutations.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    target: u64,
    registry: ClassIdentityRegistry,
    entries: PromptCache,
    previous: Arc<Generation>,
    aggregator: EmbeddingAggregator,
    events: EventSink,
}

impl StagedMutation {
    /// Generation this rebuild will commit as
    pub fn generation(&self) -> u64 {
        self.target
    }

    /// Aligns the staged registry and aggregates a new table
    pub fn rebuild(self, extractor: &dyn FeatureExtractor) -> RebuiltGeneration {
        self.events.state(self.target, SessionState::Rebuilding);
        let aligner = IndexAligner::align(&self.registry);
        let previous = Committed {
            table: &self.previous.table,
            aligner: &self.previous.aligner,
        };
        let outcome = self.aggregator.compute(&self.entries, &aligner, extractor, Some(previous));
        self.finish(aligner, outcome)
    }

    /// Produces the fallback result for a rebuild that never ran to completion
    pub fn fail(self, error: ExtractionError) -> RebuiltGeneration {
        let aligner = IndexAligner::align(&self.registry);
        let previous = Committed {
            table: &self.previous.table,
            aligner: &self.previous.aligner,
        };
        let outcome = self
            .aggregator
            .fallback(&aligner, Some(previous), AggregationError::Unavailable(error));
        self.finish(aligner, outcome)
    }

    fn finish(self, aligner: IndexAligner, outcome: AggregationOutcome) -> RebuiltGeneration {
        let status = RebuildStatus::from_outcome(&outcome);
        RebuiltGeneration {
            generation: Generation {
                number: self.target,
                registry: self.registry,
                entries: self.entries,
                table: outcome.table,
                aligner: Arc::new(aligner),
                embedding_dim: outcome.embedding_dim.or(self.previous.embedding_dim),
            },
            source: outcome.source,
            status,
        }
    }
}

/// Result of a rebuild, not yet committed
#[derive(Debug)]
pub struct RebuiltGeneration {
    generation: Generation,
    source: TableSource,
    status: RebuildStatus,
}

impl RebuiltGeneration {
    pub fn generation(&self) -> u64 {
        self.generation.number
    }

    pub fn source(&self) -> TableSource {
        self.source
    }
}

/// One labeling session: working prompts plus the committed generation the
/// detector reads.
///
/// Mutations go through a stage, rebuild, commit cycle. Each stage bumps the
/// generation counter; a rebuild whose generation is no longer the latest
/// staged one is discarded on commit.
pub struct CacheSession {
    config: SessionConfig,
    known_names: Vec<String>,
    registry: ClassIdentityRegistry,
    entries: PromptCache,
    committed: Arc<Generation>,
    latest: u64,
    state: SessionState,
    events: EventSink,
}

impl CacheSession {
    /// Creates an empty session
    ///
    /// # Errors
    /// - `ConfigError::Invalid` if the config does not validate
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(
            "Creating cache session (capacity {}, embedding dim {})",
            config.capacity, config.embedding_dim
        );
        Ok(Self {
            known_names: Vec::new(),
            registry: ClassIdentityRegistry::new(),
            entries: PromptCache::new(config.capacity),
            committed: Arc::new(Generation::empty(0, config.capacity, config.embedding_dim)),
            latest: 0,
            state: SessionState::Idle,
            events: EventSink::new(config.event_buffer),
            config,
        })
    }

    /// Sets the project's class list, indexed by class id
    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.known_names = names;
        self
    }

    /// Replaces the known names. Classes already registered keep their names.
    pub fn set_class_names(&mut self, names: Vec<String>) {
        debug!("Updating known class names ({} entries)", names.len());
        self.known_names = names;
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Committed generation number
    pub fn generation(&self) -> u64 {
        self.committed.number
    }

    /// Newest staged generation number
    pub fn latest_generation(&self) -> u64 {
        self.latest
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Working registry, including classes of rebuilds still in flight
    pub fn registry(&self) -> &ClassIdentityRegistry {
        &self.registry
    }

    /// Working prompt entries, including those of rebuilds still in flight
    pub fn entries(&self) -> &PromptCache {
        &self.entries
    }

    /// Current committed generation
    pub fn snapshot(&self) -> Arc<Generation> {
        Arc::clone(&self.committed)
    }

    pub fn get_active_table(&self) -> Arc<EmbeddingTable> {
        Arc::clone(&self.committed.table)
    }

    pub fn get_aligner(&self) -> Arc<IndexAligner> {
        Arc::clone(&self.committed.aligner)
    }

    pub fn decode(&self, row: usize) -> Result<u32, DecodeError> {
        self.committed.decode(row)
    }

    pub fn decode_detections(&self, detections: &[Detection]) -> Vec<LabeledDetection> {
        self.committed.decode_detections(detections)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            generation: self.committed.number,
            num_classes: self.committed.registry.len(),
            class_names: self
                .committed
                .registry
                .iter()
                .map(|(id, name)| (id, name.to_string()))
                .collect(),
            seeds: self.committed.entries.seed_count(),
            volatile: self.committed.entries.volatile_count(),
            capacity: self.config.capacity,
            embedding_dim: self.committed.embedding_dim,
            state: self.state,
        }
    }

    fn set_state(&mut self, generation: u64, state: SessionState) {
        self.state = state;
        self.events.state(generation, state);
    }

    fn should_validate(&self) -> bool {
        cfg!(debug_assertions) || self.config.validate_every_mutation
    }

    /// Adopts the new working state and snapshots it for a rebuild
    fn stage(&mut self, registry: ClassIdentityRegistry, entries: PromptCache) -> StagedMutation {
        self.latest += 1;
        let target = self.latest;
        self.set_state(target, SessionState::Mutating);
        self.registry = registry;
        self.entries = entries;

        let aggregator = EmbeddingAggregator::new(self.config.embedding_dim)
            .with_attempts(self.config.extraction_attempts)
            .with_expected_dim(self.committed.embedding_dim)
            .with_events(self.events.clone(), target);
        // The rebuild itself announces this state
        self.state = SessionState::Rebuilding;

        StagedMutation {
            target,
            registry: self.registry.clone(),
            entries: self.entries.clone(),
            previous: Arc::clone(&self.committed),
            aggregator,
            events: self.events.clone(),
        }
    }

    /// Validates a seed entry and stages it
    ///
    /// # Errors
    /// - `SessionError::Prompt` if the entry is malformed
    /// - `SessionError::Cache` if seeds alone would exceed the capacity
    pub fn stage_seed(&mut self, entry: PromptEntry) -> Result<Staging, SessionError> {
        entry.validate()?;
        let mut entries = self.entries.clone();
        let mut registry = self.registry.clone();
        let added = registry.register_all(entry.class_ids(), &self.known_names);
        let regions = entry.regions.len();

        let evicted = entries.add_seed(entry)?;
        info!("Staged seed prompt with {} regions ({} new classes)", regions, added);

        let mutation = self.stage(registry, entries);
        Ok(Staging {
            admission: Admission::Accepted {
                slot: self.entries.len() - 1,
                replaced: evicted.as_ref().map(|e| e.group_confidence),
            },
            evicted,
            mutation: Some(mutation),
        })
    }

    /// Validates a self-generated entry and offers it to the cache
    ///
    /// # Errors
    /// - `SessionError::Prompt` if the entry is malformed or has no regions
    pub fn stage_volatile(&mut self, entry: PromptEntry) -> Result<Staging, SessionError> {
        entry.validate()?;
        if entry.regions.is_empty() {
            return Err(PromptError::NoRegions.into());
        }

        let mut entries = self.entries.clone();
        let class_ids: Vec<u32> = entry.class_ids().collect();
        let admission = entries.add_or_replace_volatile(entry);
        if !admission.is_accepted() {
            debug!("Volatile prompt not admitted: {:?}", admission);
            return Ok(Staging {
                admission,
                evicted: None,
                mutation: None,
            });
        }

        let mut registry = self.registry.clone();
        registry.register_all(class_ids, &self.known_names);
        let mutation = self.stage(registry, entries);
        Ok(Staging {
            admission,
            evicted: None,
            mutation: Some(mutation),
        })
    }

    /// Turns one detection into a single-region volatile prompt
    ///
    /// # Errors
    /// - `SessionError::Decode` if the row has no class in the committed generation
    /// - `SessionError::Prompt` if the box or score is malformed
    pub fn stage_promotion(&mut self, detection: &Detection, image: &ImageRef) -> Result<Staging, SessionError> {
        let floor = self.config.promotion_confidence_floor;
        if detection.score.is_nan() || detection.score < floor {
            return Ok(Staging::rejected(RejectReason::BelowPromotionFloor {
                score: detection.score,
                floor,
            }));
        }
        let class_id = self.committed.decode(detection.row_index)?;

        let entry = PromptEntry::volatile(
            image.clone(),
            vec![Region::new(detection.bbox, class_id)],
            detection.score,
        );
        self.stage_volatile(entry)
    }

    /// Groups the promotable detections of one image into a single volatile
    /// prompt whose confidence is their mean score
    ///
    /// Undecodable detections and non-finite scores are skipped.
    ///
    /// # Errors
    /// - `SessionError::Prompt` if a kept box or score is malformed
    pub fn stage_promotions(&mut self, detections: &[Detection], image: &ImageRef) -> Result<Staging, SessionError> {
        let floor = self.config.promotion_confidence_floor;
        let mut regions = Vec::new();
        let mut total = 0.0f32;
        let mut best = 0.0f32;

        for detection in detections {
            best = best.max(detection.score);
            if detection.score.is_nan() || detection.score < floor {
                continue;
            }
            match self.committed.decode(detection.row_index) {
                Ok(class_id) => {
                    regions.push(Region::new(detection.bbox, class_id));
                    total += detection.score;
                }
                Err(err) => warn!("Skipping detection for promotion: {}", err),
            }
        }

        if regions.is_empty() {
            return Ok(Staging::rejected(RejectReason::BelowPromotionFloor { score: best, floor }));
        }

        let confidence = total / regions.len() as f32;
        debug!(
            "Promoting {} detections from {} (mean score {:.3})",
            regions.len(),
            image,
            confidence
        );
        self.stage_volatile(PromptEntry::volatile(image.clone(), regions, confidence))
    }

    /// Installs a rebuilt generation if it is still the latest one staged.
    ///
    /// # Errors
    /// - `SessionError::Invariant` if the rebuilt generation is inconsistent;
    ///   the previous committed generation is restored (or the session reset
    ///   when that one is broken too)
    pub fn commit(&mut self, rebuilt: RebuiltGeneration) -> Result<RebuildStatus, SessionError> {
        let RebuiltGeneration {
            generation,
            source,
            status,
        } = rebuilt;
        let number = generation.number;

        if number != self.latest {
            info!(
                "Discarding rebuild of generation {} (generation {} is newer)",
                number, self.latest
            );
            self.events.emit(SessionEvent::Superseded {
                generation: number,
                latest: self.latest,
            });
            // State tracks the newest staging: Idle once it committed, Rebuilding while it runs
            return Ok(RebuildStatus::Superseded { latest: self.latest });
        }

        if self.should_validate() {
            if let Err(violation) = ConsistencyValidator::check_with_dim(
                &generation.registry,
                &generation.table,
                &generation.aligner,
                generation.embedding_dim,
            ) {
                self.log_state(&generation, &violation);
                self.restore(number, &violation);
                return Err(violation.into());
            }
        }

        if status.is_degraded() {
            warn!("Committing generation {} with a {} table", number, source);
        } else {
            info!(
                "Committed generation {} ({} classes, {} entries)",
                number,
                generation.registry.len(),
                generation.entries.len()
            );
        }
        self.committed = Arc::new(generation);
        self.set_state(number, SessionState::Committed);
        self.events.emit(SessionEvent::Committed {
            generation: number,
            source,
            degraded: status.is_degraded(),
        });
        self.set_state(number, SessionState::Idle);
        Ok(status)
    }

    /// Drops a staged mutation without rebuilding it.
    ///
    /// Discarding the newest staging rolls the working state back to the
    /// committed generation and returns the session to `Idle`; older pending
    /// rebuilds will then be superseded. Discarding an older staging changes
    /// nothing, since the newer one already carries its changes.
    pub fn discard(&mut self, mutation: StagedMutation) {
        let number = mutation.target;
        if number != self.latest {
            debug!("Dropping stale staging of generation {} (latest {})", number, self.latest);
            return;
        }

        warn!(
            "Discarding staged generation {}, keeping generation {}",
            number, self.committed.number
        );
        self.registry = self.committed.registry.clone();
        self.entries = self.committed.entries.clone();
        self.events.emit(SessionEvent::Discarded { generation: number });
        self.set_state(number, SessionState::Idle);
    }

    fn log_state(&self, rejected: &Generation, violation: &InvariantViolation) {
        error!("Invariant violation in generation {}: {}", rejected.number, violation);
        error!(
            "Rejected state: registry order {:?}, row_to_class {:?}, table {}x{}, entries {}",
            rejected.registry.order(),
            rejected.aligner.row_to_class(),
            rejected.table.rows(),
            rejected.table.dim(),
            rejected.entries.len()
        );
        error!(
            "Committed state: generation {}, registry order {:?}, row_to_class {:?}, table {}x{}",
            self.committed.number,
            self.committed.registry.order(),
            self.committed.aligner.row_to_class(),
            self.committed.table.rows(),
            self.committed.table.dim()
        );
    }

    /// Rolls the working state back to the committed generation
    fn restore(&mut self, number: u64, violation: &InvariantViolation) {
        let committed_ok = ConsistencyValidator::check(
            &self.committed.registry,
            &self.committed.table,
            &self.committed.aligner,
        )
        .is_ok();

        if committed_ok {
            warn!("Restoring committed generation {}", self.committed.number);
            self.registry = self.committed.registry.clone();
            self.entries = self.committed.entries.clone();
        } else {
            error!("Committed generation is inconsistent too, resetting session");
            self.registry = ClassIdentityRegistry::new();
            self.entries = PromptCache::new(self.config.capacity);
            self.committed = Arc::new(Generation::empty(number, self.config.capacity, self.config.embedding_dim));
        }

        self.set_state(number, SessionState::RevertedOnFailure);
        self.events.emit(SessionEvent::Reverted {
            generation: number,
            reason: violation.to_string(),
        });
        self.set_state(number, SessionState::Idle);
    }

    fn finish(&mut self, staging: Staging, extractor: &dyn FeatureExtractor) -> Result<RebuildReport, SessionError> {
        let Staging {
            admission,
            evicted,
            mutation,
        } = staging;
        let status = match mutation {
            Some(mutation) => self.commit(mutation.rebuild(extractor))?,
            None => RebuildStatus::Unchanged,
        };
        Ok(RebuildReport {
            generation: self.generation(),
            status,
            admission,
            evicted,
        })
    }

    /// Adds a seed prompt and rebuilds on the calling thread
    pub fn add_seed(&mut self, entry: PromptEntry, extractor: &dyn FeatureExtractor) -> Result<RebuildReport, SessionError> {
        let staging = self.stage_seed(entry)?;
        self.finish(staging, extractor)
    }

    /// Offers a volatile prompt and rebuilds on the calling thread if admitted
    pub fn add_or_replace_volatile(
        &mut self,
        entry: PromptEntry,
        extractor: &dyn FeatureExtractor,
    ) -> Result<RebuildReport, SessionError> {
        let staging = self.stage_volatile(entry)?;
        self.finish(staging, extractor)
    }

    /// Feeds a confident detection back as a volatile prompt
    pub fn promote_detection_to_prompt(
        &mut self,
        detection: &Detection,
        image: &ImageRef,
        extractor: &dyn FeatureExtractor,
    ) -> Result<RebuildReport, SessionError> {
        let staging = self.stage_promotion(detection, image)?;
        self.finish(staging, extractor)
    }

    pub fn promote_detections(
        &mut self,
        detections: &[Detection],
        image: &ImageRef,
        extractor: &dyn FeatureExtractor,
    ) -> Result<RebuildReport, SessionError> {
        let staging = self.stage_promotions(detections, image)?;
        self.finish(staging, extractor)
    }

    /// Drops every prompt and class and commits an empty generation.
    ///
    /// Used when the project changes. Pending rebuilds are superseded.
    pub fn reset(&mut self) {
        self.latest += 1;
        let number = self.latest;
        info!("Resetting session at generation {}", number);
        self.entries.clear();
        self.registry = ClassIdentityRegistry::new();
        self.committed = Arc::new(Generation::empty(number, self.config.capacity, self.config.embedding_dim));
        self.set_state(number, SessionState::Committed);
        self.events.emit(SessionEvent::Committed {
            generation: number,
            source: TableSource::ZeroFilled,
            degraded: false,
        });
        self.set_state(number, SessionState::Idle);
    }
}
