use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{broadcast, Mutex};

use super::aligner::IndexAligner;
use super::detection::{Detection, LabeledDetection};
use super::error::{ExtractionError, SessionError};
use super::events::SessionEvent;
use super::extractor::FeatureExtractor;
use super::region::{ImageRef, PromptEntry};
use super::session::{CacheSession, Generation, RebuildReport, RebuildStatus, RebuiltGeneration, StagedMutation, Staging};
use super::table::EmbeddingTable;
use super::SessionInfo;
use crate::config::SessionConfig;

/// Shareable async front end of a [`CacheSession`].
///
/// The session lock is held only while staging and committing. Rebuilds run
/// on the blocking pool, so callers can keep mutating or reading the
/// committed table while features are being extracted. A rebuild that
/// finishes after a newer mutation is discarded.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<CacheSession>>,
    extractor: Arc<dyn FeatureExtractor>,
    timeout: Option<Duration>,
}

impl SessionHandle {
    pub fn new(session: CacheSession, extractor: Arc<dyn FeatureExtractor>) -> Self {
        let timeout = session.config().rebuild_timeout_ms.map(Duration::from_millis);
        Self {
            session: Arc::new(Mutex::new(session)),
            extractor,
            timeout,
        }
    }

    pub async fn add_seed(&self, entry: PromptEntry) -> Result<RebuildReport, SessionError> {
        let staging = self.session.lock().await.stage_seed(entry)?;
        self.finish(staging).await
    }

    pub async fn add_or_replace_volatile(&self, entry: PromptEntry) -> Result<RebuildReport, SessionError> {
        let staging = self.session.lock().await.stage_volatile(entry)?;
        self.finish(staging).await
    }

    pub async fn promote_detection_to_prompt(
        &self,
        detection: &Detection,
        image: &ImageRef,
    ) -> Result<RebuildReport, SessionError> {
        let staging = self.session.lock().await.stage_promotion(detection, image)?;
        self.finish(staging).await
    }

    pub async fn promote_detections(
        &self,
        detections: &[Detection],
        image: &ImageRef,
    ) -> Result<RebuildReport, SessionError> {
        let staging = self.session.lock().await.stage_promotions(detections, image)?;
        self.finish(staging).await
    }

    pub async fn set_class_names(&self, names: Vec<String>) {
        self.session.lock().await.set_class_names(names);
    }

    pub async fn reset(&self) {
        self.session.lock().await.reset();
    }

    pub async fn get_active_table(&self) -> Arc<EmbeddingTable> {
        self.session.lock().await.get_active_table()
    }

    pub async fn get_aligner(&self) -> Arc<IndexAligner> {
        self.session.lock().await.get_aligner()
    }

    pub async fn snapshot(&self) -> Arc<Generation> {
        self.session.lock().await.snapshot()
    }

    pub async fn decode_detections(&self, detections: &[Detection]) -> Vec<LabeledDetection> {
        self.snapshot().await.decode_detections(detections)
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.lock().await.subscribe()
    }

    pub async fn config(&self) -> SessionConfig {
        self.session.lock().await.config().clone()
    }

    pub async fn info(&self) -> SessionInfo {
        self.session.lock().await.info()
    }

    async fn finish(&self, staging: Staging) -> Result<RebuildReport, SessionError> {
        let Staging {
            admission,
            evicted,
            mutation,
        } = staging;

        let status = match mutation {
            Some(mutation) => self.rebuild_and_commit(mutation).await?,
            None => RebuildStatus::Unchanged,
        };

        let generation = self.session.lock().await.generation();
        Ok(RebuildReport {
            generation,
            status,
            admission,
            evicted,
        })
    }

    /// Rebuilds and commits on a spawned task, so a staging is never left
    /// behind when the caller stops waiting.
    async fn rebuild_and_commit(&self, mutation: StagedMutation) -> Result<RebuildStatus, SessionError> {
        let generation = mutation.generation();
        let spare = mutation.clone();
        let handle = self.clone();
        let task = tokio::spawn(async move {
            let rebuilt = handle.rebuild(mutation).await;
            handle.session.lock().await.commit(rebuilt)
        });

        match task.await {
            Ok(status) => status,
            Err(err) => {
                error!("Commit task of generation {} failed: {}", generation, err);
                self.session.lock().await.discard(spare);
                Err(SessionError::Interrupted {
                    generation,
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn rebuild(&self, mutation: StagedMutation) -> RebuiltGeneration {
        let fallback = mutation.clone();
        let extractor = Arc::clone(&self.extractor);
        let task = tokio::task::spawn_blocking(move || mutation.rebuild(extractor.as_ref()));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Rebuild of generation {} exceeded {:?}, using fallback table",
                        fallback.generation(),
                        limit
                    );
                    return fallback.fail(ExtractionError::TimedOut(limit.as_millis() as u64));
                }
            },
            None => task.await,
        };

        match joined {
            Ok(rebuilt) => rebuilt,
            Err(err) => {
                error!("Rebuild task of generation {} failed: {}", fallback.generation(), err);
                fallback.fail(ExtractionError::Backend(format!("rebuild task failed: {}", err)))
            }
        }
    }
}
