//! Subject synchronization: staging input → topic tree → production → index.
//!
//! A run walks `PARSED → TREE_BUILT → IDENTITY_RESOLVED → PARENTS_LINKED →
//! DELETIONS_APPLIED → EMBEDDINGS_REFRESHED → DONE`. Every step is derived
//! from current production state plus the staging batch, so an aborted run
//! is recovered by running it again.

use std::fmt;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use topicsync_embedding::Embedder;
use topicsync_outline::ParsedBatch;
use topicsync_shared::{ProductionTopic, Result, Subject, SubjectKey, TopicSyncError};
use topicsync_storage::Storage;

use crate::index::{self, IndexReport};
use crate::promote::{self, PromoteReport};
use crate::safety::ReferenceChecker;
use crate::summary::Summarizer;
use crate::tree::{self, TitleFilter, TreeReport};

// ---------------------------------------------------------------------------
// State & progress
// ---------------------------------------------------------------------------

/// Checkpoints of one synchronization run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    Parsed,
    TreeBuilt,
    IdentityResolved,
    ParentsLinked,
    DeletionsApplied,
    EmbeddingsRefreshed,
    Done,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "PARSED",
            Self::TreeBuilt => "TREE_BUILT",
            Self::IdentityResolved => "IDENTITY_RESOLVED",
            Self::ParentsLinked => "PARENTS_LINKED",
            Self::DeletionsApplied => "DELETIONS_APPLIED",
            Self::EmbeddingsRefreshed => "EMBEDDINGS_REFRESHED",
            Self::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// Callback interface for reporting progress to the caller (CLI, tests).
pub trait ProgressReporter: Send + Sync {
    /// Called when the run reaches a new state.
    fn state(&self, state: SyncState);
    /// Called after each embedding batch.
    fn batch_embedded(&self, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, report: &SyncReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn state(&self, _state: SyncState) {}
    fn batch_embedded(&self, _current: usize, _total: usize) {}
    fn done(&self, _report: &SyncReport) {}
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// Result of [`stage_batch`].
#[derive(Debug, Clone)]
pub struct StageReport {
    pub subject: Subject,
    pub batch_id: String,
    pub staged: usize,
    pub skipped: usize,
    pub truncated: usize,
}

/// Replace the subject's staging batch with freshly parsed topics.
#[instrument(skip_all, fields(subject = %key, topics = batch.topics.len()))]
pub async fn stage_batch(
    storage: &Storage,
    key: &SubjectKey,
    subject_name: Option<&str>,
    batch: &ParsedBatch,
) -> Result<StageReport> {
    if batch.topics.is_empty() {
        return Err(TopicSyncError::validation(format!(
            "no topics parsed for {key} ({} lines skipped)",
            batch.skipped
        )));
    }

    let subject = storage.ensure_subject(key, subject_name).await?;
    let batch_id = Uuid::now_v7().to_string();
    let staged = storage
        .replace_staging_topics(&subject.id, &batch_id, &batch.topics)
        .await?;

    info!(subject_id = %subject.id, %batch_id, staged, skipped = batch.skipped, "staging batch written");

    Ok(StageReport {
        subject,
        batch_id,
        staged,
        skipped: batch.skipped,
        truncated: batch.truncated,
    })
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

/// Options for [`sync_subject`].
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub title_filter: TitleFilter,
    /// Leave the staging batch in place after a successful promotion.
    pub keep_staging: bool,
    /// Version tag written on embedding records; defaults to a tree fingerprint.
    pub spec_version: Option<String>,
}

/// Everything a run did.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub subject_id: String,
    /// Last state the run completed.
    pub final_state: SyncState,
    pub staged: usize,
    pub tree: TreeReport,
    pub promote: PromoteReport,
    pub topic_count: usize,
    pub violations: Vec<String>,
    pub spec_version: String,
    /// `None` when the embedding phase was skipped or failed.
    pub index: Option<IndexReport>,
    pub embeddings_skipped: bool,
    /// Topics left without a fresh embedding because the phase failed.
    pub embedding_failures: usize,
    pub embedding_error: Option<String>,
    pub elapsed: Duration,
}

impl SyncReport {
    pub fn matched(&self) -> usize {
        self.promote.matched_by_code + self.promote.matched_by_title
    }

    pub fn embeddings_written(&self) -> usize {
        self.index.as_ref().map_or(0, |i| i.written)
    }

    /// Whether the run finished without a run-level error.
    pub fn is_success(&self) -> bool {
        self.final_state == SyncState::Done && self.embedding_error.is_none()
    }
}

/// Promote the staged batch of `key` and refresh its embedding index.
///
/// Pass `None` as `embedder` to skip the embedding phase. An embedding
/// failure does not undo promotion; it is reported through
/// [`SyncReport::embedding_error`].
#[instrument(skip_all, fields(subject = %key))]
pub async fn sync_subject<C, E, S>(
    config: &SyncConfig,
    storage: &Storage,
    key: &SubjectKey,
    checker: &C,
    embedder: Option<&E>,
    summarizer: Option<&S>,
    progress: &dyn ProgressReporter,
) -> Result<SyncReport>
where
    C: ReferenceChecker,
    E: Embedder,
    S: Summarizer,
{
    let start = Instant::now();

    let subject = storage
        .get_subject(key)
        .await?
        .ok_or_else(|| TopicSyncError::validation(format!("subject {key} has never been staged")))?;
    let staging = storage.list_staging_topics(&subject.id).await?;
    if staging.is_empty() {
        return Err(TopicSyncError::validation(format!(
            "staging batch for {key} is empty, refusing to promote"
        )));
    }
    progress.state(SyncState::Parsed);
    info!(subject_id = %subject.id, staged = staging.len(), "starting synchronization");

    // --- Tree ---
    let built = tree::build_tree(&staging, &config.title_filter);
    if built.nodes.is_empty() {
        return Err(TopicSyncError::validation(format!(
            "every staged topic for {key} was filtered, refusing to promote"
        )));
    }
    progress.state(SyncState::TreeBuilt);

    // --- Promotion ---
    let outcome = promote::promote_tree(storage, &subject.id, &built.nodes, checker, progress).await?;

    if !config.keep_staging {
        if let Err(e) = storage.clear_staging_topics(&subject.id).await {
            warn!(error = %e, "failed to clear staging batch");
        }
    }

    let spec_version = config
        .spec_version
        .clone()
        .unwrap_or_else(|| tree_fingerprint(&outcome.topics));

    let mut report = SyncReport {
        subject_id: subject.id.clone(),
        final_state: SyncState::DeletionsApplied,
        staged: staging.len(),
        tree: built.report,
        promote: outcome.report,
        topic_count: outcome.topics.len(),
        violations: outcome.violations,
        spec_version,
        index: None,
        embeddings_skipped: embedder.is_none(),
        embedding_failures: 0,
        embedding_error: None,
        elapsed: Duration::ZERO,
    };

    // --- Embeddings ---
    match embedder {
        Some(embedder) => {
            match index::refresh_embeddings(
                storage,
                &subject,
                &outcome.topics,
                embedder,
                summarizer,
                &report.spec_version,
                progress,
            )
            .await
            {
                Ok(index) => {
                    report.index = Some(index);
                    report.final_state = SyncState::EmbeddingsRefreshed;
                    progress.state(SyncState::EmbeddingsRefreshed);
                }
                Err(e) => {
                    error!(error = %e, "embedding phase aborted, topic tree kept");
                    report.embedding_failures = outcome.topics.len();
                    report.embedding_error = Some(e.to_string());
                }
            }
        }
        None => info!("embedding phase skipped"),
    }

    if report.embedding_error.is_none() {
        report.final_state = SyncState::Done;
        progress.state(SyncState::Done);
    }
    report.elapsed = start.elapsed();

    info!(
        matched = report.matched(),
        inserted = report.promote.inserted,
        parents_linked = report.promote.parents_linked,
        deleted = report.promote.deleted,
        kept = report.promote.kept_referenced,
        embeddings = report.embeddings_written(),
        embedding_failures = report.embedding_failures,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "synchronization finished"
    );

    progress.done(&report);
    Ok(report)
}

/// Stage `batch` and synchronize it in one go.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync<C, E, S>(
    config: &SyncConfig,
    storage: &Storage,
    key: &SubjectKey,
    subject_name: Option<&str>,
    batch: &ParsedBatch,
    checker: &C,
    embedder: Option<&E>,
    summarizer: Option<&S>,
    progress: &dyn ProgressReporter,
) -> Result<SyncReport>
where
    C: ReferenceChecker,
    E: Embedder,
    S: Summarizer,
{
    stage_batch(storage, key, subject_name, batch).await?;
    sync_subject(config, storage, key, checker, embedder, summarizer, progress).await
}

/// Rebuild the embedding index of an already-promoted subject.
#[instrument(skip_all, fields(subject = %key))]
pub async fn reindex_subject<E: Embedder, S: Summarizer>(
    storage: &Storage,
    key: &SubjectKey,
    embedder: &E,
    summarizer: Option<&S>,
    spec_version: Option<&str>,
    progress: &dyn ProgressReporter,
) -> Result<IndexReport> {
    let subject = storage
        .get_subject(key)
        .await?
        .ok_or_else(|| TopicSyncError::validation(format!("unknown subject {key}")))?;
    let topics = storage.list_topics(&subject.id).await?;

    let spec_version = match spec_version {
        Some(v) => v.to_string(),
        None => tree_fingerprint(&topics),
    };

    let report =
        index::refresh_embeddings(storage, &subject, &topics, embedder, summarizer, &spec_version, progress)
            .await?;
    progress.state(SyncState::EmbeddingsRefreshed);
    Ok(report)
}

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// Short SHA-256 over the production tree, used as the default version tag.
pub fn tree_fingerprint(topics: &[ProductionTopic]) -> String {
    let mut hasher = Sha256::new();
    for topic in topics {
        hasher.update(topic.code.as_bytes());
        hasher.update([0]);
        hasher.update(topic.title.as_bytes());
        hasher.update([0, topic.level, b'\n']);
    }
    hasher.finalize()[..6].iter().map(|b| format!("{b:02x}")).collect()
}
