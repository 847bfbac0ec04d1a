//! Embedding index generation.
//!
//! Builds a context string per production topic (title, ancestor path, code),
//! embeds them in batches, and replaces the subject's embedding records in a
//! single store transaction. Every batch must succeed before anything is
//! written, so a failed run leaves the previous index untouched.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use topicsync_embedding::Embedder;
use topicsync_shared::{EmbeddingRecord, ProductionTopic, Result, Subject, TopicId, TopicSyncError};
use topicsync_storage::Storage;

use crate::pipeline::ProgressReporter;
use crate::summary::{Summarizer, SummaryInput};

/// Counters for one index refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub written: usize,
    pub batches: usize,
    pub summaries: usize,
    pub summary_failures: usize,
}

/// Ancestor titles of `topic`, root first.
pub fn ancestor_titles(
    topic: &ProductionTopic,
    by_id: &HashMap<TopicId, &ProductionTopic>,
) -> Vec<String> {
    let mut titles = Vec::new();
    let mut seen = HashSet::from([topic.id]);
    let mut next = topic.parent_id;

    while let Some(id) = next {
        if !seen.insert(id) {
            break;
        }
        let Some(parent) = by_id.get(&id) else {
            break;
        };
        titles.push(parent.title.clone());
        next = parent.parent_id;
    }

    titles.reverse();
    titles
}

/// Text sent to the embedding service for one topic.
pub fn context_string(title: &str, path: &[String], code: &str) -> String {
    format!("{title}\nPath: {}\nCode: {code}", path.join(" > "))
}

/// Re-embed every production topic of `subject` and replace its index.
#[instrument(skip_all, fields(subject_id = %subject.id, topics = topics.len()))]
pub async fn refresh_embeddings<E: Embedder, S: Summarizer>(
    storage: &Storage,
    subject: &Subject,
    topics: &[ProductionTopic],
    embedder: &E,
    summarizer: Option<&S>,
    spec_version: &str,
    progress: &dyn ProgressReporter,
) -> Result<IndexReport> {
    let mut report = IndexReport::default();
    let by_id: HashMap<TopicId, &ProductionTopic> = topics.iter().map(|t| (t.id, t)).collect();
    let paths: Vec<Vec<String>> = topics.iter().map(|t| ancestor_titles(t, &by_id)).collect();
    let contexts: Vec<String> = topics
        .iter()
        .zip(&paths)
        .map(|(t, path)| context_string(&t.title, path, &t.code))
        .collect();

    // --- Embed all batches before touching the store ---
    let batch_size = embedder.batch_size().max(1);
    let total = contexts.len().div_ceil(batch_size);
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(contexts.len());

    for (i, batch) in contexts.chunks(batch_size).enumerate() {
        let embedded = embedder.embed(batch).await.map_err(|e| {
            TopicSyncError::Embedding(format!("batch {}/{total} failed: {e}", i + 1))
        })?;
        if embedded.len() != batch.len() {
            return Err(TopicSyncError::Embedding(format!(
                "batch {}/{total}: expected {} vectors, got {}",
                i + 1,
                batch.len(),
                embedded.len()
            )));
        }
        vectors.extend(embedded);
        report.batches += 1;
        progress.batch_embedded(i + 1, total);
        debug!(batch = i + 1, total, "embedded batch");
    }

    if let Some(first) = vectors.first() {
        let dims = first.len();
        if dims == 0 || vectors.iter().any(|v| v.len() != dims) {
            return Err(TopicSyncError::Embedding(
                "embedding service returned inconsistent vector dimensions".into(),
            ));
        }
    }

    // --- Summaries ---
    let mut summaries: Vec<Option<String>> = vec![None; topics.len()];
    if let Some(summarizer) = summarizer {
        for (i, topic) in topics.iter().enumerate() {
            let input = SummaryInput {
                title: &topic.title,
                code: &topic.code,
                level: topic.level,
                path: &paths[i],
                subject_label: &subject.name,
            };
            match summarizer.summarize(input).await {
                Ok(summary) => {
                    summaries[i] = Some(summary);
                    report.summaries += 1;
                }
                Err(e) => {
                    warn!(code = %topic.code, error = %e, "summary failed, storing none");
                    report.summary_failures += 1;
                }
            }
        }
    }

    let records: Vec<EmbeddingRecord> = topics
        .iter()
        .zip(vectors)
        .zip(paths)
        .zip(summaries)
        .map(|(((topic, vector), full_path), summary)| EmbeddingRecord {
            topic_id: topic.id,
            subject_id: subject.id.clone(),
            vector,
            summary,
            full_path,
            level: topic.level,
            subject_label: subject.name.clone(),
            exam_board: subject.exam_board.clone(),
            qualification: subject.qualification.clone(),
            active: true,
            spec_version: spec_version.to_string(),
        })
        .collect();

    report.written = storage.replace_subject_embeddings(&subject.id, &records).await?;
    info!(written = report.written, batches = report.batches, "embedding index replaced");

    Ok(report)
}
