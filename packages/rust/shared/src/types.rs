//! Core domain types for topic synchronization.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TopicSyncError;

// ---------------------------------------------------------------------------
// TopicId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for production topic identifiers (time-sortable).
///
/// Issued by the store on first insert and never reused for another topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub Uuid);

impl TopicId {
    /// Generate a new time-sortable topic identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TopicId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TopicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TopicId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// Identity of one unit of work: `(exam_board, qualification, subject)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectKey {
    pub exam_board: String,
    pub qualification: String,
    /// Subject code (preferred) or name.
    pub subject: String,
}

impl SubjectKey {
    pub fn new(
        exam_board: impl Into<String>,
        qualification: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            exam_board: exam_board.into(),
            qualification: qualification.into(),
            subject: subject.into(),
        }
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.exam_board, self.qualification, self.subject)
    }
}

/// A subject row in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub exam_board: String,
    pub qualification: String,
    pub code: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// StagingTopic
// ---------------------------------------------------------------------------

/// One freshly extracted topic in a staging batch.
///
/// Deserialization goes through [`StagingTopic::new`], so a record with an
/// empty code or title is rejected instead of flowing into the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StagingTopicRecord")]
pub struct StagingTopic {
    /// Unique within the subject's staging batch (e.g. `ECON-1-2`).
    pub code: String,
    pub title: String,
    /// 0 = subject root section.
    pub level: u8,
    /// Code of the parent staging topic, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_code: Option<String>,
}

impl StagingTopic {
    /// Build a staging topic, rejecting blank codes or titles.
    pub fn new(
        code: impl Into<String>,
        title: impl Into<String>,
        level: u8,
        parent_code: Option<String>,
    ) -> Result<Self, TopicSyncError> {
        let code = code.into().trim().to_string();
        let title = title.into().trim().to_string();
        if code.is_empty() {
            return Err(TopicSyncError::validation("topic code is empty"));
        }
        if title.is_empty() {
            return Err(TopicSyncError::validation(format!(
                "topic {code} has an empty title"
            )));
        }
        let parent_code = parent_code
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        Ok(Self {
            code,
            title,
            level,
            parent_code,
        })
    }
}

/// Wire shape of a flat-list record before validation.
#[derive(Debug, Deserialize)]
struct StagingTopicRecord {
    code: String,
    title: String,
    level: u8,
    #[serde(default)]
    parent_code: Option<String>,
}

impl TryFrom<StagingTopicRecord> for StagingTopic {
    type Error = TopicSyncError;

    fn try_from(r: StagingTopicRecord) -> Result<Self, Self::Error> {
        StagingTopic::new(r.code, r.title, r.level, r.parent_code)
    }
}

// ---------------------------------------------------------------------------
// ProductionTopic
// ---------------------------------------------------------------------------

/// A durable, identity-stable topic row that downstream records may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductionTopic {
    pub id: TopicId,
    pub subject_id: String,
    pub code: String,
    pub title: String,
    pub level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<TopicId>,
    /// Sibling display order.
    pub sort_order: i64,
}

// ---------------------------------------------------------------------------
// EmbeddingRecord
// ---------------------------------------------------------------------------

/// Per-topic vector representation, one-to-one with a current production topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub topic_id: TopicId,
    pub subject_id: String,
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Ancestor titles, root first.
    pub full_path: Vec<String>,
    pub level: u8,
    pub subject_label: String,
    pub exam_board: String,
    pub qualification: String,
    pub active: bool,
    pub spec_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_id_roundtrip() {
        let id = TopicId::new();
        let s = id.to_string();
        let parsed: TopicId = s.parse().expect("parse TopicId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn subject_key_display() {
        let key = SubjectKey::new("AQA", "A-Level", "ECON");
        assert_eq!(key.to_string(), "AQA/A-Level/ECON");
    }

    #[test]
    fn staging_topic_trims_and_drops_blank_parent() {
        let topic = StagingTopic::new(" E-1 ", " Markets ", 0, Some("  ".into())).unwrap();
        assert_eq!(topic.code, "E-1");
        assert_eq!(topic.title, "Markets");
        assert!(topic.parent_code.is_none());
    }

    #[test]
    fn staging_topic_rejects_missing_title() {
        let err = StagingTopic::new("E-1", "   ", 0, None).unwrap_err();
        assert!(err.to_string().contains("empty title"));
    }

    #[test]
    fn staging_topic_deserializes_through_validation() {
        let ok: StagingTopic = serde_json::from_str(
            r#"{"code":"E-1-1","title":"Supply and demand","level":1,"parent_code":"E-1"}"#,
        )
        .expect("valid record");
        assert_eq!(ok.parent_code.as_deref(), Some("E-1"));

        let missing = serde_json::from_str::<StagingTopic>(r#"{"code":"E-1","level":0}"#);
        assert!(missing.is_err());

        let blank = serde_json::from_str::<StagingTopic>(r#"{"code":"","title":"X","level":0}"#);
        assert!(blank.is_err());
    }
}
