//! Flat-list ingestion: a JSON array of `{code, title, level, parent_code}`.

use tracing::{debug, warn};

use topicsync_shared::{Result, StagingTopic, TopicSyncError};

use crate::ParsedBatch;

/// Parse a JSON array of topic records.
///
/// The document itself must be a JSON array; individual records that fail
/// validation are skipped and counted.
pub fn parse_flat_json(content: &str) -> Result<ParsedBatch> {
    let values: Vec<serde_json::Value> = serde_json::from_str(content)
        .map_err(|e| TopicSyncError::parse(format!("flat topic list is not a JSON array: {e}")))?;

    let mut batch = ParsedBatch::default();
    for (i, value) in values.into_iter().enumerate() {
        match serde_json::from_value::<StagingTopic>(value) {
            Ok(topic) => batch.topics.push(topic),
            Err(e) => {
                warn!(index = i, error = %e, "skipping malformed topic record");
                batch.skipped += 1;
            }
        }
    }

    debug!(
        topics = batch.topics.len(),
        skipped = batch.skipped,
        "flat topic list parsed"
    );
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_records_and_skips_malformed() {
        let json = r#"[
            {"code": "E-1", "title": "Markets", "level": 0},
            {"code": "E-1-1", "title": "Supply and demand", "level": 1, "parent_code": "E-1"},
            {"code": "E-1-2", "level": 1},
            {"code": "E-1-3", "title": "Elasticity", "level": -1},
            "not an object"
        ]"#;

        let batch = parse_flat_json(json).expect("parse");
        assert_eq!(batch.topics.len(), 2);
        assert_eq!(batch.skipped, 3);
        assert_eq!(batch.topics[1].parent_code.as_deref(), Some("E-1"));
    }

    #[test]
    fn rejects_non_array_document() {
        let err = parse_flat_json(r#"{"code": "E-1"}"#).unwrap_err();
        assert!(matches!(err, TopicSyncError::Parse { .. }));
    }

    #[test]
    fn flat_fixture_parses() {
        let fixture = std::fs::read_to_string("../../../fixtures/json/economics.flat.json")
            .expect("read flat fixture");
        let batch = parse_flat_json(&fixture).expect("parse fixture");
        assert_eq!(batch.topics.len(), 5);
        assert_eq!(batch.skipped, 1);
    }
}
