//! Outline and flat-list ingestion.
//!
//! Upstream extraction hands topics over in one of two shapes: numbered
//! outline text (`1.2.3 Title` per line) or an already-flat JSON list of
//! `{code, title, level, parent_code}` records. Both are turned into a list
//! of [`StagingTopic`]s here; malformed lines or records are skipped and
//! counted, never fatal.

mod flat;
mod parser;

use topicsync_shared::StagingTopic;

pub use flat::parse_flat_json;
pub use parser::{OutlineOptions, code_for_path, parse_outline};

/// Result of ingesting one batch of topic input.
#[derive(Debug, Clone, Default)]
pub struct ParsedBatch {
    /// Topics in input order.
    pub topics: Vec<StagingTopic>,
    /// Lines or records that did not match and were skipped.
    pub skipped: usize,
    /// Outline lines dropped for exceeding the level cap.
    pub truncated: usize,
}
