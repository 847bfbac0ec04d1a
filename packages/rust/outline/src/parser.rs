//! Numbered-outline parser.
//!
//! Each topic line looks like `<dotted-number>[.] <title>`:
//! - `1 Markets` → level 0
//! - `1.2. Supply and demand` → level 1, parent `1`
//! - `1.2.3 Price elasticity` → level 2, parent `1.2`
//!
//! Anything else (commentary, blank lines, page furniture) is skipped.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use topicsync_shared::StagingTopic;

use crate::ParsedBatch;

/// Matches `1.2.3 Title` or `1.2.3. Title`.
static OUTLINE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+(?:\.\d+)*)\.?\s+(\S.*?)\s*$").expect("outline line regex")
});

/// Options for [`parse_outline`].
#[derive(Debug, Clone)]
pub struct OutlineOptions {
    /// Prepended to every code, e.g. `ECON` → `ECON-1-2`.
    pub code_prefix: String,
    /// Added to the dot-depth of every line.
    pub level_offset: u8,
    /// Lines whose level exceeds this are dropped.
    pub level_cap: Option<u8>,
}

impl OutlineOptions {
    pub fn new(code_prefix: impl Into<String>) -> Self {
        Self {
            code_prefix: code_prefix.into(),
            level_offset: 0,
            level_cap: None,
        }
    }
}

/// Parse numbered outline text into staging topics, in input order.
///
/// Deterministic: the same text and options always yield the same codes.
#[instrument(skip_all, fields(prefix = %opts.code_prefix))]
pub fn parse_outline(text: &str, opts: &OutlineOptions) -> ParsedBatch {
    let mut batch = ParsedBatch::default();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let Some(caps) = OUTLINE_LINE_RE.captures(line) else {
            debug!(line, "skipping non-outline line");
            batch.skipped += 1;
            continue;
        };

        let path = &caps[1];
        let title = &caps[2];
        let depth = path.matches('.').count();

        let Some(level) = u8::try_from(depth)
            .ok()
            .and_then(|d| d.checked_add(opts.level_offset))
        else {
            batch.truncated += 1;
            continue;
        };

        if opts.level_cap.is_some_and(|cap| level > cap) {
            debug!(path, level, "dropping line beyond level cap");
            batch.truncated += 1;
            continue;
        }

        let code = code_for_path(&opts.code_prefix, path);
        let parent_code = path
            .rsplit_once('.')
            .map(|(parent, _)| code_for_path(&opts.code_prefix, parent));

        match StagingTopic::new(code, title, level, parent_code) {
            Ok(topic) => batch.topics.push(topic),
            Err(e) => {
                debug!(line, error = %e, "skipping invalid outline line");
                batch.skipped += 1;
            }
        }
    }

    debug!(
        topics = batch.topics.len(),
        skipped = batch.skipped,
        truncated = batch.truncated,
        "outline parsed"
    );

    batch
}

/// Build a topic code from a dotted numeric path: `("ECON", "1.2")` → `ECON-1-2`.
pub fn code_for_path(prefix: &str, path: &str) -> String {
    let dashed = path.replace('.', "-");
    if prefix.is_empty() {
        dashed
    } else {
        format!("{prefix}-{dashed}")
    }
}
