//! Topic tree builder.
//!
//! Turns a raw staging batch into a cleaned, leveled node list ready for
//! promotion:
//! 1. Drops duplicate codes (first occurrence wins)
//! 2. Removes administrative sections matched by the title denylist,
//!    reparenting their children to the nearest surviving ancestor
//! 3. Demotes nodes whose parent is missing or not strictly shallower to roots
//! 4. Assigns a deterministic `sort_order` from `(level, code)`

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use regex::{Regex, RegexBuilder};
use tracing::{debug, instrument, warn};

use topicsync_shared::{FiltersConfig, Result, StagingTopic, TopicSyncError, normalize_title};

/// A cleaned staging node with its display order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub code: String,
    pub title: String,
    pub level: u8,
    pub parent_code: Option<String>,
    pub sort_order: i64,
}

/// Counts of everything the builder changed or dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeReport {
    /// Nodes removed by the title denylist.
    pub filtered: usize,
    /// Nodes moved up to a surviving ancestor because their parent was filtered.
    pub reparented: usize,
    /// Nodes whose `parent_code` resolved to nothing, demoted to roots.
    pub orphaned: usize,
    /// Nodes whose parent was not at a strictly smaller level, demoted to roots.
    pub invalid_parents: usize,
    /// Later occurrences of an already-seen code.
    pub duplicates: usize,
}

/// Output of [`build_tree`]: nodes ordered by `sort_order`.
#[derive(Debug, Clone, Default)]
pub struct BuiltTree {
    pub nodes: Vec<TreeNode>,
    pub report: TreeReport,
}

// ---------------------------------------------------------------------------
// Title filter
// ---------------------------------------------------------------------------

/// Denylist of administrative section titles.
#[derive(Debug, Clone, Default)]
pub struct TitleFilter {
    patterns: Vec<Regex>,
}

impl TitleFilter {
    /// Compile case-insensitive patterns; an invalid pattern is a config error.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| TopicSyncError::config(format!("invalid title pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn from_config(config: &FiltersConfig) -> Result<Self> {
        Self::new(&config.title_denylist)
    }

    /// Whether `title` names a section that should not become a topic.
    pub fn is_denied(&self, title: &str) -> bool {
        let key = normalize_title(title);
        self.patterns.iter().any(|re| re.is_match(&key))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build a cleaned node list from a staging batch.
#[instrument(skip_all, fields(topics = topics.len()))]
pub fn build_tree(topics: &[StagingTopic], filter: &TitleFilter) -> BuiltTree {
    let mut report = TreeReport::default();

    // --- Dedup by code ---
    let mut unique: Vec<&StagingTopic> = Vec::with_capacity(topics.len());
    let mut by_code: HashMap<&str, &StagingTopic> = HashMap::new();
    for topic in topics {
        if by_code.contains_key(topic.code.as_str()) {
            warn!(code = %topic.code, title = %topic.title, "duplicate staging code, keeping first");
            report.duplicates += 1;
            continue;
        }
        by_code.insert(topic.code.as_str(), topic);
        unique.push(topic);
    }

    // --- Denylist ---
    let removed: HashSet<&str> = unique
        .iter()
        .filter(|t| filter.is_denied(&t.title))
        .map(|t| t.code.as_str())
        .collect();
    report.filtered = removed.len();
    if !removed.is_empty() {
        debug!(removed = ?removed, "filtered administrative sections");
    }

    // --- Parent resolution ---
    let mut nodes: Vec<TreeNode> = Vec::with_capacity(unique.len() - removed.len());
    for topic in unique.iter().filter(|t| !removed.contains(t.code.as_str())) {
        let parent = match surviving_ancestor(topic, &by_code, &removed) {
            Ancestor::Root { moved } => {
                if moved {
                    report.reparented += 1;
                }
                None
            }
            Ancestor::Found { code, moved } => {
                if moved {
                    report.reparented += 1;
                }
                let parent_level = by_code[code].level;
                if parent_level < topic.level {
                    Some(code.to_string())
                } else {
                    warn!(
                        code = %topic.code,
                        parent = code,
                        level = topic.level,
                        parent_level,
                        "parent is not shallower than child, demoting to root"
                    );
                    report.invalid_parents += 1;
                    None
                }
            }
            Ancestor::Missing { code } => {
                warn!(code = %topic.code, parent = %code, "parent code resolves to nothing, demoting to root");
                report.orphaned += 1;
                None
            }
        };

        nodes.push(TreeNode {
            code: topic.code.clone(),
            title: topic.title.clone(),
            level: topic.level,
            parent_code: parent,
            sort_order: 0,
        });
    }

    // --- Deterministic ordering ---
    nodes.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| compare_codes(&a.code, &b.code)));
    for (i, node) in nodes.iter_mut().enumerate() {
        node.sort_order = i as i64;
    }

    debug!(
        nodes = nodes.len(),
        filtered = report.filtered,
        reparented = report.reparented,
        orphaned = report.orphaned,
        invalid_parents = report.invalid_parents,
        duplicates = report.duplicates,
        "topic tree built"
    );

    BuiltTree { nodes, report }
}

enum Ancestor<'a> {
    /// No parent; `moved` when every ancestor was filtered.
    Root { moved: bool },
    Found { code: &'a str, moved: bool },
    Missing { code: String },
}

/// Walk up the `parent_code` chain past filtered nodes.
fn surviving_ancestor<'a>(
    topic: &StagingTopic,
    by_code: &HashMap<&'a str, &'a StagingTopic>,
    removed: &HashSet<&str>,
) -> Ancestor<'a> {
    let mut next = topic.parent_code.as_deref();
    let mut moved = false;
    let mut seen: HashSet<&str> = HashSet::new();

    while let Some(code) = next {
        let Some((&key, parent)) = by_code.get_key_value(code) else {
            return Ancestor::Missing {
                code: code.to_string(),
            };
        };
        if !removed.contains(key) {
            return Ancestor::Found { code: key, moved };
        }
        if !seen.insert(key) {
            // Cycle made only of filtered nodes
            break;
        }
        moved = true;
        next = parent.parent_code.as_deref();
    }

    Ancestor::Root { moved }
}

/// Compare codes segment by segment, numerically where both segments are numbers.
pub fn compare_codes(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.split(['-', '.']).map(str::to_string).collect()
    };
    let (sa, sb) = (split(a), split(b));

    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len()).then_with(|| a.cmp(b))
}
