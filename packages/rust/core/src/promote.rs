//! Promotion of a built topic tree into production.
//!
//! Production topics carry identities that downstream records point at, so
//! promotion never rebuilds the table. It reconciles in place:
//!
//! 1. Resolve each staging node to an existing production topic, by code
//!    first and by `(level, normalized title)` second
//! 2. Write attributes: update matched topics, insert the rest, all as roots
//! 3. Refresh the `code -> id` map from production
//! 4. Link parents once every node has an identity
//! 5. Delete production topics absent from staging, unless referenced
//! 6. Repair kept topics whose parent link is no longer valid
//!
//! Single-node write failures are logged and counted; the run carries on.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument, warn};

use topicsync_shared::{ProductionTopic, Result, TopicId, normalize_title};
use topicsync_storage::{Storage, TopicWrite};

use crate::pipeline::{ProgressReporter, SyncState};
use crate::safety::ReferenceChecker;
use crate::tree::TreeNode;

/// Counters for one promotion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromoteReport {
    pub matched_by_code: usize,
    pub matched_by_title: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Staging nodes that lost a production identity to a later claimant.
    pub ambiguous: usize,
    pub parents_linked: usize,
    /// Parent codes that did not resolve to a valid production parent.
    pub unresolved_parents: usize,
    pub deleted: usize,
    /// Absent from staging but still referenced downstream.
    pub kept_referenced: usize,
    /// Topics detached to roots by the repair pass.
    pub detached: usize,
    pub write_failures: usize,
}

/// Result of [`promote_tree`]: counters plus the production tree afterwards.
#[derive(Debug, Clone)]
pub struct PromoteOutcome {
    pub report: PromoteReport,
    pub topics: Vec<ProductionTopic>,
    /// Structural problems left in production after repair. Empty on success.
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchKind {
    Code,
    Title,
}

/// Reconcile production topics of `subject_id` with `nodes`.
#[instrument(skip_all, fields(subject_id = %subject_id, nodes = nodes.len()))]
pub async fn promote_tree<C: ReferenceChecker>(
    storage: &Storage,
    subject_id: &str,
    nodes: &[TreeNode],
    checker: &C,
    progress: &dyn ProgressReporter,
) -> Result<PromoteOutcome> {
    let mut report = PromoteReport::default();
    let production = storage.list_topics(subject_id).await?;

    let resolutions = resolve_identities(nodes, &production, &mut report);
    let claimed: HashSet<TopicId> = resolutions.iter().flatten().map(|(id, _)| *id).collect();
    progress.state(SyncState::IdentityResolved);

    write_attributes(storage, subject_id, nodes, &resolutions, &mut report).await;

    let refreshed = storage.list_topics(subject_id).await?;
    let ids = refresh_identity_map(&refreshed);
    link_parents(storage, nodes, &refreshed, &ids, &mut report).await;
    progress.state(SyncState::ParentsLinked);

    let staging_codes: HashSet<&str> = nodes.iter().map(|n| n.code.as_str()).collect();
    apply_deletions(storage, &refreshed, &staging_codes, &claimed, checker, &mut report).await;
    progress.state(SyncState::DeletionsApplied);

    let remaining = storage.list_topics(subject_id).await?;
    repair_parents(storage, &remaining, &mut report).await;

    let topics = storage.list_topics(subject_id).await?;
    let violations = validate_tree(&topics);
    for violation in &violations {
        warn!(%violation, "production tree violation");
    }

    info!(
        matched = report.matched_by_code + report.matched_by_title,
        inserted = report.inserted,
        deleted = report.deleted,
        kept = report.kept_referenced,
        failures = report.write_failures,
        "promotion complete"
    );

    Ok(PromoteOutcome {
        report,
        topics,
        violations,
    })
}

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// One entry per staging node: the production identity it takes over, if any.
///
/// When two staging nodes resolve to the same production topic the later
/// one wins; the earlier one falls through to insertion.
fn resolve_identities(
    nodes: &[TreeNode],
    production: &[ProductionTopic],
    report: &mut PromoteReport,
) -> Vec<Option<(TopicId, MatchKind)>> {
    let mut by_code: HashMap<&str, TopicId> = HashMap::new();
    let mut by_title: HashMap<(u8, String), TopicId> = HashMap::new();
    for topic in production {
        by_code.entry(topic.code.as_str()).or_insert(topic.id);
        by_title
            .entry((topic.level, normalize_title(&topic.title)))
            .or_insert(topic.id);
    }

    let mut resolutions: Vec<Option<(TopicId, MatchKind)>> = vec![None; nodes.len()];
    let mut claims: HashMap<TopicId, usize> = HashMap::new();

    for (i, node) in nodes.iter().enumerate() {
        let found = by_code
            .get(node.code.as_str())
            .map(|id| (*id, MatchKind::Code))
            .or_else(|| {
                by_title
                    .get(&(node.level, normalize_title(&node.title)))
                    .map(|id| (*id, MatchKind::Title))
            });

        let Some((id, kind)) = found else {
            continue;
        };

        if let Some(earlier) = claims.insert(id, i) {
            warn!(
                topic_id = %id,
                earlier = %nodes[earlier].code,
                later = %node.code,
                "two staging topics resolve to one production topic, later wins"
            );
            resolutions[earlier] = None;
            report.ambiguous += 1;
        }
        resolutions[i] = Some((id, kind));
    }

    for (id, kind) in resolutions.iter().flatten() {
        match kind {
            MatchKind::Code => report.matched_by_code += 1,
            MatchKind::Title => report.matched_by_title += 1,
        }
        debug!(topic_id = %id, ?kind, "resolved identity");
    }

    resolutions
}

// ---------------------------------------------------------------------------
// Pass 1: attributes
// ---------------------------------------------------------------------------

/// Update matched topics and insert the rest in one store transaction.
///
/// Title keys are released for the duration of the batch, so titles may move
/// between topics within one run. Collisions among the batch itself still fail
/// the later write.
async fn write_attributes(
    storage: &Storage,
    subject_id: &str,
    nodes: &[TreeNode],
    resolutions: &[Option<(TopicId, MatchKind)>],
    report: &mut PromoteReport,
) {
    let writes: Vec<TopicWrite<'_>> = nodes
        .iter()
        .zip(resolutions)
        .map(|(node, resolution)| TopicWrite {
            id: resolution.map(|(id, _)| id),
            code: &node.code,
            title: &node.title,
            level: node.level,
            sort_order: node.sort_order,
        })
        .collect();

    let results = match storage.write_topics(subject_id, &writes).await {
        Ok(results) => results,
        Err(e) => {
            warn!(error = %e, "attribute batch failed");
            report.write_failures += nodes.len();
            return;
        }
    };

    for ((node, write), result) in nodes.iter().zip(&writes).zip(results) {
        match result {
            Ok(id) if write.id.is_some() => {
                debug!(topic_id = %id, code = %node.code, "updated topic");
                report.updated += 1;
            }
            Ok(id) => {
                debug!(topic_id = %id, code = %node.code, "inserted topic");
                report.inserted += 1;
            }
            Err(e) => {
                warn!(code = %node.code, title = %node.title, error = %e, "failed to write topic");
                report.write_failures += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2: parents
// ---------------------------------------------------------------------------

fn refresh_identity_map(production: &[ProductionTopic]) -> HashMap<&str, TopicId> {
    let mut ids = HashMap::with_capacity(production.len());
    for topic in production {
        ids.entry(topic.code.as_str()).or_insert(topic.id);
    }
    ids
}

async fn link_parents(
    storage: &Storage,
    nodes: &[TreeNode],
    production: &[ProductionTopic],
    ids: &HashMap<&str, TopicId>,
    report: &mut PromoteReport,
) {
    let levels: HashMap<TopicId, u8> = production.iter().map(|t| (t.id, t.level)).collect();

    for node in nodes {
        let Some(parent_code) = node.parent_code.as_deref() else {
            continue;
        };
        let Some(&child) = ids.get(node.code.as_str()) else {
            // Pass 1 failed for this node
            continue;
        };

        let parent = ids
            .get(parent_code)
            .copied()
            .filter(|p| levels.get(p).is_some_and(|level| *level < node.level));
        let Some(parent) = parent else {
            warn!(code = %node.code, parent = parent_code, "parent did not resolve, leaving topic as root");
            report.unresolved_parents += 1;
            continue;
        };

        match storage.set_topic_parent(child, Some(parent)).await {
            Ok(()) => report.parents_linked += 1,
            Err(e) => {
                warn!(code = %node.code, error = %e, "failed to link parent");
                report.write_failures += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

async fn apply_deletions<C: ReferenceChecker>(
    storage: &Storage,
    production: &[ProductionTopic],
    staging_codes: &HashSet<&str>,
    claimed: &HashSet<TopicId>,
    checker: &C,
    report: &mut PromoteReport,
) {
    let removed = production
        .iter()
        .filter(|t| !staging_codes.contains(t.code.as_str()) && !claimed.contains(&t.id));

    for topic in removed {
        if checker.is_referenced(topic.id).await {
            warn!(topic_id = %topic.id, code = %topic.code, "topic removed upstream but still referenced, keeping");
            report.kept_referenced += 1;
            continue;
        }

        match storage.delete_topic(topic.id).await {
            Ok(()) => {
                debug!(topic_id = %topic.id, code = %topic.code, "deleted topic");
                report.deleted += 1;
            }
            Err(e) => {
                warn!(topic_id = %topic.id, error = %e, "failed to delete topic");
                report.write_failures += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Repair & validation
// ---------------------------------------------------------------------------

/// Detach topics whose parent is gone or not strictly shallower.
async fn repair_parents(storage: &Storage, production: &[ProductionTopic], report: &mut PromoteReport) {
    let levels: HashMap<TopicId, u8> = production.iter().map(|t| (t.id, t.level)).collect();

    for topic in production {
        let Some(parent) = topic.parent_id else {
            continue;
        };
        if levels.get(&parent).is_some_and(|level| *level < topic.level) {
            continue;
        }

        match storage.set_topic_parent(topic.id, None).await {
            Ok(()) => {
                warn!(topic_id = %topic.id, code = %topic.code, "detached topic from invalid parent");
                report.detached += 1;
            }
            Err(e) => {
                warn!(topic_id = %topic.id, error = %e, "failed to detach topic");
                report.write_failures += 1;
            }
        }
    }
}

/// Check the production tree: every parent exists in the same subject at a
/// strictly smaller level, so no cycles are possible.
pub fn validate_tree(topics: &[ProductionTopic]) -> Vec<String> {
    let by_id: HashMap<TopicId, &ProductionTopic> = topics.iter().map(|t| (t.id, t)).collect();
    let mut violations = Vec::new();

    for topic in topics {
        let Some(parent_id) = topic.parent_id else {
            continue;
        };
        match by_id.get(&parent_id) {
            None => violations.push(format!("{} ({}) has a missing parent {parent_id}", topic.code, topic.id)),
            Some(parent) if parent.subject_id != topic.subject_id => {
                violations.push(format!("{} has a parent in another subject", topic.code));
            }
            Some(parent) if parent.level >= topic.level => violations.push(format!(
                "{} (level {}) has parent {} at level {}",
                topic.code, topic.level, parent.code, parent.level
            )),
            Some(_) => {}
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::safety::StoreReferenceChecker;
    use topicsync_shared::{SafetyConfig, SubjectKey};
    use uuid::Uuid;

    struct Always(bool);

    impl ReferenceChecker for Always {
        async fn is_referenced(&self, _topic_id: TopicId) -> bool {
            self.0
        }
    }

    async fn setup() -> (Storage, String) {
        let tmp = std::env::temp_dir().join(format!("ts_promote_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp).await.expect("open test db");
        let subject = storage
            .ensure_subject(&SubjectKey::new("AQA", "A-Level", "ECON"), Some("Economics"))
            .await
            .unwrap();
        (storage, subject.id)
    }

    fn node(code: &str, title: &str, level: u8, parent: Option<&str>, sort_order: i64) -> TreeNode {
        TreeNode {
            code: code.into(),
            title: title.into(),
            level,
            parent_code: parent.map(str::to_string),
            sort_order,
        }
    }

    fn by_code<'a>(topics: &'a [ProductionTopic], code: &str) -> &'a ProductionTopic {
        topics.iter().find(|t| t.code == code).unwrap()
    }

    async fn promote<C: ReferenceChecker>(
        storage: &Storage,
        subject_id: &str,
        nodes: &[TreeNode],
        checker: &C,
    ) -> PromoteOutcome {
        promote_tree(storage, subject_id, nodes, checker, &SilentProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_promotion_inserts_and_links() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Supply", 1, Some("E-1"), 1),
        ];

        let out = promote(&storage, &subject_id, &nodes, &Always(false)).await;

        assert_eq!(out.report.inserted, 2);
        assert_eq!(out.report.parents_linked, 1);
        let parent = by_code(&out.topics, "E-1");
        assert_eq!(by_code(&out.topics, "E-1-1").parent_id, Some(parent.id));
        assert!(out.violations.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_stable() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Supply", 1, Some("E-1"), 1),
        ];

        let first = promote(&storage, &subject_id, &nodes, &Always(false)).await;
        let second = promote(&storage, &subject_id, &nodes, &Always(false)).await;

        assert_eq!(first.topics, second.topics);
        assert_eq!(second.report.inserted, 0);
        assert_eq!(second.report.matched_by_code, 2);
        assert_eq!(second.report.deleted, 0);
    }

    #[tokio::test]
    async fn test_renumbered_topic_keeps_identity_by_title() {
        let (storage, subject_id) = setup().await;
        let before = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Elasticity", 1, Some("E-1"), 1),
        ];
        let first = promote(&storage, &subject_id, &before, &Always(false)).await;
        let id = by_code(&first.topics, "E-1-1").id;

        let after = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-2", "Elasticity", 1, Some("E-1"), 1),
        ];
        let second = promote(&storage, &subject_id, &after, &Always(false)).await;

        assert_eq!(second.report.matched_by_title, 1);
        assert_eq!(second.report.deleted, 0);
        assert_eq!(by_code(&second.topics, "E-1-2").id, id);
        assert_eq!(second.topics.len(), 2);
    }

    #[tokio::test]
    async fn test_removed_topic_deleted_unless_referenced() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-2", "Trade", 0, None, 1),
            node("E-3", "Money", 0, None, 2),
        ];
        let first = promote(&storage, &subject_id, &nodes, &Always(false)).await;
        let trade = by_code(&first.topics, "E-2").id;
        storage.add_study_card(trade, "What is trade?").await.unwrap();

        let checker = StoreReferenceChecker::new(&storage, SafetyConfig::default().reference_tables);
        let second = promote(&storage, &subject_id, &nodes[..1], &checker).await;

        assert_eq!(second.report.deleted, 1);
        assert_eq!(second.report.kept_referenced, 1);
        let codes: Vec<_> = second.topics.iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["E-1", "E-2"]);
    }

    #[tokio::test]
    async fn test_kept_child_of_deleted_parent_becomes_root() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![
            node("E-2", "Trade", 0, None, 0),
            node("E-2-1", "Tariffs", 1, Some("E-2"), 1),
        ];
        let first = promote(&storage, &subject_id, &nodes, &Always(false)).await;
        let tariffs = by_code(&first.topics, "E-2-1").id;
        storage.add_study_card(tariffs, "Define a tariff").await.unwrap();

        let checker = StoreReferenceChecker::new(&storage, SafetyConfig::default().reference_tables);
        let second = promote(&storage, &subject_id, &[node("E-1", "Markets", 0, None, 0)], &checker).await;

        assert_eq!(second.report.deleted, 1);
        assert_eq!(second.report.kept_referenced, 1);
        assert_eq!(by_code(&second.topics, "E-2-1").parent_id, None);
        assert!(second.violations.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_checker_answer_keeps_everything() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![node("E-1", "Markets", 0, None, 0)];
        promote(&storage, &subject_id, &nodes, &Always(false)).await;

        let second = promote(&storage, &subject_id, &[node("E-9", "Other", 0, None, 0)], &Always(true)).await;

        assert_eq!(second.report.deleted, 0);
        assert_eq!(second.report.kept_referenced, 1);
        assert_eq!(second.topics.len(), 2);
    }

    #[tokio::test]
    async fn test_later_claimant_wins() {
        let (storage, subject_id) = setup().await;
        promote(&storage, &subject_id, &[node("E-1", "Markets", 0, None, 0)], &Always(false)).await;
        let original = storage.list_topics(&subject_id).await.unwrap()[0].id;

        // E-1 matches by code, E-7 matches the same row by title
        let nodes = vec![
            node("E-1", "Money", 0, None, 0),
            node("E-7", "Markets", 0, None, 1),
        ];
        let out = promote(&storage, &subject_id, &nodes, &Always(false)).await;

        assert_eq!(out.report.ambiguous, 1);
        assert_eq!(by_code(&out.topics, "E-7").id, original);
        assert_ne!(by_code(&out.topics, "E-1").id, original);
    }

    #[test]
    fn test_validate_tree_flags_bad_levels() {
        let root = ProductionTopic {
            id: TopicId::new(),
            subject_id: "s".into(),
            code: "A".into(),
            title: "A".into(),
            level: 1,
            parent_id: None,
            sort_order: 0,
        };
        let child = ProductionTopic {
            id: TopicId::new(),
            code: "B".into(),
            title: "B".into(),
            parent_id: Some(root.id),
            ..root.clone()
        };
        let orphan = ProductionTopic {
            id: TopicId::new(),
            code: "C".into(),
            title: "C".into(),
            level: 2,
            parent_id: Some(TopicId::new()),
            ..root.clone()
        };

        let violations = validate_tree(&[root, child, orphan]);
        assert_eq!(violations.len(), 2);
    }

    #[tokio::test]
    async fn test_sibling_title_swap_converges_in_one_run() {
        let (storage, subject_id) = setup().await;
        let before = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Supply", 1, Some("E-1"), 1),
            node("E-1-2", "Demand", 1, Some("E-1"), 2),
        ];
        let first = promote(&storage, &subject_id, &before, &Always(false)).await;
        let ids: Vec<TopicId> = ["E-1", "E-1-1", "E-1-2"]
            .iter()
            .map(|code| by_code(&first.topics, code).id)
            .collect();

        let after = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Demand", 1, Some("E-1"), 1),
            node("E-1-2", "Supply", 1, Some("E-1"), 2),
        ];
        let second = promote(&storage, &subject_id, &after, &Always(false)).await;

        assert_eq!(second.report.write_failures, 0);
        assert_eq!(second.report.updated, 3);
        assert_eq!(second.report.parents_linked, 2);
        assert_eq!(by_code(&second.topics, "E-1-1").title, "Demand");
        assert_eq!(by_code(&second.topics, "E-1-2").title, "Supply");
        for (code, id) in ["E-1", "E-1-1", "E-1-2"].iter().zip(&ids) {
            assert_eq!(by_code(&second.topics, code).id, *id);
        }

        let third = promote(&storage, &subject_id, &after, &Always(false)).await;
        assert_eq!(third.topics, second.topics);
    }

    #[tokio::test]
    async fn test_rename_into_title_of_removed_topic() {
        let (storage, subject_id) = setup().await;
        let before = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Supply", 1, Some("E-1"), 1),
            node("E-1-2", "Demand", 1, Some("E-1"), 2),
        ];
        let first = promote(&storage, &subject_id, &before, &Always(false)).await;
        let supply = by_code(&first.topics, "E-1-1").id;

        let after = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Demand", 1, Some("E-1"), 1),
        ];
        let second = promote(&storage, &subject_id, &after, &Always(false)).await;

        assert_eq!(second.report.write_failures, 0);
        assert_eq!(second.report.deleted, 1);
        assert_eq!(second.topics.len(), 2);
        let renamed = by_code(&second.topics, "E-1-1");
        assert_eq!(renamed.id, supply);
        assert_eq!(renamed.title, "Demand");
    }

    #[tokio::test]
    async fn test_colliding_insert_is_counted_and_skipped() {
        let (storage, subject_id) = setup().await;
        let nodes = vec![
            node("E-1", "Markets", 0, None, 0),
            node("E-1-1", "Supply", 1, Some("E-1"), 1),
            node("E-2", "MARKETS", 0, None, 2),
            node("E-3", "Trade", 0, None, 3),
        ];

        let out = promote(&storage, &subject_id, &nodes, &Always(false)).await;

        assert_eq!(out.report.write_failures, 1);
        assert_eq!(out.report.inserted, 3);
        assert_eq!(out.report.parents_linked, 1);
        let codes: Vec<_> = out.topics.iter().map(|t| t.code.as_str()).collect();
        assert_eq!(codes, vec!["E-1", "E-1-1", "E-3"]);
        let markets = by_code(&out.topics, "E-1");
        assert_eq!(by_code(&out.topics, "E-1-1").parent_id, Some(markets.id));
        assert!(out.violations.is_empty());
    }
}
