//! Synchronization engine for curriculum topic trees.
//!
//! Ties the outline parsers, the store, and the embedding service into one
//! per-subject run: build a clean tree from staging, promote it into
//! identity-stable production topics, then rebuild the semantic index.

pub mod index;
pub mod pipeline;
pub mod promote;
pub mod safety;
pub mod summary;
pub mod tree;

pub use index::{IndexReport, ancestor_titles, context_string, refresh_embeddings};
pub use pipeline::{
    ProgressReporter, SilentProgress, StageReport, SyncConfig, SyncReport, SyncState,
    reindex_subject, run_sync, stage_batch, sync_subject, tree_fingerprint,
};
pub use promote::{PromoteOutcome, PromoteReport, promote_tree, validate_tree};
pub use safety::{ReferenceChecker, StoreReferenceChecker};
pub use summary::{PathSummarizer, Summarizer, SummaryInput};
pub use tree::{BuiltTree, TitleFilter, TreeNode, TreeReport, build_tree, compare_codes};
