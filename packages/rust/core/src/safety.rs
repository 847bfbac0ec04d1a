//! Referential safety checks for topic deletion.

use tracing::{debug, warn};

use topicsync_shared::{ReferenceTable, TopicId};
use topicsync_storage::Storage;

/// Answers whether any downstream record still points at a production topic.
#[allow(async_fn_in_trait)]
pub trait ReferenceChecker {
    /// `true` keeps the topic. Implementations must answer `true` when they
    /// cannot tell.
    async fn is_referenced(&self, topic_id: TopicId) -> bool;
}

/// Checks a configured list of downstream `table.column` pairs in the store.
pub struct StoreReferenceChecker<'a> {
    storage: &'a Storage,
    tables: Vec<ReferenceTable>,
}

impl<'a> StoreReferenceChecker<'a> {
    pub fn new(storage: &'a Storage, tables: Vec<ReferenceTable>) -> Self {
        Self { storage, tables }
    }
}

impl ReferenceChecker for StoreReferenceChecker<'_> {
    async fn is_referenced(&self, topic_id: TopicId) -> bool {
        for reference in &self.tables {
            match self
                .storage
                .reference_exists(&reference.table, &reference.column, topic_id)
                .await
            {
                Ok(true) => {
                    debug!(%topic_id, table = %reference.table, "topic is referenced");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        %topic_id,
                        table = %reference.table,
                        column = %reference.column,
                        error = %e,
                        "reference check failed, treating topic as referenced"
                    );
                    return true;
                }
            }
        }
        false
    }
}
