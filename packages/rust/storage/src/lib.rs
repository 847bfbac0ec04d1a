//! libSQL storage layer for subjects, staging topics, production topics,
//! and the per-topic embedding index.
//!
//! The [`Storage`] struct wraps a libSQL database. Three logical tables carry
//! the synchronization state (`staging_topics`, `topics`, `topic_embeddings`);
//! downstream tables such as `study_cards` are only ever queried for
//! existence by the deletion-safety check.
//!
//! **Access rules:**
//! - sync runs: read-write via [`Storage::open`]
//! - status/inspection: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::sync::LazyLock;

use chrono::Utc;
use libsql::{Connection, Database, params};
use regex::Regex;
use uuid::Uuid;

use topicsync_shared::{
    EmbeddingRecord, ProductionTopic, Result, StagingTopic, Subject, SubjectKey, TopicId,
    TopicSyncError, normalize_title,
};

/// SQL identifiers accepted for downstream reference tables and columns.
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Prefix of the placeholder title key a topic holds while its title is in flux.
const RELEASED_KEY_PREFIX: &str = "~released:";

/// One attribute write for [`Storage::write_topics`]: overwrite topic `id`
/// in place, or insert a new topic when `id` is `None`.
#[derive(Debug, Clone, Copy)]
pub struct TopicWrite<'a> {
    pub id: Option<TopicId>,
    pub code: &'a str,
    pub title: &'a str,
    pub level: u8,
    pub sort_order: i64,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TopicSyncError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TopicSyncError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TopicSyncError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subject operations
    // -----------------------------------------------------------------------

    /// Look up the subject for a unit of work.
    pub async fn get_subject(&self, key: &SubjectKey) -> Result<Option<Subject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, exam_board, qualification, code, name FROM subjects
                 WHERE exam_board = ?1 AND qualification = ?2 AND code = ?3",
                params![
                    key.exam_board.as_str(),
                    key.qualification.as_str(),
                    key.subject.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subject(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Return the subject for `key`, creating it on first use.
    pub async fn ensure_subject(&self, key: &SubjectKey, name: Option<&str>) -> Result<Subject> {
        if let Some(subject) = self.get_subject(key).await? {
            return Ok(subject);
        }
        self.check_writable()?;

        let id = Uuid::now_v7().to_string();
        let name = name.unwrap_or(key.subject.as_str());
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO subjects (id, exam_board, qualification, code, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    key.exam_board.as_str(),
                    key.qualification.as_str(),
                    key.subject.as_str(),
                    name,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;

        tracing::info!(subject = %key, %id, "created subject");
        Ok(Subject {
            id,
            exam_board: key.exam_board.clone(),
            qualification: key.qualification.clone(),
            code: key.subject.clone(),
            name: name.to_string(),
        })
    }

    /// List all subjects ordered by board, qualification, code.
    pub async fn list_subjects(&self) -> Result<Vec<Subject>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, exam_board, qualification, code, name FROM subjects
                 ORDER BY exam_board, qualification, code",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_subject(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Staging operations
    // -----------------------------------------------------------------------

    /// Replace the subject's staging batch with `topics`, preserving input order.
    pub async fn replace_staging_topics(
        &self,
        subject_id: &str,
        batch_id: &str,
        topics: &[StagingTopic],
    ) -> Result<usize> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "DELETE FROM staging_topics WHERE subject_id = ?1",
            params![subject_id],
        )
        .await
        .map_err(db_err)?;

        for (position, topic) in topics.iter().enumerate() {
            tx.execute(
                "INSERT INTO staging_topics
                   (subject_id, batch_id, position, code, title, level, parent_code, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    subject_id,
                    batch_id,
                    position as i64,
                    topic.code.as_str(),
                    topic.title.as_str(),
                    i64::from(topic.level),
                    topic.parent_code.as_deref(),
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(topics.len())
    }

    /// List the subject's staging batch in input order.
    pub async fn list_staging_topics(&self, subject_id: &str) -> Result<Vec<StagingTopic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT code, title, level, parent_code FROM staging_topics
                 WHERE subject_id = ?1 ORDER BY position",
                params![subject_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let code: String = row.get(0).map_err(db_err)?;
            let title: String = row.get(1).map_err(db_err)?;
            let level = level_from_i64(row.get::<i64>(2).map_err(db_err)?)?;
            let parent_code: Option<String> = row.get::<String>(3).ok();
            results.push(StagingTopic::new(code, title, level, parent_code)?);
        }
        Ok(results)
    }

    /// Discard the subject's staging batch.
    pub async fn clear_staging_topics(&self, subject_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM staging_topics WHERE subject_id = ?1",
                params![subject_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Production topic operations
    // -----------------------------------------------------------------------

    /// List the subject's production topics in display order.
    pub async fn list_topics(&self, subject_id: &str) -> Result<Vec<ProductionTopic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, subject_id, code, title, level, parent_id, sort_order
                 FROM topics WHERE subject_id = ?1 ORDER BY sort_order, code",
                params![subject_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_topic(&row)?);
        }
        Ok(results)
    }

    /// Insert a new production topic as a root. Returns the issued id.
    pub async fn insert_topic(
        &self,
        subject_id: &str,
        code: &str,
        title: &str,
        level: u8,
        sort_order: i64,
    ) -> Result<TopicId> {
        self.check_writable()?;
        insert_topic_row(&self.conn, subject_id, code, title, level, sort_order).await
    }

    /// Apply a batch of attribute writes for one subject in a single transaction.
    ///
    /// Every topic of the subject gives up its title key first, so writes may
    /// exchange titles or take over a title held by a topic that is about to be
    /// removed. Updated and inserted topics are roots afterwards. Topics left
    /// unwritten (failed writes, topics absent from the batch) get their key
    /// back unless a write has taken it; those keep a per-topic placeholder.
    ///
    /// One result per write, in order. A failing write does not abort the batch.
    pub async fn write_topics(
        &self,
        subject_id: &str,
        writes: &[TopicWrite<'_>],
    ) -> Result<Vec<Result<TopicId>>> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "UPDATE topics SET title_key = ?2 || id WHERE subject_id = ?1",
            params![subject_id, RELEASED_KEY_PREFIX],
        )
        .await
        .map_err(db_err)?;

        let mut results = Vec::with_capacity(writes.len());
        for write in writes {
            let result = match write.id {
                Some(id) => {
                    update_topic_row(&tx, id, write.code, write.title, write.level, write.sort_order)
                        .await
                        .map(|()| id)
                }
                None => {
                    insert_topic_row(
                        &tx,
                        subject_id,
                        write.code,
                        write.title,
                        write.level,
                        write.sort_order,
                    )
                    .await
                }
            };
            results.push(result);
        }

        let mut released = Vec::new();
        {
            let mut rows = tx
                .query(
                    "SELECT id, title FROM topics
                     WHERE subject_id = ?1 AND substr(title_key, 1, ?3) = ?2",
                    params![
                        subject_id,
                        RELEASED_KEY_PREFIX,
                        RELEASED_KEY_PREFIX.len() as i64
                    ],
                )
                .await
                .map_err(db_err)?;
            while let Ok(Some(row)) = rows.next().await {
                let id: String = row.get(0).map_err(db_err)?;
                let title: String = row.get(1).map_err(db_err)?;
                released.push((id, title));
            }
        }

        for (id, title) in released {
            let restored = tx
                .execute(
                    "UPDATE topics SET title_key = ?1 WHERE id = ?2",
                    params![normalize_title(&title), id.as_str()],
                )
                .await;
            if let Err(e) = restored {
                tracing::debug!(topic_id = %id, error = %e, "title key taken, keeping placeholder");
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(results)
    }

    /// Point a topic at its parent (or make it a root).
    pub async fn set_topic_parent(&self, id: TopicId, parent_id: Option<TopicId>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "UPDATE topics SET parent_id = ?1 WHERE id = ?2",
                params![parent_id.map(|p| p.to_string()), id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Delete a topic and its embedding record. Children are detached to roots.
    pub async fn delete_topic(&self, id: TopicId) -> Result<()> {
        self.check_writable()?;
        let id = id.to_string();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "UPDATE topics SET parent_id = NULL WHERE parent_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(db_err)?;
        tx.execute(
            "DELETE FROM topic_embeddings WHERE topic_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(db_err)?;
        tx.execute("DELETE FROM topics WHERE id = ?1", params![id.as_str()])
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Number of production topics for a subject.
    pub async fn count_topics(&self, subject_id: &str) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM topics WHERE subject_id = ?1", subject_id)
            .await
    }

    // -----------------------------------------------------------------------
    // Downstream references
    // -----------------------------------------------------------------------

    /// Bounded existence query: does `table.column` hold `topic_id` anywhere?
    pub async fn reference_exists(&self, table: &str, column: &str, topic_id: TopicId) -> Result<bool> {
        if !IDENT_RE.is_match(table) || !IDENT_RE.is_match(column) {
            return Err(TopicSyncError::validation(format!(
                "invalid reference table identifier: {table}.{column}"
            )));
        }

        let sql = format!("SELECT 1 FROM \"{table}\" WHERE \"{column}\" = ?1 LIMIT 1");
        let mut rows = self
            .conn
            .query(&sql, params![topic_id.to_string()])
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Pin a study card to a topic.
    ///
    /// Study cards are owned by the downstream application; the sync run
    /// never calls this. It exists for fixtures and tests.
    pub async fn add_study_card(&self, topic_id: TopicId, prompt: &str) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO study_cards (id, topic_id, prompt, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), topic_id.to_string(), prompt, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Embedding operations
    // -----------------------------------------------------------------------

    /// Replace every embedding record of a subject with `records`, atomically.
    pub async fn replace_subject_embeddings(
        &self,
        subject_id: &str,
        records: &[EmbeddingRecord],
    ) -> Result<usize> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(db_err)?;

        tx.execute(
            "DELETE FROM topic_embeddings WHERE subject_id = ?1",
            params![subject_id],
        )
        .await
        .map_err(db_err)?;

        for record in records {
            let full_path = serde_json::to_string(&record.full_path)
                .map_err(|e| TopicSyncError::Storage(format!("full_path encode: {e}")))?;
            tx.execute(
                "INSERT INTO topic_embeddings
                   (topic_id, subject_id, embedding, dimensions, summary, full_path, level,
                    subject_label, exam_board, qualification, active, spec_version, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.topic_id.to_string(),
                    subject_id,
                    vector_literal(&record.vector),
                    record.vector.len() as i64,
                    record.summary.as_deref(),
                    full_path,
                    i64::from(record.level),
                    record.subject_label.as_str(),
                    record.exam_board.as_str(),
                    record.qualification.as_str(),
                    i64::from(record.active),
                    record.spec_version.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(records.len())
    }

    /// List a subject's embedding records ordered by topic id.
    pub async fn list_embeddings(&self, subject_id: &str) -> Result<Vec<EmbeddingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT topic_id, subject_id, embedding, summary, full_path, level,
                        subject_label, exam_board, qualification, active, spec_version
                 FROM topic_embeddings WHERE subject_id = ?1 ORDER BY topic_id",
                params![subject_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_embedding(&row)?);
        }
        Ok(results)
    }

    /// Number of embedding records for a subject.
    pub async fn count_embeddings(&self, subject_id: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM topic_embeddings WHERE subject_id = ?1",
            subject_id,
        )
        .await
    }

    async fn count(&self, sql: &str, subject_id: &str) -> Result<u64> {
        let mut rows = self
            .conn
            .query(sql, params![subject_id])
            .await
            .map_err(db_err)?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(db_err(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> TopicSyncError {
    TopicSyncError::Storage(e.to_string())
}

fn level_from_i64(level: i64) -> Result<u8> {
    u8::try_from(level).map_err(|_| TopicSyncError::Storage(format!("invalid topic level {level}")))
}

fn parse_topic_id(s: &str) -> Result<TopicId> {
    s.parse()
        .map_err(|e| TopicSyncError::Storage(format!("invalid topic id {s}: {e}")))
}

/// Convert a database row to a [`Subject`].
fn row_to_subject(row: &libsql::Row) -> Result<Subject> {
    Ok(Subject {
        id: row.get::<String>(0).map_err(db_err)?,
        exam_board: row.get::<String>(1).map_err(db_err)?,
        qualification: row.get::<String>(2).map_err(db_err)?,
        code: row.get::<String>(3).map_err(db_err)?,
        name: row.get::<String>(4).map_err(db_err)?,
    })
}

async fn insert_topic_row(
    conn: &Connection,
    subject_id: &str,
    code: &str,
    title: &str,
    level: u8,
    sort_order: i64,
) -> Result<TopicId> {
    let id = TopicId::new();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO topics
           (id, subject_id, code, title, title_key, level, parent_id, sort_order, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
        params![
            id.to_string(),
            subject_id,
            code,
            title,
            normalize_title(title),
            i64::from(level),
            sort_order,
            now.as_str()
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(id)
}

/// Overwrite a topic's attributes in place and detach it from its parent.
async fn update_topic_row(
    conn: &Connection,
    id: TopicId,
    code: &str,
    title: &str,
    level: u8,
    sort_order: i64,
) -> Result<()> {
    let affected = conn
        .execute(
            "UPDATE topics
             SET code = ?1, title = ?2, title_key = ?3, level = ?4, sort_order = ?5,
                 parent_id = NULL
             WHERE id = ?6",
            params![
                code,
                title,
                normalize_title(title),
                i64::from(level),
                sort_order,
                id.to_string()
            ],
        )
        .await
        .map_err(db_err)?;

    if affected == 0 {
        return Err(TopicSyncError::Storage(format!("topic {id} not found")));
    }
    Ok(())
}

/// Convert a database row to a [`ProductionTopic`].
fn row_to_topic(row: &libsql::Row) -> Result<ProductionTopic> {
    Ok(ProductionTopic {
        id: parse_topic_id(&row.get::<String>(0).map_err(db_err)?)?,
        subject_id: row.get::<String>(1).map_err(db_err)?,
        code: row.get::<String>(2).map_err(db_err)?,
        title: row.get::<String>(3).map_err(db_err)?,
        level: level_from_i64(row.get::<i64>(4).map_err(db_err)?)?,
        parent_id: match row.get::<String>(5).ok() {
            Some(p) => Some(parse_topic_id(&p)?),
            None => None,
        },
        sort_order: row.get::<i64>(6).map_err(db_err)?,
    })
}

/// Convert a database row to an [`EmbeddingRecord`].
fn row_to_embedding(row: &libsql::Row) -> Result<EmbeddingRecord> {
    let full_path: String = row.get(4).map_err(db_err)?;
    Ok(EmbeddingRecord {
        topic_id: parse_topic_id(&row.get::<String>(0).map_err(db_err)?)?,
        subject_id: row.get::<String>(1).map_err(db_err)?,
        vector: parse_vector_literal(&row.get::<String>(2).map_err(db_err)?)?,
        summary: row.get::<String>(3).ok(),
        full_path: serde_json::from_str(&full_path)
            .map_err(|e| TopicSyncError::Storage(format!("invalid full_path: {e}")))?,
        level: level_from_i64(row.get::<i64>(5).map_err(db_err)?)?,
        subject_label: row.get::<String>(6).map_err(db_err)?,
        exam_board: row.get::<String>(7).map_err(db_err)?,
        qualification: row.get::<String>(8).map_err(db_err)?,
        active: row.get::<i64>(9).map_err(db_err)? != 0,
        spec_version: row.get::<String>(10).map_err(db_err)?,
    })
}

// ---------------------------------------------------------------------------
// Vector literals
// ---------------------------------------------------------------------------

/// Serialize a vector to libSQL's vector literal (`[0.1,0.2,...]`), the text
/// form accepted by `vector32()`.
pub fn vector_literal(vector: &[f32]) -> String {
    let parts: Vec<String> = vector.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

/// Parse a vector literal produced by [`vector_literal`].
pub fn parse_vector_literal(literal: &str) -> Result<Vec<f32>> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| TopicSyncError::Storage(format!("malformed vector literal: {literal}")))?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| TopicSyncError::Storage(format!("malformed vector component {part}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ts_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn econ() -> SubjectKey {
        SubjectKey::new("AQA", "A-Level", "ECON")
    }

    fn record(topic_id: TopicId, subject_id: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            topic_id,
            subject_id: subject_id.into(),
            vector: vec![0.25, -1.5, 3.0],
            summary: Some("Markets".into()),
            full_path: vec!["Markets".into()],
            level: 1,
            subject_label: "Economics".into(),
            exam_board: "AQA".into(),
            qualification: "A-Level".into(),
            active: true,
            spec_version: "v1".into(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ts_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn ensure_subject_is_stable() {
        let storage = test_storage().await;
        let a = storage
            .ensure_subject(&econ(), Some("Economics"))
            .await
            .expect("create subject");
        let b = storage.ensure_subject(&econ(), None).await.expect("reuse subject");
        assert_eq!(a.id, b.id);
        assert_eq!(b.name, "Economics");
        assert_eq!(storage.list_subjects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn staging_replace_preserves_order() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();

        let first = vec![StagingTopic::new("E-9", "Old", 0, None).unwrap()];
        storage
            .replace_staging_topics(&subject.id, "b1", &first)
            .await
            .expect("stage first batch");

        let second = vec![
            StagingTopic::new("E-2", "Macro", 0, None).unwrap(),
            StagingTopic::new("E-1", "Markets", 0, None).unwrap(),
            StagingTopic::new("E-1-1", "Supply", 1, Some("E-1".into())).unwrap(),
        ];
        storage
            .replace_staging_topics(&subject.id, "b2", &second)
            .await
            .expect("stage second batch");

        let staged = storage.list_staging_topics(&subject.id).await.unwrap();
        assert_eq!(staged, second);

        storage.clear_staging_topics(&subject.id).await.unwrap();
        assert!(storage.list_staging_topics(&subject.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn topic_insert_update_and_parent() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();

        let root = storage
            .insert_topic(&subject.id, "E-1", "Markets", 0, 0)
            .await
            .expect("insert root");
        let child = storage
            .insert_topic(&subject.id, "E-1-1", "Supply", 1, 1)
            .await
            .expect("insert child");
        storage.set_topic_parent(child, Some(root)).await.unwrap();

        let topics = storage.list_topics(&subject.id).await.unwrap();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[1].parent_id, Some(root));

        let write = TopicWrite {
            id: Some(child),
            code: "E-1-2",
            title: "Supply and demand",
            level: 1,
            sort_order: 1,
        };
        let results = storage.write_topics(&subject.id, &[write]).await.expect("write");
        assert_eq!(results[0].as_ref().ok(), Some(&child));
        let topics = storage.list_topics(&subject.id).await.unwrap();
        assert_eq!(topics[1].code, "E-1-2");
        assert_eq!(topics[1].parent_id, None);
    }

    #[tokio::test]
    async fn write_topics_exchanges_titles() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        let supply = storage.insert_topic(&subject.id, "E-1-1", "Supply", 1, 1).await.unwrap();
        let demand = storage.insert_topic(&subject.id, "E-1-2", "Demand", 1, 2).await.unwrap();
        let stale = storage.insert_topic(&subject.id, "E-1-9", "Costs", 1, 9).await.unwrap();

        let writes = [
            TopicWrite { id: Some(supply), code: "E-1-1", title: "Demand", level: 1, sort_order: 1 },
            TopicWrite { id: Some(demand), code: "E-1-2", title: "Supply", level: 1, sort_order: 2 },
            TopicWrite { id: None, code: "E-1-3", title: "costs", level: 1, sort_order: 3 },
        ];
        let results = storage.write_topics(&subject.id, &writes).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));

        let topics = storage.list_topics(&subject.id).await.unwrap();
        let title_of = |id: TopicId| topics.iter().find(|t| t.id == id).unwrap().title.clone();
        assert_eq!(title_of(supply), "Demand");
        assert_eq!(title_of(demand), "Supply");
        // Unwritten topic keeps its title even though its key was taken
        assert_eq!(title_of(stale), "Costs");

        // Keys are live again: a plain insert collides
        assert!(storage.insert_topic(&subject.id, "E-1-8", "SUPPLY", 1, 8).await.is_err());
        storage.delete_topic(stale).await.unwrap();
        storage
            .insert_topic(&subject.id, "E-1-9", "Costs ", 1, 9)
            .await
            .expect_err("inserted topic holds the key");
    }

    #[tokio::test]
    async fn write_topics_reports_each_failure() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        let markets = storage.insert_topic(&subject.id, "E-1", "Markets", 0, 0).await.unwrap();

        let writes = [
            TopicWrite { id: Some(markets), code: "E-1", title: "Markets", level: 0, sort_order: 0 },
            TopicWrite { id: None, code: "E-2", title: "MARKETS", level: 0, sort_order: 1 },
            TopicWrite { id: None, code: "E-3", title: "Macro", level: 0, sort_order: 2 },
        ];
        let results = storage.write_topics(&subject.id, &writes).await.unwrap();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(storage.count_topics(&subject.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn normalized_title_uniqueness_enforced() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        storage
            .insert_topic(&subject.id, "E-1", "Markets", 0, 0)
            .await
            .unwrap();
        let dup = storage
            .insert_topic(&subject.id, "E-7", "  • MARKETS ", 0, 1)
            .await;
        assert!(dup.is_err());

        // Same title on another level is fine
        storage
            .insert_topic(&subject.id, "E-1-1", "Markets", 1, 2)
            .await
            .expect("different level");
    }

    #[tokio::test]
    async fn delete_topic_detaches_children_and_embedding() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        let root = storage.insert_topic(&subject.id, "E-1", "Markets", 0, 0).await.unwrap();
        let child = storage.insert_topic(&subject.id, "E-1-1", "Supply", 1, 1).await.unwrap();
        storage.set_topic_parent(child, Some(root)).await.unwrap();
        storage
            .replace_subject_embeddings(&subject.id, &[record(root, &subject.id)])
            .await
            .unwrap();

        storage.delete_topic(root).await.expect("delete");

        let topics = storage.list_topics(&subject.id).await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].parent_id, None);
        assert_eq!(storage.count_embeddings(&subject.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reference_exists_checks_study_cards() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        let topic = storage.insert_topic(&subject.id, "E-1", "Markets", 0, 0).await.unwrap();

        assert!(!storage.reference_exists("study_cards", "topic_id", topic).await.unwrap());
        storage.add_study_card(topic, "Define a market").await.unwrap();
        assert!(storage.reference_exists("study_cards", "topic_id", topic).await.unwrap());
        assert!(!storage.reference_exists("topic_bookmarks", "topic_id", topic).await.unwrap());
    }

    #[tokio::test]
    async fn reference_exists_rejects_bad_identifiers() {
        let storage = test_storage().await;
        let result = storage
            .reference_exists("study_cards; DROP TABLE topics", "topic_id", TopicId::new())
            .await;
        assert!(matches!(result, Err(TopicSyncError::Validation { .. })));

        let missing = storage
            .reference_exists("no_such_table", "topic_id", TopicId::new())
            .await;
        assert!(matches!(missing, Err(TopicSyncError::Storage(_))));
    }

    #[tokio::test]
    async fn embeddings_replace_per_subject() {
        let storage = test_storage().await;
        let subject = storage.ensure_subject(&econ(), None).await.unwrap();
        let a = storage.insert_topic(&subject.id, "E-1", "Markets", 0, 0).await.unwrap();
        let b = storage.insert_topic(&subject.id, "E-2", "Macro", 0, 1).await.unwrap();

        storage
            .replace_subject_embeddings(&subject.id, &[record(a, &subject.id), record(b, &subject.id)])
            .await
            .unwrap();
        assert_eq!(storage.count_embeddings(&subject.id).await.unwrap(), 2);

        storage
            .replace_subject_embeddings(&subject.id, &[record(b, &subject.id)])
            .await
            .unwrap();
        let stored = storage.list_embeddings(&subject.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], record(b, &subject.id));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ts_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        let subject = rw.ensure_subject(&econ(), None).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.list_subjects().await.unwrap().len(), 1);
        let result = ro.insert_topic(&subject.id, "E-1", "Markets", 0, 0).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[test]
    fn vector_literal_format() {
        assert_eq!(vector_literal(&[0.5, -1.0, 2.25]), "[0.5,-1,2.25]");
        assert_eq!(vector_literal(&[]), "[]");
        assert_eq!(parse_vector_literal("[0.5, -1, 2.25]").unwrap(), vec![0.5, -1.0, 2.25]);
        assert!(parse_vector_literal("0.5,1").is_err());
    }
}
