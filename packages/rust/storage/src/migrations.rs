//! SQL migration definitions for the topicsync database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: subjects, staging_topics, topics, topic_embeddings",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per (exam board, qualification, subject) unit of work
CREATE TABLE IF NOT EXISTS subjects (
    id            TEXT PRIMARY KEY,
    exam_board    TEXT NOT NULL,
    qualification TEXT NOT NULL,
    code          TEXT NOT NULL,
    name          TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE(exam_board, qualification, code)
);

-- Disposable, freshly extracted topics awaiting promotion
CREATE TABLE IF NOT EXISTS staging_topics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id  TEXT NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
    batch_id    TEXT NOT NULL,
    position    INTEGER NOT NULL,
    code        TEXT NOT NULL,
    title       TEXT NOT NULL,
    level       INTEGER NOT NULL,
    parent_code TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staging_subject ON staging_topics(subject_id, position);

-- Durable, identity-stable topics
CREATE TABLE IF NOT EXISTS topics (
    id         TEXT PRIMARY KEY,
    subject_id TEXT NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
    code       TEXT NOT NULL,
    title      TEXT NOT NULL,
    title_key  TEXT NOT NULL,
    level      INTEGER NOT NULL,
    parent_id  TEXT REFERENCES topics(id),
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(subject_id, level, title_key)
);

CREATE INDEX IF NOT EXISTS idx_topics_subject ON topics(subject_id);
CREATE INDEX IF NOT EXISTS idx_topics_code ON topics(subject_id, code);
CREATE INDEX IF NOT EXISTS idx_topics_parent ON topics(parent_id);

-- Semantic-search index, one row per current topic
CREATE TABLE IF NOT EXISTS topic_embeddings (
    topic_id      TEXT PRIMARY KEY REFERENCES topics(id) ON DELETE CASCADE,
    subject_id    TEXT NOT NULL,
    embedding     TEXT NOT NULL,
    dimensions    INTEGER NOT NULL,
    summary       TEXT,
    full_path     TEXT NOT NULL,
    level         INTEGER NOT NULL,
    subject_label TEXT NOT NULL,
    exam_board    TEXT NOT NULL,
    qualification TEXT NOT NULL,
    active        INTEGER NOT NULL DEFAULT 1,
    spec_version  TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_subject ON topic_embeddings(subject_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Downstream reference tables: study_cards, topic_bookmarks",
            sql: r#"
-- User-authored study cards pinned to a topic
CREATE TABLE IF NOT EXISTS study_cards (
    id         TEXT PRIMARY KEY,
    topic_id   TEXT NOT NULL,
    prompt     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_study_cards_topic ON study_cards(topic_id);

-- Per-user topic bookmarks
CREATE TABLE IF NOT EXISTS topic_bookmarks (
    id         TEXT PRIMARY KEY,
    topic_id   TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_topic_bookmarks_topic ON topic_bookmarks(topic_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
