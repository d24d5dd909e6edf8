//! SQL migration definitions for the PaperPipe database.
//!
//! Migrations are applied in order by [`crate::Storage::init`]. Every statement
//! is idempotent so that several pipeline runs may initialize the same file
//! at the same time.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: papers, processing_events, embeddings",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per unique identifier
CREATE TABLE IF NOT EXISTS papers (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier   TEXT NOT NULL UNIQUE,
    title        TEXT NOT NULL,
    authors_json TEXT NOT NULL DEFAULT '[]',
    summary      TEXT,
    published    TEXT,
    pdf_url      TEXT,
    pdf_path     TEXT,
    text_path    TEXT,
    raw_json     TEXT,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL
);

-- Append-only processing log
CREATE TABLE IF NOT EXISTS processing_events (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    paper_id INTEGER NOT NULL REFERENCES papers(id),
    stage    TEXT NOT NULL,
    status   TEXT NOT NULL CHECK (status IN ('pending', 'success', 'error')),
    error    TEXT,
    tried_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_stage_status ON processing_events(stage, status);
CREATE INDEX IF NOT EXISTS idx_events_paper_stage ON processing_events(paper_id, stage);

-- Computed vectors, one row per (paper, computation)
CREATE TABLE IF NOT EXISTS embeddings (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    paper_id    INTEGER NOT NULL REFERENCES papers(id),
    model       TEXT NOT NULL,
    vector_json TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_paper ON embeddings(paper_id);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
