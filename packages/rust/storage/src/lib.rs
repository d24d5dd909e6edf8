//! libSQL storage layer for paper records, the processing-event log, and
//! embeddings.
//!
//! The [`Storage`] struct wraps a local libSQL database. It never holds a
//! connection across operations: every call opens its own [`Connection`], so
//! concurrent pipeline tasks (and concurrent pipeline runs against the same
//! file) only contend for SQLite's own locks. Uniqueness of a paper's
//! identifier is enforced by the schema, not by callers.

mod migrations;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, params};
use tracing::{debug, info, instrument};

use paperpipe_shared::{
    EmbeddingRecord, EventStatus, PaperId, PaperMetadata, PaperPipeError, PaperRecord,
    PaperSummary, ProcessingEvent, Result, Stage,
};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Primary storage handle wrapping a libSQL database file.
pub struct Storage {
    db: Database,
    path: PathBuf,
}

impl Storage {
    /// Open or create a database at `path` and make sure its schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PaperPipeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let storage = Self {
            db,
            path: path.to_path_buf(),
        };
        storage.init().await?;
        Ok(storage)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply pending schema migrations. Safe to call repeatedly and concurrently.
    pub async fn init(&self) -> Result<()> {
        let conn = self.connect().await?;
        let current_version = schema_version(&conn).await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    PaperPipeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Open a fresh connection for one logical operation.
    async fn connect(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(db_err)?;

        // PRAGMA busy_timeout reports the new value as a row.
        let mut rows = conn
            .query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
            .await
            .map_err(db_err)?;
        rows.next().await.map_err(db_err)?;

        conn.execute("PRAGMA foreign_keys = ON", params![])
            .await
            .map_err(db_err)?;
        Ok(conn)
    }

    // -----------------------------------------------------------------------
    // Papers
    // -----------------------------------------------------------------------

    /// Insert the paper if its identifier is new, otherwise update it in place.
    ///
    /// Metadata fields are always overwritten. `pdf_path` / `text_path` only
    /// replace the stored value when `Some`; passing `None` keeps whatever was
    /// recorded before. Runs as a single statement, so concurrent upserts of the
    /// same identifier converge on one row.
    #[instrument(skip_all, fields(identifier = %meta.identifier))]
    pub async fn upsert_paper(
        &self,
        meta: &PaperMetadata,
        pdf_path: Option<&Path>,
        text_path: Option<&Path>,
    ) -> Result<PaperId> {
        let authors_json = serde_json::to_string(&meta.authors)
            .map_err(|e| PaperPipeError::Storage(format!("encode authors: {e}")))?;
        let raw_json = serde_json::to_string(&meta.raw)
            .map_err(|e| PaperPipeError::Storage(format!("encode raw payload: {e}")))?;
        let published = meta.published.map(|p| p.to_rfc3339());
        let pdf_path = pdf_path.map(path_to_string);
        let text_path = text_path.map(path_to_string);
        let now = Utc::now().to_rfc3339();

        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "INSERT INTO papers (identifier, title, authors_json, summary, published, pdf_url,
                                     pdf_path, text_path, raw_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(identifier) DO UPDATE SET
                   title = excluded.title,
                   authors_json = excluded.authors_json,
                   summary = excluded.summary,
                   published = excluded.published,
                   pdf_url = excluded.pdf_url,
                   pdf_path = COALESCE(excluded.pdf_path, papers.pdf_path),
                   text_path = COALESCE(excluded.text_path, papers.text_path),
                   raw_json = excluded.raw_json,
                   updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    meta.identifier.as_str(),
                    meta.title.as_str(),
                    authors_json.as_str(),
                    meta.summary.as_deref(),
                    published.as_deref(),
                    meta.pdf_url.as_deref(),
                    pdf_path.as_deref(),
                    text_path.as_deref(),
                    raw_json.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let id = PaperId(row.get::<i64>(0).map_err(db_err)?);
                debug!(%id, "paper upserted");
                Ok(id)
            }
            None => Err(PaperPipeError::Storage(format!(
                "upsert of '{}' returned no row id",
                meta.identifier
            ))),
        }
    }

    /// Point lookup by provider identifier.
    pub async fn get_by_identifier(&self, identifier: &str) -> Result<Option<PaperRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, identifier, title, authors_json, summary, published, pdf_url,
                        pdf_path, text_path, raw_json, created_at, updated_at
                 FROM papers WHERE identifier = ?1",
                params![identifier],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_paper_record(&row)?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Processing events
    // -----------------------------------------------------------------------

    /// Append an event to the processing log. Earlier events are never touched.
    pub async fn record_event(
        &self,
        paper_id: PaperId,
        stage: Stage,
        status: EventStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO processing_events (paper_id, stage, status, error, tried_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![paper_id.0, stage.as_str(), status.as_str(), error, now.as_str()],
        )
        .await
        .map_err(db_err)?;
        debug!(%paper_id, %stage, %status, "event recorded");
        Ok(())
    }

    /// Papers with at least one `pending` event for `stage`.
    pub async fn list_pending(&self, stage: Stage) -> Result<Vec<PaperSummary>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT DISTINCT p.id, p.identifier, p.title, p.summary, p.pdf_path, p.text_path
                 FROM papers p
                 JOIN processing_events e ON e.paper_id = p.id
                 WHERE e.stage = ?1 AND e.status = 'pending'
                 ORDER BY p.id",
                params![stage.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }

    /// Full event history of a paper, oldest first.
    pub async fn events_for_paper(&self, paper_id: PaperId) -> Result<Vec<ProcessingEvent>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, paper_id, stage, status, error, tried_at
                 FROM processing_events WHERE paper_id = ?1 ORDER BY id",
                params![paper_id.0],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(ProcessingEvent {
                id: row.get::<i64>(0).map_err(db_err)?,
                paper_id: PaperId(row.get::<i64>(1).map_err(db_err)?),
                stage: row.get::<String>(2).map_err(db_err)?.parse()?,
                status: row.get::<String>(3).map_err(db_err)?.parse()?,
                error: row.get::<String>(4).ok(),
                tried_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Current status of `stage` for a paper: the status of its latest event.
    pub async fn latest_status(
        &self,
        paper_id: PaperId,
        stage: Stage,
    ) -> Result<Option<EventStatus>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT status FROM processing_events
                 WHERE paper_id = ?1 AND stage = ?2
                 ORDER BY id DESC LIMIT 1",
                params![paper_id.0, stage.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?.parse()?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------------

    /// Store a computed vector. Returns the embedding row id.
    pub async fn save_embedding(
        &self,
        paper_id: PaperId,
        model: &str,
        vector: &[f32],
    ) -> Result<i64> {
        let vector_json = serde_json::to_string(vector)
            .map_err(|e| PaperPipeError::Storage(format!("encode vector: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "INSERT INTO embeddings (paper_id, model, vector_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id",
                params![paper_id.0, model, vector_json.as_str(), now.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err),
            None => Err(PaperPipeError::Storage(format!(
                "embedding insert for paper {paper_id} returned no row id"
            ))),
        }
    }

    /// All vectors stored for a paper, oldest first.
    pub async fn embeddings_for_paper(&self, paper_id: PaperId) -> Result<Vec<EmbeddingRecord>> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT id, paper_id, model, vector_json, created_at
                 FROM embeddings WHERE paper_id = ?1 ORDER BY id",
                params![paper_id.0],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let vector_json: String = row.get(3).map_err(db_err)?;
            results.push(EmbeddingRecord {
                id: row.get::<i64>(0).map_err(db_err)?,
                paper_id: PaperId(row.get::<i64>(1).map_err(db_err)?),
                model: row.get::<String>(2).map_err(db_err)?,
                vector: serde_json::from_str(&vector_json)
                    .map_err(|e| PaperPipeError::Storage(format!("invalid vector: {e}")))?,
                created_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    /// Papers that have no embedding yet, in insertion order.
    pub async fn papers_without_embeddings(&self, limit: Option<u32>) -> Result<Vec<PaperSummary>> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT p.id, p.identifier, p.title, p.summary, p.pdf_path, p.text_path
                 FROM papers p
                 LEFT JOIN embeddings e ON e.paper_id = p.id
                 WHERE e.id IS NULL
                 ORDER BY p.id
                 LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn db_err(e: libsql::Error) -> PaperPipeError {
    PaperPipeError::Storage(e.to_string())
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PaperPipeError::Storage(format!("invalid date '{s}': {e}")))
}

/// Get the current schema version, or 0 if no migrations have been applied.
async fn schema_version(conn: &Connection) -> u32 {
    let result = conn
        .query("SELECT MAX(version) FROM schema_migrations", params![])
        .await;

    match result {
        Ok(mut rows) => match rows.next().await {
            Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
            _ => 0,
        },
        Err(_) => 0, // Table doesn't exist yet
    }
}

/// Columns: id, identifier, title, summary, pdf_path, text_path.
fn row_to_summary(row: &Row) -> Result<PaperSummary> {
    Ok(PaperSummary {
        id: PaperId(row.get::<i64>(0).map_err(db_err)?),
        identifier: row.get::<String>(1).map_err(db_err)?,
        title: row.get::<String>(2).map_err(db_err)?,
        summary: row.get::<String>(3).ok(),
        pdf_path: row.get::<String>(4).ok(),
        text_path: row.get::<String>(5).ok(),
    })
}

fn row_to_paper_record(row: &Row) -> Result<PaperRecord> {
    let authors_json: String = row.get(3).map_err(db_err)?;
    let raw = match row.get::<String>(9).ok() {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| PaperPipeError::Storage(format!("invalid raw payload: {e}")))?,
        None => serde_json::Value::Null,
    };
    let published = match row.get::<String>(5).ok() {
        Some(s) => Some(parse_timestamp(&s)?),
        None => None,
    };

    Ok(PaperRecord {
        id: PaperId(row.get::<i64>(0).map_err(db_err)?),
        identifier: row.get::<String>(1).map_err(db_err)?,
        title: row.get::<String>(2).map_err(db_err)?,
        authors: serde_json::from_str(&authors_json)
            .map_err(|e| PaperPipeError::Storage(format!("invalid authors: {e}")))?,
        summary: row.get::<String>(4).ok(),
        published,
        pdf_url: row.get::<String>(6).ok(),
        pdf_path: row.get::<String>(7).ok(),
        text_path: row.get::<String>(8).ok(),
        raw,
        created_at: parse_timestamp(&row.get::<String>(10).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(11).map_err(db_err)?)?,
    })
}
