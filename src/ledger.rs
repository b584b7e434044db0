use crate::error::PipelineError;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// Lifecycle status of a processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Selected,
    Rejected,
    Translated,
    Published,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Selected => "selected",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Translated => "translated",
            RecordStatus::Published => "published",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub guid: String,
    pub title: String,
    pub content_hash: String,
    pub link: String,
    pub status: String,
    pub processed_date: String,
    pub output_file: Option<String>,
}

/// Append-only store of every item the pipeline has ever seen.
///
/// Answers "has this been processed?" three ways: exact guid match, exact
/// content-hash match, and near-duplicate title match (normalized edit
/// distance against every stored title). The title scan is O(n) per call,
/// which is fine at feed scale; a shingled-token index would be the next
/// step if the ledger ever grows unbounded.
#[derive(Clone)]
pub struct DeduplicationLedger {
    conn: Arc<Mutex<Connection>>,
    similarity_threshold: f64,
}

impl DeduplicationLedger {
    /// Open (or create) the ledger database and its tables.
    pub fn new(database_path: &str, similarity_threshold: f64) -> Result<Self> {
        let conn = Connection::open(database_path)
            .context(format!("Failed to open ledger at {}", database_path))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS posts (
                guid TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                link TEXT NOT NULL,
                status TEXT NOT NULL,
                processed_date TEXT NOT NULL,
                output_file TEXT
            )",
            [],
        )
        .context("Failed to create posts table")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS translations_log (
                guid TEXT NOT NULL,
                title_original TEXT NOT NULL,
                title_translated TEXT NOT NULL,
                link_original TEXT NOT NULL,
                output_file TEXT,
                status TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
            [],
        )
        .context("Failed to create translations_log table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            similarity_threshold,
        })
    }

    /// SHA-256 hex digest of an item's body.
    pub fn fingerprint(body: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// True if the guid is already recorded, or any stored title is within
    /// the similarity threshold of `title`.
    pub fn exists(&self, guid: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();

        let guid_match: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM posts WHERE guid = ?1",
                params![guid],
                |row| row.get::<_, i64>(0).map(|count| count > 0),
            )
            .context("Failed to check guid")?;

        if guid_match {
            return Ok(true);
        }

        let mut stmt = conn
            .prepare("SELECT title FROM posts")
            .context("Failed to prepare title scan")?;
        let titles = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to scan titles")?;

        for stored in titles {
            let stored = stored.context("Failed to read stored title")?;
            if title_similarity(&stored, title) >= self.similarity_threshold {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// True if the body's fingerprint matches a stored fingerprint exactly.
    pub fn is_duplicate_content(&self, body: &str) -> Result<bool> {
        let hash = Self::fingerprint(body);
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM posts WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .context("Failed to check content hash")?;
        Ok(count > 0)
    }

    /// Insert a new record. Fails with `PipelineError::AlreadyExists` on a
    /// guid collision; callers treat that as a duplicate, not a pipeline
    /// error.
    pub fn record(
        &self,
        guid: &str,
        title: &str,
        body: &str,
        link: &str,
        status: RecordStatus,
    ) -> Result<()> {
        let hash = Self::fingerprint(body);
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let result = conn.execute(
            "INSERT INTO posts (guid, title, content_hash, link, status, processed_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![guid, title, hash, link, status.as_str(), now],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(PipelineError::AlreadyExists {
                    guid: guid.to_string(),
                }
                .into())
            }
            Err(e) => Err(e).context("Failed to insert ledger record"),
        }
    }

    /// Move a record through its lifecycle (selected -> translated -> published).
    pub fn update_status(&self, guid: &str, status: RecordStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE posts SET status = ?1 WHERE guid = ?2",
            params![status.as_str(), guid],
        )
        .context("Failed to update record status")?;
        Ok(())
    }

    /// Attach the published document reference to a record.
    pub fn set_output(&self, guid: &str, output: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE posts SET output_file = ?1 WHERE guid = ?2",
            params![output, guid],
        )
        .context("Failed to set record output")?;
        Ok(())
    }

    /// Append one line to the translation audit log.
    pub fn log_translation(
        &self,
        guid: &str,
        title_original: &str,
        title_translated: &str,
        link_original: &str,
        output_file: Option<&str>,
        status: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO translations_log
                (guid, title_original, title_translated, link_original, output_file, status, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![guid, title_original, title_translated, link_original, output_file, status, now],
        )
        .context("Failed to append translation log")?;
        Ok(())
    }

    /// Most recent records first, for observability only.
    pub fn history(&self, limit: usize) -> Result<Vec<ProcessedRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT guid, title, content_hash, link, status, processed_date, output_file
                 FROM posts ORDER BY processed_date DESC, rowid DESC LIMIT ?1",
            )
            .context("Failed to prepare history query")?;

        let records = stmt
            .query_map(params![limit as i64], |row| {
                Ok(ProcessedRecord {
                    guid: row.get(0)?,
                    title: row.get(1)?,
                    content_hash: row.get(2)?,
                    link: row.get(3)?,
                    status: row.get(4)?,
                    processed_date: row.get(5)?,
                    output_file: row.get(6)?,
                })
            })
            .context("Failed to query history")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read history rows")?;

        Ok(records)
    }

    /// Look up one record by guid.
    pub fn get(&self, guid: &str) -> Result<Option<ProcessedRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT guid, title, content_hash, link, status, processed_date, output_file
                 FROM posts WHERE guid = ?1",
                params![guid],
                |row| {
                    Ok(ProcessedRecord {
                        guid: row.get(0)?,
                        title: row.get(1)?,
                        content_hash: row.get(2)?,
                        link: row.get(3)?,
                        status: row.get(4)?,
                        processed_date: row.get(5)?,
                        output_file: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to look up record")?;
        Ok(record)
    }
}

/// Normalized edit-distance similarity between two titles, case-insensitive.
fn title_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&a.to_lowercase(), &b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use tempfile::TempDir;

    fn create_test_ledger() -> (DeduplicationLedger, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test_ledger.db");
        let ledger = DeduplicationLedger::new(db_path.to_str().unwrap(), 0.85)
            .expect("Failed to create ledger");
        (ledger, temp_dir)
    }

    // ==================== Record & Idempotence Tests ====================

    #[test]
    fn test_record_and_lookup() {
        let (ledger, _tmp) = create_test_ledger();

        ledger
            .record("g1", "A Title", "body text", "https://x/1", RecordStatus::Selected)
            .expect("Should record");

        let record = ledger.get("g1").unwrap().expect("Record should exist");
        assert_eq!(record.title, "A Title");
        assert_eq!(record.status, "selected");
        assert_eq!(record.content_hash, DeduplicationLedger::fingerprint("body text"));
    }

    #[test]
    fn test_record_twice_fails_with_already_exists() {
        let (ledger, _tmp) = create_test_ledger();

        ledger
            .record("g1", "Title", "body", "https://x/1", RecordStatus::Selected)
            .unwrap();

        let err = ledger
            .record("g1", "Other Title", "other body", "https://x/2", RecordStatus::Selected)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::AlreadyExists { guid }) if guid == "g1"
        ));

        // Still exactly one record
        assert_eq!(ledger.history(10).unwrap().len(), 1);
    }

    // ==================== Duplicate Detection Tests ====================

    #[test]
    fn test_exists_by_guid() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .record("g1", "Completely Unrelated", "body", "", RecordStatus::Selected)
            .unwrap();

        assert!(ledger.exists("g1", "Totally Different Words Here").unwrap());
        assert!(!ledger.exists("g2", "Totally Different Words Here").unwrap());
    }

    #[test]
    fn test_exists_by_near_duplicate_title() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .record("g1", "Bitcoin Hits New High", "body", "", RecordStatus::Selected)
            .unwrap();

        // Similarity ~0.95, well above the 0.85 threshold, distinct guid
        assert!(ledger.exists("g2", "Bitcoin Hits New Highs").unwrap());
        // Far-away title passes
        assert!(!ledger.exists("g2", "Ethereum Merge Delayed Again").unwrap());
    }

    #[test]
    fn test_exists_title_check_is_case_insensitive() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .record("g1", "Bitcoin Hits New High", "body", "", RecordStatus::Selected)
            .unwrap();

        assert!(ledger.exists("g2", "bitcoin hits new high").unwrap());
    }

    #[test]
    fn test_is_duplicate_content() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .record("g1", "Title One", "identical body", "", RecordStatus::Selected)
            .unwrap();

        // Same body, different guid and title
        assert!(ledger.is_duplicate_content("identical body").unwrap());
        assert!(!ledger.is_duplicate_content("different body").unwrap());
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn test_update_status_and_output() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .record("g1", "Title", "body", "", RecordStatus::Selected)
            .unwrap();

        ledger.update_status("g1", RecordStatus::Published).unwrap();
        ledger.set_output("g1", "doc-abc123").unwrap();

        let record = ledger.get("g1").unwrap().unwrap();
        assert_eq!(record.status, "published");
        assert_eq!(record.output_file, Some("doc-abc123".to_string()));
    }

    #[test]
    fn test_history_most_recent_first() {
        let (ledger, _tmp) = create_test_ledger();
        for i in 0..5 {
            ledger
                .record(
                    &format!("g{}", i),
                    &format!("Unrelated Title Number {}", i * 7919),
                    &format!("body {}", i),
                    "",
                    RecordStatus::Selected,
                )
                .unwrap();
        }

        let history = ledger.history(3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].guid, "g4");
    }

    #[test]
    fn test_translation_log_appends() {
        let (ledger, _tmp) = create_test_ledger();
        ledger
            .log_translation("g1", "Title", "Título", "https://x/1", Some("doc-1"), "published")
            .unwrap();
        ledger
            .log_translation("g1", "Title", "Titre", "https://x/1", Some("doc-1"), "published")
            .unwrap();
        // Append-only log accepts repeated guids
    }

    #[test]
    fn test_ledger_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("ledger.db");
        let path = db_path.to_str().unwrap();

        {
            let ledger = DeduplicationLedger::new(path, 0.85).unwrap();
            ledger
                .record("g1", "Persistent Title", "body", "", RecordStatus::Selected)
                .unwrap();
        }

        {
            let ledger = DeduplicationLedger::new(path, 0.85).unwrap();
            assert!(ledger.exists("g1", "anything else entirely").unwrap());
        }
    }

    // ==================== Similarity Function Tests ====================

    #[test]
    fn test_title_similarity_bounds() {
        assert!((title_similarity("same", "same") - 1.0).abs() < f64::EPSILON);
        assert!(title_similarity("abc", "xyz") < 0.1);
    }
}
