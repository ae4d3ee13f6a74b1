use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Evidence, EvidenceKind, EvidenceReport};
use crate::util::truncate_utf8;

/// Default cap on stored raw output per record.
pub const DEFAULT_MAX_RAW_BYTES: usize = 64 * 1024;

/// Async-safe handle to the evidence database.
///
/// Same shape as the queue handle: a mutex-guarded connection driven from
/// tokio's blocking pool so SQLite I/O never stalls async workers.
#[derive(Clone)]
pub struct EvidenceStore {
    inner: Arc<std::sync::Mutex<EvidenceDb>>,
}

impl EvidenceStore {
    pub fn new(db: EvidenceDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// In-memory store, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(EvidenceDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EvidenceDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Evidence lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Evidence task panicked")?
    }

    pub async fn record(
        &self,
        task_id: Uuid,
        kind: EvidenceKind,
        payload: serde_json::Value,
        raw_output: Option<String>,
    ) -> Result<i64> {
        self.call(move |db| db.record(task_id, kind, &payload, raw_output.as_deref()))
            .await
    }

    pub async fn query(&self, task_id: Uuid, kind: Option<EvidenceKind>) -> Result<Vec<Evidence>> {
        self.call(move |db| db.query(task_id, kind)).await
    }

    pub async fn export_report(&self, task_id: Uuid) -> Result<EvidenceReport> {
        self.call(move |db| db.export_report(task_id)).await
    }
}

pub struct EvidenceDb {
    conn: Connection,
    max_raw_bytes: usize,
}

impl EvidenceDb {
    /// Open (or create) the evidence tables in the SQLite database at `path`.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open evidence database")?;
        let db = Self {
            conn,
            max_raw_bytes: DEFAULT_MAX_RAW_BYTES,
        };
        db.init()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory evidence database")?;
        let db = Self {
            conn,
            max_raw_bytes: DEFAULT_MAX_RAW_BYTES,
        };
        db.init()?;
        Ok(db)
    }

    pub fn with_raw_limit(mut self, max_raw_bytes: usize) -> Self {
        self.max_raw_bytes = max_raw_bytes;
        self
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS evidence (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    raw_output TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_evidence_task ON evidence(task_id, kind);

                CREATE TRIGGER IF NOT EXISTS evidence_no_update
                BEFORE UPDATE ON evidence
                BEGIN
                    SELECT RAISE(ABORT, 'evidence is append-only');
                END;
                ",
            )
            .context("Failed to create evidence table")?;
        Ok(())
    }

    /// Append one record. Raw output beyond the size cap is truncated, and the
    /// payload gains `raw_sha256` (digest of the full output) and `raw_truncated`.
    pub fn record(
        &self,
        task_id: Uuid,
        kind: EvidenceKind,
        payload: &serde_json::Value,
        raw_output: Option<&str>,
    ) -> Result<i64> {
        let mut payload = payload.clone();
        let stored_raw = raw_output.map(|raw| {
            let (kept, truncated) = truncate_utf8(raw, self.max_raw_bytes);
            if let Some(obj) = payload.as_object_mut() {
                let digest = Sha256::digest(raw.as_bytes());
                obj.insert(
                    "raw_sha256".to_string(),
                    serde_json::Value::String(format!("{:x}", digest)),
                );
                obj.insert("raw_truncated".to_string(), serde_json::Value::Bool(truncated));
            }
            kept.to_string()
        });

        let payload_json =
            serde_json::to_string(&payload).context("Failed to serialize evidence payload")?;
        self.conn
            .execute(
                "INSERT INTO evidence (task_id, kind, recorded_at, payload, raw_output)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    task_id.to_string(),
                    kind.as_str(),
                    Utc::now().to_rfc3339(),
                    payload_json,
                    stored_raw
                ],
            )
            .context("Failed to insert evidence")?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(%task_id, kind = kind.as_str(), evidence_id = id, "evidence recorded");
        Ok(id)
    }

    /// All evidence for a task in recording order, optionally of one kind.
    pub fn query(&self, task_id: Uuid, kind: Option<EvidenceKind>) -> Result<Vec<Evidence>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, task_id, kind, recorded_at, payload, raw_output
                 FROM evidence
                 WHERE task_id = ?1 AND (?2 IS NULL OR kind = ?2)
                 ORDER BY id",
            )
            .context("Failed to prepare evidence query")?;
        let rows = stmt
            .query_map(
                params![task_id.to_string(), kind.map(|k| k.as_str())],
                |row| {
                    Ok(EvidenceRow {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        kind: row.get(2)?,
                        recorded_at: row.get(3)?,
                        payload: row.get(4)?,
                        raw_output: row.get(5)?,
                    })
                },
            )
            .context("Failed to query evidence")?;

        let mut entries = Vec::new();
        for row in rows {
            let r = row.context("Failed to read evidence row")?;
            entries.push(r.into_evidence()?);
        }
        Ok(entries)
    }

    pub fn export_report(&self, task_id: Uuid) -> Result<EvidenceReport> {
        Ok(EvidenceReport::from_entries(task_id, self.query(task_id, None)?))
    }

    pub fn count(&self, task_id: Uuid) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM evidence WHERE task_id = ?1",
                params![task_id.to_string()],
                |row| row.get(0),
            )
            .context("Failed to count evidence")?;
        Ok(n as usize)
    }
}

struct EvidenceRow {
    id: i64,
    task_id: String,
    kind: String,
    recorded_at: String,
    payload: String,
    raw_output: Option<String>,
}

impl EvidenceRow {
    fn into_evidence(self) -> Result<Evidence> {
        Ok(Evidence {
            id: self.id,
            task_id: Uuid::parse_str(&self.task_id).context("Invalid task id in evidence row")?,
            kind: self.kind.parse()?,
            timestamp: DateTime::parse_from_rfc3339(&self.recorded_at)
                .context("Invalid evidence timestamp")?
                .with_timezone(&Utc),
            payload: serde_json::from_str(&self.payload).context("Invalid evidence payload")?,
            raw_output: self.raw_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_appends_and_never_overwrites() -> Result<()> {
        let db = EvidenceDb::new_in_memory()?;
        let task = Uuid::new_v4();

        let a = db.record(task, EvidenceKind::TestRun, &json!({"passed": false}), None)?;
        let b = db.record(task, EvidenceKind::TestRun, &json!({"passed": true}), None)?;
        assert_ne!(a, b);

        let all = db.query(task, None)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].passed(), Some(false));
        assert_eq!(all[1].passed(), Some(true));
        Ok(())
    }

    #[test]
    fn test_updates_are_rejected() -> Result<()> {
        let db = EvidenceDb::new_in_memory()?;
        let task = Uuid::new_v4();
        let id = db.record(task, EvidenceKind::Diff, &json!({"passed": true}), None)?;
        let result = db.conn.execute(
            "UPDATE evidence SET payload = '{}' WHERE id = ?1",
            params![id],
        );
        assert!(result.is_err(), "evidence rows must be immutable");
        Ok(())
    }

    #[test]
    fn test_query_filters_by_task_and_kind() -> Result<()> {
        let db = EvidenceDb::new_in_memory()?;
        let task = Uuid::new_v4();
        let other = Uuid::new_v4();
        db.record(task, EvidenceKind::TestRun, &json!({}), None)?;
        db.record(task, EvidenceKind::PortCheck, &json!({}), None)?;
        db.record(other, EvidenceKind::TestRun, &json!({}), None)?;

        assert_eq!(db.query(task, None)?.len(), 2);
        let runs = db.query(task, Some(EvidenceKind::TestRun))?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].task_id, task);
        assert_eq!(db.count(other)?, 1);
        Ok(())
    }

    #[test]
    fn test_raw_output_is_truncated_with_digest() -> Result<()> {
        let db = EvidenceDb::new_in_memory()?.with_raw_limit(8);
        let task = Uuid::new_v4();
        db.record(
            task,
            EvidenceKind::TestRun,
            &json!({"passed": true}),
            Some("0123456789abcdef"),
        )?;
        let e = &db.query(task, None)?[0];
        assert_eq!(e.raw_output.as_deref(), Some("01234567"));
        assert_eq!(e.payload["raw_truncated"], json!(true));
        assert_eq!(e.payload["raw_sha256"].as_str().unwrap().len(), 64);
        Ok(())
    }

    #[test]
    fn test_export_report_aggregates_everything() -> Result<()> {
        let db = EvidenceDb::new_in_memory()?;
        let task = Uuid::new_v4();
        db.record(task, EvidenceKind::TestRun, &json!({"passed": true}), Some("ok"))?;
        db.record(task, EvidenceKind::Criterion, &json!({"passed": false}), None)?;
        let report = db.export_report(task)?;
        assert_eq!(report.total, 2);
        assert_eq!(report.task_id, task);
        assert_eq!(report.by_kind[&EvidenceKind::Criterion].failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_handle_round_trip() -> Result<()> {
        let store = EvidenceStore::in_memory()?;
        let task = Uuid::new_v4();
        let id = store
            .record(task, EvidenceKind::PortCheck, json!({"passed": true}), None)
            .await?;
        let entries = store.query(task, Some(EvidenceKind::PortCheck)).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        Ok(())
    }
}
