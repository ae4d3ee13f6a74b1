use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use uuid::Uuid;

use super::models::*;
use crate::errors::QueueError;

type QResult<T> = std::result::Result<T, QueueError>;

const ITEM_COLUMNS: &str = "seq, id, title, description, work_type, priority, status, source, attempts, max_attempts,
     created_at, started_at, completed_at, success_criteria, functional_verifications,
     expected_files, needs, commit_sha, failure_report, last_error, retry_context";

/// Default page size for [`ItemCursor`].
pub const LIST_PAGE_SIZE: usize = 50;

/// Async-safe handle to the queue database.
///
/// Wraps `QueueDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Cloning shares the same connection.
#[derive(Clone)]
pub struct QueueHandle {
    inner: Arc<std::sync::Mutex<QueueDb>>,
}

impl QueueHandle {
    pub fn new(db: QueueDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn in_memory() -> QResult<Self> {
        Ok(Self::new(QueueDb::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> QResult<R>
    where
        F: FnOnce(&QueueDb) -> QResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| QueueError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .map_err(|e| QueueError::Database(anyhow::anyhow!("queue task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. Only for startup, CLI
    /// one-shots and tests; never from a hot async path.
    pub fn lock_sync(&self) -> QResult<std::sync::MutexGuard<'_, QueueDb>> {
        self.inner.lock().map_err(|_| QueueError::LockPoisoned)
    }

    pub async fn push(&self, item: NewWorkItem) -> QResult<Uuid> {
        self.call(move |db| db.push(&item)).await
    }

    pub async fn claim_next(&self) -> QResult<Option<WorkItem>> {
        self.call(|db| db.claim_next()).await
    }

    pub async fn complete(&self, id: Uuid, outcome: Outcome) -> QResult<WorkItem> {
        self.call(move |db| db.complete(id, outcome)).await
    }

    pub async fn requeue(&self, id: Uuid, retry_context: Option<String>) -> QResult<WorkItem> {
        self.call(move |db| db.requeue(id, retry_context.as_deref()))
            .await
    }

    pub async fn view(&self, id: Uuid) -> QResult<Option<WorkItem>> {
        self.call(move |db| db.view(id)).await
    }

    pub async fn list(&self, filter: ListFilter) -> QResult<Vec<WorkItem>> {
        self.call(move |db| db.list(filter).collect()).await
    }

    pub async fn set_commit_sha(&self, id: Uuid, sha: String) -> QResult<()> {
        self.call(move |db| db.set_commit_sha(id, &sha)).await
    }

    pub async fn attach_failure(
        &self,
        id: Uuid,
        report_path: Option<String>,
        reason: String,
    ) -> QResult<()> {
        self.call(move |db| db.attach_failure(id, report_path.as_deref(), &reason))
            .await
    }

    pub async fn counts(&self) -> QResult<QueueCounts> {
        self.call(|db| db.counts()).await
    }

    pub async fn recover_stale(&self) -> QResult<(usize, usize)> {
        self.call(|db| db.recover_stale()).await
    }
}

pub struct QueueDb {
    conn: Connection,
}

impl QueueDb {
    /// Open (or create) the queue database at the given path and run migrations.
    pub fn new(path: &Path) -> QResult<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open queue database at {}", path.display()))
            .map_err(QueueError::Database)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> QResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> QResult<()> {
        self.conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // WAL lets readers (status API, CLI) proceed while a worker holds the write lock.
        // In-memory databases answer "memory".
        let _mode: String = self.conn.pragma_update_and_check(
            None,
            "journal_mode",
            "WAL",
            |row| row.get(0),
        )?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS work_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                work_type TEXT NOT NULL,
                priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 5),
                status TEXT NOT NULL DEFAULT 'pending',
                source TEXT NOT NULL DEFAULT 'manual',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                success_criteria TEXT NOT NULL DEFAULT '[]',
                functional_verifications TEXT NOT NULL DEFAULT '[]',
                expected_files TEXT,
                needs TEXT NOT NULL DEFAULT '[]',
                commit_sha TEXT,
                failure_report TEXT,
                last_error TEXT,
                retry_context TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_claim
                ON work_items(status, priority DESC, seq);
            ",
        )?;
        Ok(())
    }

    /// Insert a new item with status `pending`.
    pub fn push(&self, item: &NewWorkItem) -> QResult<Uuid> {
        let (work_type, priority) = item.validate()?;
        let id = Uuid::new_v4();
        let max_attempts = item.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        self.conn.execute(
            "INSERT INTO work_items (id, title, description, work_type, priority, status, source,
                                     attempts, max_attempts, created_at, success_criteria,
                                     functional_verifications, expected_files, needs)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id.to_string(),
                item.title.trim(),
                item.description,
                work_type.as_str(),
                priority,
                item.source,
                max_attempts,
                Utc::now().to_rfc3339(),
                to_json(&item.success_criteria)?,
                to_json(&item.functional_verifications)?,
                item.expected_files.as_ref().map(to_json).transpose()?,
                to_json(&item.needs)?,
            ],
        )?;

        tracing::info!(task_id = %id, priority, work_type = work_type.as_str(), source = %item.source, "work item queued");
        Ok(id)
    }

    /// Atomically claim the highest-priority pending item (oldest first on ties).
    ///
    /// Selection and the status flip happen in one `UPDATE … RETURNING` inside an
    /// IMMEDIATE transaction, so two claimers (threads or processes sharing the
    /// file) can never receive the same item.
    pub fn claim_next(&self) -> QResult<Option<WorkItem>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let sql = format!(
            "UPDATE work_items SET status = 'active', started_at = ?1
             WHERE seq = (SELECT seq FROM work_items WHERE status = 'pending'
                          ORDER BY priority DESC, seq ASC LIMIT 1)
               AND status = 'pending'
             RETURNING {}",
            ITEM_COLUMNS
        );
        let claimed = tx
            .query_row(&sql, params![Utc::now().to_rfc3339()], ItemRow::from_row)
            .optional()?;
        tx.commit()?;

        let item = claimed.map(ItemRow::into_item).transpose()?;
        if let Some(ref item) = item {
            tracing::info!(task_id = %item.id, priority = item.priority, attempt = item.attempt_number(), "work item claimed");
        }
        Ok(item)
    }

    /// active → completed | failed.
    pub fn complete(&self, id: Uuid, outcome: Outcome) -> QResult<WorkItem> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let current = Self::status_of(&tx, id)?;
        if current != WorkStatus::Active {
            return Err(QueueError::InvalidState {
                id,
                expected: WorkStatus::Active.to_string(),
                actual: current.to_string(),
            });
        }
        tx.execute(
            "UPDATE work_items SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![
                outcome.status().as_str(),
                Utc::now().to_rfc3339(),
                id.to_string()
            ],
        )?;
        tx.commit()?;
        tracing::info!(task_id = %id, status = outcome.status().as_str(), "work item finished");
        self.view(id)?.ok_or(QueueError::NotFound { id })
    }

    /// active → pending for another attempt, incrementing `attempts`.
    ///
    /// The attempt being abandoned counts toward `max_attempts`: an item with
    /// `max_attempts = 3` runs at most three times. When no attempt is left the
    /// caller gets `RetryExhausted` and must fail the item instead.
    pub fn requeue(&self, id: Uuid, retry_context: Option<&str>) -> QResult<WorkItem> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let (status, attempts, max_attempts): (String, u32, u32) = tx
            .query_row(
                "SELECT status, attempts, max_attempts FROM work_items WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or(QueueError::NotFound { id })?;
        let status: WorkStatus = status.parse()?;
        if status != WorkStatus::Active {
            return Err(QueueError::InvalidState {
                id,
                expected: WorkStatus::Active.to_string(),
                actual: status.to_string(),
            });
        }
        if attempts + 1 >= max_attempts {
            return Err(QueueError::RetryExhausted {
                id,
                attempts: attempts + 1,
                max_attempts,
            });
        }
        tx.execute(
            "UPDATE work_items
             SET status = 'pending', attempts = attempts + 1, started_at = NULL,
                 retry_context = COALESCE(?1, retry_context)
             WHERE id = ?2",
            params![retry_context, id.to_string()],
        )?;
        tx.commit()?;
        tracing::info!(task_id = %id, attempts = attempts + 1, max_attempts, "work item requeued");
        self.view(id)?.ok_or(QueueError::NotFound { id })
    }

    pub fn view(&self, id: Uuid) -> QResult<Option<WorkItem>> {
        let sql = format!("SELECT {} FROM work_items WHERE id = ?1", ITEM_COLUMNS);
        self.conn
            .query_row(&sql, params![id.to_string()], ItemRow::from_row)
            .optional()?
            .map(ItemRow::into_item)
            .transpose()
    }

    /// Lazily page through items matching `filter`, priority desc then creation asc.
    pub fn list(&self, filter: ListFilter) -> ItemCursor<'_> {
        ItemCursor::new(self, filter, LIST_PAGE_SIZE)
    }

    pub fn set_commit_sha(&self, id: Uuid, sha: &str) -> QResult<()> {
        let n = self.conn.execute(
            "UPDATE work_items SET commit_sha = ?1 WHERE id = ?2",
            params![sha, id.to_string()],
        )?;
        if n == 0 {
            return Err(QueueError::NotFound { id });
        }
        Ok(())
    }

    pub fn attach_failure(&self, id: Uuid, report_path: Option<&str>, reason: &str) -> QResult<()> {
        let n = self.conn.execute(
            "UPDATE work_items SET failure_report = COALESCE(?1, failure_report), last_error = ?2
             WHERE id = ?3",
            params![report_path, reason, id.to_string()],
        )?;
        if n == 0 {
            return Err(QueueError::NotFound { id });
        }
        Ok(())
    }

    /// Return items left `active` by a crashed process to the queue.
    ///
    /// Only safe before any worker of this process starts claiming. Items with
    /// no attempts left are failed instead. Returns (requeued, failed).
    pub fn recover_stale(&self) -> QResult<(usize, usize)> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let failed = tx.execute(
            "UPDATE work_items
             SET status = 'failed', completed_at = ?1,
                 last_error = 'interrupted while active; no attempts left'
             WHERE status = 'active' AND attempts + 1 >= max_attempts",
            params![Utc::now().to_rfc3339()],
        )?;
        let requeued = tx.execute(
            "UPDATE work_items
             SET status = 'pending', attempts = attempts + 1, started_at = NULL,
                 last_error = 'interrupted while active'
             WHERE status = 'active'",
            [],
        )?;
        tx.commit()?;
        if requeued + failed > 0 {
            tracing::warn!(requeued, failed, "recovered work items left active by a previous run");
        }
        Ok((requeued, failed))
    }

    pub fn counts(&self) -> QResult<QueueCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n as usize;
            match status.parse::<WorkStatus>()? {
                WorkStatus::Pending => counts.pending = n,
                WorkStatus::Active => counts.active = n,
                WorkStatus::Completed => counts.completed = n,
                WorkStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    fn status_of(tx: &Transaction<'_>, id: Uuid) -> QResult<WorkStatus> {
        let status: String = tx
            .query_row(
                "SELECT status FROM work_items WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(QueueError::NotFound { id })?;
        status.parse()
    }

    fn fetch_page(
        &self,
        filter: &ListFilter,
        after: Option<(u8, i64)>,
        limit: usize,
    ) -> QResult<Vec<(u8, i64, WorkItem)>> {
        let sql = format!(
            "SELECT {} FROM work_items
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR work_type = ?2)
               AND (?3 IS NULL OR priority >= ?3)
               AND (?4 IS NULL OR priority <= ?4)
               AND (?5 IS NULL OR priority < ?5 OR (priority = ?5 AND seq > ?6))
             ORDER BY priority DESC, seq ASC
             LIMIT ?7",
            ITEM_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                filter.status.map(|s| s.as_str()),
                filter.work_type.map(|t| t.as_str()),
                filter.min_priority,
                filter.max_priority,
                after.map(|(p, _)| p),
                after.map(|(_, s)| s),
                limit as i64,
            ],
            ItemRow::from_row,
        )?;
        let mut page = Vec::new();
        for row in rows {
            let r = row?;
            let (priority, seq) = (r.priority, r.seq);
            page.push((priority, seq, r.into_item()?));
        }
        Ok(page)
    }
}

/// Lazy, finite, restartable sequence over queue items.
///
/// Pages are fetched on demand with keyset pagination on (priority, seq), so
/// items inserted mid-iteration never cause duplicates. `restart` rewinds to
/// the first page.
pub struct ItemCursor<'a> {
    db: &'a QueueDb,
    filter: ListFilter,
    page_size: usize,
    after: Option<(u8, i64)>,
    buffer: VecDeque<WorkItem>,
    exhausted: bool,
}

impl<'a> ItemCursor<'a> {
    fn new(db: &'a QueueDb, filter: ListFilter, page_size: usize) -> Self {
        Self {
            db,
            filter,
            page_size: page_size.max(1),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.exhausted = false;
    }
}

impl Iterator for ItemCursor<'_> {
    type Item = QResult<WorkItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.db.fetch_page(&self.filter, self.after, self.page_size) {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some((p, s, _)) = page.last() {
                        self.after = Some((*p, *s));
                    }
                    self.buffer.extend(page.into_iter().map(|(_, _, item)| item));
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> QResult<String> {
    serde_json::to_string(value)
        .context("Failed to serialize work item field")
        .map_err(QueueError::Database)
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, field: &str) -> QResult<T> {
    serde_json::from_str(raw)
        .with_context(|| format!("Invalid JSON in work_items.{}", field))
        .map_err(QueueError::Database)
}

fn parse_ts(raw: &str) -> QResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .context("Invalid timestamp in work_items")
        .map_err(QueueError::Database)
}

struct ItemRow {
    seq: i64,
    id: String,
    title: String,
    description: String,
    work_type: String,
    priority: u8,
    status: String,
    source: String,
    attempts: u32,
    max_attempts: u32,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    success_criteria: String,
    functional_verifications: String,
    expected_files: Option<String>,
    needs: String,
    commit_sha: Option<String>,
    failure_report: Option<String>,
    last_error: Option<String>,
    retry_context: Option<String>,
}

impl ItemRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            title: row.get(2)?,
            description: row.get(3)?,
            work_type: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            source: row.get(7)?,
            attempts: row.get(8)?,
            max_attempts: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
            success_criteria: row.get(13)?,
            functional_verifications: row.get(14)?,
            expected_files: row.get(15)?,
            needs: row.get(16)?,
            commit_sha: row.get(17)?,
            failure_report: row.get(18)?,
            last_error: row.get(19)?,
            retry_context: row.get(20)?,
        })
    }

    fn into_item(self) -> QResult<WorkItem> {
        Ok(WorkItem {
            id: Uuid::parse_str(&self.id)
                .context("Invalid id in work_items")
                .map_err(QueueError::Database)?,
            title: self.title,
            description: self.description,
            work_type: self.work_type.parse()?,
            priority: self.priority,
            status: self.status.parse()?,
            source: self.source,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            success_criteria: from_json(&self.success_criteria, "success_criteria")?,
            functional_verifications: from_json(
                &self.functional_verifications,
                "functional_verifications",
            )?,
            expected_files: self
                .expected_files
                .as_deref()
                .map(|raw| from_json::<BTreeSet<String>>(raw, "expected_files"))
                .transpose()?,
            needs: from_json(&self.needs, "needs")?,
            commit_sha: self.commit_sha,
            failure_report: self.failure_report,
            last_error: self.last_error,
            retry_context: self.retry_context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn push(db: &QueueDb, title: &str, priority: i64) -> Uuid {
        db.push(&NewWorkItem::new(title, WorkType::Feature, priority))
            .unwrap()
    }

    #[test]
    fn test_push_rejects_invalid_priority_and_type() {
        let db = QueueDb::new_in_memory().unwrap();
        assert!(matches!(
            db.push(&NewWorkItem::new("x", WorkType::Feature, 9)),
            Err(QueueError::Validation(_))
        ));
        let mut bad = NewWorkItem::new("x", WorkType::Feature, 3);
        bad.work_type = "chore".to_string();
        assert!(matches!(db.push(&bad), Err(QueueError::Validation(_))));
        assert_eq!(db.counts().unwrap(), QueueCounts::default());
    }

    #[test]
    fn test_push_then_view_round_trips_fields() {
        let db = QueueDb::new_in_memory().unwrap();
        let new = NewWorkItem::new("Fix login", WorkType::BugFix, 4)
            .with_description("500 on POST /login")
            .with_source("log_scanner")
            .with_expected_files(["app/controllers/sessions.rb"])
            .with_needs(["web"])
            .with_criteria(vec![Criterion::FileExists {
                path: "app/controllers/sessions.rb".into(),
            }]);
        let id = db.push(&new).unwrap();
        let item = db.view(id).unwrap().unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.work_type, WorkType::BugFix);
        assert_eq!(item.source, "log_scanner");
        assert_eq!(item.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(item.success_criteria.len(), 1);
        assert!(item.expected_files.unwrap().contains("app/controllers/sessions.rb"));
        assert!(item.needs.contains("web"));
        assert!(item.started_at.is_none());
    }

    #[test]
    fn test_claim_next_returns_highest_priority_first() {
        let db = QueueDb::new_in_memory().unwrap();
        let low = push(&db, "low", 2);
        let high = push(&db, "high", 5);

        let first = db.claim_next().unwrap().unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, WorkStatus::Active);
        assert!(first.started_at.is_some());

        let second = db.claim_next().unwrap().unwrap();
        assert_eq!(second.id, low);
        assert!(db.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_claim_next_breaks_ties_by_creation_order() {
        let db = QueueDb::new_in_memory().unwrap();
        let a = push(&db, "a", 3);
        let b = push(&db, "b", 3);
        let c = push(&db, "c", 3);
        let order: Vec<Uuid> = (0..3).map(|_| db.claim_next().unwrap().unwrap().id).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn test_claim_next_on_empty_queue_is_none() {
        let db = QueueDb::new_in_memory().unwrap();
        assert!(db.claim_next().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_claims_never_share_an_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let db = QueueDb::new(&path).unwrap();
            for i in 0..40 {
                push(&db, &format!("item {}", i), (i % 5) + 1);
            }
        }

        // Separate connections per thread exercise the IMMEDIATE transaction,
        // not just the in-process mutex.
        let claimed = std::sync::Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let claimed = claimed.clone();
                std::thread::spawn(move || {
                    let db = QueueDb::new(&path).unwrap();
                    while let Some(item) = db.claim_next().unwrap() {
                        claimed.lock().unwrap().push(item.id);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let claimed = claimed.lock().unwrap();
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(claimed.len(), 40);
        assert_eq!(unique.len(), 40, "an item was handed to two workers");
    }

    #[test]
    fn test_complete_requires_active_state() {
        let db = QueueDb::new_in_memory().unwrap();
        let id = push(&db, "x", 3);
        assert!(matches!(
            db.complete(id, Outcome::Completed),
            Err(QueueError::InvalidState { .. })
        ));

        db.claim_next().unwrap();
        let done = db.complete(id, Outcome::Completed).unwrap();
        assert_eq!(done.status, WorkStatus::Completed);
        assert!(done.completed_at.is_some());

        assert!(matches!(
            db.complete(id, Outcome::Failed),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_complete_unknown_id_is_not_found() {
        let db = QueueDb::new_in_memory().unwrap();
        assert!(matches!(
            db.complete(Uuid::new_v4(), Outcome::Completed),
            Err(QueueError::NotFound { .. })
        ));
    }

    #[test]
    fn test_requeue_increments_attempts_until_exhausted() {
        let db = QueueDb::new_in_memory().unwrap();
        let id = db
            .push(&NewWorkItem::new("x", WorkType::Test, 3).with_max_attempts(3))
            .unwrap();

        db.claim_next().unwrap();
        let item = db.requeue(id, Some("tests failed: 2")).unwrap();
        assert_eq!(item.status, WorkStatus::Pending);
        assert_eq!(item.attempts, 1);
        assert_eq!(item.retry_context.as_deref(), Some("tests failed: 2"));

        db.claim_next().unwrap();
        let item = db.requeue(id, None).unwrap();
        assert_eq!(item.attempts, 2);
        assert_eq!(item.retry_context.as_deref(), Some("tests failed: 2"));

        db.claim_next().unwrap();
        assert!(matches!(
            db.requeue(id, None),
            Err(QueueError::RetryExhausted { attempts: 3, max_attempts: 3, .. })
        ));
        // Still active: the caller must fail it explicitly.
        assert_eq!(db.view(id).unwrap().unwrap().status, WorkStatus::Active);
        db.complete(id, Outcome::Failed).unwrap();
    }

    #[test]
    fn test_requeue_pending_item_is_state_error() {
        let db = QueueDb::new_in_memory().unwrap();
        let id = push(&db, "x", 3);
        assert!(matches!(
            db.requeue(id, None),
            Err(QueueError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_list_orders_by_priority_then_creation() {
        let db = QueueDb::new_in_memory().unwrap();
        let a = push(&db, "a", 1);
        let b = push(&db, "b", 5);
        let c = push(&db, "c", 3);
        let d = push(&db, "d", 5);
        let ids: Vec<Uuid> = db
            .list(ListFilter::default())
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![b, d, c, a]);
    }

    #[test]
    fn test_list_pages_lazily_and_restarts() {
        let db = QueueDb::new_in_memory().unwrap();
        for i in 0..7 {
            push(&db, &format!("{}", i), (i % 3) + 1);
        }
        let mut cursor = db.list(ListFilter::default()).with_page_size(2);
        let first: Vec<Uuid> = cursor.by_ref().map(|r| r.unwrap().id).collect();
        assert_eq!(first.len(), 7);
        assert!(cursor.next().is_none());

        cursor.restart();
        let second: Vec<Uuid> = cursor.map(|r| r.unwrap().id).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_list_filters() {
        let db = QueueDb::new_in_memory().unwrap();
        push(&db, "feature", 2);
        db.push(&NewWorkItem::new("bug", WorkType::BugFix, 4)).unwrap();
        push(&db, "claimed", 5);
        db.claim_next().unwrap();

        let pending: Vec<_> = db
            .list(ListFilter::status(WorkStatus::Pending))
            .collect::<QResult<_>>()
            .unwrap();
        assert_eq!(pending.len(), 2);

        let bugs: Vec<WorkItem> = db
            .list(ListFilter {
                work_type: Some(WorkType::BugFix),
                ..Default::default()
            })
            .collect::<QResult<_>>()
            .unwrap();
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].title, "bug");

        let urgent: Vec<WorkItem> = db
            .list(ListFilter {
                min_priority: Some(4),
                ..Default::default()
            })
            .collect::<QResult<_>>()
            .unwrap();
        assert_eq!(urgent.len(), 2);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let id = {
            let db = QueueDb::new(&path).unwrap();
            push(&db, "durable", 4)
        };
        let db = QueueDb::new(&path).unwrap();
        let item = db.view(id).unwrap().unwrap();
        assert_eq!(item.title, "durable");
        assert_eq!(item.status, WorkStatus::Pending);
    }

    #[test]
    fn test_recover_stale_requeues_or_fails_active_items() {
        let db = QueueDb::new_in_memory().unwrap();
        let retryable = db
            .push(&NewWorkItem::new("a", WorkType::Feature, 5).with_max_attempts(3))
            .unwrap();
        let last_try = db
            .push(&NewWorkItem::new("b", WorkType::Feature, 4).with_max_attempts(1))
            .unwrap();
        db.claim_next().unwrap();
        db.claim_next().unwrap();

        assert_eq!(db.recover_stale().unwrap(), (1, 1));
        let a = db.view(retryable).unwrap().unwrap();
        assert_eq!(a.status, WorkStatus::Pending);
        assert_eq!(a.attempts, 1);
        let b = db.view(last_try).unwrap().unwrap();
        assert_eq!(b.status, WorkStatus::Failed);
    }

    #[test]
    fn test_set_commit_sha_and_attach_failure() {
        let db = QueueDb::new_in_memory().unwrap();
        let id = push(&db, "x", 3);
        db.set_commit_sha(id, "abc123").unwrap();
        db.attach_failure(id, Some("/tmp/report.json"), "tests failed")
            .unwrap();
        let item = db.view(id).unwrap().unwrap();
        assert_eq!(item.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(item.failure_report.as_deref(), Some("/tmp/report.json"));
        assert_eq!(item.last_error.as_deref(), Some("tests failed"));
        assert!(matches!(
            db.set_commit_sha(Uuid::new_v4(), "x"),
            Err(QueueError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_handle_claims_exclusively_across_tasks() {
        let handle = QueueHandle::in_memory().unwrap();
        for i in 0..20 {
            handle
                .push(NewWorkItem::new(&format!("{}", i), WorkType::Refactor, 3))
                .await
                .unwrap();
        }
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(item) = h.claim_next().await.unwrap() {
                    mine.push(item.id);
                }
                mine
            }));
        }
        let mut all = Vec::new();
        for t in tasks {
            all.extend(t.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }
}
