use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{FrozenRevision, IdentityProvider, PageStore, RevisionStore};
use crate::task::{TaskOutcome, TaskQueue, TaskSpec, run_create_page, run_refresh_page};

const QUEUE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS queue_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    params_json TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    detail TEXT,
    enqueued_at_unix INTEGER NOT NULL,
    finished_at_unix INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_tasks_status ON queue_tasks(status);
CREATE INDEX IF NOT EXISTS idx_queue_tasks_batch ON queue_tasks(batch_id);

CREATE TABLE IF NOT EXISTS frozen_revisions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_title TEXT NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL
);
"#;

const STATUS_PENDING: &str = "pending";
const STATUS_SUCCEEDED: &str = "succeeded";
const STATUS_FAILED: &str = "failed";

/// Durable task queue backed by SQLite. Also hosts the frozen revision
/// store so oversized bodies survive a process restart alongside the
/// tasks that reference them.
pub struct SqliteTaskQueue {
    connection: Connection,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub frozen_revisions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRunResult {
    pub task_id: i64,
    pub kind: String,
    pub target_title: String,
    pub status: String,
    pub detail: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueRunReport {
    pub success: bool,
    pub ran: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub follow_ups_enqueued: usize,
    pub errors: Vec<String>,
    pub tasks: Vec<TaskRunResult>,
}

impl SqliteTaskQueue {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        initialize_queue_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        initialize_queue_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.count_by_status(STATUS_PENDING)?,
            succeeded: self.count_by_status(STATUS_SUCCEEDED)?,
            failed: self.count_by_status(STATUS_FAILED)?,
            frozen_revisions: count_query(&self.connection, "SELECT COUNT(*) FROM frozen_revisions")?,
        })
    }

    fn count_by_status(&self, status: &str) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM queue_tasks WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )
            .context("failed to count queue tasks")?;
        Ok(count as usize)
    }

    fn next_batch_id(&self) -> Result<i64> {
        let max: Option<i64> = self
            .connection
            .query_row("SELECT MAX(batch_id) FROM queue_tasks", [], |row| {
                row.get(0)
            })
            .context("failed to read batch ids")?;
        Ok(max.unwrap_or(0) + 1)
    }

    fn insert_task(&self, batch_id: i64, spec: &TaskSpec) -> Result<()> {
        let params_json =
            serde_json::to_string(spec).context("failed to serialize task parameters")?;
        self.connection
            .execute(
                "INSERT INTO queue_tasks (batch_id, kind, params_json, status, enqueued_at_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![batch_id, spec.kind(), params_json, STATUS_PENDING, unix_now()?],
            )
            .context("failed to insert queue task")?;
        Ok(())
    }

    fn pending_tasks(&self, limit: Option<usize>) -> Result<Vec<(i64, String)>> {
        let sql = match limit {
            Some(_) => {
                "SELECT id, params_json FROM queue_tasks WHERE status = ?1 ORDER BY id LIMIT ?2"
            }
            None => "SELECT id, params_json FROM queue_tasks WHERE status = ?1 ORDER BY id",
        };
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare pending-task query")?;
        fn row_to_pair(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String)> {
            Ok((row.get(0)?, row.get(1)?))
        }
        let mut rows = Vec::new();
        let mapped = match limit {
            Some(limit) => statement.query_map(params![STATUS_PENDING, limit as i64], row_to_pair),
            None => statement.query_map(params![STATUS_PENDING], row_to_pair),
        }
        .context("failed to query pending tasks")?;
        for row in mapped {
            rows.push(row.context("failed to read pending task row")?);
        }
        Ok(rows)
    }

    fn mark_finished(&self, task_id: i64, outcome: &TaskOutcome) -> Result<()> {
        let (status, error, detail) = match outcome {
            TaskOutcome::Succeeded { action, detail } => (
                STATUS_SUCCEEDED,
                None,
                Some(match detail {
                    Some(detail) => format!("{}; {detail}", action.as_str()),
                    None => action.as_str().to_string(),
                }),
            ),
            TaskOutcome::Failed { error } => (STATUS_FAILED, Some(error.clone()), None),
        };
        self.connection
            .execute(
                "UPDATE queue_tasks SET status = ?1, error = ?2, detail = ?3, finished_at_unix = ?4
                 WHERE id = ?5",
                params![status, error, detail, unix_now()?, task_id],
            )
            .context("failed to update queue task")?;
        Ok(())
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn enqueue(&mut self, batch: Vec<TaskSpec>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch_id = self.next_batch_id()?;
        let transaction = self
            .connection
            .transaction()
            .context("failed to start queue transaction")?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO queue_tasks (batch_id, kind, params_json, status, enqueued_at_unix)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("failed to prepare queue insert")?;
            let now = unix_now()?;
            for spec in &batch {
                let params_json =
                    serde_json::to_string(spec).context("failed to serialize task parameters")?;
                statement
                    .execute(params![batch_id, spec.kind(), params_json, STATUS_PENDING, now])
                    .context("failed to insert queue task")?;
            }
        }
        transaction
            .commit()
            .context("failed to commit queue transaction")?;
        Ok(())
    }
}

impl RevisionStore for SqliteTaskQueue {
    fn store_revision(&mut self, target_title: &str, content: &str) -> Result<i64> {
        self.connection
            .execute(
                "INSERT INTO frozen_revisions (target_title, content, content_hash, created_at_unix)
                 VALUES (?1, ?2, ?3, ?4)",
                params![target_title, content, compute_hash(content), unix_now()?],
            )
            .context("failed to store frozen revision")?;
        Ok(self.connection.last_insert_rowid())
    }

    fn revision_by_id(&mut self, id: i64) -> Result<Option<FrozenRevision>> {
        let mut statement = self
            .connection
            .prepare("SELECT id, target_title, content FROM frozen_revisions WHERE id = ?1")
            .context("failed to prepare revision query")?;
        let mut rows = statement
            .query_map(params![id], |row| {
                Ok(FrozenRevision {
                    id: row.get(0)?,
                    target_title: row.get(1)?,
                    content: row.get(2)?,
                })
            })
            .context("failed to query frozen revision")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read frozen revision")?)),
            None => Ok(None),
        }
    }
}

/// Run pending tasks oldest-first. Each task is executed and finalized
/// independently; one failure never aborts the run. A successful create
/// enqueues its follow-up refresh as a new pending task.
pub fn run_pending_tasks(
    queue: &mut SqliteTaskQueue,
    store: &mut dyn PageStore,
    identity: &dyn IdentityProvider,
    limit: Option<usize>,
) -> Result<QueueRunReport> {
    let pending = queue.pending_tasks(limit)?;
    let mut report = QueueRunReport {
        success: false,
        ran: 0,
        succeeded: 0,
        failed: 0,
        follow_ups_enqueued: 0,
        errors: Vec::new(),
        tasks: Vec::new(),
    };

    for (task_id, params_json) in pending {
        let spec: TaskSpec = match serde_json::from_str(&params_json) {
            Ok(spec) => spec,
            Err(error) => {
                let message = format!("task {task_id}: unreadable parameters: {error}");
                queue.mark_finished(
                    task_id,
                    &TaskOutcome::Failed {
                        error: message.clone(),
                    },
                )?;
                report.ran += 1;
                report.failed += 1;
                report.errors.push(message);
                continue;
            }
        };

        let target_title = spec.target_title().full();
        let (outcome, follow_up) = match &spec {
            TaskSpec::Create(params) => run_create_page(store, queue, identity, params),
            TaskSpec::Refresh(params) => (run_refresh_page(store, identity, params), None),
        };
        queue.mark_finished(task_id, &outcome)?;
        report.ran += 1;

        let mut detail = None;
        let mut error = None;
        match &outcome {
            TaskOutcome::Succeeded {
                action,
                detail: note,
            } => {
                report.succeeded += 1;
                detail = Some(match note {
                    Some(note) => format!("{}; {note}", action.as_str()),
                    None => action.as_str().to_string(),
                });
            }
            TaskOutcome::Failed { error: message } => {
                report.failed += 1;
                error = Some(message.clone());
                report.errors.push(format!("{target_title}: {message}"));
            }
        }

        if let Some(refresh) = follow_up {
            // A lost follow-up degrades the page's derived data, not the
            // save itself, so it is reported without failing the task.
            let batch_id = queue.next_batch_id()?;
            match queue.insert_task(batch_id, &TaskSpec::Refresh(refresh)) {
                Ok(()) => report.follow_ups_enqueued += 1,
                Err(enqueue_error) => report
                    .errors
                    .push(format!("{target_title}: failed to enqueue refresh: {enqueue_error:#}")),
            }
        }

        report.tasks.push(TaskRunResult {
            task_id,
            kind: spec.kind().to_string(),
            target_title,
            status: if outcome.is_success() {
                STATUS_SUCCEEDED.to_string()
            } else {
                STATUS_FAILED.to_string()
            },
            detail,
            error,
        });
    }

    report.success = report.errors.is_empty();
    Ok(report)
}

fn initialize_queue_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(QUEUE_SCHEMA_SQL)
        .context("failed to initialize queue schema")?;
    Ok(())
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .context("failed to run count query")?;
    Ok(count as usize)
}

fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn unix_now() -> Result<i64> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow::anyhow!("system clock is before the unix epoch"))?;
    if now.as_secs() > i64::MAX as u64 {
        bail!("system clock is out of range");
    }
    Ok(now.as_secs() as i64)
}
