//! SQLite-based task store.
//!
//! Each node is stored as its JSON document plus a handful of indexed columns
//! the claim and summary queries filter on. The conditional write is a single
//! `UPDATE ... WHERE version = ?`, so concurrent workers sharing one database
//! file get the same compare-and-swap semantics as the in-memory store.

use super::{summarize, StoreError, SummaryIndex, SummaryResult, SummaryRow, TaskDb};
use crate::task::{TaskInfo, TaskState};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    version INTEGER NOT NULL,
    job_id TEXT NOT NULL,
    parent_id TEXT,
    state TEXT NOT NULL,
    profile TEXT NOT NULL,
    task_type TEXT NOT NULL,
    subtype TEXT NOT NULL DEFAULT '',
    worker_id TEXT,
    created INTEGER NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    total_progress REAL NOT NULL DEFAULT 0,
    doc TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id, state);
CREATE INDEX IF NOT EXISTS idx_tasks_profile ON tasks(profile, state, created);
CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type, subtype, state);
CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, created);
CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker_id) WHERE worker_id IS NOT NULL;
"#;

/// Database file name inside the data directory.
const DB_FILE: &str = "tasks.db";

pub struct SqliteTaskDb {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteTaskDb {
    /// Open (or create) `tasks.db` under `data_dir`.
    pub async fn new(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&data_dir).await?;
        Self::open(data_dir.join(DB_FILE)).await
    }

    /// Open (or create) the database at `path`.
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await??;

        tracing::debug!("Opened task database at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }
}

fn parse_doc(doc: &str) -> Result<TaskInfo, StoreError> {
    Ok(serde_json::from_str(doc)?)
}

fn query_docs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<TaskInfo>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let docs = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    docs.iter().map(|doc| parse_doc(doc)).collect()
}

#[async_trait]
impl TaskDb for SqliteTaskDb {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn get(&self, id: &str) -> Result<Option<TaskInfo>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let doc: Option<String> = conn
                .query_row("SELECT doc FROM tasks WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            doc.as_deref().map(parse_doc).transpose()
        })
        .await
    }

    async fn put(&self, info: &mut TaskInfo) -> Result<bool, StoreError> {
        let expected = info.version;
        let mut stored = info.clone();
        stored.version = expected + 1;
        let doc = serde_json::to_string(&stored)?;

        let written = self
            .with_conn(move |conn| {
                let changed = if expected == 0 {
                    conn.execute(
                        "INSERT OR IGNORE INTO tasks
                            (id, version, job_id, parent_id, state, profile, task_type, subtype,
                             worker_id, created, progress, total_progress, doc)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                        params![
                            stored.id,
                            stored.version as i64,
                            stored.job_id,
                            stored.parent_id,
                            stored.state.as_str(),
                            stored.profile,
                            stored.task_type,
                            stored.subtype,
                            stored.worker_id,
                            stored.created.timestamp_micros(),
                            stored.progress(),
                            stored.total_progress,
                            doc,
                        ],
                    )?
                } else {
                    conn.execute(
                        "UPDATE tasks SET version = ?1, state = ?2, profile = ?3, worker_id = ?4,
                                progress = ?5, total_progress = ?6, doc = ?7
                         WHERE id = ?8 AND version = ?9",
                        params![
                            stored.version as i64,
                            stored.state.as_str(),
                            stored.profile,
                            stored.worker_id,
                            stored.progress(),
                            stored.total_progress,
                            doc,
                            stored.id,
                            expected as i64,
                        ],
                    )?
                };
                Ok(changed == 1)
            })
            .await?;

        if written {
            info.version = expected + 1;
        } else {
            tracing::debug!("Conditional write of {} at version {} lost", info.id, expected);
        }
        Ok(written)
    }

    async fn erase(&self, info: &TaskInfo) -> Result<bool, StoreError> {
        let id = info.id.clone();
        let version = info.version as i64;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "DELETE FROM tasks WHERE id = ?1 AND version = ?2",
                params![id, version],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn get_for_profile(
        &self,
        profile: &str,
        queued: bool,
    ) -> Result<Option<TaskInfo>, StoreError> {
        let profile = profile.to_string();
        let state = if queued {
            TaskState::Queued
        } else {
            TaskState::Ready
        };
        self.with_conn(move |conn| {
            let docs = query_docs(
                conn,
                "SELECT doc FROM tasks WHERE profile = ?1 AND state = ?2
                 ORDER BY created, id LIMIT 1",
                params![profile, state.as_str()],
            )?;
            Ok(docs.into_iter().next())
        })
        .await
    }

    async fn get_for_worker(&self, worker_id: &str) -> Result<Option<TaskInfo>, StoreError> {
        let worker_id = worker_id.to_string();
        self.with_conn(move |conn| {
            let docs = query_docs(
                conn,
                "SELECT doc FROM tasks WHERE worker_id = ?1 AND state = ?2
                 ORDER BY created, id LIMIT 1",
                params![worker_id, TaskState::Running.as_str()],
            )?;
            Ok(docs.into_iter().next())
        })
        .await
    }

    async fn list_job(&self, job_id: &str) -> Result<Vec<TaskInfo>, StoreError> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            query_docs(
                conn,
                "SELECT doc FROM tasks WHERE job_id = ?1 ORDER BY id",
                params![job_id],
            )
        })
        .await
    }

    async fn list_in_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskInfo>, StoreError> {
        self.with_conn(move |conn| {
            query_docs(
                conn,
                "SELECT doc FROM tasks WHERE state = ?1 ORDER BY created, id LIMIT ?2",
                params![state.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
        })
        .await
    }

    async fn find_range(
        &self,
        index: SummaryIndex,
        start_key: &[String],
        end_key: &[String],
        limit: Option<usize>,
        group_level: usize,
    ) -> Result<Vec<SummaryResult>, StoreError> {
        // Bounds on the leading key component go to the index; the rest of
        // the range is checked while grouping.
        let lower = start_key.first().cloned();
        let upper = end_key.first().cloned();
        let rows = self
            .with_conn(move |conn| {
                let (column, subtype) = match index {
                    SummaryIndex::ByJob => ("job_id", "''"),
                    SummaryIndex::ByProfile => ("profile", "''"),
                    SummaryIndex::ByType => ("task_type", "subtype"),
                };
                let mut sql = format!(
                    "SELECT {column}, {subtype}, state, progress, total_progress FROM tasks WHERE 1 = 1"
                );
                let mut bounds = Vec::new();
                if let Some(lower) = lower {
                    bounds.push(lower);
                    sql.push_str(&format!(" AND {column} >= ?{}", bounds.len()));
                }
                if let Some(upper) = upper {
                    bounds.push(upper);
                    sql.push_str(&format!(" AND {column} <= ?{}", bounds.len()));
                }
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(bounds.iter()), |row| {
                        let first: String = row.get(0)?;
                        let subtype: String = row.get(1)?;
                        let state: String = row.get(2)?;
                        let key = match index {
                            SummaryIndex::ByType => vec![first, subtype, state],
                            _ => vec![first, state],
                        };
                        Ok(SummaryRow {
                            key,
                            progress: row.get(3)?,
                            total_progress: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(summarize(rows, start_key, end_key, limit, group_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_backend, node};

    #[tokio::test]
    async fn test_sqlite_backend_contract() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteTaskDb::new(dir.path().to_path_buf()).await.unwrap();
        assert!(db.is_persistent());
        exercise_backend(&db).await;
    }

    #[tokio::test]
    async fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = SqliteTaskDb::new(dir.path().to_path_buf()).await.unwrap();
            let mut info = node("j", "j", TaskState::Ready);
            info.cur_progress = 0.3;
            assert!(db.put(&mut info).await.unwrap());
        }
        let db = SqliteTaskDb::new(dir.path().to_path_buf()).await.unwrap();
        let info = db.get("j").await.unwrap().unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.state, TaskState::Ready);
        assert!((info.cur_progress - 0.3).abs() < 1e-12);
        assert_eq!(db.path(), dir.path().join("tasks.db"));
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SqliteTaskDb::new(dir.path().to_path_buf()).await.unwrap());
        let mut info = node("j", "j", TaskState::Ready);
        assert!(db.put(&mut info).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let db = db.clone();
            let mut copy = info.clone();
            handles.push(tokio::spawn(async move {
                copy.worker_id = Some(format!("w{}", i));
                db.put(&mut copy).await.unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(db.get("j").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_job_range_uses_job_index() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteTaskDb::new(dir.path().to_path_buf()).await.unwrap();
        for (id, job) in [("a", "a"), ("b", "b"), ("b_0", "b"), ("c", "c")] {
            let mut info = node(id, job, TaskState::Ready);
            assert!(db.put(&mut info).await.unwrap());
        }

        let key = vec!["b".to_string()];
        let summary = db
            .find_range(SummaryIndex::ByJob, &key, &key, None, 1)
            .await
            .unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].key, key);
        assert_eq!(summary[0].count, 2);

        let conn = db.conn.lock().await;
        let plan: Vec<String> = conn
            .prepare(
                "EXPLAIN QUERY PLAN SELECT job_id, '', state, progress, total_progress \
                 FROM tasks WHERE 1 = 1 AND job_id >= ?1 AND job_id <= ?2",
            )
            .unwrap()
            .query_map(params!["b", "b"], |row| row.get::<_, String>(3))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(plan.iter().any(|step| step.contains("idx_tasks_job")), "{:?}", plan);
    }
}
