use crate::models::{AgentRecord, LogEvent, LogEventKind, Task, TaskKind, TaskStatus, ThreadEntry};
use crate::{PerchError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{info, warn};


// Schema version (increment when changing table definitions)
const SCHEMA_VERSION: i32 = 1;

/// Fields of a thread entry before the store assigns id and timestamp
#[derive(Debug, Clone, Default)]
pub struct NewThreadEntry {
    pub machine_id: String,
    pub task_id: Option<String>,
    pub agent: Option<String>,
    pub skill: Option<String>,
    pub user_input: Option<String>,
    pub summary: String,
    pub tokens_used: Option<i64>,
}

/// Durable record of tasks, thread entries, log events and the agent
/// registry
///
/// All access funnels through this API; the connection is serialized behind
/// an async mutex so the engine, the control surface and the sync engine can
/// share one handle within a single process. Cross-process concurrency is
/// not supported.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Startup recovery: any task stranded in `running` by a crash is moved
    /// to `failed` with error text "interrupted".
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let now = to_sql_ts(&Utc::now());
        let recovered = conn.execute(
            r#"
            UPDATE tasks
            SET status = 'failed', error = 'interrupted', finished_at = ?1
            WHERE status = 'running'
            "#,
            params![now],
        )?;
        if recovered > 0 {
            warn!("Recovered {} interrupted task(s) from previous run", recovered);
        }
        Ok(recovered)
    }

    // ---- tasks ----

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO tasks (
                id, type, what, run_at, cron, depends_on, agent, isolation,
                memory, retry_count, max_retries, status, created_at,
                started_at, finished_at, output, error, parent_id, machine_id
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                task.id,
                task.kind.type_str(),
                task.kind.what(),
                to_sql_ts(&task.run_at),
                task.cron,
                serde_json::to_string(&task.depends_on)?,
                task.agent,
                task.isolation,
                serde_json::to_string(&task.memory)?,
                task.retry_count,
                task.max_retries,
                task.status.as_str(),
                to_sql_ts(&task.created_at),
                task.started_at.as_ref().map(to_sql_ts),
                task.finished_at.as_ref().map(to_sql_ts),
                task.output,
                task.error,
                task.parent_id,
                task.machine_id,
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    /// Tasks eligible to run: pending, due, and with every dependency in
    /// terminal `done`. Ordered by `run_at` ascending.
    pub async fn list_ready(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE status = 'pending' AND run_at <= ?1
            ORDER BY run_at ASC
            "#
        ))?;
        let candidates = stmt
            .query_map(params![to_sql_ts(&now)], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Dependency gate: resolve statuses in one pass over the candidates.
        let mut status_cache: HashMap<String, Option<TaskStatus>> = HashMap::new();
        let mut ready = Vec::new();
        'candidates: for task in candidates {
            for dep in &task.depends_on {
                let status = match status_cache.get(dep) {
                    Some(status) => *status,
                    None => {
                        let status = conn
                            .query_row(
                                "SELECT status FROM tasks WHERE id = ?1",
                                params![dep],
                                |row| row.get::<_, String>(0),
                            )
                            .optional()?
                            .and_then(|s| TaskStatus::from_str(&s).ok());
                        status_cache.insert(dep.clone(), status);
                        status
                    }
                };
                if status != Some(TaskStatus::Done) {
                    continue 'candidates;
                }
            }
            ready.push(task);
        }
        Ok(ready)
    }

    pub async fn list_recent(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE status = ?1
                    ORDER BY created_at DESC
                    LIMIT ?2
                    "#
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit as i64], row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    ORDER BY created_at DESC
                    LIMIT ?1
                    "#
                ))?;
                let rows = stmt.query_map(params![limit as i64], row_to_task)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(tasks)
    }

    pub async fn list_by_parent(&self, parent_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE parent_id = ?1
            ORDER BY created_at ASC
            "#
        ))?;
        let tasks = stmt
            .query_map(params![parent_id], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub async fn list_recurring(&self) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks
            WHERE cron IS NOT NULL AND cron != ''
            ORDER BY created_at ASC
            "#
        ))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Transitions task status, stamping `started_at` on entry to `running`
    /// and `finished_at` on entry to a terminal state.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = to_sql_ts(&Utc::now());
        let changed = match status {
            TaskStatus::Running => conn.execute(
                "UPDATE tasks SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?,
            TaskStatus::Done | TaskStatus::Failed => conn.execute(
                "UPDATE tasks SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?,
            TaskStatus::Pending => conn.execute(
                "UPDATE tasks SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?,
        };
        if changed == 0 {
            return Err(PerchError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub async fn set_output(&self, id: &str, output: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET output = ?1 WHERE id = ?2",
            params![output, id],
        )?;
        Ok(())
    }

    /// Records the failure reason and transitions the task to `failed`.
    pub async fn set_error(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE tasks
            SET error = ?1, status = 'failed', finished_at = ?2
            WHERE id = ?3
            "#,
            params![error, to_sql_ts(&Utc::now()), id],
        )?;
        Ok(())
    }

    pub async fn increment_retry_count(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET retry_count = retry_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Resets a failed task in place: pending, due now, error and run
    /// timestamps cleared. Only valid from `failed`.
    pub async fn reset_for_retry(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE tasks
            SET status = 'pending', run_at = ?1, error = NULL,
                started_at = NULL, finished_at = NULL
            WHERE id = ?2 AND status = 'failed'
            "#,
            params![to_sql_ts(&Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(PerchError::TaskExecution {
                task_id: id.to_string(),
                message: "retry is only permitted from the failed state".to_string(),
            });
        }
        Ok(())
    }

    // ---- log events ----

    pub async fn append_log(
        &self,
        task_id: &str,
        event: LogEventKind,
        detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO log_events (task_id, timestamp, event, detail)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![task_id, to_sql_ts(&Utc::now()), event.as_str(), detail],
        )?;
        Ok(())
    }

    pub async fn list_log(&self, task_id: &str) -> Result<Vec<LogEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, task_id, timestamp, event, detail
            FROM log_events
            WHERE task_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let events = stmt
            .query_map(params![task_id], |row| {
                Ok(LogEvent {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    timestamp: from_sql_ts(&row.get::<_, String>(2)?)?,
                    event: parse_event(&row.get::<_, String>(3)?)?,
                    detail: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ---- thread entries ----

    /// Appends a thread entry stamped with the current instant.
    pub async fn append_thread(&self, entry: NewThreadEntry) -> Result<ThreadEntry> {
        self.append_thread_at(entry, Utc::now()).await
    }

    /// Appends a thread entry with an explicit timestamp (sync merge path).
    pub async fn append_thread_at(
        &self,
        entry: NewThreadEntry,
        timestamp: DateTime<Utc>,
    ) -> Result<ThreadEntry> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO thread_entries (
                timestamp, machine_id, task_id, agent, skill, user_input,
                summary, tokens_used
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                to_sql_ts(&timestamp),
                entry.machine_id,
                entry.task_id,
                entry.agent,
                entry.skill,
                entry.user_input,
                entry.summary,
                entry.tokens_used,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(ThreadEntry {
            id,
            timestamp,
            machine_id: entry.machine_id,
            task_id: entry.task_id,
            agent: entry.agent,
            skill: entry.skill,
            user_input: entry.user_input,
            summary: entry.summary,
            tokens_used: entry.tokens_used,
        })
    }

    /// Dedup probe for merged entries that reference a task.
    pub async fn exists_thread_by_identity(
        &self,
        task_id: &str,
        machine_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM thread_entries
            WHERE task_id = ?1 AND machine_id = ?2 AND timestamp = ?3
            "#,
            params![task_id, machine_id, to_sql_ts(&timestamp)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Dedup probe for merged entries without a task reference.
    pub async fn exists_thread_by_summary(
        &self,
        machine_id: &str,
        timestamp: DateTime<Utc>,
        summary: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM thread_entries
            WHERE machine_id = ?1 AND timestamp = ?2 AND summary = ?3
            "#,
            params![machine_id, to_sql_ts(&timestamp), summary],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn list_thread_by_date(&self, date: NaiveDate) -> Result<Vec<ThreadEntry>> {
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).ok_or_else(|| {
            PerchError::Internal(anyhow::anyhow!("invalid date {date}"))
        })?);
        let end = start + chrono::Duration::days(1);

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, machine_id, task_id, agent, skill,
                   user_input, summary, tokens_used
            FROM thread_entries
            WHERE timestamp >= ?1 AND timestamp < ?2
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;
        let entries = stmt
            .query_map(params![to_sql_ts(&start), to_sql_ts(&end)], row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub async fn sum_tokens_by_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let total: i64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(tokens_used), 0) FROM thread_entries
            WHERE timestamp >= ?1 AND timestamp < ?2
            "#,
            params![to_sql_ts(&from), to_sql_ts(&to)],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    // ---- counters ----

    pub async fn count_by_status(&self, status: TaskStatus) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub async fn count_finished_since(
        &self,
        status: TaskStatus,
        since: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM tasks
            WHERE status = ?1 AND finished_at >= ?2
            "#,
            params![status.as_str(), to_sql_ts(&since)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ---- agent registry ----

    pub async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO agents (
                name, adapter, command, context_window, default_isolation,
                healthy, health_checked_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(name) DO UPDATE SET
                adapter = ?2,
                command = ?3,
                context_window = ?4,
                default_isolation = ?5
            "#,
            params![
                agent.name,
                agent.adapter,
                agent.command,
                agent.context_window,
                agent.default_isolation,
                agent.healthy,
                agent.health_checked_at.as_ref().map(to_sql_ts),
            ],
        )?;
        Ok(())
    }

    pub async fn get_agent(&self, name: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn.lock().await;
        let agent = conn
            .query_row(
                r#"
                SELECT name, adapter, command, context_window,
                       default_isolation, healthy, health_checked_at
                FROM agents
                WHERE name = ?1
                "#,
                params![name],
                row_to_agent,
            )
            .optional()?;
        Ok(agent)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT name, adapter, command, context_window,
                   default_isolation, healthy, health_checked_at
            FROM agents
            ORDER BY name ASC
            "#,
        )?;
        let agents = stmt
            .query_map([], row_to_agent)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    pub async fn update_agent_health(
        &self,
        name: &str,
        healthy: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            UPDATE agents SET healthy = ?1, health_checked_at = ?2
            WHERE name = ?3
            "#,
            params![healthy, to_sql_ts(&checked_at), name],
        )?;
        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, type, what, run_at, cron, depends_on, agent, \
     isolation, memory, retry_count, max_retries, status, created_at, \
     started_at, finished_at, output, error, parent_id, machine_id";

fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current_version != 0 && current_version != SCHEMA_VERSION {
        return Err(PerchError::ConfigurationError(format!(
            "store schema version {current_version} is not supported (expected {SCHEMA_VERSION})"
        )));
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            what TEXT NOT NULL,
            run_at TEXT NOT NULL,
            cron TEXT,
            depends_on TEXT NOT NULL DEFAULT '[]',
            agent TEXT NOT NULL,
            isolation TEXT NOT NULL,
            memory TEXT NOT NULL DEFAULT '[]',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            output TEXT,
            error TEXT,
            parent_id TEXT,
            machine_id TEXT
        );

        CREATE TABLE IF NOT EXISTS thread_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            machine_id TEXT NOT NULL,
            task_id TEXT,
            agent TEXT,
            skill TEXT,
            user_input TEXT,
            summary TEXT NOT NULL,
            tokens_used INTEGER
        );

        CREATE TABLE IF NOT EXISTS log_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event TEXT NOT NULL,
            detail TEXT
        );

        CREATE TABLE IF NOT EXISTS agents (
            name TEXT PRIMARY KEY,
            adapter TEXT NOT NULL,
            command TEXT NOT NULL,
            context_window INTEGER NOT NULL,
            default_isolation TEXT,
            healthy INTEGER NOT NULL DEFAULT 1,
            health_checked_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_status_run_at ON tasks(status, run_at);
        CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
        CREATE INDEX IF NOT EXISTS idx_thread_ts ON thread_entries(timestamp);
        CREATE INDEX IF NOT EXISTS idx_log_task ON log_events(task_id);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
    info!("Store schema ready (version {})", SCHEMA_VERSION);
    Ok(())
}

// Timestamps are stored as fixed-width RFC3339 UTC text so that string
// comparison in SQL matches chronological order.
fn to_sql_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_sql_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_event(raw: &str) -> rusqlite::Result<LogEventKind> {
    LogEventKind::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

fn parse_json_list(raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let type_str: String = row.get(1)?;
    let what: String = row.get(2)?;
    let kind = TaskKind::from_parts(&type_str, what).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    let status_str: String = row.get(11)?;
    let status = TaskStatus::from_str(&status_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, e.into())
    })?;

    Ok(Task {
        id: row.get(0)?,
        kind,
        run_at: from_sql_ts(&row.get::<_, String>(3)?)?,
        cron: row.get(4)?,
        depends_on: parse_json_list(&row.get::<_, String>(5)?)?,
        agent: row.get(6)?,
        isolation: row.get(7)?,
        memory: parse_json_list(&row.get::<_, String>(8)?)?,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        status,
        created_at: from_sql_ts(&row.get::<_, String>(12)?)?,
        started_at: row
            .get::<_, Option<String>>(13)?
            .map(|s| from_sql_ts(&s))
            .transpose()?,
        finished_at: row
            .get::<_, Option<String>>(14)?
            .map(|s| from_sql_ts(&s))
            .transpose()?,
        output: row.get(15)?,
        error: row.get(16)?,
        parent_id: row.get(17)?,
        machine_id: row.get(18)?,
    })
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ThreadEntry> {
    Ok(ThreadEntry {
        id: row.get(0)?,
        timestamp: from_sql_ts(&row.get::<_, String>(1)?)?,
        machine_id: row.get(2)?,
        task_id: row.get(3)?,
        agent: row.get(4)?,
        skill: row.get(5)?,
        user_input: row.get(6)?,
        summary: row.get(7)?,
        tokens_used: row.get(8)?,
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        name: row.get(0)?,
        adapter: row.get(1)?,
        command: row.get(2)?,
        context_window: row.get(3)?,
        default_isolation: row.get(4)?,
        healthy: row.get(5)?,
        health_checked_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| from_sql_ts(&s))
            .transpose()?,
    })
}
