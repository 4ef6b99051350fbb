use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Represents a unit of work owned by the timeline engine
///
/// Tasks are the fundamental unit of work in Perch. Each task names the
/// agent that will execute it, carries its own scheduling and retry state,
/// and moves through the lifecycle in [`TaskStatus`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub run_at: DateTime<Utc>,
    pub cron: Option<String>,
    pub depends_on: Vec<String>,
    pub agent: String,
    pub isolation: String,
    pub memory: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub parent_id: Option<String>,
    pub machine_id: Option<String>,
}

/// What a task asks its agent to do
///
/// A `Prompt` carries free text handed to the agent directly; a `Skill`
/// names a stored template that is loaded and interpolated at dispatch.
/// The store persists the variant as a `type` column plus a `what` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "what", rename_all = "lowercase")]
pub enum TaskKind {
    Prompt(String),
    Skill(String),
}

impl TaskKind {
    /// The free text or skill name, as stored in the `what` column.
    pub fn what(&self) -> &str {
        match self {
            TaskKind::Prompt(text) => text,
            TaskKind::Skill(name) => name,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self {
            TaskKind::Prompt(_) => "prompt",
            TaskKind::Skill(_) => "skill",
        }
    }

    pub fn from_parts(type_str: &str, what: String) -> Result<Self, String> {
        match type_str {
            "prompt" => Ok(TaskKind::Prompt(what)),
            "skill" => Ok(TaskKind::Skill(what)),
            other => Err(format!("Unknown task type: {other}")),
        }
    }
}

/// Current status of a task in the timeline
///
/// Transitions are `pending → running → {done, failed}`; the only other
/// permitted move is the startup recovery of a stale `running` task to
/// `failed` with error text "interrupted".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("Unknown task status: {other}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    /// Creates a new pending task for the given agent, eligible immediately.
    pub fn new(kind: TaskKind, agent: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            run_at: now,
            cron: None,
            depends_on: Vec::new(),
            agent: agent.into(),
            isolation: crate::constants::DEFAULT_ISOLATION.to_string(),
            memory: Vec::new(),
            retry_count: 0,
            max_retries: crate::constants::DEFAULT_MAX_RETRIES,
            status: TaskStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            parent_id: None,
            machine_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub fn with_memory(mut self, memory: Vec<String>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// One observable event in the dated activity thread
///
/// Appended after an agent run, or inserted by a sync merge with its
/// original timestamp preserved. Entries are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub machine_id: String,
    pub task_id: Option<String>,
    pub agent: Option<String>,
    pub skill: Option<String>,
    pub user_input: Option<String>,
    pub summary: String,
    pub tokens_used: Option<i64>,
}

/// An audit record appended at defined points of task dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: i64,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub event: LogEventKind,
    pub detail: Option<String>,
}

/// Closed set of audit event names the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEventKind {
    Started,
    PromptBuilt,
    OutputReceived,
    ParseWarning,
    MarkersParsed,
    ThreadAppended,
    Completed,
    Failed,
    ScheduleError,
    MemoryWriteError,
    CronError,
    CronScheduled,
    RetryScheduled,
    RetryError,
}

impl LogEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogEventKind::Started => "started",
            LogEventKind::PromptBuilt => "prompt_built",
            LogEventKind::OutputReceived => "output_received",
            LogEventKind::ParseWarning => "parse_warning",
            LogEventKind::MarkersParsed => "markers_parsed",
            LogEventKind::ThreadAppended => "thread_appended",
            LogEventKind::Completed => "completed",
            LogEventKind::Failed => "failed",
            LogEventKind::ScheduleError => "schedule_error",
            LogEventKind::MemoryWriteError => "memory_write_error",
            LogEventKind::CronError => "cron_error",
            LogEventKind::CronScheduled => "cron_scheduled",
            LogEventKind::RetryScheduled => "retry_scheduled",
            LogEventKind::RetryError => "retry_error",
        }
    }
}

impl FromStr for LogEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(LogEventKind::Started),
            "prompt_built" => Ok(LogEventKind::PromptBuilt),
            "output_received" => Ok(LogEventKind::OutputReceived),
            "parse_warning" => Ok(LogEventKind::ParseWarning),
            "markers_parsed" => Ok(LogEventKind::MarkersParsed),
            "thread_appended" => Ok(LogEventKind::ThreadAppended),
            "completed" => Ok(LogEventKind::Completed),
            "failed" => Ok(LogEventKind::Failed),
            "schedule_error" => Ok(LogEventKind::ScheduleError),
            "memory_write_error" => Ok(LogEventKind::MemoryWriteError),
            "cron_error" => Ok(LogEventKind::CronError),
            "cron_scheduled" => Ok(LogEventKind::CronScheduled),
            "retry_scheduled" => Ok(LogEventKind::RetryScheduled),
            "retry_error" => Ok(LogEventKind::RetryError),
            other => Err(format!("Unknown log event: {other}")),
        }
    }
}

impl fmt::Display for LogEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution profile of a registered agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub adapter: String,
    pub command: String,
    pub context_window: i64,
    pub default_isolation: Option<String>,
    pub healthy: bool,
    pub health_checked_at: Option<DateTime<Utc>>,
}
