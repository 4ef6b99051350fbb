use crate::config::Config;
use crate::models::{LogEvent, Task, TaskKind, TaskStatus};
use crate::store::Store;
use crate::thread;
use crate::{PerchError, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

#[cfg(test)]
mod tests;

const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{id}";
const ROUTE_TASK_RETRY: &str = "/tasks/{id}/retry";
const ROUTE_THREAD: &str = "/thread";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_STATUS: &str = "/status";
const ROUTE_LOG: &str = "/log/{task_id}";

/// Local control surface over a filesystem socket
///
/// The daemon listens on a Unix socket inside the data directory; there is
/// no network exposure and no authentication layer.
pub struct ApiServer {
    config: Arc<Config>,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    store: Arc<Store>,
    config: Arc<Config>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub what: String,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub agent: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub what: String,
    pub run_at: String,
    pub agent: String,
    pub isolation: String,
    pub status: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            task_type: task.kind.type_str().to_string(),
            what: task.kind.what().to_string(),
            run_at: format_ts(&task.run_at),
            agent: task.agent,
            isolation: task.isolation,
            status: task.status.as_str().to_string(),
            created_at: format_ts(&task.created_at),
            started_at: task.started_at.as_ref().map(format_ts),
            finished_at: task.finished_at.as_ref().map(format_ts),
            output: task.output,
            error: task.error,
            parent_id: task.parent_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentView {
    pub name: String,
    pub adapter: String,
    pub context_window: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_isolation: Option<String>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_checked_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub pending: usize,
    pub running: usize,
    pub agents: usize,
    pub tokens_today: i64,
    pub tokens_week: i64,
    pub done_today: usize,
    pub failed_today: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadResponse {
    pub thread: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogEventView {
    pub id: i64,
    pub timestamp: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<LogEvent> for LogEventView {
    fn from(event: LogEvent) -> Self {
        Self {
            id: event.id,
            timestamp: format_ts(&event.timestamp),
            event: event.event.as_str().to_string(),
            detail: event.detail,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadQueryParams {
    pub date: Option<String>,
    pub budget: Option<i64>,
}

type ApiResult<T> = std::result::Result<T, (StatusCode, Json<ErrorResponse>)>;

impl ApiServer {
    pub fn new(config: Arc<Config>, store: Arc<Store>) -> Self {
        Self {
            state: AppState {
                store,
                config: config.clone(),
            },
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let socket_path = self.config.socket_path();
        // A stale socket from a previous run blocks the bind.
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = tokio::net::UnixListener::bind(&socket_path)?;
        info!("Control surface listening on {}", socket_path.display());

        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| PerchError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route(ROUTE_TASKS, post(create_task).get(list_tasks))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_RETRY, post(retry_task))
            .route(ROUTE_THREAD, get(get_thread))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_STATUS, get(get_status))
            .route(ROUTE_LOG, get(get_log))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TaskView>)> {
    let agent = request
        .agent
        .unwrap_or_else(|| state.config.default_agent.clone());
    let kind = match request.task_type.as_deref().unwrap_or("prompt") {
        "prompt" => TaskKind::Prompt(request.what),
        "skill" => TaskKind::Skill(request.what),
        other => {
            return Err(bad_request(format!("unknown task type {other:?}")));
        }
    };

    let mut task = Task::new(kind, agent)
        .with_max_retries(state.config.default_max_retries);
    if let Some(run_at) = request.run_at {
        task = task.with_run_at(run_at);
    }
    task.machine_id = Some(state.config.machine_id.clone());

    state
        .store
        .create_task(&task)
        .await
        .map_err(error_response)?;
    info!("Task {} submitted via control surface", task.id);
    Ok((StatusCode::CREATED, Json(task.into())))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<Json<Vec<TaskView>>> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(TaskStatus::from_str(raw).map_err(bad_request)?),
        None => None,
    };
    let limit = params.limit.unwrap_or(crate::constants::DEFAULT_LIST_LIMIT);

    let tasks = state
        .store
        .list_recent(status, limit)
        .await
        .map_err(error_response)?;
    Ok(Json(tasks.into_iter().map(TaskView::from).collect()))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    let task = state
        .store
        .get_task(&id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(format!("task {id}")))?;
    Ok(Json(task.into()))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskView>> {
    state
        .store
        .get_task(&id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(format!("task {id}")))?;

    state
        .store
        .reset_for_retry(&id)
        .await
        .map_err(|e| match e {
            PerchError::TaskExecution { message, .. } => {
                (StatusCode::CONFLICT, Json(ErrorResponse { error: message }))
            }
            other => error_response(other),
        })?;

    let task = state
        .store
        .get_task(&id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| not_found(format!("task {id}")))?;
    Ok(Json(task.into()))
}

async fn get_thread(
    State(state): State<AppState>,
    Query(params): Query<ThreadQueryParams>,
) -> ApiResult<Json<ThreadResponse>> {
    let date = match params.date.as_deref() {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|e| bad_request(format!("invalid date {raw:?}: {e}")))?,
        None => Utc::now().date_naive(),
    };

    let entries = state
        .store
        .list_thread_by_date(date)
        .await
        .map_err(error_response)?;
    let rendered = thread::render_with_budget(&entries, params.budget.unwrap_or(0));
    Ok(Json(ThreadResponse { thread: rendered }))
}

async fn list_agents(State(state): State<AppState>) -> ApiResult<Json<Vec<AgentView>>> {
    let agents = state.store.list_agents().await.map_err(error_response)?;
    Ok(Json(
        agents
            .into_iter()
            .map(|agent| AgentView {
                name: agent.name,
                adapter: agent.adapter,
                context_window: agent.context_window,
                default_isolation: agent.default_isolation,
                healthy: agent.healthy,
                health_checked_at: agent.health_checked_at.as_ref().map(format_ts),
            })
            .collect(),
    ))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let now = Utc::now();
    let today = now.date_naive();
    let day_start = today
        .and_hms_opt(0, 0, 0)
        .map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
        .unwrap_or(now);
    let week_start = day_start - Duration::days(6);

    let pending = state
        .store
        .count_by_status(TaskStatus::Pending)
        .await
        .map_err(error_response)?;
    let running = state
        .store
        .count_by_status(TaskStatus::Running)
        .await
        .map_err(error_response)?;
    let agents = state.store.list_agents().await.map_err(error_response)?;
    let tokens_today = state
        .store
        .sum_tokens_by_range(day_start, now)
        .await
        .map_err(error_response)?;
    let tokens_week = state
        .store
        .sum_tokens_by_range(week_start, now)
        .await
        .map_err(error_response)?;
    let done_today = state
        .store
        .count_finished_since(TaskStatus::Done, day_start)
        .await
        .map_err(error_response)?;
    let failed_today = state
        .store
        .count_finished_since(TaskStatus::Failed, day_start)
        .await
        .map_err(error_response)?;

    Ok(Json(StatusResponse {
        pending,
        running,
        agents: agents.len(),
        tokens_today,
        tokens_week,
        done_today,
        failed_today,
    }))
}

async fn get_log(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Vec<LogEventView>>> {
    let events = state
        .store
        .list_log(&task_id)
        .await
        .map_err(error_response)?;
    Ok(Json(events.into_iter().map(LogEventView::from).collect()))
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn error_response(error: PerchError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        PerchError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn not_found(what: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Not found: {what}"),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}
