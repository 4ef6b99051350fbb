use crate::agent::{AgentRegistry, InvokeError};
use crate::config::Config;
use crate::cron::CronExpr;
use crate::directive::{DirectiveParser, RunSpec};
use crate::memory::MemoryStore;
use crate::models::{LogEventKind, Task, TaskKind, TaskStatus};
use crate::prompt::{PromptBuilder, PromptResult};
use crate::sandbox::SandboxProvider;
use crate::store::{NewThreadEntry, Store};
use crate::{PerchError, Result};
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};


/// Exponential retry backoff: doubling seconds, capped at five minutes.
pub fn retry_backoff(retry_count: u32) -> Duration {
    let secs = 1u64
        .checked_shl(retry_count)
        .unwrap_or(u64::MAX)
        .min(crate::constants::RETRY_BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

// First `max` bytes of the text, clamped back to a char boundary.
fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// The polling timeline scheduler
///
/// Each tick claims at most one ready task, runs the full dispatch pipeline
/// against it, and returns to polling. Every state transition is durable
/// before the next step begins, so a crash at any point is recoverable.
pub struct Engine {
    store: Arc<Store>,
    builder: PromptBuilder,
    registry: Arc<AgentRegistry>,
    sandboxes: Arc<dyn SandboxProvider>,
    memory: Arc<MemoryStore>,
    parser: DirectiveParser,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(
        store: Arc<Store>,
        builder: PromptBuilder,
        registry: Arc<AgentRegistry>,
        sandboxes: Arc<dyn SandboxProvider>,
        memory: Arc<MemoryStore>,
        config: Arc<Config>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            builder,
            registry,
            sandboxes,
            memory,
            parser: DirectiveParser::new()?,
            config,
        })
    }

    /// Runs the poll loop until the shutdown signal flips.
    ///
    /// The in-flight task, if any, drains before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll_interval = self.config.poll_duration()?;
        info!(
            "Timeline engine started (poll interval {:?}, machine {})",
            poll_interval, self.config.machine_id
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Timeline engine shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!("Poll tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// One poll tick: claim and run the oldest ready task, if any.
    ///
    /// Returns the id of the task it processed. Dispatch failures are
    /// recorded on the task (with a retry child when retries remain) and do
    /// not surface here; only store-level faults do.
    pub async fn tick(&self) -> Result<Option<String>> {
        let now = Utc::now();
        let ready = self.store.list_ready(now).await?;
        let Some(task) = ready.into_iter().next() else {
            return Ok(None);
        };

        self.store
            .update_status(&task.id, TaskStatus::Running)
            .await?;
        self.store
            .append_log(&task.id, LogEventKind::Started, None)
            .await?;
        debug!("Dispatching task {} ({})", task.id, task.kind.type_str());

        if let Err(e) = self.dispatch(&task).await {
            let message = e.to_string();
            warn!("Task {} failed: {}", task.id, message);
            self.store.set_error(&task.id, &message).await?;
            self.store
                .append_log(&task.id, LogEventKind::Failed, Some(&message))
                .await?;
            if task.retry_count < task.max_retries {
                self.schedule_retry(&task).await;
            }
        }

        Ok(Some(task.id))
    }

    /// The dispatch pipeline. A returned error is task-fatal; side-effect
    /// faults (follow-ups, memory writes, cron) are logged and swallowed.
    async fn dispatch(&self, task: &Task) -> Result<()> {
        // Gate the agent the task names before spending any further work.
        let agent_impl = self.gated_agent(&task.agent).await?;

        let built = self.builder.build(&task.id, None).await?;
        self.store
            .append_log(&task.id, LogEventKind::PromptBuilt, Some(&built.prompt))
            .await?;

        // A skill may have re-routed execution to a different agent.
        let agent_impl = if built.agent == task.agent {
            agent_impl
        } else {
            self.gated_agent(&built.agent).await?
        };

        let sandbox = self
            .sandboxes
            .create(&task.id, &built.isolation)
            .await
            .map_err(|e| PerchError::TaskExecution {
                task_id: task.id.clone(),
                message: format!("sandbox setup failed: {e}"),
            })?;

        let invoked = agent_impl.invoke(&built.prompt, built.timeout).await;

        // Teardown happens on every path before the outcome is inspected.
        if let Err(e) = sandbox.teardown().await {
            warn!("Sandbox teardown for task {} failed: {}", task.id, e);
        }

        let output = match invoked {
            Ok(output) => output,
            Err(InvokeError::Timeout(limit)) => {
                return Err(PerchError::Timeout {
                    message: format!("agent {:?} timed out after {limit:?}", built.agent),
                })
            }
            Err(e @ InvokeError::Refused(_)) => {
                return Err(PerchError::Agent {
                    message: e.to_string(),
                })
            }
            Err(e @ InvokeError::Stream(_)) => {
                return Err(PerchError::TaskExecution {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                })
            }
        };
        if output.text.is_empty() {
            return Err(PerchError::TaskExecution {
                task_id: task.id.clone(),
                message: "empty output".to_string(),
            });
        }

        self.store
            .append_log(
                &task.id,
                LogEventKind::OutputReceived,
                Some(&format!("{} bytes", output.text.len())),
            )
            .await?;
        self.store.set_output(&task.id, &output.text).await?;

        let bundle = self.parser.parse(&output.text);
        for warning in &bundle.warnings {
            self.store
                .append_log(&task.id, LogEventKind::ParseWarning, Some(warning))
                .await?;
        }
        self.store
            .append_log(
                &task.id,
                LogEventKind::MarkersParsed,
                Some(&format!(
                    "{} schedule, {} memory",
                    bundle.schedules.len(),
                    bundle.memory_writes.len()
                )),
            )
            .await?;

        // Follow-up schedule directives become child tasks; failures here
        // never fail the parent.
        for intent in &bundle.schedules {
            let now = Utc::now();
            let run_at = match &intent.run {
                RunSpec::Delay(delay) => {
                    now + chrono::Duration::from_std(*delay)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                }
                RunSpec::At(at) => *at,
            };
            let mut child = Task::new(TaskKind::Prompt(intent.content.clone()), &built.agent)
                .with_id(format!("{}-f{}", task.id, run_at.timestamp_millis()))
                .with_run_at(run_at)
                .with_parent(&task.id)
                .with_memory(intent.memory.clone())
                .with_max_retries(self.config.default_max_retries);
            child.isolation = built.isolation.clone();
            child.machine_id = Some(self.config.machine_id.clone());
            if let Some(after) = &intent.after {
                child.depends_on = vec![after.clone()];
            }
            if let Err(e) = self.store.create_task(&child).await {
                self.store
                    .append_log(
                        &task.id,
                        LogEventKind::ScheduleError,
                        Some(&e.to_string()),
                    )
                    .await?;
            } else {
                debug!("Scheduled follow-up {} at {}", child.id, run_at);
            }
        }

        // Memory writes require an explicitly opted-in skill.
        let memory_write_allowed = built
            .skill
            .as_ref()
            .map(|skill| skill.memory_write)
            .unwrap_or(false);
        if memory_write_allowed {
            for intent in &bundle.memory_writes {
                if let Err(e) = self.memory.write(&intent.file, &intent.content).await {
                    self.store
                        .append_log(
                            &task.id,
                            LogEventKind::MemoryWriteError,
                            Some(&format!("{}: {e}", intent.file)),
                        )
                        .await?;
                }
            }
        } else if !bundle.memory_writes.is_empty() {
            debug!(
                "Task {} produced {} memory directive(s) without write permission",
                task.id,
                bundle.memory_writes.len()
            );
        }

        // Summaries come from the stripped text; an output that is all
        // directives falls back to the raw text so the entry keeps one.
        let stripped = self.parser.strip(&output.text);
        let summary_source = if stripped.trim().is_empty() {
            output.text.as_str()
        } else {
            stripped.trim()
        };
        let summary =
            truncate_bytes(summary_source, crate::constants::SUMMARY_MAX_BYTES).to_string();
        self.store
            .append_thread(NewThreadEntry {
                machine_id: self.config.machine_id.clone(),
                task_id: Some(task.id.clone()),
                agent: Some(built.agent.clone()),
                skill: built.skill.as_ref().map(|s| s.name.clone()),
                user_input: None,
                summary,
                tokens_used: output.tokens_used,
            })
            .await?;
        self.store
            .append_log(&task.id, LogEventKind::ThreadAppended, None)
            .await?;

        self.store
            .update_status(&task.id, TaskStatus::Done)
            .await?;
        self.store
            .append_log(&task.id, LogEventKind::Completed, None)
            .await?;
        info!("Task {} completed", task.id);

        if let Some(cron) = task.cron.as_deref().filter(|c| !c.is_empty()) {
            self.schedule_recurrence(task, cron, &built).await?;
        }

        Ok(())
    }

    /// Looks up an agent record and health-gates it through the cache.
    async fn gated_agent(&self, name: &str) -> Result<Arc<dyn crate::agent::Agent>> {
        let record = self
            .store
            .get_agent(name)
            .await?
            .ok_or_else(|| PerchError::Agent {
                message: format!("agent {name:?} not found"),
            })?;
        let agent = self.registry.resolve(&record).await?;
        let healthy = self
            .registry
            .ensure_healthy(&self.store, &record, agent.as_ref())
            .await?;
        if !healthy {
            return Err(PerchError::Agent {
                message: format!("agent {name:?} unhealthy"),
            });
        }
        Ok(agent)
    }

    /// Schedules the next cron occurrence as a sibling child task.
    async fn schedule_recurrence(
        &self,
        task: &Task,
        cron: &str,
        built: &PromptResult,
    ) -> Result<()> {
        let now = Utc::now();
        let next = match CronExpr::parse(cron) {
            Ok(expr) => match expr.next(now) {
                Some(next) => next,
                None => {
                    self.store
                        .append_log(
                            &task.id,
                            LogEventKind::CronError,
                            Some(&format!("no matching instant for {cron:?} within horizon")),
                        )
                        .await?;
                    return Ok(());
                }
            },
            Err(e) => {
                self.store
                    .append_log(&task.id, LogEventKind::CronError, Some(&e.to_string()))
                    .await?;
                return Ok(());
            }
        };

        let mut child = Task::new(task.kind.clone(), &task.agent)
            .with_run_at(next)
            .with_parent(&task.id)
            .with_cron(cron)
            .with_memory(task.memory.clone())
            .with_max_retries(task.max_retries);
        child.isolation = built.isolation.clone();
        child.machine_id = Some(self.config.machine_id.clone());

        match self.store.create_task(&child).await {
            Ok(()) => {
                self.store
                    .append_log(
                        &task.id,
                        LogEventKind::CronScheduled,
                        Some(&format!(
                            "next run: {} (task {})",
                            next.to_rfc3339_opts(SecondsFormat::Secs, true),
                            child.id
                        )),
                    )
                    .await?;
            }
            Err(e) => {
                self.store
                    .append_log(&task.id, LogEventKind::CronError, Some(&e.to_string()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Creates the retry child after a failure. Never fails the caller.
    async fn schedule_retry(&self, task: &Task) {
        let attempt = task.retry_count + 1;
        let backoff = retry_backoff(task.retry_count);
        let run_at = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());

        let mut child = Task::new(task.kind.clone(), &task.agent)
            .with_id(format!("{}-r{attempt}", task.id))
            .with_run_at(run_at)
            .with_parent(&task.id)
            .with_memory(task.memory.clone())
            .with_max_retries(task.max_retries);
        child.retry_count = attempt;
        child.isolation = task.isolation.clone();
        child.cron = task.cron.clone();
        child.machine_id = Some(self.config.machine_id.clone());

        match self.store.create_task(&child).await {
            Ok(()) => {
                let detail = format!(
                    "retry {attempt}/{} in {}s",
                    task.max_retries,
                    backoff.as_secs()
                );
                if let Err(e) = self
                    .store
                    .append_log(&task.id, LogEventKind::RetryScheduled, Some(&detail))
                    .await
                {
                    warn!("Cannot record retry of task {}: {}", task.id, e);
                }
            }
            Err(e) => {
                warn!("Cannot create retry child for task {}: {}", task.id, e);
                if let Err(e) = self
                    .store
                    .append_log(&task.id, LogEventKind::RetryError, Some(&e.to_string()))
                    .await
                {
                    warn!("Cannot record retry error for task {}: {}", task.id, e);
                }
            }
        }
    }
}
