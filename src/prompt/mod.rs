use crate::config::Config;
use crate::constants::{
    DEFAULT_ISOLATION, DEFAULT_TIMEOUT_SECS, FALLBACK_CONTEXT_WINDOW, FORMAT_DOCS,
    PROMPT_OVERHEAD_MARGIN,
};
use crate::memory::{MemoryStore, IDENTITY_DOCUMENT};
use crate::models::{Task, TaskKind};
use crate::skill::{interpolate, resolve_vars, InterpolationData, Skill, SkillLoader};
use crate::store::Store;
use crate::thread::ThreadView;
use crate::{PerchError, Result};
use chrono::Utc;
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};


/// Everything dispatch needs to hand a task to its agent
#[derive(Debug, Clone)]
pub struct PromptResult {
    pub prompt: String,
    pub agent: String,
    pub isolation: String,
    pub mounts: Vec<String>,
    pub timeout: Duration,
    pub skill: Option<Arc<Skill>>,
    pub memory_loaded: Vec<String>,
    pub budget_used: i64,
    pub budget_total: i64,
    pub warnings: Vec<String>,
}

/// Assembles the final prompt for a task
///
/// Pulls the memory context, the skill template and the rendered thread
/// together under the agent's character budget. The thread renderer is
/// injected as a narrow capability so this module stays independent of the
/// engine.
pub struct PromptBuilder {
    store: Arc<Store>,
    memory: Arc<MemoryStore>,
    skills: Arc<SkillLoader>,
    thread_view: Arc<dyn ThreadView>,
    config: Arc<Config>,
}

impl PromptBuilder {
    pub fn new(
        store: Arc<Store>,
        memory: Arc<MemoryStore>,
        skills: Arc<SkillLoader>,
        thread_view: Arc<dyn ThreadView>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            memory,
            skills,
            thread_view,
            config,
        }
    }

    /// Builds the prompt for a stored task.
    ///
    /// `agent_override` is the caller-level (CLI) agent selection and wins
    /// over every other layer.
    pub async fn build(
        &self,
        task_id: &str,
        agent_override: Option<&str>,
    ) -> Result<PromptResult> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PerchError::NotFound(format!("task {task_id}")))?;

        // A skill task fails fast if its template cannot be loaded.
        let skill = match &task.kind {
            TaskKind::Skill(name) => Some(self.skills.load(name).await?),
            TaskKind::Prompt(_) => None,
        };

        let agent = self.resolve_agent(&task, skill.as_deref(), agent_override);
        let record = self.store.get_agent(&agent).await?;
        let (isolation, timeout) = self.resolve_isolation_timeout(
            &task,
            skill.as_deref(),
            record.as_ref().and_then(|r| r.default_isolation.as_deref()),
        )?;

        let context_window = record
            .map(|r| r.context_window)
            .unwrap_or(FALLBACK_CONTEXT_WINDOW);

        let base_text = match &skill {
            Some(skill) => skill.body.as_str(),
            None => task.kind.what(),
        };
        let mut budget = context_window
            - base_text.len() as i64
            - PROMPT_OVERHEAD_MARGIN
            - FORMAT_DOCS.len() as i64;

        // Memory dependencies: skill declarations, forced identity for
        // ad-hoc prompts, then the task's own list.
        let mut deps: Vec<String> = skill
            .as_ref()
            .map(|s| s.memory.clone())
            .unwrap_or_default();
        if matches!(task.kind, TaskKind::Prompt(_)) {
            deps.push(IDENTITY_DOCUMENT.to_string());
        }
        deps.extend(task.memory.iter().cloned());

        let retrieved = self.memory.retrieve(task.kind.what(), &deps).await?;
        let memory_loaded: Vec<String> =
            retrieved.iter().map(|(name, _)| name.clone()).collect();
        let memory_block = retrieved
            .iter()
            .map(|(_, body)| body.trim_end())
            .filter(|body| !body.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        budget -= memory_block.len() as i64;

        // A non-positive budget suppresses the thread section entirely.
        let render_thread = skill.as_ref().map(|s| s.thread).unwrap_or(true);
        let thread_str = if budget > 0 && render_thread {
            self.thread_view
                .render_for_date(&self.store, Utc::now().date_naive(), budget)
                .await?
        } else {
            String::new()
        };
        budget -= thread_str.len() as i64;

        let mut warnings = Vec::new();
        let task_prompt = match &skill {
            Some(skill) => {
                let data = InterpolationData {
                    memory: retrieved.into_iter().collect::<HashMap<_, _>>(),
                    identity: self.identity_fields().await?,
                    thread: thread_str.clone(),
                    task: task.kind.what().to_string(),
                };
                let (rendered, interp_warnings) = interpolate(&skill.body, &data)?;
                warnings.extend(interp_warnings);
                rendered
            }
            None => {
                if thread_str.is_empty() {
                    task.kind.what().to_string()
                } else {
                    format!("## Today So Far\n{thread_str}\n\n{}", task.kind.what())
                }
            }
        };
        for warning in &warnings {
            warn!("Prompt interpolation for task {}: {}", task.id, warning);
        }

        let prompt = [memory_block.as_str(), task_prompt.as_str(), FORMAT_DOCS]
            .iter()
            .filter(|section| !section.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n\n");

        let mounts = match &skill {
            Some(skill) => resolve_vars(&skill.mounts, &self.config.vars)?,
            None => Vec::new(),
        };

        debug!(
            "Built prompt for task {} ({} bytes, {} memory docs)",
            task.id,
            prompt.len(),
            memory_loaded.len()
        );

        Ok(PromptResult {
            budget_used: prompt.len() as i64,
            budget_total: context_window,
            prompt,
            agent,
            isolation,
            mounts,
            timeout,
            skill,
            memory_loaded,
            warnings,
        })
    }

    /// Resolves the executing agent with the weakest layer first: daemon
    /// default, the task's own agent, skill front-matter, caller override.
    fn resolve_agent(
        &self,
        task: &Task,
        skill: Option<&Skill>,
        agent_override: Option<&str>,
    ) -> String {
        let mut agent = if task.agent.is_empty() {
            self.config.default_agent.clone()
        } else {
            task.agent.clone()
        };
        if let Some(skill_agent) = skill.and_then(|s| s.agent.as_deref()) {
            agent = skill_agent.to_string();
        }
        if let Some(override_agent) = agent_override {
            agent = override_agent.to_string();
        }
        agent
    }

    /// Resolves isolation and timeout: defaults, then the agent record's
    /// default isolation, then skill front-matter, then the task's own
    /// inherited isolation.
    fn resolve_isolation_timeout(
        &self,
        task: &Task,
        skill: Option<&Skill>,
        record_isolation: Option<&str>,
    ) -> Result<(String, Duration)> {
        let mut isolation = DEFAULT_ISOLATION.to_string();
        if let Some(record_isolation) = record_isolation {
            isolation = record_isolation.to_string();
        }
        if let Some(skill_isolation) = skill.and_then(|s| s.isolation.as_deref()) {
            isolation = skill_isolation.to_string();
        }
        if !task.isolation.is_empty() && task.isolation != DEFAULT_ISOLATION {
            isolation = task.isolation.clone();
        }

        let mut timeout = Duration::from_secs(DEFAULT_TIMEOUT_SECS);
        if let Some(skill) = skill {
            if let Some(skill_timeout) = skill.timeout_duration()? {
                timeout = skill_timeout;
            }
        }
        Ok((isolation, timeout))
    }

    async fn identity_fields(&self) -> Result<HashMap<String, String>> {
        let doc = self.memory.load(IDENTITY_DOCUMENT).await?;
        let mut fields = HashMap::new();
        for (key, value) in &doc.front_matter {
            if let Some(key) = key.as_str() {
                let stringified = match value {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                };
                if let Some(stringified) = stringified {
                    fields.insert(key.to_string(), stringified);
                }
            }
        }
        Ok(fields)
    }
}
