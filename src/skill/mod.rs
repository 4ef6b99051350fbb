use crate::memory::split_front_matter;
use crate::{PerchError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// A named prompt template with front-matter controlling execution
///
/// Skills are stored as `<name>.md` under the skills directory: a mandatory
/// `---`-fenced front-matter block followed by the template body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub isolation: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub memory: Vec<String>,
    #[serde(default)]
    pub memory_write: bool,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_thread")]
    pub thread: bool,
    #[serde(skip)]
    pub body: String,
}

fn default_thread() -> bool {
    true
}

impl Skill {
    /// The execution timeout parsed from front-matter duration text.
    pub fn timeout_duration(&self) -> Result<Option<Duration>> {
        match &self.timeout {
            Some(text) => {
                let parsed = crate::directive::parse_duration(text).map_err(|e| {
                    PerchError::Skill(format!("invalid timeout {text:?}: {e}"))
                })?;
                Ok(Some(parsed))
            }
            None => Ok(None),
        }
    }
}

/// Loads and caches skill templates from a flat directory
pub struct SkillLoader {
    dir: PathBuf,
    cache: Mutex<HashMap<String, Arc<Skill>>>,
}

impl SkillLoader {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Loads a skill by name. Unlike memory documents, a missing or
    /// malformed skill is an error: the task that references it cannot run.
    pub async fn load(&self, name: &str) -> Result<Arc<Skill>> {
        {
            let cache = self.cache.lock().await;
            if let Some(skill) = cache.get(name) {
                return Ok(skill.clone());
            }
        }

        let path = self.dir.join(format!("{name}.md"));
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PerchError::Skill(format!("cannot read skill {name:?}: {e}"))
        })?;

        let (front_raw, body) = split_front_matter(&raw);
        let front_raw = front_raw.ok_or_else(|| {
            PerchError::Skill(format!("skill {name:?} is missing front-matter"))
        })?;

        let mut skill: Skill = serde_yaml::from_str(front_raw).map_err(|e| {
            PerchError::Skill(format!("skill {name:?} has invalid front-matter: {e}"))
        })?;
        skill.body = body.to_string();
        debug!("Loaded skill {:?} ({} byte body)", name, skill.body.len());

        let skill = Arc::new(skill);
        let mut cache = self.cache.lock().await;
        cache.insert(name.to_string(), skill.clone());
        Ok(skill)
    }
}

/// Values available to `{{namespace.key}}` markers during interpolation
#[derive(Debug, Clone, Default)]
pub struct InterpolationData {
    /// `memory.<name>` — bodies of the retrieved memory documents.
    pub memory: HashMap<String, String>,
    /// `identity.<field>` — stringified scalars of the identity front-matter.
    pub identity: HashMap<String, String>,
    /// `thread.summary` — the rendered recent-activity thread.
    pub thread: String,
    /// `task.what` — the task's free text.
    pub task: String,
}

/// Replaces `{{ns.key}}` markers in a skill body.
///
/// Missing memory documents and identity fields substitute an empty string
/// and add a warning. Unknown namespaces, and unrecognized keys in the
/// `thread`/`task` namespaces, pass through literally with no warning.
pub fn interpolate(body: &str, data: &InterpolationData) -> Result<(String, Vec<String>)> {
    let marker = Regex::new(r"\{\{(\w+)\.([\w.-]+)\}\}")
        .map_err(|e| PerchError::Internal(e.into()))?;

    let mut warnings = Vec::new();
    let rendered = marker.replace_all(body, |caps: &regex::Captures<'_>| {
        let namespace = &caps[1];
        let key = &caps[2];
        match namespace {
            "memory" => match data.memory.get(key) {
                Some(body) => body.clone(),
                None => {
                    warnings.push(format!("memory document {key:?} not loaded"));
                    String::new()
                }
            },
            "identity" => match data.identity.get(key) {
                Some(value) => value.clone(),
                None => {
                    warnings.push(format!("identity field {key:?} not set"));
                    String::new()
                }
            },
            "thread" if key == "summary" => data.thread.clone(),
            "task" if key == "what" => data.task.clone(),
            // Unknown namespace or unrecognized key: leave the marker as-is.
            _ => caps[0].to_string(),
        }
    });

    Ok((rendered.into_owned(), warnings))
}

/// Substitutes `$NAME` occurrences in mount specs from the variable map.
///
/// Names with no mapping stay literal.
pub fn resolve_vars(mounts: &[String], vars: &HashMap<String, String>) -> Result<Vec<String>> {
    let var = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|e| PerchError::Internal(e.into()))?;

    Ok(mounts
        .iter()
        .map(|mount| {
            var.replace_all(mount, |caps: &regex::Captures<'_>| {
                match vars.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
        })
        .collect())
}
