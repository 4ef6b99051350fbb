use crate::models::AgentRecord;
use crate::store::Store;
use crate::{PerchError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Captured output of one agent invocation
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub text: String,
    pub tokens_used: Option<i64>,
}

/// How an invocation failed; the engine maps each variant to its own
/// task-fatal error text
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("transport refused the call: {0}")]
    Refused(String),

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A black-box producer of text given a prompt
#[async_trait]
pub trait Agent: Send + Sync {
    /// Runs the prompt to completion within `timeout`, returning the whole
    /// captured output.
    async fn invoke(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> std::result::Result<AgentOutput, InvokeError>;

    /// Cheap liveness probe.
    async fn probe(&self) -> bool;
}

/// Runs the configured command with the prompt on stdin
///
/// stdout becomes the output text. A non-zero exit is a refused call; a
/// failure while collecting output is a stream interruption.
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| PerchError::Agent {
            message: "agent command is empty".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn invoke(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> std::result::Result<AgentOutput, InvokeError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InvokeError::Refused(format!("cannot spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A write failure means the child exited without reading stdin;
            // its exit status decides the outcome below.
            let _ = stdin.write_all(prompt.as_bytes()).await;
            // Close stdin so the child sees EOF.
            drop(stdin);
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(InvokeError::Stream(e.to_string())),
            Err(_) => return Err(InvokeError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InvokeError::Refused(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        Ok(AgentOutput {
            text: String::from_utf8_lossy(&output.stdout).into_owned(),
            tokens_used: None,
        })
    }

    async fn probe(&self) -> bool {
        match tokio::time::timeout(
            Duration::from_secs(5),
            Command::new(&self.program)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        {
            Ok(Ok(status)) => status.success(),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct HttpInvokeRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct HttpInvokeResponse {
    text: String,
    #[serde(default)]
    tokens_used: Option<i64>,
}

/// POSTs the prompt as JSON to the configured endpoint
pub struct HttpAgent {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Agent for HttpAgent {
    async fn invoke(
        &self,
        prompt: &str,
        timeout: Duration,
    ) -> std::result::Result<AgentOutput, InvokeError> {
        let send = self
            .client
            .post(&self.endpoint)
            .json(&HttpInvokeRequest { prompt })
            .timeout(timeout)
            .send();

        let response = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(InvokeError::Timeout(timeout)),
            Ok(Err(e)) => return Err(InvokeError::Refused(e.to_string())),
            Err(_) => return Err(InvokeError::Timeout(timeout)),
        };

        if !response.status().is_success() {
            return Err(InvokeError::Refused(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let body: HttpInvokeResponse = response
            .json()
            .await
            .map_err(|e| InvokeError::Stream(e.to_string()))?;
        Ok(AgentOutput {
            text: body.text,
            tokens_used: body.tokens_used,
        })
    }

    async fn probe(&self) -> bool {
        let health_url = format!("{}/health", self.endpoint.trim_end_matches('/'));
        match self
            .client
            .get(&health_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Short-TTL memoization of agent liveness probes
///
/// A cached verdict younger than the TTL is served as-is; otherwise the
/// probe runs, the agent record is updated, and the fresh verdict is cached.
pub struct HealthCache {
    ttl: Duration,
    inner: Mutex<HashMap<String, (bool, Instant)>>,
}

impl HealthCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, store: &Store, name: &str, agent: &dyn Agent) -> Result<bool> {
        {
            let cache = self.inner.lock().await;
            if let Some((healthy, checked_at)) = cache.get(name) {
                if checked_at.elapsed() < self.ttl {
                    return Ok(*healthy);
                }
            }
        }

        let healthy = agent.probe().await;
        store.update_agent_health(name, healthy, Utc::now()).await?;
        if !healthy {
            warn!("Agent {:?} failed its health probe", name);
        }

        let mut cache = self.inner.lock().await;
        cache.insert(name.to_string(), (healthy, Instant::now()));
        Ok(healthy)
    }
}

/// Resolves agent records to live transports
///
/// Adapter construction follows the record's `adapter` tag; explicitly
/// registered instances (used for in-process agents and tests) take
/// precedence over construction.
pub struct AgentRegistry {
    instances: Mutex<HashMap<String, Arc<dyn Agent>>>,
    health: HealthCache,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            health: HealthCache::new(Duration::from_secs(
                crate::constants::HEALTH_CACHE_TTL_SECS,
            )),
        }
    }

    /// Registers a concrete agent under a name, bypassing adapter lookup.
    pub async fn register(&self, name: &str, agent: Arc<dyn Agent>) {
        let mut instances = self.instances.lock().await;
        instances.insert(name.to_string(), agent);
    }

    pub async fn resolve(&self, record: &AgentRecord) -> Result<Arc<dyn Agent>> {
        {
            let instances = self.instances.lock().await;
            if let Some(agent) = instances.get(&record.name) {
                return Ok(agent.clone());
            }
        }

        let agent: Arc<dyn Agent> = match record.adapter.as_str() {
            "command" => Arc::new(CommandAgent::new(&record.command)?),
            "http" => Arc::new(HttpAgent::new(&record.command)),
            other => {
                return Err(PerchError::Agent {
                    message: format!(
                        "agent {:?} uses unknown adapter {other:?}",
                        record.name
                    ),
                })
            }
        };
        debug!("Built {} adapter for agent {:?}", record.adapter, record.name);

        let mut instances = self.instances.lock().await;
        instances.insert(record.name.clone(), agent.clone());
        Ok(agent)
    }

    /// Cached health gate for a resolved agent.
    pub async fn ensure_healthy(
        &self,
        store: &Store,
        record: &AgentRecord,
        agent: &dyn Agent,
    ) -> Result<bool> {
        self.health.check(store, &record.name, agent).await
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProbe {
        probes: AtomicUsize,
        healthy: bool,
    }

    #[async_trait]
    impl Agent for FlakyProbe {
        async fn invoke(
            &self,
            _prompt: &str,
            _timeout: Duration,
        ) -> std::result::Result<AgentOutput, InvokeError> {
            Ok(AgentOutput {
                text: "ok".to_string(),
                tokens_used: None,
            })
        }

        async fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy
        }
    }

    fn record(name: &str, adapter: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            adapter: adapter.to_string(),
            command: "mock-agent --flag".to_string(),
            context_window: 1000,
            default_isolation: None,
            healthy: true,
            health_checked_at: None,
        }
    }

    #[tokio::test]
    async fn health_cache_serves_fresh_probes_from_cache() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_agent(&record("mock", "command")).await.unwrap();
        let agent = FlakyProbe {
            probes: AtomicUsize::new(0),
            healthy: true,
        };
        let cache = HealthCache::new(Duration::from_secs(60));

        assert!(cache.check(&store, "mock", &agent).await.unwrap());
        assert!(cache.check(&store, "mock", &agent).await.unwrap());
        assert_eq!(agent.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_cache_reprobes_after_ttl() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_agent(&record("mock", "command")).await.unwrap();
        let agent = FlakyProbe {
            probes: AtomicUsize::new(0),
            healthy: false,
        };
        let cache = HealthCache::new(Duration::from_millis(0));

        assert!(!cache.check(&store, "mock", &agent).await.unwrap());
        assert!(!cache.check(&store, "mock", &agent).await.unwrap());
        assert_eq!(agent.probes.load(Ordering::SeqCst), 2);

        // The probe outcome lands on the agent record too.
        let loaded = store.get_agent("mock").await.unwrap().unwrap();
        assert!(!loaded.healthy);
        assert!(loaded.health_checked_at.is_some());
    }

    #[tokio::test]
    async fn registry_prefers_registered_instances() {
        let registry = AgentRegistry::new();
        registry
            .register(
                "mock",
                Arc::new(FlakyProbe {
                    probes: AtomicUsize::new(0),
                    healthy: true,
                }),
            )
            .await;

        let agent = registry.resolve(&record("mock", "command")).await.unwrap();
        let output = agent.invoke("hi", Duration::from_secs(1)).await.unwrap();
        assert_eq!(output.text, "ok");
    }

    #[tokio::test]
    async fn registry_rejects_unknown_adapters() {
        let registry = AgentRegistry::new();
        assert!(registry.resolve(&record("x", "carrier-pigeon")).await.is_err());
    }

    #[test]
    fn command_agent_splits_program_and_args() {
        let agent = CommandAgent::new("mock-agent --flag value").unwrap();
        assert_eq!(agent.program, "mock-agent");
        assert_eq!(agent.args, vec!["--flag", "value"]);

        assert!(CommandAgent::new("   ").is_err());
    }

    #[tokio::test]
    async fn command_agent_captures_stdout() {
        let agent = CommandAgent::new("cat").unwrap();
        let output = agent
            .invoke("hello prompt", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.text, "hello prompt");
    }

    #[tokio::test]
    async fn command_agent_nonzero_exit_is_refused() {
        let agent = CommandAgent::new("false").unwrap();
        let err = agent.invoke("hi", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Refused(_)));
    }

    #[tokio::test]
    async fn command_agent_times_out() {
        let agent = CommandAgent::new("sleep 5").unwrap();
        let err = agent
            .invoke("hi", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
    }
}
