use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// An exclusively-owned execution scratch area for one dispatch
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn path(&self) -> &Path;

    /// Releases the sandbox. Dispatch guarantees this runs on every exit
    /// path, success or failure.
    async fn teardown(self: Box<Self>) -> Result<()>;
}

/// Creates sandboxes at a named isolation level
///
/// Isolation tags (`standard`, `network`, `strict`, ...) are interpreted by
/// the concrete provider; unknown tags behave as `standard`.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, task_id: &str, isolation: &str) -> Result<Box<dyn Sandbox>>;
}

/// Per-task scratch directories under the data dir
///
/// The process-local provider: every dispatch gets a fresh directory that
/// teardown removes. Isolation tags are recorded but not enforced here;
/// enforcement belongs to providers that wrap real sandboxing.
pub struct ScratchDirProvider {
    root: PathBuf,
}

impl ScratchDirProvider {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl SandboxProvider for ScratchDirProvider {
    async fn create(&self, task_id: &str, isolation: &str) -> Result<Box<dyn Sandbox>> {
        let slug: String = task_id
            .chars()
            .take(30)
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect();
        let path = self
            .root
            .join(format!("{slug}_{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&path).await?;
        debug!(
            "Created sandbox {} for task {} (isolation {})",
            path.display(),
            task_id,
            isolation
        );
        Ok(Box::new(ScratchDir { path }))
    }
}

struct ScratchDir {
    path: PathBuf,
}

#[async_trait]
impl Sandbox for ScratchDir {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn teardown(self: Box<Self>) -> Result<()> {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!("Failed to remove sandbox {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_and_teardown_round_trip() {
        let root = TempDir::new().unwrap();
        let provider = ScratchDirProvider::new(root.path().to_path_buf());

        let sandbox = provider.create("task-1", "standard").await.unwrap();
        let path = sandbox.path().to_path_buf();
        assert!(path.exists());
        assert!(path.starts_with(root.path()));

        sandbox.teardown().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn sandboxes_are_unique_per_dispatch() {
        let root = TempDir::new().unwrap();
        let provider = ScratchDirProvider::new(root.path().to_path_buf());

        let a = provider.create("task", "standard").await.unwrap();
        let b = provider.create("task", "network").await.unwrap();
        assert_ne!(a.path(), b.path());

        a.teardown().await.unwrap();
        b.teardown().await.unwrap();
    }
}
