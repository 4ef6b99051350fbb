use crate::models::ThreadEntry;
use crate::store::{NewThreadEntry, Store};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod crypto;

#[cfg(test)]
mod tests;

/// One file in a sync manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    pub wing_id: String,
}

/// Content-hash index of the memory directory, exchanged between machines
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub wing_id: String,
    pub created_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Add,
    Update,
}

/// An additive operation bringing the local tree toward the remote one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOp {
    pub kind: DiffKind,
    pub path: String,
    pub remote_sha256: String,
}

/// Conflict record written under `.conflicts` before an update overwrites
/// diverged local content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub path: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub timestamp: DateTime<Utc>,
    pub resolution: String,
}

/// Fetches remote file contents for [`SyncEngine::apply_diffs`]
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>>;
}

/// Outcome of one thread-entry merge
#[derive(Debug, Default)]
pub struct MergeReport {
    pub imported: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Additive file and thread synchronization between stores
///
/// Files only flow toward the local machine through `apply_diffs`; nothing
/// is ever deleted. Thread entries merge through the dedup triples so the
/// exchange is idempotent in both directions.
pub struct SyncEngine {
    store: Arc<Store>,
    memory_dir: PathBuf,
    wing_id: String,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, memory_dir: PathBuf, wing_id: String) -> Self {
        Self {
            store,
            memory_dir,
            wing_id,
        }
    }

    /// Builds the manifest over every markdown file in the memory
    /// directory, skipping the reserved `.conflicts` subdirectory.
    pub async fn build_manifest(&self) -> Result<Manifest> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.memory_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest {
                    wing_id: self.wing_id.clone(),
                    created_at: Utc::now(),
                    files,
                })
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if name == crate::constants::CONFLICTS_DIR {
                continue;
            }
            if path.extension().and_then(|e| e.to_str())
                != Some(crate::constants::MEMORY_FILE_EXTENSION)
            {
                continue;
            }

            let contents = tokio::fs::read(&path).await?;
            let metadata = entry.metadata().await?;
            let mod_time = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            files.push(ManifestFile {
                path: name,
                sha256: hex_sha256(&contents),
                size: contents.len() as u64,
                mod_time,
                wing_id: self.wing_id.clone(),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Manifest {
            wing_id: self.wing_id.clone(),
            created_at: Utc::now(),
            files,
        })
    }

    /// Additive-only diff: `add` for remote-only paths, `update` for hash
    /// mismatches. Local-only paths are never reported (never delete).
    pub fn diff_manifests(local: &Manifest, remote: &Manifest) -> Vec<DiffOp> {
        let mut ops = Vec::new();
        for remote_file in &remote.files {
            match local.files.iter().find(|f| f.path == remote_file.path) {
                None => ops.push(DiffOp {
                    kind: DiffKind::Add,
                    path: remote_file.path.clone(),
                    remote_sha256: remote_file.sha256.clone(),
                }),
                Some(local_file) if local_file.sha256 != remote_file.sha256 => {
                    ops.push(DiffOp {
                        kind: DiffKind::Update,
                        path: remote_file.path.clone(),
                        remote_sha256: remote_file.sha256.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        ops
    }

    /// Fetches and writes each diffed file. An update whose local content
    /// has diverged from both sides records a conflict entry first;
    /// resolution is always `remote_wins`.
    pub async fn apply_diffs(
        &self,
        diffs: &[DiffOp],
        fetcher: &dyn FileFetcher,
    ) -> Result<usize> {
        let mut applied = 0;
        for op in diffs {
            let incoming = fetcher.fetch(&op.path).await?;
            let target = self.memory_dir.join(&op.path);

            if op.kind == DiffKind::Update {
                if let Ok(existing) = tokio::fs::read(&target).await {
                    let local_hash = hex_sha256(&existing);
                    let remote_hash = hex_sha256(&incoming);
                    if local_hash != remote_hash {
                        self.record_conflict(&op.path, &local_hash, &remote_hash)
                            .await?;
                    }
                }
            }

            tokio::fs::create_dir_all(&self.memory_dir).await?;
            tokio::fs::write(&target, &incoming).await?;
            debug!("Applied {:?} for {}", op.kind, op.path);
            applied += 1;
        }
        if applied > 0 {
            info!("Applied {} file sync operation(s)", applied);
        }
        Ok(applied)
    }

    async fn record_conflict(
        &self,
        path: &str,
        local_hash: &str,
        remote_hash: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let record = ConflictRecord {
            path: path.to_string(),
            local_hash: local_hash.to_string(),
            remote_hash: remote_hash.to_string(),
            timestamp: now,
            resolution: "remote_wins".to_string(),
        };

        let conflicts_dir = self.memory_dir.join(crate::constants::CONFLICTS_DIR);
        tokio::fs::create_dir_all(&conflicts_dir).await?;
        let basename = PathBuf::from(path)
            .file_name()
            .and_then(|n| n.to_str().map(str::to_string))
            .unwrap_or_else(|| path.to_string());
        let conflict_path = conflicts_dir.join(format!(
            "{}_{basename}.json",
            now.format("%Y%m%dT%H%M%SZ")
        ));
        tokio::fs::write(&conflict_path, serde_json::to_vec_pretty(&record)?).await?;
        warn!(
            "Recorded sync conflict for {} ({} wins remote)",
            path, conflict_path.display()
        );
        Ok(())
    }

    /// Merges remote thread entries additively, preserving their original
    /// timestamps. Duplicates (by the identity or summary triple) are
    /// skipped; per-entry errors accumulate without aborting the merge.
    pub async fn merge_thread_entries(&self, mut remote: Vec<ThreadEntry>) -> MergeReport {
        remote.sort_by_key(|entry| entry.timestamp);

        let mut report = MergeReport::default();
        for entry in remote {
            let exists = match &entry.task_id {
                Some(task_id) => {
                    self.store
                        .exists_thread_by_identity(task_id, &entry.machine_id, entry.timestamp)
                        .await
                }
                None => {
                    self.store
                        .exists_thread_by_summary(
                            &entry.machine_id,
                            entry.timestamp,
                            &entry.summary,
                        )
                        .await
                }
            };

            match exists {
                Ok(true) => report.skipped += 1,
                Ok(false) => {
                    let result = self
                        .store
                        .append_thread_at(
                            NewThreadEntry {
                                machine_id: entry.machine_id.clone(),
                                task_id: entry.task_id.clone(),
                                agent: entry.agent.clone(),
                                skill: entry.skill.clone(),
                                user_input: entry.user_input.clone(),
                                summary: entry.summary.clone(),
                                tokens_used: entry.tokens_used,
                            },
                            entry.timestamp,
                        )
                        .await;
                    match result {
                        Ok(_) => report.imported += 1,
                        Err(e) => report.errors.push(format!(
                            "entry at {} from {}: {e}",
                            entry.timestamp, entry.machine_id
                        )),
                    }
                }
                Err(e) => report.errors.push(format!(
                    "dedup probe at {} from {}: {e}",
                    entry.timestamp, entry.machine_id
                )),
            }
        }

        info!(
            "Thread merge: {} imported, {} skipped, {} error(s)",
            report.imported,
            report.skipped,
            report.errors.len()
        );
        report
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
