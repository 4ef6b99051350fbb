use super::*;
use crate::thread;
use chrono::{Duration, TimeZone};
use std::collections::HashMap;
use tempfile::TempDir;

struct MapFetcher(HashMap<String, Vec<u8>>);

#[async_trait]
impl FileFetcher for MapFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>> {
        self.0
            .get(path)
            .cloned()
            .ok_or_else(|| crate::PerchError::Sync(format!("no content for {path}")))
    }
}

async fn engine_with(files: &[(&str, &str)], wing_id: &str) -> (TempDir, SyncEngine) {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        tokio::fs::write(dir.path().join(name), content).await.unwrap();
    }
    let store = Arc::new(Store::open_in_memory().unwrap());
    let engine = SyncEngine::new(store, dir.path().to_path_buf(), wing_id.to_string());
    (dir, engine)
}

#[tokio::test]
async fn manifest_lists_markdown_files_only() {
    let (dir, engine) = engine_with(
        &[("index.md", "index\n"), ("notes.md", "notes\n"), ("junk.txt", "x")],
        "mac",
    )
    .await;
    tokio::fs::create_dir_all(dir.path().join(".conflicts"))
        .await
        .unwrap();
    tokio::fs::write(dir.path().join(".conflicts/old.json"), "{}")
        .await
        .unwrap();

    let manifest = engine.build_manifest().await.unwrap();
    assert_eq!(manifest.wing_id, "mac");
    let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["index.md", "notes.md"]);
    assert!(manifest.files.iter().all(|f| f.sha256.len() == 64));
}

#[tokio::test]
async fn diff_is_additive_only() {
    let (_a_dir, a) = engine_with(
        &[("shared.md", "same\n"), ("local-only.md", "mine\n"), ("stale.md", "old\n")],
        "mac",
    )
    .await;
    let (_b_dir, b) = engine_with(
        &[("shared.md", "same\n"), ("remote-only.md", "theirs\n"), ("stale.md", "new\n")],
        "wsl",
    )
    .await;

    let local = a.build_manifest().await.unwrap();
    let remote = b.build_manifest().await.unwrap();
    let mut diffs = SyncEngine::diff_manifests(&local, &remote);
    diffs.sort_by(|x, y| x.path.cmp(&y.path));

    assert_eq!(diffs.len(), 2);
    assert_eq!(diffs[0].kind, DiffKind::Add);
    assert_eq!(diffs[0].path, "remote-only.md");
    assert_eq!(diffs[1].kind, DiffKind::Update);
    assert_eq!(diffs[1].path, "stale.md");
    // local-only.md is never reported: sync never deletes.
}

#[tokio::test]
async fn apply_diffs_converges_to_the_remote_set() {
    let (a_dir, a) = engine_with(&[("stale.md", "old\n")], "mac").await;
    let (_b_dir, b) = engine_with(
        &[("stale.md", "new\n"), ("fresh.md", "hello\n")],
        "wsl",
    )
    .await;

    let remote = b.build_manifest().await.unwrap();
    let diffs = SyncEngine::diff_manifests(&a.build_manifest().await.unwrap(), &remote);
    let fetcher = MapFetcher(
        [
            ("stale.md".to_string(), b"new\n".to_vec()),
            ("fresh.md".to_string(), b"hello\n".to_vec()),
        ]
        .into(),
    );
    assert_eq!(a.apply_diffs(&diffs, &fetcher).await.unwrap(), 2);

    // The diverged update left a conflict record behind.
    let mut conflict_files = Vec::new();
    let mut entries = tokio::fs::read_dir(a_dir.path().join(".conflicts"))
        .await
        .unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        conflict_files.push(entry.path());
    }
    assert_eq!(conflict_files.len(), 1);
    let record: ConflictRecord = serde_json::from_slice(
        &tokio::fs::read(&conflict_files[0]).await.unwrap(),
    )
    .unwrap();
    assert_eq!(record.path, "stale.md");
    assert_eq!(record.resolution, "remote_wins");
    assert_ne!(record.local_hash, record.remote_hash);

    // Rebuilding the local manifest now covers every remote file.
    let rebuilt = a.build_manifest().await.unwrap();
    for remote_file in &remote.files {
        let local_file = rebuilt
            .files
            .iter()
            .find(|f| f.path == remote_file.path)
            .unwrap();
        assert_eq!(local_file.sha256, remote_file.sha256);
    }

    // A second pass has nothing left to do.
    assert!(SyncEngine::diff_manifests(&rebuilt, &remote).is_empty());
}

#[tokio::test]
async fn manifest_round_trips_through_json() {
    let (_dir, engine) = engine_with(&[("index.md", "hi\n")], "mac").await;
    let manifest = engine.build_manifest().await.unwrap();

    let json = serde_json::to_string(&manifest).unwrap();
    assert!(json.contains("\"wing_id\":\"mac\""));
    let parsed: Manifest = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.files.len(), 1);
    assert_eq!(parsed.files[0].sha256, manifest.files[0].sha256);
}

fn remote_entry(
    machine: &str,
    timestamp: chrono::DateTime<Utc>,
    summary: &str,
) -> ThreadEntry {
    ThreadEntry {
        id: 999,
        timestamp,
        machine_id: machine.to_string(),
        task_id: None,
        agent: Some("mock".to_string()),
        skill: None,
        user_input: None,
        summary: summary.to_string(),
        tokens_used: None,
    }
}

#[tokio::test]
async fn cross_machine_merge_interleaves_and_dedups() {
    let (_dir, engine) = engine_with(&[], "mac").await;
    let today = Utc::now().date_naive();
    let noon = Utc.from_utc_datetime(&today.and_hms_opt(12, 0, 0).unwrap());

    // Local entries from "mac" at t-2h and t-30m.
    for (offset, summary) in [(120, "mac early"), (30, "mac late")] {
        engine
            .store
            .append_thread_at(
                NewThreadEntry {
                    machine_id: "mac".to_string(),
                    summary: summary.to_string(),
                    ..Default::default()
                },
                noon - Duration::minutes(offset),
            )
            .await
            .unwrap();
    }

    // Remote entries from "wsl" at t-90m and t-15m, deliberately unsorted.
    let remote = vec![
        remote_entry("wsl", noon - Duration::minutes(15), "wsl late"),
        remote_entry("wsl", noon - Duration::minutes(90), "wsl early"),
    ];

    let report = engine.merge_thread_entries(remote.clone()).await;
    assert_eq!(report.imported, 2);
    assert!(report.errors.is_empty());

    let entries = engine.store.list_thread_by_date(today).await.unwrap();
    let machines: Vec<_> = entries.iter().map(|e| e.machine_id.as_str()).collect();
    assert_eq!(machines, vec!["mac", "wsl", "mac", "wsl"]);
    // Original timestamps are preserved on the merged entries.
    assert_eq!(entries[1].timestamp, noon - Duration::minutes(90));

    // Every header carries its machine tag in the cross-machine rendering.
    let rendered = thread::render(&entries);
    assert!(rendered.contains(", mac]"));
    assert!(rendered.contains(", wsl]"));

    // Re-merging the same remote set imports nothing.
    let report = engine.merge_thread_entries(remote).await;
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped, 2);
}

#[tokio::test]
async fn merge_dedups_task_entries_by_identity_triple() {
    let (_dir, engine) = engine_with(&[], "mac").await;
    let ts = Utc::now();

    let mut entry = remote_entry("wsl", ts, "task work");
    entry.task_id = Some("t1".to_string());

    let report = engine.merge_thread_entries(vec![entry.clone()]).await;
    assert_eq!(report.imported, 1);

    // Same identity triple, different summary: still a duplicate.
    entry.summary = "task work (edited)".to_string();
    let report = engine.merge_thread_entries(vec![entry]).await;
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped, 1);
}
