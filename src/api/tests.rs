use super::*;
use crate::models::AgentRecord;
use crate::store::NewThreadEntry;
use axum::body::{to_bytes, Body};
use axum::http::Request;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn fixture() -> (Arc<Store>, Router) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let config = Arc::new(Config {
        dir: std::path::PathBuf::from("/tmp/perch-api-test"),
        default_agent: "mock".to_string(),
        machine_id: "mac".to_string(),
        poll_interval: "1s".to_string(),
        default_max_retries: 1,
        vars: Default::default(),
        agents: Vec::new(),
    });
    let router = ApiServer::new(config, store.clone()).build_router();
    (store, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_task_defaults_to_prompt_and_default_agent() {
    let (store, router) = fixture().await;

    let (status, body) = send(&router, post_json("/tasks", json!({"what": "deploy"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["type"], "prompt");
    assert_eq!(body["what"], "deploy");
    assert_eq!(body["agent"], "mock");
    assert_eq!(body["status"], "pending");

    let id = body["id"].as_str().unwrap();
    let stored = store.get_task(id).await.unwrap().unwrap();
    assert_eq!(stored.max_retries, 1);
    assert_eq!(stored.machine_id.as_deref(), Some("mac"));
}

#[tokio::test]
async fn create_task_honors_type_agent_and_run_at() {
    let (_store, router) = fixture().await;

    let (status, body) = send(
        &router,
        post_json(
            "/tasks",
            json!({
                "what": "morning-review",
                "type": "skill",
                "agent": "planner",
                "run_at": "2026-08-02T07:00:00Z"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["type"], "skill");
    assert_eq!(body["agent"], "planner");
    assert_eq!(body["run_at"], "2026-08-02T07:00:00Z");
}

#[tokio::test]
async fn create_task_rejects_unknown_type() {
    let (_store, router) = fixture().await;
    let (status, _) = send(
        &router,
        post_json("/tasks", json!({"what": "x", "type": "widget"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_task_returns_404_for_unknown_ids() {
    let (_store, router) = fixture().await;
    let (status, _) = send(&router, get("/tasks/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_tasks_filters_by_status_and_limits() {
    let (store, router) = fixture().await;
    for i in 0..3 {
        let task = Task::new(TaskKind::Prompt(format!("job {i}")), "mock")
            .with_id(format!("t{i}"));
        store.create_task(&task).await.unwrap();
    }
    store.set_error("t1", "boom").await.unwrap();

    let (status, body) = send(&router, get("/tasks?status=failed")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "t1");
    assert_eq!(body[0]["error"], "boom");

    let (_, body) = send(&router, get("/tasks?limit=2")).await;
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = send(&router, get("/tasks?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn retry_is_only_permitted_from_failed() {
    let (store, router) = fixture().await;
    let task = Task::new(TaskKind::Prompt("flaky".to_string()), "mock").with_id("t");
    store.create_task(&task).await.unwrap();

    // Pending task: conflict.
    let (status, _) = send(&router, post_json("/tasks/t/retry", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    store.set_error("t", "boom").await.unwrap();
    let (status, body) = send(&router, post_json("/tasks/t/retry", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert!(body.get("error").is_none());
    assert!(body.get("finished_at").is_none());

    let (status, _) = send(&router, post_json("/tasks/ghost/retry", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn thread_endpoint_renders_markdown() {
    let (store, router) = fixture().await;
    store
        .append_thread(NewThreadEntry {
            machine_id: "mac".to_string(),
            agent: Some("mock".to_string()),
            summary: "did the thing".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (status, body) = send(&router, get("/thread")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["thread"].as_str().unwrap().contains("did the thing"));

    // A date with no entries renders empty.
    let (_, body) = send(&router, get("/thread?date=2000-01-01")).await;
    assert_eq!(body["thread"], "");

    let (status, _) = send(&router, get("/thread?date=not-a-date")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn agents_endpoint_reports_health_fields() {
    let (store, router) = fixture().await;
    store
        .upsert_agent(&AgentRecord {
            name: "mock".to_string(),
            adapter: "command".to_string(),
            command: "mock-agent".to_string(),
            context_window: 100_000,
            default_isolation: None,
            healthy: true,
            health_checked_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    let (status, body) = send(&router, get("/agents")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "mock");
    assert_eq!(body[0]["healthy"], true);
    assert!(body[0]["health_checked_at"].is_string());
}

#[tokio::test]
async fn status_endpoint_counts_tasks_and_tokens() {
    let (store, router) = fixture().await;
    store
        .create_task(&Task::new(TaskKind::Prompt("a".into()), "mock").with_id("a"))
        .await
        .unwrap();
    store
        .create_task(&Task::new(TaskKind::Prompt("b".into()), "mock").with_id("b"))
        .await
        .unwrap();
    store.update_status("b", TaskStatus::Running).await.unwrap();
    store
        .append_thread(NewThreadEntry {
            machine_id: "mac".to_string(),
            summary: "work".to_string(),
            tokens_used: Some(250),
            ..Default::default()
        })
        .await
        .unwrap();

    let (status, body) = send(&router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["running"], 1);
    assert_eq!(body["tokens_today"], 250);
    assert_eq!(body["tokens_week"], 250);
}

#[tokio::test]
async fn log_endpoint_returns_ordered_events() {
    let (store, router) = fixture().await;
    let task = Task::new(TaskKind::Prompt("x".into()), "mock").with_id("t");
    store.create_task(&task).await.unwrap();
    store
        .append_log("t", crate::models::LogEventKind::Started, None)
        .await
        .unwrap();
    store
        .append_log("t", crate::models::LogEventKind::Completed, None)
        .await
        .unwrap();

    let (status, body) = send(&router, get("/log/t")).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events[0]["event"], "started");
    assert_eq!(events[1]["event"], "completed");
}
