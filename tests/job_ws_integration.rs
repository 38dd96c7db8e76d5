//! Integration tests for the job WebSocket + REST surface.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and exercises the real WS / REST contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use ai_jobs::error::LlmError;
use ai_jobs::jobs::{JobManager, JobStage, JobType, RunnerConfig, TaskRunner};
use ai_jobs::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use ai_jobs::notifier::ChangeNotifier;
use ai_jobs::store::{FileJobStore, JobStore, SessionStore};
use ai_jobs::sync::{ClientHints, job_routes};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Stub LLM provider for integration tests (no real API calls).
struct StubLlm;

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: "1. What does the borrow checker enforce?\n2. When is a value dropped?"
                .to_string(),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

struct Server {
    port: u16,
    manager: Arc<JobManager>,
    notifier: Arc<ChangeNotifier>,
    dir: TempDir,
}

/// Start an Axum server on a random port.
async fn start_server() -> Server {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn JobStore> =
        Arc::new(FileJobStore::open(dir.path().join("jobs")).await.unwrap());
    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions")).await.unwrap());
    let manager = Arc::new(JobManager::new(Arc::clone(&store)));
    let runner = Arc::new(TaskRunner::new(
        Arc::clone(&manager),
        Arc::new(StubLlm),
        RunnerConfig::default(),
    ));
    let notifier = ChangeNotifier::new(store, Duration::from_millis(20));
    let app = job_routes(
        runner,
        Arc::clone(&notifier),
        sessions,
        ClientHints::default(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        port,
        manager,
        notifier,
        dir,
    }
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Read frames until a `jobs:update` for `id` in `stage` arrives.
async fn wait_for_update<S>(ws: &mut S, id: Uuid, stage: &str) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = ws.next().await.unwrap().unwrap();
        if !msg.is_text() {
            continue;
        }
        let json = parse_ws_json(&msg);
        if json["type"] == "jobs:update"
            && json["job"]["id"] == id.to_string()
            && json["job"]["stage"] == stage
        {
            return json;
        }
    }
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_empty_init() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);

        assert_eq!(json["type"], "jobs:init");
        assert!(json["jobs"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_init_contains_only_active_jobs() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let active = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();
        let done = server
            .manager
            .create_job(JobType::SubmitAnswers, None)
            .await
            .unwrap();
        server.manager.fail_job(done.id, "boom").await.unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());

        assert_eq!(json["type"], "jobs:init");
        let jobs = json["jobs"].as_array().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], active.id.to_string());
        assert_eq!(jobs[0]["type"], "create_session");
        assert_eq!(jobs[0]["stage"], "pending");
        assert!(jobs[0]["stageStartedAt"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_receives_update_after_stage_change() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();
        let _init = ws.next().await.unwrap().unwrap();

        server
            .manager
            .update_stage(job.id, JobStage::Extract)
            .await
            .unwrap();
        server.notifier.touch(job.id);

        let json = wait_for_update(&mut ws, job.id, "extract").await;
        assert!(json["job"]["completedAt"].is_null());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_cancel_action_fails_pending_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();
        let _init = ws.next().await.unwrap().unwrap();

        let action = serde_json::json!({"type": "jobs:cancel", "jobId": job.id});
        ws.send(Message::Text(action.to_string().into())).await.unwrap();

        let json = wait_for_update(&mut ws, job.id, "failed").await;
        assert_eq!(json["job"]["error"], "Cancelled by user");
        assert!(json["job"]["completedAt"].is_string());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_multiple_clients_receive_same_update() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::AddMoreQuestions, None)
            .await
            .unwrap();

        let url = format!("ws://127.0.0.1:{}/ws/jobs", server.port);
        let (mut ws1, _) = connect_async(&url).await.unwrap();
        let (mut ws2, _) = connect_async(&url).await.unwrap();
        let _ = ws1.next().await.unwrap().unwrap();
        let _ = ws2.next().await.unwrap().unwrap();
        assert_eq!(server.notifier.subscriber_count(), 2);

        server.manager.fail_job(job.id, "upstream down").await.unwrap();
        server.notifier.touch(job.id);

        let a = wait_for_update(&mut ws1, job.id, "failed").await;
        let b = wait_for_update(&mut ws2, job.id, "failed").await;
        assert_eq!(a, b);
        assert_eq!(a["job"]["error"], "upstream down");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_ping_gets_pong() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();
        let _init = ws.next().await.unwrap().unwrap();

        ws.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Pong(ref data) if data.as_ref() == b"hi"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_disconnect_releases_subscription() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();
        let _init = ws.next().await.unwrap().unwrap();
        assert_eq!(server.notifier.subscriber_count(), 1);

        ws.close(None).await.unwrap();
        drop(ws);

        while server.notifier.subscriber_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.notifier.is_watching());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_closes_when_snapshot_is_unavailable() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        std::fs::remove_dir_all(server.dir.path().join("jobs")).unwrap();

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws/jobs", server.port))
            .await
            .unwrap();

        match ws.next().await {
            Some(Ok(Message::Close(frame))) => {
                let frame = frame.expect("close frame carries a reason");
                assert_eq!(u16::from(frame.code), 1011);
            }
            Some(Ok(other)) => panic!("expected close, got {:?}", other),
            // Connection dropped without a close frame is also a close.
            Some(Err(_)) | None => {}
        }
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn rest_job_types_expose_label_and_eta() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let types: Vec<Value> =
            reqwest::get(format!("http://127.0.0.1:{}/api/job-types", server.port))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();

        assert_eq!(types.len(), 6);
        let create = types
            .iter()
            .find(|t| t["type"] == "create_session")
            .unwrap();
        assert_eq!(create["label"], "Generating questions");
        assert_eq!(create["etaSecs"], 45);
        assert!(types.iter().all(|t| t["etaSecs"].as_u64().unwrap() > 0));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_health() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["pollIntervalMs"], 2000);
        assert_eq!(json["stallThresholdSecs"], 120);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_active_jobs_bypass_caches() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{}/api/jobs/active", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get(reqwest::header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        let jobs: Vec<Value> = resp.json().await.unwrap();
        assert_eq!(jobs.len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_list_all_includes_finished_jobs() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();
        server.manager.cancel_job(job.id).await.unwrap();

        let jobs: Vec<Value> = reqwest::get(format!("http://127.0.0.1:{}/api/jobs", server.port))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["stage"], "failed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_get_job_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();
        let base = format!("http://127.0.0.1:{}/api/jobs", server.port);

        let resp = reqwest::get(format!("{base}/{}", job.id)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["id"], job.id.to_string());

        let resp = reqwest::get(format!("{base}/{}", Uuid::new_v4())).await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = reqwest::get(format!("{base}/not-a-uuid")).await.unwrap();
        assert_eq!(resp.status(), 400);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["error"], "Invalid job ID");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_cancel_pending_job() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/jobs/{}/cancel",
                server.port, job.id
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["stage"], "failed");
        assert_eq!(json["error"], "Cancelled by user");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_cancel_started_job_conflicts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let job = server
            .manager
            .create_job(JobType::CreateSession, None)
            .await
            .unwrap();
        server
            .manager
            .update_stage(job.id, JobStage::Extract)
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/jobs/{}/cancel",
                server.port, job.id
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
        let json: Value = resp.json().await.unwrap();
        assert!(json["error"].as_str().unwrap().contains("cannot be cancelled"));

        let after = server.manager.get_job(job.id).await.unwrap();
        assert_eq!(after.stage, JobStage::Extract);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_cancel_unknown_or_invalid_id() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/jobs/{}/cancel",
                server.port,
                Uuid::new_v4()
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client
            .post(format!(
                "http://127.0.0.1:{}/api/jobs/not-a-uuid/cancel",
                server.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_start_job_runs_to_completion() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://127.0.0.1:{}/api/jobs", server.port))
            .json(&serde_json::json!({
                "type": "create_session",
                "title": "Ownership",
                "source": "Every value in Rust has a single owner.",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let started: Value = resp.json().await.unwrap();
        assert_eq!(started["type"], "create_session");
        let id: Uuid = started["id"].as_str().unwrap().parse().unwrap();

        let job = loop {
            let job = server.manager.get_job(id).await.unwrap();
            if job.stage.is_terminal() {
                break job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(job.stage, JobStage::Completed, "error: {:?}", job.error);
        assert!(job.result_session_id.is_some());
        assert!(job.completed_at.is_some());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn rest_start_job_rejects_unknown_type() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://127.0.0.1:{}/api/jobs", server.port))
            .json(&serde_json::json!({"type": "launch_rocket"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert!(server.manager.list_all_jobs().await.unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
