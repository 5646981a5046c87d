use actix_cors::Cors;
use actix_web::{delete, get, post, web, App, HttpResponse, HttpServer, Result as ActixResult};
use actix_ws::Message;
use relaycore::{
    ApprovalError, Decision, OverdueSeverity, PendingApproval, RelayError, RunId,
    WorkflowDefinition,
};
use relayruntime::{
    ExecutorRegistry, RelayRuntime, RuntimeConfig, StaticWorkerSource, WorkerDirectory,
};
use relaysteps::CommandTransport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<RelayRuntime>,
}

/// Request body for run submission
#[derive(Debug, Deserialize)]
struct SubmitRequest {
    definition: WorkflowDefinition,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    run_id: RunId,
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct DecisionRequest {
    decision: Decision,
    #[serde(default)]
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ThreadFilter {
    thread: Option<String>,
}

/// A pending approval with its current overdue grade, if past deadline
#[derive(Debug, Serialize)]
struct ApprovalView {
    #[serde(flatten)]
    approval: PendingApproval,
    severity: Option<OverdueSeverity>,
    overdue_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ValidationIssue {
    step_id: Option<String>,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ValidationIssue>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            errors: Vec::new(),
        }
    }
}

fn error_response(err: &RelayError) -> HttpResponse {
    match err {
        RelayError::Validation(errors) => HttpResponse::UnprocessableEntity().json(ErrorResponse {
            error: format!("{} validation error(s)", errors.len()),
            errors: errors
                .iter()
                .map(|e| ValidationIssue {
                    step_id: e.step_id().map(str::to_string),
                    message: e.to_string(),
                })
                .collect(),
        }),
        RelayError::Dispatch(_) => {
            HttpResponse::UnprocessableEntity().json(ErrorResponse::new(err.to_string()))
        }
        RelayError::RunNotFound(_) | RelayError::Approval(ApprovalError::NotFound { .. }) => {
            HttpResponse::NotFound().json(ErrorResponse::new(err.to_string()))
        }
        RelayError::Approval(_) | RelayError::ThreadBusy { .. } => {
            HttpResponse::Conflict().json(ErrorResponse::new(err.to_string()))
        }
        _ => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(ErrorResponse::new(err.to_string()))
        }
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "relay"
    }))
}

/// List available step kinds
#[get("/api/kinds")]
async fn list_kinds(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runtime.kinds())
}

/// Validate and start a run
#[post("/api/runs")]
async fn submit_run(data: web::Data<AppState>, req: web::Json<SubmitRequest>) -> HttpResponse {
    let SubmitRequest {
        definition,
        project_id,
        thread_id,
    } = req.into_inner();

    info!("Submitting workflow: {} ({})", definition.name, definition.id);

    match data.runtime.submit(&definition, project_id, thread_id).await {
        Ok(handle) => HttpResponse::Accepted().json(SubmitResponse {
            run_id: handle.run_id,
            thread_id: handle.thread_id.clone(),
        }),
        Err(e) => error_response(&e),
    }
}

#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runtime.list_runs().await)
}

#[get("/api/runs/{id}")]
async fn get_run(data: web::Data<AppState>, path: web::Path<RunId>) -> HttpResponse {
    let run_id = path.into_inner();
    match data.runtime.run_summary(run_id).await {
        Some(summary) => HttpResponse::Ok().json(summary),
        None => error_response(&RelayError::RunNotFound(run_id)),
    }
}

#[post("/api/runs/{id}/abort")]
async fn abort_run(data: web::Data<AppState>, path: web::Path<RunId>) -> HttpResponse {
    let run_id = path.into_inner();
    match data.runtime.abort(run_id).await {
        Ok(()) => HttpResponse::Accepted().json(serde_json::json!({
            "run_id": run_id,
            "message": "Abort requested"
        })),
        Err(e) => error_response(&e),
    }
}

/// Undecided approvals, oldest first, with overdue severity
#[get("/api/approvals")]
async fn list_approvals(
    data: web::Data<AppState>,
    query: web::Query<ThreadFilter>,
) -> HttpResponse {
    let pending = data.runtime.pending_approvals().await;
    let overdue = data.runtime.overdue_approvals().await;

    let views: Vec<ApprovalView> = pending
        .into_iter()
        .filter(|a| query.thread.as_deref().map_or(true, |t| a.thread_id == t))
        .map(|approval| {
            let alert = overdue.iter().find(|alert| {
                alert.approval.thread_id == approval.thread_id
                    && alert.approval.step_id == approval.step_id
            });
            ApprovalView {
                severity: alert.map(|a| a.severity),
                overdue_secs: alert.map(|a| a.overdue_secs),
                approval,
            }
        })
        .collect();

    HttpResponse::Ok().json(views)
}

#[post("/api/approvals/{thread_id}/{step_id}")]
async fn decide_approval(
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    req: web::Json<DecisionRequest>,
) -> HttpResponse {
    let (thread_id, step_id) = path.into_inner();
    let DecisionRequest { decision, comment } = req.into_inner();

    info!("Decision for {}/{}: {}", thread_id, step_id, decision);

    match data
        .runtime
        .decide(&thread_id, &step_id, decision, comment)
        .await
    {
        Ok(approval) => HttpResponse::Ok().json(approval),
        Err(e) => error_response(&e),
    }
}

/// Drop the finished runs and settled approvals of an idle thread
#[delete("/api/threads/{thread_id}")]
async fn forget_thread(data: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let thread_id = path.into_inner();
    match data.runtime.forget_thread(&thread_id).await {
        Ok(runs_removed) => HttpResponse::Ok().json(serde_json::json!({
            "thread_id": thread_id,
            "runs_removed": runs_removed
        })),
        Err(e) => error_response(&e),
    }
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<ThreadFilter>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let thread = query.into_inner().thread;

    info!(thread = ?thread, "WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if thread.as_deref().is_some_and(|t| event.thread_id() != t) {
                                continue;
                            }
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "WebSocket client lagged behind");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(list_kinds)
        .service(submit_run)
        .service(list_runs)
        .service(get_run)
        .service(abort_run)
        .service(list_approvals)
        .service(decide_approval)
        .service(forget_thread)
        .service(websocket_events);
}

/// Runtime configured from `RELAY_CONFIG` and `RELAY_WORKERS`, both optional.
fn build_runtime() -> anyhow::Result<RelayRuntime> {
    let config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => RuntimeConfig::load(path)?,
        Err(_) => RuntimeConfig::default(),
    };
    let source = match std::env::var("RELAY_WORKERS") {
        Ok(path) => StaticWorkerSource::load(path)?,
        Err(_) => StaticWorkerSource::new(),
    };

    let mut registry = ExecutorRegistry::new();
    relaysteps::register_all(&mut registry, Arc::new(CommandTransport::default()));

    let directory = Arc::new(WorkerDirectory::new(Arc::new(source)));
    Ok(RelayRuntime::new(config, registry, directory))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Relay Server");

    let runtime = build_runtime()?;

    info!(
        "✅ Runtime initialized with {} step kinds (mock: {})",
        runtime.kinds().len(),
        runtime.config().use_mock
    );

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .configure(routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use relaycore::WorkerConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn test_state() -> web::Data<AppState> {
        let source = StaticWorkerSource::from_workers(vec![WorkerConfig::new("writer-1", "writer")]);
        let mut registry = ExecutorRegistry::new();
        relaysteps::register_all(&mut registry, Arc::new(CommandTransport::default()));
        let runtime = RelayRuntime::new(
            RuntimeConfig::default().with_mock(true),
            registry,
            Arc::new(WorkerDirectory::new(Arc::new(source))),
        );
        web::Data::new(AppState {
            runtime: Arc::new(runtime),
        })
    }

    #[actix_web::test]
    async fn test_health_check() {
        let app = test::init_service(App::new().configure(routes)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["status"], "healthy");
    }

    #[actix_web::test]
    async fn test_invalid_run_lists_every_problem() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(routes)).await;
        let body = json!({
            "definition": {
                "name": "broken",
                "steps": [
                    { "id": "a", "task": "x", "role": "nobody" },
                    { "id": "b", "task": "y", "role": "writer", "depends_on": ["ghost"] }
                ]
            }
        });

        let req = test::TestRequest::post().uri("/api/runs").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body: Value = test::read_body_json(resp).await;
        let errors = body["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[actix_web::test]
    async fn test_gated_run_is_decided_once() {
        let state = test_state();
        let app = test::init_service(App::new().app_data(state.clone()).configure(routes)).await;
        let body = json!({
            "thread_id": "t-1",
            "definition": {
                "name": "gated",
                "steps": [
                    { "id": "draft", "task": "write", "role": "writer",
                      "approval": { "prompt": "Ship it?" } }
                ]
            }
        });

        let req = test::TestRequest::post().uri("/api/runs").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let submitted: Value = test::read_body_json(resp).await;
        let run_id = submitted["run_id"].as_str().unwrap().to_string();

        let mut pending = Vec::new();
        for _ in 0..100 {
            let req = test::TestRequest::get().uri("/api/approvals?thread=t-1").to_request();
            let listed: Vec<Value> = test::call_and_read_body_json(&app, req).await;
            if !listed.is_empty() {
                pending = listed;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["step_id"], "draft");
        assert_eq!(pending[0]["severity"], Value::Null);

        let decision = json!({ "decision": "approve", "comment": "fine" });
        let req = test::TestRequest::post()
            .uri("/api/approvals/t-1/draft")
            .set_json(&decision)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::post()
            .uri("/api/approvals/t-1/draft")
            .set_json(&decision)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let mut status = Value::Null;
        for _ in 0..100 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/runs/{}", run_id))
                .to_request();
            let summary: Value = test::call_and_read_body_json(&app, req).await;
            status = summary["status"].clone();
            if status != "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, "completed");
    }

    #[actix_web::test]
    async fn test_unknown_approval_and_run_are_not_found() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/approvals/nope/nothing")
            .set_json(json!({ "decision": "reject" }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri(&format!("/api/runs/{}/abort", uuid::Uuid::new_v4()))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_busy_thread_conflicts_until_forgotten() {
        let app =
            test::init_service(App::new().app_data(test_state()).configure(routes)).await;
        let body = json!({
            "thread_id": "t-busy",
            "definition": {
                "name": "gated",
                "steps": [
                    { "id": "draft", "task": "write", "role": "writer",
                      "approval": { "prompt": "Ship it?" } }
                ]
            }
        });

        let req = test::TestRequest::post().uri("/api/runs").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let submitted: Value = test::read_body_json(resp).await;
        let run_id = submitted["run_id"].as_str().unwrap().to_string();

        let req = test::TestRequest::post().uri("/api/runs").set_json(&body).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let error: Value = test::read_body_json(resp).await;
        assert_eq!(error["error"], "Thread 't-busy' already has an active run");

        let req = test::TestRequest::delete().uri("/api/threads/t-busy").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let mut decided = false;
        for _ in 0..100 {
            let req = test::TestRequest::post()
                .uri("/api/approvals/t-busy/draft")
                .set_json(json!({ "decision": "approve" }))
                .to_request();
            if test::call_service(&app, req).await.status() == StatusCode::OK {
                decided = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(decided);

        let mut forgotten = Value::Null;
        for _ in 0..100 {
            let req = test::TestRequest::delete().uri("/api/threads/t-busy").to_request();
            let resp = test::call_service(&app, req).await;
            if resp.status() == StatusCode::OK {
                forgotten = test::read_body_json(resp).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(forgotten["runs_removed"], 1);

        let req = test::TestRequest::get()
            .uri(&format!("/api/runs/{}", run_id))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }
}
