//! The project agent's local HTTP surface (spec §6): health/status plus a
//! fallback task-dispatch, file, git, and exec surface for callers that
//! can't reach the agent over the bus. Mirrors the teacher's
//! `adapters::mcp::tasks_http` router construction: CORS and tracing layers
//! wrapped around a small set of routes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::actions::{self, ActionError, AgentAction};

/// Shared status the HTTP handlers read and the agent loop (and this
/// router's own `/task` handler) update as tasks run.
#[derive(Default)]
pub struct AgentStatus {
    pub active_tasks: AtomicU32,
    pub completed_tasks: AtomicU32,
    pub failed_tasks: AtomicU32,
    pub current_task: Mutex<Option<String>>,
}

#[derive(Clone)]
struct HttpState {
    project_id: String,
    work_dir: PathBuf,
    status: Arc<AgentStatus>,
}

pub fn router(project_id: impl Into<String>, work_dir: PathBuf, status: Arc<AgentStatus>) -> Router {
    let state = HttpState {
        project_id: project_id.into(),
        work_dir,
        status,
    };

    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz))
        .route("/status", get(status_handler))
        .route("/task", post(task_handler))
        .route("/files/read", post(files_read))
        .route("/files/write", post(files_write))
        .route("/files/tree", post(files_tree))
        .route("/files/search", post(files_search))
        .route("/git/commit", post(git_commit))
        .route("/git/push", post(git_push))
        .route("/git/status", post(git_status))
        .route("/git/diff", post(git_diff))
        .route("/exec", post(exec_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "project_id": state.project_id,
        "work_dir": state.work_dir.to_string_lossy(),
    }))
}

#[derive(Serialize)]
struct StatusResponse {
    project_id: String,
    work_dir: String,
    busy: bool,
    current_task: Option<String>,
    active_tasks: u32,
    completed_tasks: u32,
    failed_tasks: u32,
}

async fn status_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let active_tasks = state.status.active_tasks.load(Ordering::Relaxed);
    Json(StatusResponse {
        project_id: state.project_id.clone(),
        work_dir: state.work_dir.to_string_lossy().into_owned(),
        busy: active_tasks > 0,
        current_task: state.status.current_task.lock().expect("status lock poisoned").clone(),
        active_tasks,
        completed_tasks: state.status.completed_tasks.load(Ordering::Relaxed),
        failed_tasks: state.status.failed_tasks.load(Ordering::Relaxed),
    })
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    project_id: String,
    #[serde(default)]
    task_id: Option<String>,
    action: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// Maps the HTTP task surface's `{action, params}` shape onto an
/// `AgentAction`, translating the two composite git actions into the
/// underlying `Git` variant.
fn agent_action_from_named(action: &str, params: &serde_json::Value) -> Result<AgentAction, ActionError> {
    let value = match action {
        "git_commit" => {
            let message = params.get("message").and_then(serde_json::Value::as_str).unwrap_or("update");
            json!({"action": "git", "args": ["commit", "-am", message]})
        }
        "git_push" => json!({"action": "git", "args": ["push"]}),
        other => {
            let mut object = match params {
                serde_json::Value::Object(map) => map.clone(),
                _ => serde_json::Map::new(),
            };
            object.insert("action".to_string(), serde_json::Value::String(other.to_string()));
            serde_json::Value::Object(object)
        }
    };
    Ok(serde_json::from_value(value)?)
}

async fn task_handler(State(state): State<HttpState>, Json(req): Json<TaskRequest>) -> Response {
    if req.project_id != state.project_id {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("project_id mismatch: expected {}", state.project_id)})),
        )
            .into_response();
    }

    let action = match agent_action_from_named(&req.action, &req.params) {
        Ok(action) => action,
        Err(e) => return action_error_response(&e),
    };

    {
        let mut current = state.status.current_task.lock().expect("status lock poisoned");
        *current = Some(req.task_id.unwrap_or_else(|| req.action.clone()));
    }

    let work_dir = state.work_dir.clone();
    let status = state.status.clone();
    tokio::spawn(async move {
        status.active_tasks.fetch_add(1, Ordering::Relaxed);
        let outcome = actions::execute(&action, &work_dir).await;
        status.active_tasks.fetch_sub(1, Ordering::Relaxed);
        match outcome {
            Ok(_) => {
                status.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                status.failed_tasks.fetch_add(1, Ordering::Relaxed);
            }
        }
        *status.current_task.lock().expect("status lock poisoned") = None;
    });

    StatusCode::ACCEPTED.into_response()
}

#[derive(Debug, Deserialize)]
struct ReadRequest {
    path: String,
}

async fn files_read(State(state): State<HttpState>, Json(req): Json<ReadRequest>) -> Response {
    match actions::execute(&AgentAction::Read { path: req.path }, &state.work_dir).await {
        Ok(content) => Json(json!({"content": content})).into_response(),
        Err(e) => action_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
}

async fn files_write(State(state): State<HttpState>, Json(req): Json<WriteRequest>) -> Response {
    match actions::execute(&AgentAction::Write { path: req.path, content: req.content }, &state.work_dir).await {
        Ok(output) => Json(json!({"result": output})).into_response(),
        Err(e) => action_error_response(&e),
    }
}

/// Recursively lists every file under `root`, as paths relative to it.
async fn list_workspace(root: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else {
                let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
                out.push(relative);
            }
        }
    }
    Ok(out)
}

async fn files_tree(State(state): State<HttpState>) -> Response {
    match list_workspace(&state.work_dir).await {
        Ok(paths) => Json(json!({"paths": paths})).into_response(),
        Err(e) => action_error_response(&ActionError::from(e)),
    }
}

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
}

/// Reads every workspace file and keeps those whose contents contain
/// `query`, verbatim (no regex, no indexing -- a fallback surface, not a
/// search engine).
async fn search_text(root: &Path, query: &str) -> std::io::Result<Vec<String>> {
    let mut matches = Vec::new();
    for relative in list_workspace(root).await? {
        if let Ok(content) = tokio::fs::read_to_string(root.join(&relative)).await {
            if content.contains(query) {
                matches.push(relative);
            }
        }
    }
    Ok(matches)
}

async fn files_search(State(state): State<HttpState>, Json(req): Json<SearchRequest>) -> Response {
    match search_text(&state.work_dir, &req.query).await {
        Ok(matches) => Json(json!({"matches": matches})).into_response(),
        Err(e) => action_error_response(&ActionError::from(e)),
    }
}

async fn git_response(state: &HttpState, args: Vec<String>) -> Response {
    match actions::execute(&AgentAction::Git { args }, &state.work_dir).await {
        Ok(output) => Json(json!({"output": output})).into_response(),
        Err(e) => action_error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct GitCommitRequest {
    message: String,
}

async fn git_commit(State(state): State<HttpState>, Json(req): Json<GitCommitRequest>) -> Response {
    git_response(&state, vec!["commit".to_string(), "-am".to_string(), req.message]).await
}

async fn git_push(State(state): State<HttpState>) -> Response {
    git_response(&state, vec!["push".to_string()]).await
}

async fn git_status(State(state): State<HttpState>) -> Response {
    git_response(&state, vec!["status".to_string(), "--short".to_string()]).await
}

async fn git_diff(State(state): State<HttpState>) -> Response {
    git_response(&state, vec!["diff".to_string()]).await
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default = "default_exec_timeout_secs")]
    timeout_secs: u64,
}

fn default_exec_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Serialize)]
struct ExecResponse {
    success: bool,
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Runs `command` directly via `bash -c`, bypassing `actions::execute`: that
/// helper collapses success/failure into a `Result`, but `/exec` needs to
/// hand back stdout/stderr/exit code regardless of which way the process
/// exited.
async fn exec_handler(State(state): State<HttpState>, Json(req): Json<ExecRequest>) -> Response {
    let spawn = Command::new("bash")
        .arg("-c")
        .arg(&req.command)
        .current_dir(&state.work_dir)
        .stdin(Stdio::null())
        .output();

    match tokio::time::timeout(Duration::from_secs(req.timeout_secs), spawn).await {
        Ok(Ok(output)) => Json(ExecResponse {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
        .into_response(),
        Ok(Err(e)) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
        Err(_) => (StatusCode::REQUEST_TIMEOUT, Json(json!({"error": "exec timed out"}))).into_response(),
    }
}

fn action_error_response(err: &ActionError) -> Response {
    let status = match err {
        ActionError::PathEscapesSandbox(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use super::*;

    fn test_router(work_dir: PathBuf) -> Router {
        router("proj", work_dir, Arc::new(AgentStatus::default()))
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_project_and_work_dir() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["project_id"], json!("proj"));
    }

    #[tokio::test]
    async fn task_rejects_project_id_mismatch() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let body = json!({"project_id": "other", "action": "bash", "params": {"command": "true"}});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/task")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_accepts_matching_project_id() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let body = json!({"project_id": "proj", "action": "bash", "params": {"command": "true"}});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/task")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn files_write_then_tree_sees_the_new_file() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let body = json!({"path": "notes.txt", "content": "hello"});
        app.clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/files/write")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().method("POST").uri("/files/tree").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["paths"], json!(["notes.txt"]));
    }

    #[tokio::test]
    async fn exec_runs_a_command_and_reports_exit_code() {
        let dir = tempdir().unwrap();
        let app = test_router(dir.path().to_path_buf());
        let body = json!({"command": "exit 0"});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/exec")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], json!(true));
    }
}
