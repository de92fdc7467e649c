#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dockhand::api::{ApiClient, Timeouts};
use dockhand::app::{Dashboard, ReconcilerSettings};
use dockhand::credentials::CredentialStore;
use dockhand::docker::DockerClient;
use dockhand::poller::PollConfig;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "s3cret";
pub const JWT: &str = "jwt-1";

#[derive(Default)]
pub struct MockState {
    pub containers: Vec<Value>,
    pub progress: VecDeque<Value>,
    /// `<command> <id>` per container call, in arrival order.
    pub commands: Vec<String>,
    pub update_bodies: Vec<String>,
    pub bearer_seen: Vec<Option<String>>,
    /// Number of container list requests served.
    pub list_calls: usize,
    /// Holds container commands this long before answering.
    pub delay: Option<Duration>,
}

type Shared = Arc<Mutex<MockState>>;

pub struct MockBackend {
    pub addr: SocketAddr,
    pub state: Shared,
    handle: tokio::task::JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(containers: Vec<Value>) -> Self {
        let state: Shared = Arc::new(Mutex::new(MockState {
            containers,
            ..Default::default()
        }));

        let app = Router::new()
            .route("/api/auth", post(login))
            .route("/api/containers", get(list_containers))
            .route("/api/container/:id/:command", post(container_command))
            .route("/api/progress/:task", get(progress))
            .route("/api/version", get(version))
            .route("/api/echo", post(echo))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> url::Url {
        url::Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    pub fn client(&self, credentials: Arc<CredentialStore>) -> ApiClient {
        self.client_with_timeouts(credentials, default_timeouts())
    }

    pub fn client_with_timeouts(
        &self,
        credentials: Arc<CredentialStore>,
        timeouts: Timeouts,
    ) -> ApiClient {
        ApiClient::new(self.url(), credentials, timeouts).unwrap()
    }

    /// Client logged in with the accepted token.
    pub fn authorized_client(&self) -> ApiClient {
        let credentials = Arc::new(CredentialStore::in_memory());
        credentials.set_token(JWT).unwrap();
        self.client(credentials)
    }

    /// Dashboard logged in with the accepted token and a fast poll loop.
    pub fn dashboard(&self) -> Dashboard {
        self.dashboard_with_timeouts(default_timeouts())
    }

    pub fn dashboard_with_timeouts(&self, timeouts: Timeouts) -> Dashboard {
        let credentials = Arc::new(CredentialStore::in_memory());
        credentials.set_token(JWT).unwrap();
        let poll = PollConfig {
            max_attempts: 10,
            interval: Duration::from_millis(20),
        };
        let settings = ReconcilerSettings {
            confirm_refresh_delay: Duration::from_millis(50),
            auto_refresh_interval: Duration::from_secs(10),
        };
        Dashboard::new(
            DockerClient::new(self.client_with_timeouts(credentials, timeouts)),
            poll,
            settings,
        )
    }

    pub fn script_progress(&self, responses: Vec<Value>) {
        self.state.lock().unwrap().progress.extend(responses);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    pub fn set_status(&self, id: &str, status: &str) {
        for c in self.state.lock().unwrap().containers.iter_mut() {
            if c["id"] == id {
                c["status"] = json!(status);
            }
        }
    }

    pub fn slow_commands(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn default_timeouts() -> Timeouts {
    Timeouts {
        management: Duration::from_secs(5),
        metadata: Duration::from_secs(2),
    }
}

pub fn container(id: &str, name: &str, status: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "usingImage": "nginx:latest",
        "status": status,
        "createTime": "2024-05-01 10:00:00",
        "runningTime": "3 hours",
        "haveUpdate": false
    })
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn authorize(state: &Shared, headers: &HeaderMap) -> Result<(), Response> {
    let token = bearer(headers);
    state.lock().unwrap().bearer_seen.push(token.clone());
    if token.as_deref() == Some(JWT) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": 401, "msg": "token invalid"})),
        )
            .into_response())
    }
}

async fn login(body: Bytes) -> Json<Value> {
    let body = String::from_utf8_lossy(&body);
    if body.contains("name=\"secretKey\"") && body.contains(&format!("\r\n\r\n{}\r\n", SECRET)) {
        Json(json!({"code": 200, "msg": "success", "data": {"jwt": JWT}}))
    } else {
        Json(json!({"code": 401, "msg": "secretKey invalid"}))
    }
}

async fn list_containers(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let containers = {
        let mut state = state.lock().unwrap();
        state.list_calls += 1;
        state.containers.clone()
    };
    Json(json!({"code": 200, "msg": "success", "data": containers})).into_response()
}

async fn container_command(
    State(state): State<Shared>,
    Path((id, command)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let delay = state.lock().unwrap().delay;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let mut state = state.lock().unwrap();
    state.commands.push(format!("{} {}", command, id));

    let set_status = |state: &mut MockState, status: &str| {
        for c in state.containers.iter_mut() {
            if c["id"] == id.as_str() {
                c["status"] = json!(status);
            }
        }
    };

    match command.as_str() {
        "start" | "restart" => set_status(&mut state, "running"),
        "stop" => set_status(&mut state, "exited"),
        "rename" => {
            let new_name = query.get("newName").cloned().unwrap_or_default();
            let taken = state.containers.iter().any(|c| c["name"] == new_name.as_str());
            if taken {
                return Json(json!({
                    "code": 500,
                    "msg": format!("Conflict. The container name \"/{}\" is already in use", new_name)
                }))
                .into_response();
            }
            for c in state.containers.iter_mut() {
                if c["id"] == id.as_str() {
                    c["name"] = json!(new_name);
                }
            }
        }
        "update" => {
            state
                .update_bodies
                .push(String::from_utf8_lossy(&body).into_owned());
            return Json(json!({"code": 200, "msg": "success", "data": {"taskID": "task-1"}}))
                .into_response();
        }
        _ => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"code": 404, "msg": "unknown command"})),
            )
                .into_response()
        }
    }
    Json(json!({"code": 200, "msg": "success"})).into_response()
}

async fn progress(
    State(state): State<Shared>,
    Path(task): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    if task == "missing" {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"msg": "task not found"})),
        )
            .into_response();
    }
    let next = state
        .lock()
        .unwrap()
        .progress
        .pop_front()
        .unwrap_or_else(|| json!({"code": 200, "msg": "success", "data": {"status": "running"}}));
    Json(next).into_response()
}

async fn version(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match query.get("type").map(String::as_str) {
        Some("remote") => Json(json!({"code": 200, "data": {"remoteVersion": "v1.3.0"}})),
        _ => Json(json!({"code": 200, "data": {"version": "v1.2.0", "buildDate": "2024-05-01"}})),
    }
    .into_response()
}

/// Answers with the request's content type and decoded JSON body.
async fn echo(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Json(json!({"contentType": content_type, "body": body})).into_response()
}
