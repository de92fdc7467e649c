mod common;

use common::{container, MockBackend, JWT, SECRET};
use dockhand::api::{ApiError, RequestBody, Timeouts};
use dockhand::credentials::{AuthEvent, CredentialStore};
use dockhand::docker::DockerClient;
use dockhand::poller::{PollConfig, PollEvent, PollOutcome, TaskHandle, TaskPoller};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn login_persists_token_and_later_calls_carry_it() {
    let backend = MockBackend::start(vec![container("c1", "web", "running")]).await;
    let dir = tempfile::tempdir().unwrap();
    let token_path = dir.path().join("token");

    let credentials = Arc::new(CredentialStore::with_file(&token_path).unwrap());
    let api = backend.client(credentials.clone());

    api.login(SECRET).await.expect("login should succeed");
    assert_eq!(credentials.token().as_deref(), Some(JWT));
    assert_eq!(std::fs::read_to_string(&token_path).unwrap(), JWT);

    let containers = api.list_containers().await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].using_image, "nginx:latest");

    let seen = backend.state.lock().unwrap().bearer_seen.clone();
    assert_eq!(seen, vec![Some(JWT.to_string())]);
}

#[tokio::test]
async fn wrong_secret_is_rejected_without_storing_anything() {
    let backend = MockBackend::start(Vec::new()).await;
    let credentials = Arc::new(CredentialStore::in_memory());
    let api = backend.client(credentials.clone());

    let err = api.login("nope").await.unwrap_err();
    assert!(matches!(err, ApiError::Rejected { code: 401, .. }));
    assert!(!credentials.is_authenticated());
}

#[tokio::test]
async fn unauthorized_response_clears_token_and_notifies() {
    let backend = MockBackend::start(vec![container("c1", "web", "running")]).await;
    let credentials = Arc::new(CredentialStore::in_memory());
    credentials.set_token("expired-jwt").unwrap();
    let mut events = credentials.subscribe();

    let client = DockerClient::new(backend.client(credentials.clone()));
    let err = client.refresh().await.unwrap_err();

    assert!(matches!(err, ApiError::AuthExpired));
    assert!(credentials.token().is_none());
    assert_eq!(
        events.recv().await.unwrap(),
        AuthEvent::Changed {
            authenticated: false
        }
    );

    // Without a token the backend answer is plain unauthorized
    let err = client.refresh().await.unwrap_err();
    assert!(matches!(err, ApiError::Unauthorized));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn version_info_combines_local_and_remote() {
    let backend = MockBackend::start(Vec::new()).await;
    let credentials = Arc::new(CredentialStore::in_memory());
    credentials.set_token(JWT).unwrap();
    let client = DockerClient::new(backend.client(credentials));

    let info = client.version_info().await.unwrap();
    assert_eq!(info.version, "v1.2.0");
    assert_eq!(info.build_date, "2024-05-01");
    assert_eq!(info.remote_version, "v1.3.0");
    assert!(info.has_update);
}

#[tokio::test]
async fn error_status_without_envelope_code_keeps_http_status() {
    let backend = MockBackend::start(Vec::new()).await;
    let api = backend.authorized_client();

    let err = api.get_progress("missing").await.unwrap_err();
    match err {
        ApiError::Rejected { code, message } => {
            assert_eq!(code, 500);
            assert_eq!(message, "task not found");
        }
        other => panic!("expected a rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn poller_fails_task_on_server_error_with_message() {
    let backend = MockBackend::start(Vec::new()).await;
    let poller = TaskPoller::new(
        Arc::new(backend.authorized_client()),
        PollConfig {
            max_attempts: 5,
            interval: Duration::from_millis(10),
        },
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = poller.spawn(TaskHandle::new("missing", "c1"), tx);
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no poll event")
        .expect("poll channel closed");
    handle.join().await;

    match event {
        PollEvent::Terminal { outcome, .. } => assert_eq!(
            outcome,
            PollOutcome::Failed {
                message: "task not found".into()
            }
        ),
        other => panic!("expected terminal event, got {:?}", other),
    }
}

#[tokio::test]
async fn json_body_is_sent_with_bearer_and_content_type() {
    let backend = MockBackend::start(Vec::new()).await;
    let api = backend.authorized_client();
    let url = backend.url().join("api/echo").unwrap();

    let answer = api
        .send(
            Method::POST,
            url,
            RequestBody::Json(json!({"name": "web", "keep": true})),
            Duration::from_secs(2),
            true,
        )
        .await
        .unwrap();

    assert_eq!(answer["contentType"], "application/json");
    assert_eq!(answer["body"], json!({"name": "web", "keep": true}));
    let seen = backend.state.lock().unwrap().bearer_seen.clone();
    assert_eq!(seen, vec![Some(JWT.to_string())]);
}

#[tokio::test]
async fn slow_backend_yields_timeout_error() {
    let backend = MockBackend::start(vec![container("c1", "web", "exited")]).await;
    backend.slow_commands(Duration::from_secs(1));
    let credentials = Arc::new(CredentialStore::in_memory());
    credentials.set_token(JWT).unwrap();
    let api = backend.client_with_timeouts(
        credentials,
        Timeouts {
            management: Duration::from_millis(200),
            metadata: Duration::from_millis(200),
        },
    );

    let err = api.container_command("c1", "start").await.unwrap_err();
    assert!(err.is_timeout(), "got {:?}", err);
}
