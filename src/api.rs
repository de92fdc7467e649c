//! Docker Copilot REST API client
//!
//! Low-level gateway for the management backend. Every outbound request is
//! built here: the bearer credential is attached, bodies are encoded as JSON
//! or multipart forms, timeouts are applied and authorization failures are
//! turned into a credential reset plus an auth-changed notification.

use crate::credentials::CredentialStore;
use log::{debug, warn};
use reqwest::{multipart, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:12712";

/// The backend reports success with either code.
pub const SUCCESS_CODES: [i64; 2] = [0, 200];

pub fn is_success_code(code: i64) -> bool {
    SUCCESS_CODES.contains(&code)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Authentication expired, please log in again")]
    AuthExpired,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("HTTP status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("API error ({code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("No data in response")]
    MissingData,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else {
            ApiError::Http(err)
        }
    }
}

impl ApiError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout(_))
    }
}

// API Response structures
#[derive(Debug, Deserialize, Serialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub using_image: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub running_time: String,
    #[serde(default)]
    pub have_update: bool,
    #[serde(default)]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub in_used: bool,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    jwt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAck {
    #[serde(default, rename = "taskID", alias = "taskId")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
    Local,
    Remote,
}

impl VersionKind {
    fn as_query(&self) -> &'static str {
        match self {
            VersionKind::Local => "local",
            VersionKind::Remote => "remote",
        }
    }
}

/// The version endpoint answers with either a bare string or an object.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VersionPayload {
    Text(String),
    #[serde(rename_all = "camelCase")]
    Details {
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        build_date: Option<String>,
        #[serde(default)]
        remote_version: Option<String>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Container and image management calls.
    pub management: Duration,
    /// Calls the backend forwards to third-party registries.
    pub metadata: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            management: Duration::from_secs(10),
            metadata: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(&'static str, String)>),
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    credentials: Arc<CredentialStore>,
    timeouts: Timeouts,
}

impl ApiClient {
    pub fn new(
        base: Url,
        credentials: Arc<CredentialStore>,
        timeouts: Timeouts,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            base,
            credentials,
            timeouts,
        })
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Sends one request and returns the decoded JSON body of a 2xx response.
    ///
    /// The bearer token is attached when `authenticated` is set and a token is
    /// stored. A 401 answered to a request that carried a token clears that
    /// token and yields [`ApiError::AuthExpired`].
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
        timeout: Duration,
        authenticated: bool,
    ) -> Result<Value, ApiError> {
        let attached = if authenticated {
            self.credentials.token()
        } else {
            None
        };

        debug!("{} {}", method, url.path());
        let mut request = self.http.request(method.clone(), url.clone()).timeout(timeout);
        if let Some(token) = &attached {
            request = request.bearer_auth(token);
        }
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(&value),
            RequestBody::Form(fields) => {
                let form = fields
                    .into_iter()
                    .fold(multipart::Form::new(), |form, (name, value)| {
                        form.text(name, value)
                    });
                request.multipart(form)
            }
        };

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return match attached {
                Some(token) => {
                    warn!("Credential rejected on {} {}, clearing it", method, url.path());
                    self.credentials.clear_if_current(&token);
                    Err(ApiError::AuthExpired)
                }
                None => Err(ApiError::Unauthorized),
            };
        }

        let text = response.text().await?;

        if !status.is_success() {
            if let Ok(envelope) = serde_json::from_str::<ApiResponse<Value>>(&text) {
                if !envelope.msg.is_empty() {
                    // A body without its own error code carries the HTTP status instead
                    let code = if is_success_code(envelope.code) {
                        i64::from(status.as_u16())
                    } else {
                        envelope.code
                    };
                    return Err(ApiError::Rejected {
                        code,
                        message: envelope.msg,
                    });
                }
            }
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Sends a request and checks the envelope code, keeping the raw payload.
    async fn acknowledge(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ApiResponse<Value>, ApiError> {
        let value = self.send(method, url, body, timeout, true).await?;
        let envelope: ApiResponse<Value> = serde_json::from_value(value)?;
        if !is_success_code(envelope.code) {
            return Err(ApiError::Rejected {
                code: envelope.code,
                message: envelope.msg,
            });
        }
        Ok(envelope)
    }

    async fn request<T>(&self, method: Method, url: Url, timeout: Duration) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let envelope = self
            .acknowledge(method, url, RequestBody::Empty, timeout)
            .await?;
        let data = envelope.data.ok_or(ApiError::MissingData)?;
        Ok(serde_json::from_value(data)?)
    }

    // ============== Authentication ==============

    /// Exchanges the secret key for a JWT and stores it.
    pub async fn login(&self, secret_key: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "auth"], &[])?;
        let value = self
            .send(
                Method::POST,
                url,
                RequestBody::Form(vec![("secretKey", secret_key.to_string())]),
                self.timeouts.management,
                false,
            )
            .await?;

        let envelope: ApiResponse<LoginData> = serde_json::from_value(value)?;
        if !is_success_code(envelope.code) {
            return Err(ApiError::Rejected {
                code: envelope.code,
                message: envelope.msg,
            });
        }
        let data = envelope.data.ok_or(ApiError::MissingData)?;
        if let Err(e) = self.credentials.set_token(data.jwt) {
            // The token still works for this process
            warn!("Failed to persist credential: {}", e);
        }
        Ok(())
    }

    pub fn logout(&self) -> bool {
        self.credentials.clear()
    }

    // ============== Containers ==============

    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>, ApiError> {
        let url = self.endpoint(&["api", "containers"], &[])?;
        let envelope = self
            .acknowledge(Method::GET, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        match envelope.data {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(data) => Ok(serde_json::from_value(data)?),
        }
    }

    /// `POST /api/container/{id}/{command}` for start, stop and restart.
    pub async fn container_command(&self, id: &str, command: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "container", id, command], &[])?;
        self.acknowledge(Method::POST, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(())
    }

    pub async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "container", id, "rename"], &[("newName", new_name)])?;
        self.acknowledge(Method::POST, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(())
    }

    /// Submits an update job. The backend may answer with a task id to poll.
    pub async fn update_container(
        &self,
        id: &str,
        container_name: &str,
        image_name_and_tag: &str,
        delete_old_container: bool,
    ) -> Result<UpdateAck, ApiError> {
        let url = self.endpoint(&["api", "container", id, "update"], &[])?;
        let form = vec![
            ("containerName", container_name.to_string()),
            ("imageNameAndTag", image_name_and_tag.to_string()),
            ("delOldContainer", delete_old_container.to_string()),
        ];
        let envelope = self
            .acknowledge(
                Method::POST,
                url,
                RequestBody::Form(form),
                self.timeouts.management,
            )
            .await?;

        match envelope.data {
            Some(data @ Value::Object(_)) => Ok(serde_json::from_value(data)?),
            _ => Ok(UpdateAck::default()),
        }
    }

    /// Raw progress payload; its shape varies, see [`crate::progress`].
    pub async fn get_progress(&self, task_id: &str) -> Result<Value, ApiError> {
        let url = self.endpoint(&["api", "progress", task_id], &[])?;
        self.send(
            Method::GET,
            url,
            RequestBody::Empty,
            self.timeouts.management,
            true,
        )
        .await
    }

    // ============== Backups ==============

    pub async fn backup_containers(&self) -> Result<String, ApiError> {
        let url = self.endpoint(&["api", "container", "backup"], &[])?;
        let envelope = self
            .acknowledge(Method::GET, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(envelope.msg)
    }

    pub async fn list_backups(&self) -> Result<Vec<String>, ApiError> {
        let url = self.endpoint(&["api", "container", "listBackups"], &[])?;
        let envelope = self
            .acknowledge(Method::GET, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        match envelope.data {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(data) => Ok(serde_json::from_value(data)?),
        }
    }

    pub async fn restore_backup(&self, filename: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "container", "backups", filename, "restore"], &[])?;
        self.acknowledge(Method::POST, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(())
    }

    pub async fn delete_backup(&self, filename: &str) -> Result<(), ApiError> {
        let url = self.endpoint(&["api", "container", "backups", filename], &[])?;
        self.acknowledge(Method::DELETE, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(())
    }

    /// Compose file generated from the current containers.
    pub async fn backup_to_compose(&self) -> Result<String, ApiError> {
        let url = self.endpoint(&["api", "container", "backup2compose"], &[])?;
        let envelope = self
            .acknowledge(Method::GET, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        match envelope.data {
            Some(Value::String(text)) => Ok(text),
            Some(Value::Null) | None => Err(ApiError::MissingData),
            Some(other) => Ok(serde_json::to_string_pretty(&other)?),
        }
    }

    // ============== Images ==============

    pub async fn list_images(&self) -> Result<Vec<ImageInfo>, ApiError> {
        let url = self.endpoint(&["api", "images"], &[])?;
        let envelope = self
            .acknowledge(Method::GET, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        match envelope.data {
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(data) => Ok(serde_json::from_value(data)?),
        }
    }

    pub async fn delete_image(&self, id: &str, force: bool) -> Result<(), ApiError> {
        let force = force.to_string();
        let url = self.endpoint(&["api", "image", id], &[("force", force.as_str())])?;
        self.acknowledge(Method::DELETE, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(())
    }

    // ============== Program ==============

    pub async fn get_version(
        &self,
        kind: Option<VersionKind>,
    ) -> Result<VersionPayload, ApiError> {
        let (url, timeout) = match kind {
            Some(kind) => (
                self.endpoint(&["api", "version"], &[("type", kind.as_query())])?,
                match kind {
                    VersionKind::Local => self.timeouts.management,
                    VersionKind::Remote => self.timeouts.metadata,
                },
            ),
            None => (
                self.endpoint(&["api", "version"], &[])?,
                self.timeouts.management,
            ),
        };
        self.request(Method::GET, url, timeout).await
    }

    /// Asks the backend to update itself to the latest release.
    pub async fn update_program(&self) -> Result<String, ApiError> {
        let url = self.endpoint(&["api", "program"], &[])?;
        let envelope = self
            .acknowledge(Method::PUT, url, RequestBody::Empty, self.timeouts.management)
            .await?;
        Ok(envelope.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(
            Url::parse(base).unwrap(),
            Arc::new(CredentialStore::in_memory()),
            Timeouts::default(),
        )
        .unwrap()
    }

    #[test]
    fn endpoint_encodes_segments_and_query() {
        let api = client("http://127.0.0.1:12712");
        let url = api
            .endpoint(&["api", "container", "abc", "rename"], &[("newName", "my app")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:12712/api/container/abc/rename?newName=my+app"
        );
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let api = client("http://nas.local/copilot/");
        let url = api
            .endpoint(&["api", "container", "backups", "a b.json"], &[])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://nas.local/copilot/api/container/backups/a%20b.json"
        );
    }

    #[test]
    fn version_payload_accepts_both_shapes() {
        let text: VersionPayload = serde_json::from_value(json!("v1.2.0")).unwrap();
        assert_eq!(text, VersionPayload::Text("v1.2.0".into()));

        let details: VersionPayload =
            serde_json::from_value(json!({"version": "v1.2.0", "buildDate": "2024-05-01"}))
                .unwrap();
        assert_eq!(
            details,
            VersionPayload::Details {
                version: Some("v1.2.0".into()),
                build_date: Some("2024-05-01".into()),
                remote_version: None,
            }
        );
    }

    #[test]
    fn update_ack_reads_task_id() {
        let ack: UpdateAck = serde_json::from_value(json!({"taskID": "t-1"})).unwrap();
        assert_eq!(ack.task_id.as_deref(), Some("t-1"));
        let empty: UpdateAck = serde_json::from_value(json!({})).unwrap();
        assert!(empty.task_id.is_none());
    }
}
