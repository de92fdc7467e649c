//! Docker Copilot client
//!
//! Domain view of the backend: containers with a typed lifecycle status, the
//! shared container list cache, and the higher level calls the reconciler
//! issues against the API gateway.

use crate::api::{ApiClient, ApiError, ContainerInfo, UpdateAck, VersionKind, VersionPayload};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerStatus {
    Running,
    Stopped,
    Restarting,
    Paused,
    Unknown,
}

impl ContainerStatus {
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "running" | "up" => ContainerStatus::Running,
            "exited" | "stopped" | "created" | "dead" => ContainerStatus::Stopped,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            _ => ContainerStatus::Unknown,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Update,
}

impl ContainerAction {
    /// Status to show before the backend confirms. None for polled actions.
    pub fn expected_status(&self) -> Option<ContainerStatus> {
        match self {
            ContainerAction::Start => Some(ContainerStatus::Running),
            ContainerAction::Stop => Some(ContainerStatus::Stopped),
            ContainerAction::Restart => Some(ContainerStatus::Restarting),
            ContainerAction::Update => None,
        }
    }

    /// Path segment of the lifecycle command. None for `Update`, which goes
    /// through the update route and is polled.
    pub fn command(&self) -> Option<&'static str> {
        match self {
            ContainerAction::Start => Some("start"),
            ContainerAction::Stop => Some("stop"),
            ContainerAction::Restart => Some("restart"),
            ContainerAction::Update => None,
        }
    }

    pub fn past_tense(&self) -> &'static str {
        match self {
            ContainerAction::Start => "started",
            ContainerAction::Stop => "stopped",
            ContainerAction::Restart => "restarted",
            ContainerAction::Update => "updated",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
            ContainerAction::Update => "update",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: String,
    pub running_time: String,
    pub has_update: bool,
    pub icon_url: Option<String>,
}

impl From<ContainerInfo> for Container {
    fn from(info: ContainerInfo) -> Self {
        Self {
            status: ContainerStatus::from_wire(&info.status),
            id: info.id,
            name: info.name,
            image: info.using_image,
            created_at: info.create_time,
            running_time: info.running_time,
            has_update: info.have_update,
            icon_url: info.icon_url,
        }
    }
}

/// Process-wide container list. Patches replace the matching entry by id and
/// leave every other entry untouched.
#[derive(Debug, Clone, Default)]
pub struct ContainerCache {
    inner: Arc<RwLock<Vec<Container>>>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<Container> {
        self.inner.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.inner.read().await.iter().find(|c| c.id == id).cloned()
    }

    pub async fn replace(&self, containers: Vec<Container>) {
        *self.inner.write().await = containers;
    }

    /// Applies `f` to the container with `id`. Returns false if it is not cached.
    pub async fn patch<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Container),
    {
        let mut guard = self.inner.write().await;
        let mut f = Some(f);
        let next: Vec<Container> = guard
            .iter()
            .map(|c| {
                if c.id != id {
                    return c.clone();
                }
                let mut patched = c.clone();
                if let Some(f) = f.take() {
                    f(&mut patched);
                }
                patched
            })
            .collect();
        let found = f.is_none();
        *guard = next;
        found
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub container_name: String,
    pub image_name_and_tag: String,
    pub delete_old_container: bool,
}

impl UpdateRequest {
    /// Re-pull the image the container already runs, replacing the old one.
    pub fn same_image(container: &Container) -> Self {
        Self {
            container_name: container.name.clone(),
            image_name_and_tag: container.image.clone(),
            delete_old_container: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub version: String,
    pub build_date: String,
    pub remote_version: String,
    pub has_update: bool,
}

const UNKNOWN_VERSION: &str = "unknown";

impl VersionInfo {
    fn from_payloads(local: Option<VersionPayload>, remote: Option<VersionPayload>) -> Self {
        let (version, build_date) = match local {
            Some(VersionPayload::Text(v)) => (v, String::new()),
            Some(VersionPayload::Details {
                version,
                build_date,
                ..
            }) => (
                version.unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
                build_date.unwrap_or_default(),
            ),
            None => (UNKNOWN_VERSION.to_string(), String::new()),
        };
        let remote_version = match remote {
            Some(VersionPayload::Text(v)) => v,
            Some(VersionPayload::Details { remote_version, .. }) => {
                remote_version.unwrap_or_else(|| UNKNOWN_VERSION.to_string())
            }
            None => UNKNOWN_VERSION.to_string(),
        };
        let has_update = remote_version != UNKNOWN_VERSION && remote_version != version;
        Self {
            version,
            build_date,
            remote_version,
            has_update,
        }
    }
}

#[derive(Clone)]
pub struct DockerClient {
    api: ApiClient,
    cache: ContainerCache,
}

impl DockerClient {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            cache: ContainerCache::new(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &ContainerCache {
        &self.cache
    }

    /// Reloads the container list from the backend into the cache.
    pub async fn refresh(&self) -> Result<usize, ApiError> {
        debug!("Refreshing container list");
        let containers: Vec<Container> = self
            .api
            .list_containers()
            .await?
            .into_iter()
            .map(Container::from)
            .collect();
        let count = containers.len();
        self.cache.replace(containers).await;
        info!("Container list refreshed - {} containers", count);
        Ok(count)
    }

    /// Fire-and-forget lifecycle command, `command` as given by
    /// [`ContainerAction::command`].
    pub async fn run_command(&self, id: &str, command: &str) -> Result<(), ApiError> {
        debug!("Sending {} to container {}", command, id);
        self.api.container_command(id, command).await
    }

    pub async fn submit_update(
        &self,
        id: &str,
        request: &UpdateRequest,
    ) -> Result<UpdateAck, ApiError> {
        self.api
            .update_container(
                id,
                &request.container_name,
                &request.image_name_and_tag,
                request.delete_old_container,
            )
            .await
    }

    pub async fn rename(&self, id: &str, new_name: &str) -> Result<(), ApiError> {
        self.api.rename_container(id, new_name).await?;
        let new_name = new_name.to_string();
        self.cache.patch(id, move |c| c.name = new_name).await;
        Ok(())
    }

    /// Local and remote versions, fetched together. A failed remote lookup
    /// degrades to "unknown" instead of failing the whole call.
    pub async fn version_info(&self) -> Result<VersionInfo, ApiError> {
        let (local, remote) = futures::future::join(
            self.api.get_version(Some(VersionKind::Local)),
            self.api.get_version(Some(VersionKind::Remote)),
        )
        .await;

        let local = local?;
        let remote = match remote {
            Ok(payload) => Some(payload),
            Err(ApiError::AuthExpired) => return Err(ApiError::AuthExpired),
            Err(e) => {
                warn!("Remote version lookup failed: {}", e);
                None
            }
        };
        Ok(VersionInfo::from_payloads(Some(local), remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(id: &str, status: ContainerStatus) -> Container {
        Container {
            id: id.to_string(),
            name: format!("{}-name", id),
            image: "nginx:latest".to_string(),
            status,
            created_at: String::new(),
            running_time: String::new(),
            has_update: false,
            icon_url: None,
        }
    }

    #[test]
    fn wire_status_mapping() {
        assert_eq!(ContainerStatus::from_wire("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from_wire("Exited"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_wire("paused"), ContainerStatus::Paused);
        assert_eq!(ContainerStatus::from_wire("restarting"), ContainerStatus::Restarting);
        assert_eq!(ContainerStatus::from_wire("removing"), ContainerStatus::Unknown);
    }

    #[tokio::test]
    async fn patches_to_different_entities_do_not_clobber() {
        let cache = ContainerCache::new();
        cache
            .replace(vec![
                container("a", ContainerStatus::Stopped),
                container("b", ContainerStatus::Running),
            ])
            .await;

        let (first, second) = tokio::join!(
            cache.patch("a", |c| c.status = ContainerStatus::Running),
            cache.patch("b", |c| c.status = ContainerStatus::Stopped),
        );
        assert!(first && second);

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot[0].status, ContainerStatus::Running);
        assert_eq!(snapshot[1].status, ContainerStatus::Stopped);
        assert_eq!(snapshot[0].name, "a-name");
    }

    #[tokio::test]
    async fn patch_of_unknown_entity_reports_miss() {
        let cache = ContainerCache::new();
        cache.replace(vec![container("a", ContainerStatus::Running)]).await;
        assert!(!cache.patch("zzz", |c| c.status = ContainerStatus::Paused).await);
        assert_eq!(cache.get("a").await.unwrap().status, ContainerStatus::Running);
    }

    #[test]
    fn version_info_flags_update_only_for_known_remote() {
        let info = VersionInfo::from_payloads(
            Some(VersionPayload::Details {
                version: Some("v1.0".into()),
                build_date: Some("2024-01-01".into()),
                remote_version: None,
            }),
            Some(VersionPayload::Details {
                version: None,
                build_date: None,
                remote_version: Some("v1.1".into()),
            }),
        );
        assert!(info.has_update);
        assert_eq!(info.build_date, "2024-01-01");

        let same = VersionInfo::from_payloads(
            Some(VersionPayload::Text("v1.1".into())),
            Some(VersionPayload::Text("v1.1".into())),
        );
        assert!(!same.has_update);

        let offline = VersionInfo::from_payloads(Some(VersionPayload::Text("v1.1".into())), None);
        assert_eq!(offline.remote_version, "unknown");
        assert!(!offline.has_update);
    }
}
