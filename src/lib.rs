//! Dockhand - console client for a Docker Copilot backend
//!
//! Container lifecycle actions with optimistic status, background tracking of
//! long-running update tasks, and the credential handling around them.

pub mod api;
pub mod app;
pub mod config;
pub mod credentials;
pub mod docker;
pub mod poller;
pub mod progress;

pub use api::{ApiClient, ApiError};
pub use app::{ActionFailure, ActionState, Dashboard, FailureKind, Notice, Phase};
pub use config::Settings;
pub use credentials::{AuthEvent, CredentialStore};
pub use docker::{Container, ContainerAction, ContainerStatus, DockerClient, UpdateRequest};
pub use poller::{PollConfig, PollEvent, PollOutcome, TaskPoller};
