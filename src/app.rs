//! Action state and reconciliation
//!
//! This module owns the per-container action bookkeeping. Network calls run
//! as background tasks and report back through a channel; poller events come
//! through a second one. Handling an event never waits on another container,
//! so slow or stuck actions only affect their own entry.

use crate::api::{ApiError, UpdateAck};
use crate::config::Settings;
use crate::credentials::AuthEvent;
use crate::docker::{Container, ContainerAction, DockerClient, UpdateRequest};
use crate::poller::{
    PollConfig, PollEvent, PollHandle, PollOutcome, ProgressSource, TaskHandle, TaskPoller,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

const HISTORY_LIMIT: usize = 10;
const NAME_CONFLICT_WORDING: [&str; 5] = ["already in use", "conflict", "already exists", "已存在", "已被使用"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Requested,
    Polling,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionState {
    pub action: ContainerAction,
    pub phase: Phase,
    pub message: String,
    pub percentage: u8,
    operation_id: String,
}

impl ActionState {
    fn new(action: ContainerAction, operation_id: String) -> Self {
        Self {
            action,
            phase: Phase::Requested,
            message: String::new(),
            percentage: 0,
            operation_id,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("container {entity_id} is busy with {action}")]
pub struct Busy {
    pub entity_id: String,
    pub action: ContainerAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    AuthExpired,
    NetworkTimeout,
    BackendRejected { code: Option<i64> },
    PollTimedOut,
    Cancelled,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub entity_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
    pub suggestions: Vec<String>,
}

impl ActionFailure {
    pub fn from_api_error(entity_id: Option<&str>, err: &ApiError) -> Self {
        let entity_id = entity_id.map(str::to_string);
        match err {
            ApiError::AuthExpired | ApiError::Unauthorized => Self {
                entity_id,
                kind: FailureKind::AuthExpired,
                message: "Authentication expired".to_string(),
                suggestions: vec!["Log in again with `dockhand login`".to_string()],
            },
            ApiError::Timeout(_) => Self {
                entity_id,
                kind: FailureKind::NetworkTimeout,
                message: "The backend did not answer in time".to_string(),
                suggestions: vec!["Retry the action".to_string()],
            },
            ApiError::Rejected { code, message } => {
                let suggestions = if is_name_conflict(message) {
                    vec![
                        "Rename the container that already uses this name".to_string(),
                        "Or delete the conflicting container first".to_string(),
                    ]
                } else {
                    Vec::new()
                };
                Self {
                    entity_id,
                    kind: FailureKind::BackendRejected { code: Some(*code) },
                    message: message.clone(),
                    suggestions,
                }
            }
            other => Self {
                entity_id,
                kind: FailureKind::Other,
                message: other.to_string(),
                suggestions: Vec::new(),
            },
        }
    }
}

pub fn is_name_conflict(message: &str) -> bool {
    let lowered = message.to_lowercase();
    NAME_CONFLICT_WORDING.iter().any(|w| lowered.contains(w))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Success {
        entity_id: String,
        message: String,
    },
    /// Outcome unknown rather than failed.
    Warning {
        entity_id: String,
        kind: FailureKind,
        message: String,
    },
    Error(ActionFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Registered,
    Running,
    Success,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UserOperation {
    pub id: String,
    pub description: String,
    pub entity_id: Option<String>,
    pub status: OperationStatus,
    pub started_at: Instant,
    pub completed_at: Option<Instant>,
}

impl UserOperation {
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

#[derive(Debug)]
pub enum AppEvent {
    CommandFinished {
        entity_id: String,
        operation_id: String,
        result: Result<(), ApiError>,
    },
    UpdateSubmitted {
        entity_id: String,
        operation_id: String,
        result: Result<UpdateAck, ApiError>,
    },
    RefreshDue,
    Refreshed(Result<usize, ApiError>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub dispatched: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    pub confirm_refresh_delay: Duration,
    pub auto_refresh_interval: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            confirm_refresh_delay: Duration::from_millis(1500),
            auto_refresh_interval: Duration::from_secs(10),
        }
    }
}

pub struct Dashboard {
    client: DockerClient,
    poller: TaskPoller<dyn ProgressSource>,
    settings: ReconcilerSettings,
    actions: HashMap<String, ActionState>,
    /// Last terminal state per entity, kept until the next action on it.
    outcomes: HashMap<String, ActionState>,
    active_tasks: HashMap<String, (TaskHandle, PollHandle)>,
    notices: VecDeque<Notice>,
    history: Vec<UserOperation>,
    event_tx: mpsc::UnboundedSender<AppEvent>,
    event_rx: mpsc::UnboundedReceiver<AppEvent>,
    poll_tx: mpsc::UnboundedSender<PollEvent>,
    poll_rx: mpsc::UnboundedReceiver<PollEvent>,
    refresh_in_flight: bool,
    refresh_pending: bool,
    last_refresh: Option<Instant>,
}

impl Dashboard {
    /// Dashboard polling task progress through the client's own gateway.
    pub fn new(client: DockerClient, poll: PollConfig, settings: ReconcilerSettings) -> Self {
        let source: Arc<dyn ProgressSource> = Arc::new(client.api().clone());
        Self::with_poller(client, TaskPoller::new(source, poll), settings)
    }

    pub fn from_settings(client: DockerClient, settings: &Settings) -> Self {
        Self::new(
            client,
            settings.poll,
            ReconcilerSettings {
                confirm_refresh_delay: settings.confirm_refresh_delay,
                auto_refresh_interval: settings.auto_refresh_interval,
            },
        )
    }

    pub fn with_poller(
        client: DockerClient,
        poller: TaskPoller<dyn ProgressSource>,
        settings: ReconcilerSettings,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        Self {
            client,
            poller,
            settings,
            actions: HashMap::new(),
            outcomes: HashMap::new(),
            active_tasks: HashMap::new(),
            notices: VecDeque::new(),
            history: Vec::new(),
            event_tx,
            event_rx,
            poll_tx,
            poll_rx,
            refresh_in_flight: false,
            refresh_pending: false,
            last_refresh: None,
        }
    }

    pub fn client(&self) -> &DockerClient {
        &self.client
    }

    pub async fn containers(&self) -> Vec<Container> {
        self.client.cache().snapshot().await
    }

    pub fn action_state(&self, entity_id: &str) -> Option<&ActionState> {
        self.actions.get(entity_id)
    }

    /// How the last finished action on `entity_id` ended (`Done` or `Failed`).
    pub fn last_outcome(&self, entity_id: &str) -> Option<&ActionState> {
        self.outcomes.get(entity_id)
    }

    pub fn action_states(&self) -> &HashMap<String, ActionState> {
        &self.actions
    }

    pub fn active_task(&self, entity_id: &str) -> Option<&TaskHandle> {
        self.active_tasks.get(entity_id).map(|(task, _)| task)
    }

    pub fn is_idle(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn history(&self) -> &[UserOperation] {
        &self.history
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.client.api().credentials().subscribe()
    }

    // ============== Refresh ==============

    pub async fn refresh(&mut self) -> Result<usize, ApiError> {
        let count = self.client.refresh().await?;
        self.last_refresh = Some(Instant::now());
        Ok(count)
    }

    pub fn should_auto_refresh(&self) -> bool {
        match self.last_refresh {
            Some(last) => last.elapsed() > self.settings.auto_refresh_interval,
            None => true,
        }
    }

    pub async fn maybe_auto_refresh(&mut self) -> Option<Result<usize, ApiError>> {
        if self.should_auto_refresh() {
            Some(self.refresh().await)
        } else {
            None
        }
    }

    /// Reloads the list in the background; the result arrives as an event.
    ///
    /// A request made while a reload is running is queued and issued once
    /// that reload's result is applied, since it may have read older state.
    pub fn request_refresh(&mut self) {
        if self.refresh_in_flight {
            self.refresh_pending = true;
            return;
        }
        self.refresh_in_flight = true;
        let client = self.client.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = client.refresh().await;
            let _ = tx.send(AppEvent::Refreshed(result));
        });
    }

    // ============== Actions ==============

    /// Records a new action for `entity_id`, or reports it busy and changes nothing.
    pub fn begin_action(
        &mut self,
        entity_id: &str,
        action: ContainerAction,
    ) -> Result<&ActionState, Busy> {
        if let Some(existing) = self.actions.get(entity_id) {
            return Err(Busy {
                entity_id: entity_id.to_string(),
                action: existing.action,
            });
        }
        self.outcomes.remove(entity_id);
        let operation_id = self.register_operation(
            format!("{} container '{}'", action, entity_id),
            Some(entity_id.to_string()),
        );
        Ok(self
            .actions
            .entry(entity_id.to_string())
            .or_insert_with(|| ActionState::new(action, operation_id)))
    }

    /// Shows the status `action` will lead to right away and schedules a
    /// refresh to confirm it. Polled actions are left alone.
    pub async fn apply_optimistic_transition(
        &self,
        entity_id: &str,
        action: ContainerAction,
    ) -> bool {
        let Some(expected) = action.expected_status() else {
            return false;
        };
        let patched = self
            .client
            .cache()
            .patch(entity_id, |c| c.status = expected)
            .await;

        let tx = self.event_tx.clone();
        let delay = self.settings.confirm_refresh_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(AppEvent::RefreshDue);
        });
        patched
    }

    /// Starts, stops or restarts a container without waiting for the result.
    /// `Update` re-pulls the image the container runs and is polled.
    pub async fn run_command(
        &mut self,
        entity_id: &str,
        action: ContainerAction,
    ) -> Result<(), Busy> {
        let Some(command) = action.command() else {
            let request = match self.client.cache().get(entity_id).await {
                Some(container) => UpdateRequest::same_image(&container),
                None => {
                    self.notices.push_back(Notice::Error(ActionFailure {
                        entity_id: Some(entity_id.to_string()),
                        kind: FailureKind::Other,
                        message: "Container not found, refresh the list first".to_string(),
                        suggestions: Vec::new(),
                    }));
                    return Ok(());
                }
            };
            return self.update(entity_id, request);
        };

        let operation_id = self.begin_action(entity_id, action)?.operation_id.clone();
        self.start_operation(&operation_id);
        self.apply_optimistic_transition(entity_id, action).await;

        let client = self.client.clone();
        let tx = self.event_tx.clone();
        let entity = entity_id.to_string();
        tokio::spawn(async move {
            let result = client.run_command(&entity, command).await;
            let _ = tx.send(AppEvent::CommandFinished {
                entity_id: entity,
                operation_id,
                result,
            });
        });
        Ok(())
    }

    /// Submits an update job; progress is polled once the backend hands out a task id.
    pub fn update(&mut self, entity_id: &str, request: UpdateRequest) -> Result<(), Busy> {
        let operation_id = self
            .begin_action(entity_id, ContainerAction::Update)?
            .operation_id
            .clone();
        self.start_operation(&operation_id);

        let client = self.client.clone();
        let tx = self.event_tx.clone();
        let entity = entity_id.to_string();
        tokio::spawn(async move {
            let result = client.submit_update(&entity, &request).await;
            let _ = tx.send(AppEvent::UpdateSubmitted {
                entity_id: entity,
                operation_id,
                result,
            });
        });
        Ok(())
    }

    /// Dispatches `action` to every id independently. Busy ids are skipped.
    pub async fn run_batch(&mut self, ids: &[String], action: ContainerAction) -> BatchReport {
        let mut report = BatchReport::default();
        for id in ids {
            if self.actions.contains_key(id) {
                self.notices.push_back(Notice::Info(format!(
                    "Skipped '{}': an action is already in progress",
                    id
                )));
                report.skipped.push(id.clone());
                continue;
            }
            match self.run_command(id, action).await {
                Ok(()) if self.actions.contains_key(id) => report.dispatched.push(id.clone()),
                _ => report.skipped.push(id.clone()),
            }
        }
        report
    }

    pub async fn rename(&mut self, entity_id: &str, new_name: &str) -> Result<(), ActionFailure> {
        let operation_id = self.register_operation(
            format!("Rename container '{}' to '{}'", entity_id, new_name),
            Some(entity_id.to_string()),
        );
        self.start_operation(&operation_id);
        match self.client.rename(entity_id, new_name).await {
            Ok(()) => {
                self.complete_operation(&operation_id, true, None);
                self.request_refresh();
                Ok(())
            }
            Err(e) => {
                error!("Failed to rename container {}: {}", entity_id, e);
                let failure = ActionFailure::from_api_error(Some(entity_id), &e);
                self.complete_operation(&operation_id, false, Some(failure.message.clone()));
                Err(failure)
            }
        }
    }

    /// Drops whatever is in flight for `entity_id` without reporting anything.
    pub fn cancel(&mut self, entity_id: &str) -> bool {
        let poll_cancelled = self
            .active_tasks
            .remove(entity_id)
            .map(|(_, poll)| poll.cancel())
            .unwrap_or(false);
        match self.actions.remove(entity_id) {
            Some(state) => {
                self.cancel_operation(&state.operation_id);
                true
            }
            None => poll_cancelled,
        }
    }

    pub fn cancel_all(&mut self) {
        let ids: Vec<String> = self.actions.keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    // ============== Event handling ==============

    /// Waits for the next background result and applies it.
    pub async fn process_next(&mut self) {
        tokio::select! {
            Some(event) = self.poll_rx.recv() => self.handle_poll_event(event),
            Some(event) = self.event_rx.recv() => self.handle_event(event),
        }
    }

    /// Applies every result that is already waiting.
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.poll_rx.try_recv() {
            self.handle_poll_event(event);
            handled += 1;
        }
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Processes events until no action is outstanding.
    pub async fn settle(&mut self) {
        while !self.is_idle() {
            self.process_next().await;
        }
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::CommandFinished {
                entity_id,
                operation_id,
                result,
            } => self.on_command_finished(&entity_id, &operation_id, result),
            AppEvent::UpdateSubmitted {
                entity_id,
                operation_id,
                result,
            } => self.on_update_submitted(&entity_id, &operation_id, result),
            AppEvent::RefreshDue => self.request_refresh(),
            AppEvent::Refreshed(result) => {
                self.refresh_in_flight = false;
                match result {
                    Ok(_) => self.last_refresh = Some(Instant::now()),
                    Err(e) => {
                        warn!("Background refresh failed: {}", e);
                        if matches!(e, ApiError::AuthExpired) {
                            self.notices
                                .push_back(Notice::Error(ActionFailure::from_api_error(None, &e)));
                        }
                    }
                }
                if std::mem::take(&mut self.refresh_pending) {
                    debug!("Issuing queued refresh");
                    self.request_refresh();
                }
            }
        }
    }

    pub fn handle_poll_event(&mut self, event: PollEvent) {
        let current = self
            .active_tasks
            .get(event.entity_id())
            .map(|(task, _)| task.task_id == event.task_id())
            .unwrap_or(false);
        if !current {
            debug!(
                "Ignoring event for stale task {} of {}",
                event.task_id(),
                event.entity_id()
            );
            return;
        }

        match event {
            PollEvent::Progress {
                entity_id,
                attempt,
                message,
                percentage,
                ..
            } => self.on_poll_update(&entity_id, attempt, message, percentage),
            PollEvent::Terminal {
                entity_id, outcome, ..
            } => self.on_poll_terminal(&entity_id, outcome),
        }
    }

    fn owns(&self, entity_id: &str, operation_id: &str) -> bool {
        self.actions
            .get(entity_id)
            .map(|s| s.operation_id == operation_id)
            .unwrap_or(false)
    }

    /// Moves the entity's action to its terminal phase and out of the active map.
    fn finish_action(&mut self, entity_id: &str, phase: Phase, message: &str) {
        let Some(mut state) = self.actions.remove(entity_id) else {
            return;
        };
        state.phase = phase;
        state.message = message.to_string();
        if phase == Phase::Done {
            state.percentage = 100;
        }
        debug!("{} of {} ended {:?}", state.action, entity_id, phase);
        self.outcomes.insert(entity_id.to_string(), state);
    }

    fn on_command_finished(
        &mut self,
        entity_id: &str,
        operation_id: &str,
        result: Result<(), ApiError>,
    ) {
        if !self.owns(entity_id, operation_id) {
            debug!("Dropping result of cancelled operation {}", operation_id);
            return;
        }
        let Some(action) = self.actions.get(entity_id).map(|s| s.action) else {
            return;
        };

        match result {
            Ok(()) => {
                info!("Container {} {}", entity_id, action.past_tense());
                let message = format!("Container '{}' {}", entity_id, action.past_tense());
                self.finish_action(entity_id, Phase::Done, &message);
                self.complete_operation(operation_id, true, None);
                self.notices.push_back(Notice::Success {
                    entity_id: entity_id.to_string(),
                    message,
                });
            }
            Err(e) if e.is_timeout() => {
                // Outcome unknown, so no terminal phase is recorded
                warn!("{} of {} timed out: {}", action, entity_id, e);
                self.actions.remove(entity_id);
                self.complete_operation(operation_id, false, Some("timed out".to_string()));
                self.notices.push_back(Notice::Warning {
                    entity_id: entity_id.to_string(),
                    kind: FailureKind::NetworkTimeout,
                    message: format!(
                        "No answer to {} of '{}'; trigger it again if the status does not change",
                        action, entity_id
                    ),
                });
                // The optimistic status may be wrong
                self.request_refresh();
            }
            Err(e) => {
                error!("Failed to {} container {}: {}", action, entity_id, e);
                let failure = ActionFailure::from_api_error(Some(entity_id), &e);
                self.finish_action(entity_id, Phase::Failed, &failure.message);
                self.complete_operation(operation_id, false, Some(failure.message.clone()));
                self.notices.push_back(Notice::Error(failure));
                self.request_refresh();
            }
        }
    }

    fn on_update_submitted(
        &mut self,
        entity_id: &str,
        operation_id: &str,
        result: Result<UpdateAck, ApiError>,
    ) {
        if !self.owns(entity_id, operation_id) {
            debug!("Dropping update acknowledgement of cancelled operation {}", operation_id);
            return;
        }

        match result {
            Ok(UpdateAck {
                task_id: Some(task_id),
            }) => self.start_polling(entity_id, task_id),
            Ok(UpdateAck { task_id: None }) => {
                // Backend finished synchronously
                self.on_poll_terminal(
                    entity_id,
                    PollOutcome::Completed {
                        message: String::new(),
                    },
                );
            }
            Err(e) if e.is_timeout() => {
                warn!("Update submission for {} timed out: {}", entity_id, e);
                self.actions.remove(entity_id);
                self.complete_operation(operation_id, false, Some("outcome unknown".to_string()));
                self.notices.push_back(Notice::Warning {
                    entity_id: entity_id.to_string(),
                    kind: FailureKind::NetworkTimeout,
                    message: format!(
                        "The update of '{}' may have been accepted and still be running; refresh in a while to check",
                        entity_id
                    ),
                });
            }
            Err(e) => {
                error!("Failed to submit update for {}: {}", entity_id, e);
                let failure = ActionFailure::from_api_error(Some(entity_id), &e);
                self.finish_action(entity_id, Phase::Failed, &failure.message);
                self.complete_operation(operation_id, false, Some(failure.message.clone()));
                self.notices.push_back(Notice::Error(failure));
            }
        }
    }

    fn start_polling(&mut self, entity_id: &str, task_id: String) {
        if let Some((old, poll)) = self.active_tasks.remove(entity_id) {
            warn!(
                "Replacing task {} of {} with {}",
                old.task_id, entity_id, task_id
            );
            poll.cancel();
        }

        let task = TaskHandle::new(task_id, entity_id);
        let poll = self.poller.spawn(task.clone(), self.poll_tx.clone());
        if let Some(state) = self.actions.get_mut(entity_id) {
            state.phase = Phase::Polling;
            state.message = format!("Waiting for task {}", task.task_id);
        }
        self.active_tasks.insert(entity_id.to_string(), (task, poll));
    }

    pub fn on_poll_update(&mut self, entity_id: &str, attempt: u32, message: String, percentage: u8) {
        if let Some((task, _)) = self.active_tasks.get_mut(entity_id) {
            task.attempt = attempt;
        }
        if let Some(state) = self.actions.get_mut(entity_id) {
            state.phase = Phase::Polling;
            state.percentage = percentage;
            if !message.is_empty() {
                state.message = message;
            }
        }
    }

    pub fn on_poll_terminal(&mut self, entity_id: &str, outcome: PollOutcome) {
        self.active_tasks.remove(entity_id);
        let operation_id = self.actions.get(entity_id).map(|s| s.operation_id.clone());

        let (success, notice) = match outcome {
            PollOutcome::Completed { message } => (
                true,
                Notice::Success {
                    entity_id: entity_id.to_string(),
                    message: if message.is_empty() {
                        format!("Container '{}' updated", entity_id)
                    } else {
                        message
                    },
                },
            ),
            PollOutcome::Failed { message } => (
                false,
                Notice::Error(ActionFailure {
                    entity_id: Some(entity_id.to_string()),
                    kind: FailureKind::BackendRejected { code: None },
                    suggestions: if is_name_conflict(&message) {
                        vec![
                            "Rename the container that already uses this name".to_string(),
                            "Or delete the conflicting container first".to_string(),
                        ]
                    } else {
                        Vec::new()
                    },
                    message,
                }),
            ),
            PollOutcome::TimedOut { attempts } => (
                false,
                Notice::Error(ActionFailure {
                    entity_id: Some(entity_id.to_string()),
                    kind: FailureKind::PollTimedOut,
                    message: format!(
                        "Status of '{}' unknown after {} progress checks, please check manually",
                        entity_id, attempts
                    ),
                    suggestions: vec!["Refresh the container list".to_string()],
                }),
            ),
            PollOutcome::AuthExpired => (
                false,
                Notice::Error(ActionFailure::from_api_error(
                    Some(entity_id),
                    &ApiError::AuthExpired,
                )),
            ),
        };

        let (phase, message) = match &notice {
            Notice::Error(failure) => (Phase::Failed, failure.message.clone()),
            Notice::Success { message, .. } => (Phase::Done, message.clone()),
            _ => (Phase::Failed, String::new()),
        };
        self.finish_action(entity_id, phase, &message);
        if let Some(operation_id) = operation_id {
            let error_msg = (!success).then_some(message);
            self.complete_operation(&operation_id, success, error_msg);
        }
        self.notices.push_back(notice);
        self.request_refresh();
    }

    // ============== Operation history ==============

    pub fn register_operation(&mut self, description: String, entity_id: Option<String>) -> String {
        let operation_id = Uuid::new_v4().to_string();
        self.history.push(UserOperation {
            id: operation_id.clone(),
            description,
            entity_id,
            status: OperationStatus::Registered,
            started_at: Instant::now(),
            completed_at: None,
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }
        operation_id
    }

    fn start_operation(&mut self, operation_id: &str) {
        if let Some(op) = self.history.iter_mut().find(|o| o.id == operation_id) {
            op.status = OperationStatus::Running;
            op.started_at = Instant::now();
        }
    }

    fn complete_operation(&mut self, operation_id: &str, success: bool, error_msg: Option<String>) {
        if let Some(op) = self.history.iter_mut().find(|o| o.id == operation_id) {
            op.status = if success {
                OperationStatus::Success
            } else {
                OperationStatus::Failed(error_msg.unwrap_or_default())
            };
            op.completed_at = Some(Instant::now());
        }
    }

    fn cancel_operation(&mut self, operation_id: &str) {
        if let Some(op) = self.history.iter_mut().find(|o| o.id == operation_id) {
            op.status = OperationStatus::Cancelled;
            op.completed_at = Some(Instant::now());
        }
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        for (_, (_, poll)) in self.active_tasks.drain() {
            poll.cancel();
        }
    }
}
