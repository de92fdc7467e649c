//! Task progress poller
//!
//! Drives a bounded, fixed-interval polling loop for one backend task and
//! reports progress and a single terminal outcome over a channel.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Idle -> Polling{1} -> Polling{2} -> ... -> Completed | Failed | TimedOut
//!   \________________________________________________/
//!                         Cancelled
//! ```

use crate::api::{ApiClient, ApiError};
use crate::progress::{self, ProgressReport, ProgressStatus};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Estimates never reach 100 so a real completion stays distinguishable.
pub const ESTIMATE_CEILING: u8 = 95;

#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn fetch_progress(&self, task_id: &str) -> Result<Value, ApiError>;
}

#[async_trait]
impl ProgressSource for ApiClient {
    async fn fetch_progress(&self, task_id: &str) -> Result<Value, ApiError> {
        self.get_progress(task_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_millis(2000),
        }
    }
}

impl PollConfig {
    /// Longest time a task is observed before giving up.
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub entity_id: String,
    pub attempt: u32,
    pub started_at: Instant,
}

impl TaskHandle {
    pub fn new(task_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            entity_id: entity_id.into(),
            attempt: 0,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { message: String },
    Failed { message: String },
    /// The poller stopped watching; the backend task may still be running.
    TimedOut { attempts: u32 },
    AuthExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollEvent {
    Progress {
        entity_id: String,
        task_id: String,
        attempt: u32,
        message: String,
        percentage: u8,
    },
    Terminal {
        entity_id: String,
        task_id: String,
        outcome: PollOutcome,
    },
}

impl PollEvent {
    pub fn entity_id(&self) -> &str {
        match self {
            PollEvent::Progress { entity_id, .. } | PollEvent::Terminal { entity_id, .. } => {
                entity_id
            }
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            PollEvent::Progress { task_id, .. } | PollEvent::Terminal { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling { attempt: u32 },
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Idle | PollState::Polling { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue { percentage: u8, message: String },
    /// The query itself failed; the attempt is spent but nothing is reported.
    Unobserved,
    Terminal(PollOutcome),
}

#[derive(Debug)]
pub struct PollMachine {
    config: PollConfig,
    state: PollState,
    last_percentage: u8,
}

impl PollMachine {
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            state: PollState::Idle,
            last_percentage: 0,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// Moves to the next attempt, or returns None once terminal or out of budget.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let next = match self.state {
            PollState::Idle => 1,
            PollState::Polling { attempt } => attempt + 1,
            _ => return None,
        };
        if next > self.config.max_attempts {
            self.state = PollState::TimedOut;
            return None;
        }
        self.state = PollState::Polling { attempt: next };
        Some(next)
    }

    pub fn observe(&mut self, report: ProgressReport) -> Step {
        let attempt = match self.state {
            PollState::Polling { attempt } => attempt,
            _ => return Step::Unobserved,
        };

        match report.status {
            ProgressStatus::Failed => {
                self.state = PollState::Failed;
                Step::Terminal(PollOutcome::Failed {
                    message: report.message,
                })
            }
            ProgressStatus::Completed => {
                self.state = PollState::Completed;
                self.last_percentage = 100;
                Step::Terminal(PollOutcome::Completed {
                    message: report.message,
                })
            }
            ProgressStatus::Running => {
                let floor = self.last_percentage.min(ESTIMATE_CEILING);
                let percentage = report
                    .percentage
                    .unwrap_or_else(|| self.estimate(attempt).max(floor));
                self.last_percentage = percentage;
                Step::Continue {
                    percentage,
                    message: report.message,
                }
            }
        }
    }

    pub fn observe_error(&mut self, err: &ApiError) -> Step {
        match err {
            ApiError::AuthExpired => {
                self.state = PollState::Failed;
                Step::Terminal(PollOutcome::AuthExpired)
            }
            // Error envelopes on the progress route describe the task itself
            ApiError::Rejected { code, message } => {
                self.observe(progress::normalize(&json!({ "code": code, "msg": message })))
            }
            _ => Step::Unobserved,
        }
    }

    /// Times out once the last permitted attempt produced no terminal signal.
    pub fn check_budget(&mut self) -> Option<PollOutcome> {
        match self.state {
            PollState::Polling { attempt } if attempt >= self.config.max_attempts => {
                self.state = PollState::TimedOut;
                Some(PollOutcome::TimedOut { attempts: attempt })
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = PollState::Cancelled;
        true
    }

    fn estimate(&self, attempt: u32) -> u8 {
        let max = self.config.max_attempts.max(1) as u64;
        let linear = (attempt as u64 * 100) / max;
        linear.min(ESTIMATE_CEILING as u64) as u8
    }
}

/// Delivers events until closed. Closing happens on cancel or on the
/// terminal event, whichever comes first, so neither can follow the other.
struct Emitter {
    open: Arc<Mutex<bool>>,
    tx: mpsc::UnboundedSender<PollEvent>,
}

impl Emitter {
    fn emit(&self, event: PollEvent) -> bool {
        let open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        *open && self.tx.send(event).is_ok()
    }

    fn finish(&self, event: PollEvent) -> bool {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if !*open {
            return false;
        }
        *open = false;
        self.tx.send(event).is_ok()
    }
}

pub struct PollHandle {
    task_id: String,
    entity_id: String,
    token: CancellationToken,
    open: Arc<Mutex<bool>>,
    join: JoinHandle<PollState>,
}

impl PollHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Stops the poller. No event is delivered once this returns.
    ///
    /// Safe to call repeatedly and after the poller finished on its own.
    /// Returns true if the poller was still live.
    pub fn cancel(&self) -> bool {
        let was_open = {
            let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *open, false)
        };
        self.token.cancel();
        if was_open {
            debug!("Cancelled poller for task {} ({})", self.task_id, self.entity_id);
        }
        was_open
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn join(self) -> PollState {
        self.join.await.unwrap_or(PollState::Cancelled)
    }
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("task_id", &self.task_id)
            .field("entity_id", &self.entity_id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub struct TaskPoller<S: ?Sized> {
    source: Arc<S>,
    config: PollConfig,
}

impl<S: ?Sized> Clone for TaskPoller<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config,
        }
    }
}

impl<S> TaskPoller<S>
where
    S: ProgressSource + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, config: PollConfig) -> Self {
        Self { source, config }
    }

    /// Starts polling `task` in the background.
    ///
    /// The caller must make sure the entity has no other live handle.
    pub fn spawn(&self, task: TaskHandle, events: mpsc::UnboundedSender<PollEvent>) -> PollHandle {
        let token = CancellationToken::new();
        let open = Arc::new(Mutex::new(true));
        let emitter = Emitter {
            open: Arc::clone(&open),
            tx: events,
        };

        let task_id = task.task_id.clone();
        let entity_id = task.entity_id.clone();
        let join = tokio::spawn(run(
            Arc::clone(&self.source),
            self.config,
            task,
            emitter,
            token.clone(),
        ));

        PollHandle {
            task_id,
            entity_id,
            token,
            open,
            join,
        }
    }
}

async fn run<S>(
    source: Arc<S>,
    config: PollConfig,
    mut task: TaskHandle,
    emitter: Emitter,
    token: CancellationToken,
) -> PollState
where
    S: ProgressSource + ?Sized,
{
    let mut machine = PollMachine::new(config);
    debug!(
        "Polling task {} for {} (max {} attempts every {:?})",
        task.task_id, task.entity_id, config.max_attempts, config.interval
    );

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                machine.cancel();
                return machine.state();
            }
            _ = sleep(config.interval) => {}
        }

        let Some(attempt) = machine.begin_attempt() else {
            return machine.state();
        };
        task.attempt = attempt;

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => {
                machine.cancel();
                return machine.state();
            }
            response = source.fetch_progress(&task.task_id) => response,
        };

        let step = match response {
            Ok(value) => machine.observe(progress::normalize(&value)),
            Err(e) => {
                if !matches!(e, ApiError::AuthExpired | ApiError::Rejected { .. }) {
                    warn!(
                        "Progress query {} for task {} failed: {}",
                        attempt, task.task_id, e
                    );
                }
                machine.observe_error(&e)
            }
        };

        match step {
            Step::Terminal(outcome) => {
                info!(
                    "Task {} for {} finished after {} attempts in {}s: {:?}",
                    task.task_id,
                    task.entity_id,
                    attempt,
                    task.started_at.elapsed().as_secs(),
                    outcome
                );
                emitter.finish(PollEvent::Terminal {
                    entity_id: task.entity_id.clone(),
                    task_id: task.task_id.clone(),
                    outcome,
                });
                return machine.state();
            }
            Step::Continue {
                percentage,
                message,
            } => {
                let delivered = emitter.emit(PollEvent::Progress {
                    entity_id: task.entity_id.clone(),
                    task_id: task.task_id.clone(),
                    attempt,
                    message,
                    percentage,
                });
                if !delivered {
                    machine.cancel();
                    return machine.state();
                }
            }
            Step::Unobserved => {}
        }

        if let Some(outcome) = machine.check_budget() {
            info!(
                "Task {} for {} still unfinished after {} attempts, giving up",
                task.task_id, task.entity_id, attempt
            );
            emitter.finish(PollEvent::Terminal {
                entity_id: task.entity_id.clone(),
                task_id: task.task_id.clone(),
                outcome,
            });
            return machine.state();
        }
    }
}
