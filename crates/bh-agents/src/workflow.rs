//! Workflow -- drives one error-resolution task through
//! Locate -> Propose -> Verify -> AwaitApproval, pauses, and on approval
//! continues with Publish.
//!
//! Every merged update is committed to the [`TaskStore`] before the next
//! stage starts, so the pause at the approval gate can outlive the process
//! that started the run. Updates are also broadcast on an [`UpdateBus`].

use std::sync::Arc;

use bh_core::collaborators::{
    CodeLocator, CollaboratorError, FixProposer, IssueTracker, RepoHost, SandboxRunner,
};
use bh_core::config::{Config, ConfigError, Credentials};
use bh_core::store::{StoreError, TaskClaim, TaskStore};
use bh_core::types::{
    ApprovalState, Decision, LogLevel, RepoRef, StageName, Task, TaskUpdate, WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{StageUpdate, UpdateBus};
use crate::stages::{
    ApprovalGate, LocateStage, ProposeStage, PublishStage, Stage, StageError, VerifyStage,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("error report not found: {0}")]
    NotFound(String),
    #[error("stage {stage} failed: {source}")]
    StageExecution {
        stage: StageName,
        #[source]
        source: StageError,
    },
    #[error("invalid transition for task {task_id}: {reason}")]
    InvalidTransition { task_id: String, reason: String },
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid initial state: {0}")]
    InvalidInitialState(String),
    #[error("task store error: {0}")]
    Store(#[from] StoreError),
    #[error("issue tracker error: {0}")]
    IssueTracker(#[source] CollaboratorError),
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

fn invalid_transition(task_id: &str, reason: impl ToString) -> WorkflowError {
    WorkflowError::InvalidTransition {
        task_id: task_id.to_string(),
        reason: reason.to_string(),
    }
}

/// A lost compare-and-swap or a held claim means someone else is moving
/// the task.
fn store_error(task_id: &str, err: StoreError) -> WorkflowError {
    if matches!(
        err,
        StoreError::Conflict { .. } | StoreError::AlreadyExists(_) | StoreError::Busy { .. }
    ) {
        invalid_transition(task_id, err)
    } else {
        WorkflowError::Store(err)
    }
}

// ---------------------------------------------------------------------------
// Pre-flight
// ---------------------------------------------------------------------------

/// Settings every run needs, checked before any stage executes.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub repository: RepoRef,
    pub credentials: Credentials,
}

/// Fail fast on missing settings or credentials.
pub fn preflight(config: &Config) -> Result<Preflight> {
    config.validate()?;
    let repository = config.require_repository()?;
    let credentials = Credentials::resolve(config)?;
    Ok(Preflight {
        repository,
        credentials,
    })
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// The external services a workflow talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub issue_tracker: Arc<dyn IssueTracker>,
    pub locator: Arc<dyn CodeLocator>,
    pub proposer: Arc<dyn FixProposer>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub repo_host: Arc<dyn RepoHost>,
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub branch_prefix: String,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            branch_prefix: bh_core::branch::DEFAULT_BRANCH_PREFIX.to_string(),
        }
    }
}

impl From<&Config> for WorkflowSettings {
    fn from(config: &Config) -> Self {
        Self {
            branch_prefix: config.github.branch_prefix.clone(),
        }
    }
}

/// What one `start` or `resume` call did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub status: WorkflowStatus,
    /// Every merged update, in order.
    pub updates: Vec<StageUpdate>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct Workflow {
    store: Arc<dyn TaskStore>,
    issue_tracker: Arc<dyn IssueTracker>,
    pre_gate: Vec<Box<dyn Stage>>,
    publish: PublishStage,
    bus: UpdateBus,
}

impl Workflow {
    pub fn new(
        store: Arc<dyn TaskStore>,
        collaborators: Collaborators,
        settings: WorkflowSettings,
    ) -> Self {
        let pre_gate: Vec<Box<dyn Stage>> = vec![
            Box::new(LocateStage::new(collaborators.locator)),
            Box::new(ProposeStage::new(collaborators.proposer)),
            Box::new(VerifyStage::new(collaborators.sandbox)),
            Box::new(ApprovalGate),
        ];
        Self {
            store,
            issue_tracker: collaborators.issue_tracker,
            pre_gate,
            publish: PublishStage::new(collaborators.repo_host, settings.branch_prefix),
            bus: UpdateBus::new(),
        }
    }

    /// Receive every update merged from now on, for any task.
    pub fn subscribe(&self) -> flume::Receiver<StageUpdate> {
        self.bus.subscribe()
    }

    /// Receive updates for one task only.
    pub fn subscribe_task(&self, task_id: &str) -> flume::Receiver<StageUpdate> {
        self.bus.subscribe_task(task_id)
    }

    /// Every run holds the task's claim from first read to last commit, so
    /// runs in this or another process never interleave on one task.
    fn claim(&self, task_id: &str) -> Result<TaskClaim> {
        self.store
            .claim(task_id)
            .map_err(|e| store_error(task_id, e))
    }

    /// Fetch an error report and run a new task for it up to the approval
    /// gate. The task id defaults to the error id.
    pub async fn investigate(
        &self,
        error_id: &str,
        repository: RepoRef,
        task_id: Option<&str>,
    ) -> Result<RunReport> {
        let report = self
            .issue_tracker
            .fetch_error_detail(error_id)
            .await
            .map_err(|e| match e {
                CollaboratorError::NotFound(_) => WorkflowError::NotFound(error_id.to_string()),
                other => WorkflowError::IssueTracker(other),
            })?;
        let headline = report.headline();
        let mut task = Task::new(task_id.unwrap_or(error_id), report, repository);
        task.log(None, LogLevel::Info, format!("Fetched error report: {headline}"));
        self.start(task).await
    }

    /// Run a fresh task through Locate, Propose, Verify and the approval
    /// gate, returning once it is paused.
    ///
    /// An id whose stored task failed before the approval gate is restarted
    /// from scratch; any other existing id is rejected. A task that failed
    /// after approval keeps its approval and is retried through
    /// [`Workflow::resume`].
    pub async fn start(&self, initial: Task) -> Result<RunReport> {
        validate_initial(&initial)?;
        let _claim = self.claim(&initial.id)?;

        let mut task = initial;
        match self.store.load(&task.id)? {
            None => self
                .store
                .insert(&mut task)
                .map_err(|e| store_error(&task.id, e))?,
            Some(existing)
                if existing.status == WorkflowStatus::Failed
                    && existing.approval == ApprovalState::Pending =>
            {
                info!(task_id = %task.id, "restarting failed task");
                task.revision = existing.revision;
                let mut log = existing.log;
                log.append(&mut task.log);
                task.log = log;
                task.log(None, LogLevel::Info, "Restarting after a failed run");
                self.commit(&mut task)?;
            }
            Some(existing) if existing.is_publish_pending() => {
                return Err(invalid_transition(
                    &task.id,
                    "the fix is already approved; approve again to retry publishing",
                ));
            }
            Some(existing) => {
                return Err(invalid_transition(
                    &task.id,
                    format!("task already exists in state {}", existing.status),
                ));
            }
        }

        let mut updates = Vec::new();
        for stage in &self.pre_gate {
            self.run_stage(&mut task, stage.as_ref(), &mut updates)
                .await?;
        }
        info!(task_id = %task.id, "task paused at approval gate");
        Ok(RunReport {
            task_id: task.id,
            status: task.status,
            updates,
        })
    }

    /// Record the reviewer's decision for a paused task. On approval the
    /// Publish stage runs and the task completes; on rejection it halts.
    ///
    /// Only one decision is ever accepted per task: later calls fail with
    /// [`WorkflowError::InvalidTransition`] and change nothing. The one
    /// exception is an approved task whose publish never completed; approving
    /// it again re-runs Publish alone, which the repo host makes idempotent
    /// per branch.
    pub async fn resume(&self, task_id: &str, decision: Decision) -> Result<RunReport> {
        let _claim = self.claim(task_id)?;

        let mut task = self.get_state(task_id)?;
        let mut updates = Vec::new();
        if task.is_awaiting_decision() {
            self.record_decision(&mut task, decision, &mut updates)?;
            if decision == Decision::Rejected {
                return Ok(RunReport {
                    task_id: task.id,
                    status: task.status,
                    updates,
                });
            }
        } else if decision == Decision::Approved && task.is_publish_pending() {
            info!(task_id, status = %task.status, "retrying publish for an approved task");
            task.reopen_for_publish()
                .map_err(|e| invalid_transition(task_id, e))?;
            task.log(
                Some(StageName::Publish),
                LogLevel::Info,
                "Retrying publish for the approved fix",
            );
            self.commit(&mut task)?;
        } else {
            return Err(invalid_transition(
                task_id,
                format!(
                    "task is {} with approval {}, not awaiting a decision",
                    task.status, task.approval
                ),
            ));
        }

        self.run_stage(&mut task, &self.publish, &mut updates)
            .await?;

        let done = TaskUpdate::new().with_log(
            StageName::Publish,
            LogLevel::Success,
            "Workflow completed",
        );
        task.apply(done.clone())
            .map_err(|e| invalid_transition(task_id, e))?;
        task.transition(WorkflowStatus::Completed)
            .map_err(|e| invalid_transition(task_id, e))?;
        self.commit(&mut task)?;
        self.emit(&task, StageName::Publish, done, &mut updates);
        info!(task_id, "task completed");

        Ok(RunReport {
            task_id: task.id,
            status: task.status,
            updates,
        })
    }

    fn record_decision(
        &self,
        task: &mut Task,
        decision: Decision,
        updates: &mut Vec<StageUpdate>,
    ) -> Result<()> {
        let task_id = task.id.clone();
        let (level, message) = match decision {
            Decision::Approved => (LogLevel::Success, "Fix approved"),
            Decision::Rejected => (
                LogLevel::Warning,
                "Fix rejected, no pull request will be opened",
            ),
        };
        let decided = TaskUpdate {
            approval: Some(ApprovalState::from(decision)),
            ..TaskUpdate::new()
        }
        .with_log(StageName::AwaitApproval, level, message);
        task.apply(decided.clone())
            .map_err(|e| invalid_transition(&task_id, e))?;
        if decision == Decision::Rejected {
            task.transition(WorkflowStatus::Rejected)
                .map_err(|e| invalid_transition(&task_id, e))?;
        }
        self.commit(task)?;
        info!(task_id = %task_id, approval = %task.approval, "approval decision recorded");
        self.emit(task, StageName::AwaitApproval, decided, updates);
        Ok(())
    }

    /// Last persisted snapshot.
    pub fn get_state(&self, task_id: &str) -> Result<Task> {
        self.store
            .load(task_id)?
            .ok_or_else(|| WorkflowError::UnknownTask(task_id.to_string()))
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        Ok(self.store.list()?)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn commit(&self, task: &mut Task) -> Result<()> {
        self.store
            .commit(task)
            .map_err(|e| store_error(&task.id, e))
    }

    fn emit(
        &self,
        task: &Task,
        stage: StageName,
        update: TaskUpdate,
        updates: &mut Vec<StageUpdate>,
    ) {
        let event = StageUpdate {
            task_id: task.id.clone(),
            stage,
            status: task.status,
            update,
        };
        self.bus.publish(event.clone());
        updates.push(event);
    }

    /// Enter the stage's status, run it, merge its update and persist. A
    /// stage error or an update that breaks a task invariant moves the task
    /// to `Failed` with everything merged so far intact.
    async fn run_stage(
        &self,
        task: &mut Task,
        stage: &dyn Stage,
        updates: &mut Vec<StageUpdate>,
    ) -> Result<()> {
        let name = stage.name();
        task.transition(name.status())
            .map_err(|e| invalid_transition(&task.id, e))?;
        self.commit(task)?;
        info!(task_id = %task.id, stage = %name, "stage started");

        let outcome = match stage.run(task).await {
            Ok(update) => task
                .apply(update.clone())
                .map(|()| update)
                .map_err(StageError::from),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(update) => {
                self.commit(task)?;
                info!(task_id = %task.id, stage = %name, "stage completed");
                self.emit(task, name, update, updates);
                Ok(())
            }
            Err(source) => {
                warn!(task_id = %task.id, stage = %name, error = %source, "stage failed");
                task.record_failure(name, source.to_string());
                let failure = TaskUpdate {
                    log: task.log.last().cloned().into_iter().collect(),
                    ..TaskUpdate::new()
                };
                self.commit(task)?;
                self.emit(task, name, failure, updates);
                Err(WorkflowError::StageExecution {
                    stage: name,
                    source,
                })
            }
        }
    }
}

fn validate_initial(task: &Task) -> Result<()> {
    if task.id.trim().is_empty() {
        return Err(WorkflowError::InvalidInitialState("task id is empty".into()));
    }
    if task.status != WorkflowStatus::Created {
        return Err(WorkflowError::InvalidInitialState(format!(
            "task must start as created, got {}",
            task.status
        )));
    }
    if task.approval != ApprovalState::Pending {
        return Err(WorkflowError::InvalidInitialState(format!(
            "approval must start pending, got {}",
            task.approval
        )));
    }
    if task.pull_request.is_some() {
        return Err(WorkflowError::InvalidInitialState(
            "a new task cannot already have a pull request".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
