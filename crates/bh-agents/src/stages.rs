//! The five workflow stages.
//!
//! A stage reads the current task snapshot and returns only the fields it
//! changes. It never writes the task itself; the workflow merges the update.

use std::sync::Arc;

use async_trait::async_trait;
use bh_core::branch::{commit_message, derive_branch_name};
use bh_core::collaborators::{
    CodeLocator, CollaboratorError, DraftPullRequest, FileChange, FixProposer, RepoHost,
    SandboxRunner, VerifyRequest,
};
use bh_core::proposal;
use bh_core::types::{
    ApprovalState, LogLevel, SandboxResult, StageName, Task, TaskInvariantError, TaskUpdate,
};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("stage produced an invalid update: {0}")]
    InvalidUpdate(#[from] TaskInvariantError),
}

pub type Result<T> = std::result::Result<T, StageError>;

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Compute this stage's partial update from a read-only snapshot.
    async fn run(&self, task: &Task) -> Result<TaskUpdate>;
}

// ---------------------------------------------------------------------------
// Locate
// ---------------------------------------------------------------------------

pub struct LocateStage {
    locator: Arc<dyn CodeLocator>,
}

impl LocateStage {
    pub fn new(locator: Arc<dyn CodeLocator>) -> Self {
        Self { locator }
    }
}

#[async_trait]
impl Stage for LocateStage {
    fn name(&self) -> StageName {
        StageName::Locate
    }

    async fn run(&self, task: &Task) -> Result<TaskUpdate> {
        let outcome = self.locator.locate(&task.repository, &task.error_report).await;
        let (level, message) = if outcome.candidates.is_empty() {
            (
                LogLevel::Warning,
                format!("No candidate locations found: {}", outcome.summary),
            )
        } else {
            let paths: Vec<&str> = outcome.candidates.iter().map(|c| c.path.as_str()).collect();
            (
                LogLevel::Info,
                format!(
                    "Identified {} candidate location(s): {}",
                    paths.len(),
                    paths.join(", ")
                ),
            )
        };
        Ok(TaskUpdate {
            candidate_locations: Some(outcome.candidates),
            locator_summary: Some(outcome.summary),
            ..TaskUpdate::new()
        }
        .with_log(StageName::Locate, level, message))
    }
}

// ---------------------------------------------------------------------------
// Propose
// ---------------------------------------------------------------------------

pub struct ProposeStage {
    proposer: Arc<dyn FixProposer>,
}

impl ProposeStage {
    pub fn new(proposer: Arc<dyn FixProposer>) -> Self {
        Self { proposer }
    }
}

#[async_trait]
impl Stage for ProposeStage {
    fn name(&self) -> StageName {
        StageName::Propose
    }

    async fn run(&self, task: &Task) -> Result<TaskUpdate> {
        let raw = self
            .proposer
            .propose(
                &task.error_report,
                &task.candidate_locations,
                task.locator_summary.as_deref(),
            )
            .await?;
        let parsed = proposal::parse(&raw);

        let (level, message) = match parsed.file_change() {
            Some((path, _)) => (
                LogLevel::Info,
                format!("Drafted fix for {path}: {}", parsed.pr_title),
            ),
            None => (
                LogLevel::Warning,
                format!(
                    "Drafted proposal without a file change: {}",
                    parsed.pr_title
                ),
            ),
        };
        Ok(TaskUpdate {
            raw_proposal: Some(raw),
            fix_proposal: Some(parsed),
            ..TaskUpdate::new()
        }
        .with_log(StageName::Propose, level, message))
    }
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

pub struct VerifyStage {
    sandbox: Arc<dyn SandboxRunner>,
}

impl VerifyStage {
    pub fn new(sandbox: Arc<dyn SandboxRunner>) -> Self {
        Self { sandbox }
    }
}

fn describe_sandbox(result: &SandboxResult) -> (LogLevel, String) {
    if result.succeeded {
        return (
            LogLevel::Success,
            format!("Sandbox run succeeded in {} ms", result.duration_ms),
        );
    }
    if result.timed_out {
        return (LogLevel::Warning, "Sandbox run timed out".to_string());
    }
    let last_line = result
        .output
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output");
    let message = match result.exit_code {
        Some(code) => format!("Sandbox run failed with exit code {code}: {last_line}"),
        None => format!("Sandbox run failed: {last_line}"),
    };
    (LogLevel::Warning, message)
}

#[async_trait]
impl Stage for VerifyStage {
    fn name(&self) -> StageName {
        StageName::Verify
    }

    async fn run(&self, task: &Task) -> Result<TaskUpdate> {
        let proposal = task
            .fix_proposal
            .as_ref()
            .ok_or_else(|| StageError::Precondition("no fix proposal to verify".into()))?;

        let change = proposal.file_change();
        let request = VerifyRequest {
            repository: &task.repository,
            target_file: change.map(|(path, _)| path),
            patched_content: change.map(|(_, content)| content),
        };
        let result = self.sandbox.verify(request).await;
        let (level, message) = describe_sandbox(&result);
        Ok(TaskUpdate {
            sandbox_result: Some(result),
            ..TaskUpdate::new()
        }
        .with_log(StageName::Verify, level, message))
    }
}

// ---------------------------------------------------------------------------
// AwaitApproval
// ---------------------------------------------------------------------------

/// Marks the suspension point. The workflow stops after this stage and only
/// continues on an explicit resume.
pub struct ApprovalGate;

#[async_trait]
impl Stage for ApprovalGate {
    fn name(&self) -> StageName {
        StageName::AwaitApproval
    }

    async fn run(&self, _task: &Task) -> Result<TaskUpdate> {
        Ok(TaskUpdate {
            approval: Some(ApprovalState::Pending),
            ..TaskUpdate::new()
        }
        .with_log(
            StageName::AwaitApproval,
            LogLevel::Info,
            "Awaiting human approval",
        ))
    }
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

pub struct PublishStage {
    repo_host: Arc<dyn RepoHost>,
    branch_prefix: String,
}

impl PublishStage {
    pub fn new(repo_host: Arc<dyn RepoHost>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_host,
            branch_prefix: branch_prefix.into(),
        }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn name(&self) -> StageName {
        StageName::Publish
    }

    async fn run(&self, task: &Task) -> Result<TaskUpdate> {
        if task.approval != ApprovalState::Approved {
            return Err(StageError::Precondition(format!(
                "publishing requires approval, task is {}",
                task.approval
            )));
        }
        let proposal = task
            .fix_proposal
            .as_ref()
            .ok_or_else(|| StageError::Precondition("no fix proposal to publish".into()))?;

        let branch = derive_branch_name(&task.id, &self.branch_prefix);
        let request = DraftPullRequest {
            repository: task.repository.clone(),
            branch: branch.clone(),
            title: proposal.pr_title.clone(),
            body: proposal.pr_description.clone(),
            commit_message: commit_message(&proposal.pr_title, &proposal.pr_description),
            change: proposal.file_change().map(|(path, content)| FileChange {
                path: path.to_string(),
                content: content.to_string(),
            }),
        };
        let pr = self.repo_host.open_draft_pull_request(&request).await?;

        let message = format!("Opened draft pull request #{}: {}", pr.number, pr.url);
        Ok(TaskUpdate {
            branch_name: Some(branch),
            pull_request: Some(pr),
            ..TaskUpdate::new()
        }
        .with_log(StageName::Publish, LogLevel::Success, message))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
