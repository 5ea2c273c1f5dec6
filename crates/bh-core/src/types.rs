use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// RepoRef
// ---------------------------------------------------------------------------

/// A hosted repository, always normalised to `owner/name`.
///
/// Accepts the plain slug as well as `https://github.com/owner/name(.git)`
/// when parsing. Serialises as the slug string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepoRef {
    owner: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid repository reference: {0:?} (expected owner/name or a GitHub URL)")]
pub struct InvalidRepoRef(pub String);

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    pub fn parse(input: &str) -> Result<Self, InvalidRepoRef> {
        let trimmed = input.trim();
        let path = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        let path = path.strip_prefix("github.com/").unwrap_or(path);
        let path = path.trim_end_matches('/');
        let path = path.strip_suffix(".git").unwrap_or(path);

        let mut parts = path.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None)
                if is_slug_component(owner) && is_slug_component(name) =>
            {
                Ok(Self::new(owner, name))
            }
            _ => Err(InvalidRepoRef(input.to_string())),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// HTTPS clone URL rooted at `base` (e.g. `https://github.com`).
    pub fn clone_url(&self, base: &str) -> String {
        format!(
            "{}/{}/{}.git",
            base.trim_end_matches('/'),
            self.owner,
            self.name
        )
    }
}

fn is_slug_component(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl TryFrom<String> for RepoRef {
    type Error = InvalidRepoRef;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RepoRef> for String {
    fn from(value: RepoRef) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// ErrorReport
// ---------------------------------------------------------------------------

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub filename: String,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub line_number: Option<u32>,
    #[serde(default)]
    pub in_app: bool,
}

/// A captured application fault as reported by the issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub culprit: Option<String>,
    /// Outermost frame first, as trackers usually report them.
    #[serde(default)]
    pub stack_frames: Vec<StackFrame>,
    /// Untouched tracker payload.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl ErrorReport {
    pub fn new(
        id: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            error_type: error_type.into(),
            message: message.into(),
            culprit: None,
            stack_frames: Vec::new(),
            raw: serde_json::Value::Null,
        }
    }

    /// One-line summary, e.g. `KeyError: 'foo'`.
    pub fn headline(&self) -> String {
        if self.message.is_empty() {
            self.error_type.clone()
        } else {
            format!("{}: {}", self.error_type, self.message)
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

/// A file suspected of relating to an error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLocation {
    pub path: String,
    pub justification: String,
    #[serde(default)]
    pub line_number: Option<u32>,
}

impl CandidateLocation {
    pub fn new(path: impl Into<String>, justification: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            justification: justification.into(),
            line_number: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.line_number = Some(line);
        self
    }
}

/// Structured fix extracted from the model's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixProposal {
    pub target_file: Option<String>,
    pub problem_statement: Option<String>,
    pub solution_rationale: Option<String>,
    pub patched_content: Option<String>,
    pub pr_title: String,
    pub pr_description: String,
}

impl FixProposal {
    /// The file write this proposal asks for, if it names both a file and
    /// its new content.
    pub fn file_change(&self) -> Option<(&str, &str)> {
        match (&self.target_file, &self.patched_content) {
            (Some(path), Some(content)) if !path.is_empty() => Some((path, content)),
            _ => None,
        }
    }
}

/// Outcome of running the patched repository in a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub succeeded: bool,
    pub output: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SandboxResult {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            exit_code: Some(0),
            timed_out: false,
            duration_ms: 0,
        }
    }

    /// A failure that never reached (or never finished) the command itself.
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output: message.into(),
            exit_code: None,
            timed_out: false,
            duration_ms: 0,
        }
    }
}

/// A created (or reused) draft pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub url: String,
    pub number: u64,
}

// ---------------------------------------------------------------------------
// ApprovalState / Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    /// `Pending` may resolve either way; a resolved state never moves.
    /// Re-asserting the current state is a no-op and allowed.
    pub fn can_transition_to(&self, next: ApprovalState) -> bool {
        *self == next || (*self == ApprovalState::Pending && next != ApprovalState::Pending)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// A reviewer's answer at the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl From<Decision> for ApprovalState {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Approved => ApprovalState::Approved,
            Decision::Rejected => ApprovalState::Rejected,
        }
    }
}

// ---------------------------------------------------------------------------
// StageName / WorkflowStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Locate,
    Propose,
    Verify,
    AwaitApproval,
    Publish,
}

impl StageName {
    /// Fixed execution order.
    pub const ORDER: [StageName; 5] = [
        StageName::Locate,
        StageName::Propose,
        StageName::Verify,
        StageName::AwaitApproval,
        StageName::Publish,
    ];

    /// Status the task holds while this stage runs.
    pub fn status(&self) -> WorkflowStatus {
        match self {
            StageName::Locate => WorkflowStatus::Locating,
            StageName::Propose => WorkflowStatus::Proposing,
            StageName::Verify => WorkflowStatus::Verifying,
            StageName::AwaitApproval => WorkflowStatus::AwaitingApproval,
            StageName::Publish => WorkflowStatus::Publishing,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageName::Locate => "locate",
            StageName::Propose => "propose",
            StageName::Verify => "verify",
            StageName::AwaitApproval => "await_approval",
            StageName::Publish => "publish",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Created,
    Locating,
    Proposing,
    Verifying,
    AwaitingApproval,
    Publishing,
    Completed,
    Rejected,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Rejected | WorkflowStatus::Failed
        )
    }

    /// Valid transitions:
    /// - Created          -> Locating
    /// - Locating         -> Proposing
    /// - Proposing        -> Verifying
    /// - Verifying        -> AwaitingApproval
    /// - AwaitingApproval -> Publishing | Rejected
    /// - Publishing       -> Completed
    /// - any non-terminal -> Failed
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, Locating)
                | (Locating, Proposing)
                | (Proposing, Verifying)
                | (Verifying, AwaitingApproval)
                | (AwaitingApproval, Publishing)
                | (AwaitingApproval, Rejected)
                | (Publishing, Completed)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Locating => "locating",
            WorkflowStatus::Proposing => "proposing",
            WorkflowStatus::Verifying => "verifying",
            WorkflowStatus::AwaitingApproval => "awaiting_approval",
            WorkflowStatus::Publishing => "publishing",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Rejected => "rejected",
            WorkflowStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// TaskLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Option<StageName>,
    pub level: LogLevel,
    pub message: String,
}

impl TaskLogEntry {
    pub fn new(stage: Option<StageName>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stage,
            level,
            message: message.into(),
        }
    }
}

/// Why a run halted in `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: StageName,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskUpdate
// ---------------------------------------------------------------------------

/// The fields one stage changes. `None` means "leave as is"; log entries are
/// appended, never replaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_locations: Option<Vec<CandidateLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_proposal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_proposal: Option<FixProposal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_result: Option<SandboxResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<TaskLogEntry>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(
        mut self,
        stage: StageName,
        level: LogLevel,
        message: impl Into<String>,
    ) -> Self {
        self.log.push(TaskLogEntry::new(Some(stage), level, message));
        self
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskInvariantError {
    #[error("approval cannot move from {from} to {to}")]
    ApprovalReversal {
        from: ApprovalState,
        to: ApprovalState,
    },
    #[error("a pull request can only be recorded once the fix is approved (approval is {0})")]
    PullRequestBeforeApproval(ApprovalState),
    #[error("invalid status transition: {from} -> {to}")]
    StatusTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

/// One error-resolution task moving through the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub error_report: ErrorReport,
    pub repository: RepoRef,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub candidate_locations: Vec<CandidateLocation>,
    #[serde(default)]
    pub locator_summary: Option<String>,
    #[serde(default)]
    pub raw_proposal: Option<String>,
    #[serde(default)]
    pub fix_proposal: Option<FixProposal>,
    #[serde(default)]
    pub sandbox_result: Option<SandboxResult>,
    #[serde(default)]
    pub approval: ApprovalState,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pull_request: Option<PullRequestRef>,
    #[serde(default)]
    pub failure: Option<StageFailure>,
    #[serde(default)]
    pub log: Vec<TaskLogEntry>,
    /// Bumped by the store on every commit.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, error_report: ErrorReport, repository: RepoRef) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            error_report,
            repository,
            status: WorkflowStatus::Created,
            candidate_locations: Vec::new(),
            locator_summary: None,
            raw_proposal: None,
            fix_proposal: None,
            sandbox_result: None,
            approval: ApprovalState::Pending,
            branch_name: None,
            pull_request: None,
            failure: None,
            log: Vec::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Paused at the approval gate, waiting for a decision.
    pub fn is_awaiting_decision(&self) -> bool {
        self.status == WorkflowStatus::AwaitingApproval && self.approval == ApprovalState::Pending
    }

    /// Approved, but the publish that should follow never completed: the run
    /// was interrupted or the Publish stage failed.
    pub fn is_publish_pending(&self) -> bool {
        self.approval == ApprovalState::Approved
            && matches!(
                self.status,
                WorkflowStatus::AwaitingApproval
                    | WorkflowStatus::Publishing
                    | WorkflowStatus::Failed
            )
    }

    /// Put a publish-pending task back at the gate so Publish can run again.
    /// Approval and everything produced before the gate are kept.
    pub fn reopen_for_publish(&mut self) -> Result<(), TaskInvariantError> {
        if !self.is_publish_pending() {
            return Err(TaskInvariantError::StatusTransition {
                from: self.status,
                to: WorkflowStatus::AwaitingApproval,
            });
        }
        self.failure = None;
        self.status = WorkflowStatus::AwaitingApproval;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Merge a stage's partial update. Checks every invariant before touching
    /// any field, so a rejected update leaves the task unchanged.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), TaskInvariantError> {
        let approval = match update.approval {
            Some(next) if !self.approval.can_transition_to(next) => {
                return Err(TaskInvariantError::ApprovalReversal {
                    from: self.approval,
                    to: next,
                });
            }
            Some(next) => next,
            None => self.approval,
        };
        if update.pull_request.is_some() && approval != ApprovalState::Approved {
            return Err(TaskInvariantError::PullRequestBeforeApproval(approval));
        }

        self.approval = approval;
        if let Some(v) = update.candidate_locations {
            self.candidate_locations = v;
        }
        if let Some(v) = update.locator_summary {
            self.locator_summary = Some(v);
        }
        if let Some(v) = update.raw_proposal {
            self.raw_proposal = Some(v);
        }
        if let Some(v) = update.fix_proposal {
            self.fix_proposal = Some(v);
        }
        if let Some(v) = update.sandbox_result {
            self.sandbox_result = Some(v);
        }
        if let Some(v) = update.branch_name {
            self.branch_name = Some(v);
        }
        if let Some(v) = update.pull_request {
            self.pull_request = Some(v);
        }
        self.log.extend(update.log);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), TaskInvariantError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskInvariantError::StatusTransition {
                from: self.status,
                to: next,
            });
        }
        tracing::debug!(task_id = %self.id, from = %self.status, to = %next, "task status transition");
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn log(&mut self, stage: Option<StageName>, level: LogLevel, message: impl Into<String>) {
        self.log.push(TaskLogEntry::new(stage, level, message));
        self.updated_at = Utc::now();
    }

    /// Halt in `Failed`, keeping every field produced by earlier stages.
    pub fn record_failure(&mut self, stage: StageName, message: impl Into<String>) {
        let message = message.into();
        self.log(
            Some(stage),
            LogLevel::Error,
            format!("Stage {stage} failed: {message}"),
        );
        self.failure = Some(StageFailure {
            stage,
            message,
            at: Utc::now(),
        });
        if self.status.can_transition_to(WorkflowStatus::Failed) {
            self.status = WorkflowStatus::Failed;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task() -> Task {
        Task::new(
            "task-1",
            ErrorReport::new("task-1", "KeyError", "'foo'"),
            RepoRef::new("acme", "shop"),
        )
    }

    #[test]
    fn repo_ref_accepts_slug_and_urls() {
        let expected = RepoRef::new("acme", "shop");
        assert_eq!(RepoRef::parse("acme/shop").unwrap(), expected);
        assert_eq!(RepoRef::parse("https://github.com/acme/shop").unwrap(), expected);
        assert_eq!(RepoRef::parse("https://github.com/acme/shop.git").unwrap(), expected);
        assert_eq!(RepoRef::parse("github.com/acme/shop/").unwrap(), expected);
    }

    #[test]
    fn repo_ref_rejects_garbage() {
        assert!(RepoRef::parse("shop").is_err());
        assert!(RepoRef::parse("acme/shop/extra").is_err());
        assert!(RepoRef::parse("acme/").is_err());
        assert!(RepoRef::parse("ac me/shop").is_err());
    }

    #[test]
    fn repo_ref_serializes_as_slug() {
        let json = serde_json::to_string(&RepoRef::new("acme", "shop")).unwrap();
        assert_eq!(json, "\"acme/shop\"");
        let back: RepoRef = serde_json::from_str("\"https://github.com/acme/shop\"").unwrap();
        assert_eq!(back.to_string(), "acme/shop");
    }

    #[test]
    fn approval_never_reverses() {
        assert!(ApprovalState::Pending.can_transition_to(ApprovalState::Approved));
        assert!(ApprovalState::Pending.can_transition_to(ApprovalState::Rejected));
        assert!(ApprovalState::Pending.can_transition_to(ApprovalState::Pending));
        assert!(!ApprovalState::Approved.can_transition_to(ApprovalState::Pending));
        assert!(!ApprovalState::Approved.can_transition_to(ApprovalState::Rejected));
        assert!(!ApprovalState::Rejected.can_transition_to(ApprovalState::Approved));
    }

    #[test]
    fn status_follows_stage_order() {
        let mut status = WorkflowStatus::Created;
        for stage in StageName::ORDER {
            assert!(status.can_transition_to(stage.status()), "{status} -> {}", stage.status());
            status = stage.status();
        }
        assert!(status.can_transition_to(WorkflowStatus::Completed));
    }

    #[test]
    fn status_rejects_skips_and_terminal_moves() {
        assert!(!WorkflowStatus::Created.can_transition_to(WorkflowStatus::Verifying));
        assert!(!WorkflowStatus::Verifying.can_transition_to(WorkflowStatus::Publishing));
        assert!(!WorkflowStatus::Completed.can_transition_to(WorkflowStatus::Failed));
        assert!(!WorkflowStatus::Rejected.can_transition_to(WorkflowStatus::Publishing));
        assert!(!WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Created));
        assert!(WorkflowStatus::Proposing.can_transition_to(WorkflowStatus::Failed));
    }

    #[test]
    fn apply_merges_only_set_fields() {
        let mut task = make_task();
        task.apply(TaskUpdate {
            candidate_locations: Some(vec![CandidateLocation::new("app.py", "stack")]),
            locator_summary: Some("one file".into()),
            ..TaskUpdate::default()
        })
        .unwrap();

        task.apply(TaskUpdate::new().with_log(StageName::Propose, LogLevel::Info, "drafted"))
            .unwrap();

        assert_eq!(task.candidate_locations.len(), 1);
        assert_eq!(task.locator_summary.as_deref(), Some("one file"));
        assert_eq!(task.log.len(), 1);
    }

    #[test]
    fn apply_refuses_pull_request_before_approval() {
        let mut task = make_task();
        let err = task
            .apply(TaskUpdate {
                pull_request: Some(PullRequestRef {
                    url: "https://example.test/pr/1".into(),
                    number: 1,
                }),
                log: vec![TaskLogEntry::new(None, LogLevel::Info, "ignored")],
                ..TaskUpdate::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            TaskInvariantError::PullRequestBeforeApproval(ApprovalState::Pending)
        );
        assert!(task.pull_request.is_none());
        assert!(task.log.is_empty());
    }

    #[test]
    fn apply_refuses_approval_reversal() {
        let mut task = make_task();
        task.apply(TaskUpdate {
            approval: Some(ApprovalState::Rejected),
            ..TaskUpdate::default()
        })
        .unwrap();
        let err = task
            .apply(TaskUpdate {
                approval: Some(ApprovalState::Approved),
                ..TaskUpdate::default()
            })
            .unwrap_err();
        assert!(matches!(err, TaskInvariantError::ApprovalReversal { .. }));
        assert_eq!(task.approval, ApprovalState::Rejected);
    }

    #[test]
    fn record_failure_keeps_earlier_output() {
        let mut task = make_task();
        task.transition(WorkflowStatus::Locating).unwrap();
        task.apply(TaskUpdate {
            candidate_locations: Some(vec![CandidateLocation::new("app.py", "stack")]),
            ..TaskUpdate::default()
        })
        .unwrap();
        task.transition(WorkflowStatus::Proposing).unwrap();
        task.record_failure(StageName::Propose, "model unavailable");

        assert_eq!(task.status, WorkflowStatus::Failed);
        assert_eq!(task.candidate_locations.len(), 1);
        let failure = task.failure.as_ref().unwrap();
        assert_eq!(failure.stage, StageName::Propose);
        assert!(task.log.last().unwrap().message.contains("propose"));
    }

    #[test]
    fn failed_publish_can_be_reopened_without_losing_approval() {
        let mut task = make_task();
        task.status = WorkflowStatus::Publishing;
        task.approval = ApprovalState::Approved;
        task.record_failure(StageName::Publish, "bad gateway");
        assert!(task.is_publish_pending());

        task.reopen_for_publish().unwrap();
        assert_eq!(task.status, WorkflowStatus::AwaitingApproval);
        assert_eq!(task.approval, ApprovalState::Approved);
        assert!(task.failure.is_none());
        assert!(!task.is_awaiting_decision());
    }

    #[test]
    fn only_approved_unpublished_tasks_reopen() {
        let mut pending = make_task();
        pending.status = WorkflowStatus::AwaitingApproval;
        assert!(pending.reopen_for_publish().is_err());

        let mut done = make_task();
        done.status = WorkflowStatus::Completed;
        done.approval = ApprovalState::Approved;
        assert!(done.reopen_for_publish().is_err());

        let mut rejected = make_task();
        rejected.status = WorkflowStatus::Rejected;
        rejected.approval = ApprovalState::Rejected;
        assert!(!rejected.is_publish_pending());
    }

    #[test]
    fn file_change_requires_path_and_content() {
        let mut proposal = FixProposal {
            target_file: Some("app.py".into()),
            problem_statement: None,
            solution_rationale: None,
            patched_content: None,
            pr_title: "t".into(),
            pr_description: "d".into(),
        };
        assert!(proposal.file_change().is_none());
        proposal.patched_content = Some("print('ok')".into());
        assert_eq!(proposal.file_change(), Some(("app.py", "print('ok')")));
    }
}
