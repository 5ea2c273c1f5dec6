//! Narrow interfaces to the outside world.
//!
//! The workflow only talks to issue trackers, models, sandboxes and repository
//! hosts through these traits, so tests can swap in deterministic doubles.
//! `CodeLocator` and `SandboxRunner` return plain values rather than `Result`:
//! their failures are reported inside the value and never halt a run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CandidateLocation, ErrorReport, PullRequestRef, RepoRef, SandboxResult};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The requested record does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection, DNS, TLS or timeout failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The service answered with a non-success status.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The service answered with something we could not decode.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Listing entry from the issue tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub id: String,
    pub short_id: String,
    pub title: String,
    pub event_count: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Output of a [`CodeLocator`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocateOutcome {
    pub candidates: Vec<CandidateLocation>,
    pub summary: String,
}

impl LocateOutcome {
    /// An empty result whose summary explains what went wrong.
    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            candidates: Vec::new(),
            summary: summary.into(),
        }
    }
}

/// A sandbox run request. Without a target file the repository runs as-is.
#[derive(Debug, Clone)]
pub struct VerifyRequest<'a> {
    pub repository: &'a RepoRef,
    pub target_file: Option<&'a str>,
    pub patched_content: Option<&'a str>,
}

/// A whole-file replacement committed on the fix branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub content: String,
}

/// Everything a repository host needs to open the draft pull request.
#[derive(Debug, Clone)]
pub struct DraftPullRequest {
    pub repository: RepoRef,
    pub branch: String,
    pub title: String,
    pub body: String,
    pub commit_message: String,
    pub change: Option<FileChange>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Latest event for an issue. `CollaboratorError::NotFound` if unknown.
    async fn fetch_error_detail(&self, error_id: &str) -> Result<ErrorReport, CollaboratorError>;

    /// Unresolved issues, most relevant first.
    async fn list_issues(&self, limit: usize) -> Result<Vec<IssueSummary>, CollaboratorError>;
}

#[async_trait]
pub trait CodeLocator: Send + Sync {
    /// Never fails: on internal error returns no candidates and a summary
    /// explaining why.
    async fn locate(&self, repository: &RepoRef, report: &ErrorReport) -> LocateOutcome;
}

#[async_trait]
pub trait FixProposer: Send + Sync {
    /// Free-form model output, consumed through [`crate::proposal::parse`].
    async fn propose(
        &self,
        report: &ErrorReport,
        candidates: &[CandidateLocation],
        locator_summary: Option<&str>,
    ) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Never fails: non-zero exits, timeouts and provisioning problems all
    /// come back as `succeeded == false`.
    async fn verify(&self, request: VerifyRequest<'_>) -> SandboxResult;
}

#[async_trait]
pub trait RepoHost: Send + Sync {
    /// Idempotent by branch name: an existing pull request for the branch is
    /// returned instead of an error.
    async fn open_draft_pull_request(
        &self,
        request: &DraftPullRequest,
    ) -> Result<PullRequestRef, CollaboratorError>;
}
