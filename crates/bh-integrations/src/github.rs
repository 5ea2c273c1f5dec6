//! GitHub repository host: fix branch, commit and draft pull request through
//! the git data API.

use async_trait::async_trait;
use bh_core::collaborators::{CollaboratorError, DraftPullRequest, RepoHost};
use bh_core::types::{PullRequestRef, RepoRef};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),

    #[error("missing GitHub token")]
    MissingToken,
}

pub type Result<T> = std::result::Result<T, GitHubError>;

impl GitHubError {
    /// HTTP status of an API error response, when there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            GitHubError::Api(octocrab::Error::GitHub { source, .. }) => {
                Some(source.status_code.as_u16())
            }
            _ => None,
        }
    }

    fn api_message(&self) -> String {
        match self {
            GitHubError::Api(octocrab::Error::GitHub { source, .. }) => {
                let mut message = source.message.clone();
                if let Some(errors) = &source.errors {
                    for e in errors {
                        message.push_str("; ");
                        message.push_str(&e.to_string());
                    }
                }
                message
            }
            other => other.to_string(),
        }
    }
}

impl From<GitHubError> for CollaboratorError {
    fn from(err: GitHubError) -> Self {
        match err.status() {
            Some(404) => CollaboratorError::NotFound(err.api_message()),
            Some(status) => CollaboratorError::Api {
                status,
                message: err.api_message(),
            },
            None => CollaboratorError::Transport(err.to_string()),
        }
    }
}

// ---- wire types -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct ShaOnly {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    tree: ShaOnly,
}

#[derive(Debug, Deserialize)]
struct PullInfo {
    number: u64,
    html_url: String,
}

impl From<PullInfo> for PullRequestRef {
    fn from(pr: PullInfo) -> Self {
        PullRequestRef {
            url: pr.html_url,
            number: pr.number,
        }
    }
}

#[derive(Debug, Serialize)]
struct PullQuery<'a> {
    head: &'a str,
    state: &'a str,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GitHubRepoHost {
    octocrab: Octocrab,
}

impl GitHubRepoHost {
    /// `api_base_url` points at a GitHub Enterprise API root; public GitHub
    /// when `None`.
    pub fn new(token: &str, api_base_url: Option<&str>) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(GitHubError::MissingToken);
        }
        let mut builder = Octocrab::builder().personal_token(token.to_string());
        if let Some(base) = api_base_url {
            builder = builder.base_uri(base)?;
        }
        Ok(Self {
            octocrab: builder.build()?,
        })
    }

    async fn default_branch(&self, repo: &RepoRef) -> Result<String> {
        let info: RepoInfo = self
            .octocrab
            .get(repo_route(repo, ""), None::<&()>)
            .await?;
        Ok(info.default_branch)
    }

    async fn branch_head(&self, repo: &RepoRef, branch: &str) -> Result<String> {
        let r: GitRef = self
            .octocrab
            .get(repo_route(repo, &format!("/git/ref/heads/{branch}")), None::<&()>)
            .await?;
        Ok(r.object.sha)
    }

    async fn commit_tree(&self, repo: &RepoRef, commit_sha: &str) -> Result<String> {
        let c: GitCommit = self
            .octocrab
            .get(repo_route(repo, &format!("/git/commits/{commit_sha}")), None::<&()>)
            .await?;
        Ok(c.tree.sha)
    }

    /// Tree for the fix commit: the base tree with the changed file swapped
    /// in, or the base tree itself for an empty commit.
    async fn fix_tree(&self, request: &DraftPullRequest, base_tree: &str) -> Result<String> {
        let Some(change) = &request.change else {
            return Ok(base_tree.to_string());
        };
        let repo = &request.repository;
        let blob: ShaOnly = self
            .octocrab
            .post(
                repo_route(repo, "/git/blobs"),
                Some(&json!({ "content": change.content, "encoding": "utf-8" })),
            )
            .await?;
        let tree: ShaOnly = self
            .octocrab
            .post(
                repo_route(repo, "/git/trees"),
                Some(&tree_payload(base_tree, &change.path, &blob.sha)),
            )
            .await?;
        Ok(tree.sha)
    }

    /// Point `branch` at `commit_sha`, creating it or force-moving an
    /// existing one.
    async fn set_branch(&self, repo: &RepoRef, branch: &str, commit_sha: &str) -> Result<()> {
        let created: Result<Value> = self
            .octocrab
            .post(
                repo_route(repo, "/git/refs"),
                Some(&json!({ "ref": format!("refs/heads/{branch}"), "sha": commit_sha })),
            )
            .await
            .map_err(GitHubError::from);
        match created {
            Ok(_) => {
                debug!(branch, "created branch");
                Ok(())
            }
            Err(e) if e.status() == Some(422) => {
                info!(branch, "branch exists, moving it to the fix commit");
                let _: Value = self
                    .octocrab
                    .patch(
                        repo_route(repo, &format!("/git/refs/heads/{branch}")),
                        Some(&json!({ "sha": commit_sha, "force": true })),
                    )
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn find_pull(
        &self,
        repo: &RepoRef,
        branch: &str,
        state: &str,
    ) -> Result<Option<PullInfo>> {
        let head = head_filter(repo, branch);
        let pulls: Vec<PullInfo> = self
            .octocrab
            .get(
                repo_route(repo, "/pulls"),
                Some(&PullQuery { head: &head, state }),
            )
            .await?;
        Ok(pulls.into_iter().next())
    }

    async fn create_draft(&self, request: &DraftPullRequest, base: &str) -> Result<PullInfo> {
        let repo = &request.repository;
        let created: Result<PullInfo> = self
            .octocrab
            .post(repo_route(repo, "/pulls"), Some(&pull_payload(request, base)))
            .await
            .map_err(GitHubError::from);
        match created {
            Err(e) if e.status() == Some(422) && is_already_exists(&e.api_message()) => {
                info!(branch = %request.branch, "pull request already exists, looking it up");
                match self.find_pull(repo, &request.branch, "all").await? {
                    Some(pr) => Ok(pr),
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    /// The whole publish flow.
    pub async fn publish(&self, request: &DraftPullRequest) -> Result<PullRequestRef> {
        let repo = &request.repository;
        let base_branch = self.default_branch(repo).await?;
        let base_sha = self.branch_head(repo, &base_branch).await?;
        let base_tree = self.commit_tree(repo, &base_sha).await?;
        debug!(%repo, %base_branch, %base_sha, "resolved base");

        let tree = self.fix_tree(request, &base_tree).await?;
        let commit: ShaOnly = self
            .octocrab
            .post(
                repo_route(repo, "/git/commits"),
                Some(&commit_payload(&request.commit_message, &tree, &base_sha)),
            )
            .await?;
        self.set_branch(repo, &request.branch, &commit.sha).await?;

        if let Some(existing) = self.find_pull(repo, &request.branch, "open").await? {
            info!(number = existing.number, "refreshing existing pull request");
            let _: Value = self
                .octocrab
                .patch(
                    repo_route(repo, &format!("/pulls/{}", existing.number)),
                    Some(&json!({ "title": request.title, "body": request.body })),
                )
                .await?;
            return Ok(existing.into());
        }

        let pr = self.create_draft(request, &base_branch).await?;
        info!(number = pr.number, url = %pr.html_url, "opened draft pull request");
        Ok(pr.into())
    }
}

#[async_trait]
impl RepoHost for GitHubRepoHost {
    async fn open_draft_pull_request(
        &self,
        request: &DraftPullRequest,
    ) -> std::result::Result<PullRequestRef, CollaboratorError> {
        Ok(self.publish(request).await?)
    }
}

// ---- internal helpers -------------------------------------------------------

fn repo_route(repo: &RepoRef, suffix: &str) -> String {
    format!("/repos/{}/{}{}", repo.owner(), repo.name(), suffix)
}

fn head_filter(repo: &RepoRef, branch: &str) -> String {
    format!("{}:{}", repo.owner(), branch)
}

fn is_already_exists(message: &str) -> bool {
    message.to_ascii_lowercase().contains("already exists")
}

fn tree_payload(base_tree: &str, path: &str, blob_sha: &str) -> Value {
    json!({
        "base_tree": base_tree,
        "tree": [{
            "path": path.trim_start_matches("./").trim_start_matches('/'),
            "mode": "100644",
            "type": "blob",
            "sha": blob_sha,
        }],
    })
}

fn commit_payload(message: &str, tree: &str, parent: &str) -> Value {
    json!({ "message": message, "tree": tree, "parents": [parent] })
}

fn pull_payload(request: &DraftPullRequest, base: &str) -> Value {
    json!({
        "title": request.title,
        "head": request.branch,
        "base": base,
        "body": request.body,
        "draft": true,
    })
}
