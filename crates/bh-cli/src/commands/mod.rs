pub mod decide;
pub mod investigate;
pub mod issues;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use bh_agents::workflow::{
    preflight, Collaborators, Preflight, Workflow, WorkflowError, WorkflowSettings,
};
use bh_core::collaborators::CodeLocator;
use bh_core::config::{Config, LocatorStrategy};
use bh_core::store::FileTaskStore;
use bh_core::types::{RepoRef, StageName};
use bh_intelligence::{
    provider_from_config, CompletionConfig, LlmCodeLocator, LlmFixProposer, StackTraceLocator,
};
use bh_integrations::{GitHubRepoHost, LocalSandboxRunner, SentryClient};

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load_from(p).with_context(|| format!("loading {}", p.display())),
        None => Config::load().context("loading ~/.bughunt/config.toml"),
    }
}

pub fn task_store(config: &Config) -> FileTaskStore {
    FileTaskStore::new(config.state_dir())
}

/// Wire every collaborator from config. Fails before any stage runs when a
/// setting or credential is missing.
pub fn build_workflow(config: &Config) -> anyhow::Result<(Workflow, RepoRef)> {
    let Preflight {
        repository,
        credentials,
    } = preflight(config).map_err(friendly_error)?;

    let issue_tracker = SentryClient::new(&config.sentry, credentials.sentry_token.clone())
        .context("creating Sentry client")?;
    let llm = provider_from_config(&config.llm, &credentials.llm_api_key);
    let completion = CompletionConfig::from(&config.llm);

    let locator: Arc<dyn CodeLocator> = match config.locator.strategy {
        LocatorStrategy::Llm => Arc::new(
            LlmCodeLocator::new(llm.clone(), completion.clone())
                .with_stack_budget(config.locator.stack_trace_chars),
        ),
        LocatorStrategy::StackTrace => Arc::new(StackTraceLocator),
    };
    let repo_host = GitHubRepoHost::new(
        &credentials.github_token,
        config.github.api_base_url.as_deref(),
    )
    .context("creating GitHub client")?;

    let collaborators = Collaborators {
        issue_tracker: Arc::new(issue_tracker),
        locator,
        proposer: Arc::new(LlmFixProposer::new(llm, completion)),
        sandbox: Arc::new(LocalSandboxRunner::new(&config.sandbox)),
        repo_host: Arc::new(repo_host),
    };
    let workflow = Workflow::new(
        Arc::new(task_store(config)),
        collaborators,
        WorkflowSettings::from(config),
    );
    Ok((workflow, repository))
}

/// Map workflow errors to messages with a next step where there is one.
pub fn friendly_error(err: WorkflowError) -> anyhow::Error {
    match &err {
        WorkflowError::Configuration(_) => anyhow::anyhow!(
            "{err}\n  (hint: check ~/.bughunt/config.toml and the credential env vars)"
        ),
        WorkflowError::UnknownTask(id) => {
            anyhow::anyhow!("{err}\n  (hint: `bughunt list` shows known tasks; got {id:?})")
        }
        WorkflowError::StageExecution {
            stage: StageName::Publish,
            ..
        } => anyhow::anyhow!(
            "{err}\n  (hint: the approval is kept; approve the task again to retry publishing)"
        ),
        WorkflowError::InvalidTransition { task_id, .. } => anyhow::anyhow!(
            "{err}\n  (hint: `bughunt status {task_id}` shows where the task is)"
        ),
        _ => anyhow::Error::new(err),
    }
}
