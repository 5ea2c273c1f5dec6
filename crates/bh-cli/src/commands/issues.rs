use anyhow::Context;
use bh_core::collaborators::IssueTracker;
use bh_core::config::{Config, ConfigError, CredentialProvider};
use bh_integrations::SentryClient;

/// Run the `issues` subcommand: list unresolved issues.
pub async fn run(config: &Config, limit: usize) -> anyhow::Result<()> {
    let env_var = config.sentry.token_env.clone();
    let token = CredentialProvider::first_of(std::slice::from_ref(&env_var)).ok_or_else(|| {
        ConfigError::MissingCredential {
            name: "sentry token".into(),
            env_var,
        }
    })?;
    let client = SentryClient::new(&config.sentry, token).context("creating Sentry client")?;

    let issues = client
        .list_issues(limit)
        .await
        .context("listing Sentry issues")?;
    if issues.is_empty() {
        println!("No unresolved issues.");
        return Ok(());
    }
    print!("{}", crate::render::issue_table(&issues));
    Ok(())
}
