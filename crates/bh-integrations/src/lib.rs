//! Adapters from the collaborator traits in `bh-core` to real services.

pub mod github;
pub mod sandbox;
pub mod sentry;

pub use github::GitHubRepoHost;
pub use sandbox::LocalSandboxRunner;
pub use sentry::SentryClient;
