use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::RepoRef;

/// Top-level configuration loaded from `~/.bughunt/config.toml`.
///
/// **Security**: This struct NEVER stores API keys or tokens. Sections only
/// hold the *name* of the env var to read; see [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub sentry: SentryConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub locator: LocatorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Load config from `~/.bughunt/config.toml`, falling back to defaults
    /// when the file does not exist. Environment overrides are applied.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::parse_file(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path. The file must exist.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut cfg = Self::parse_file(&path.into())?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Let the deployment environment override selected settings.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(org) = non_empty("SENTRY_ORG_SLUG") {
            self.sentry.organization = Some(org);
        }
        if let Some(project) = non_empty("SENTRY_PROJECT_SLUG") {
            self.sentry.project = Some(project);
        }
        if let Some(repo) = non_empty("GITHUB_REPO") {
            self.github.repository = Some(repo);
        }
        if let Some(model) = non_empty("BUGHUNT_MODEL") {
            self.llm.model = model;
        }
    }

    /// Semantic validation for settings that are not fully expressible via
    /// type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(repo) = &self.github.repository {
            RepoRef::parse(repo).map_err(|e| ConfigError::Validation(e.to_string()))?;
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "sandbox.timeout_secs must be greater than zero".into(),
            ));
        }
        if self.sandbox.command.trim().is_empty() {
            return Err(ConfigError::Validation("sandbox.command is empty".into()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model is empty".into()));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Validation(format!(
                "llm.temperature {} is outside 0.0..=2.0",
                self.llm.temperature
            )));
        }
        Ok(())
    }

    /// The repository fixes are published to. Required before any run.
    pub fn require_repository(&self) -> Result<RepoRef, ConfigError> {
        let raw = self
            .github
            .repository
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::Validation(
                    "no repository configured (set github.repository or GITHUB_REPO)".into(),
                )
            })?;
        RepoRef::parse(raw).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Directory holding one JSON file per task.
    pub fn state_dir(&self) -> PathBuf {
        match &self.general.state_dir {
            Some(dir) => expand_home(dir),
            None => bughunt_home().join("tasks"),
        }
    }

    pub fn default_path() -> PathBuf {
        bughunt_home().join("config.toml")
    }
}

fn bughunt_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bughunt")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing credential {name}: set the {env_var} environment variable")]
    MissingCredential { name: String, env_var: String },
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    /// Defaults to `~/.bughunt/tasks`.
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            state_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryConfig {
    #[serde(default = "default_sentry_url")]
    pub base_url: String,
    #[serde(default)]
    pub organization: Option<String>,
    /// Without a project, listings span the whole organization.
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_sentry_token_env")]
    pub token_env: String,
    #[serde(default = "default_sentry_query")]
    pub query: String,
    #[serde(default = "default_stats_period")]
    pub stats_period: String,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            base_url: default_sentry_url(),
            organization: None,
            project: None,
            token_env: default_sentry_token_env(),
            query: default_sentry_query(),
            stats_period: default_stats_period(),
        }
    }
}

fn default_sentry_url() -> String {
    "https://sentry.io".into()
}
fn default_sentry_token_env() -> String {
    "SENTRY_TOKEN".into()
}
fn default_sentry_query() -> String {
    "is:unresolved".into()
}
fn default_stats_period() -> String {
    "14d".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// `owner/name` or a github.com URL.
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default = "default_github_env")]
    pub token_env: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// GitHub Enterprise API root; public GitHub when unset.
    #[serde(default)]
    pub api_base_url: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            repository: None,
            token_env: default_github_env(),
            branch_prefix: default_branch_prefix(),
            api_base_url: None,
        }
    }
}

fn default_github_env() -> String {
    "GITHUB_TOKEN".into()
}
fn default_branch_prefix() -> String {
    crate::branch::DEFAULT_BRANCH_PREFIX.into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    Anthropic,
    #[default]
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,
    #[serde(default = "default_model")]
    pub model: String,
    /// Env var holding the key. Gemini also falls back to `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            model: default_model(),
            api_key_env: None,
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            base_url: None,
        }
    }
}

impl LlmConfig {
    /// Env var names tried in order for the model API key.
    pub fn key_env_candidates(&self) -> Vec<String> {
        if let Some(explicit) = &self.api_key_env {
            return vec![explicit.clone()];
        }
        match self.provider {
            LlmProviderKind::Anthropic => vec!["ANTHROPIC_API_KEY".into()],
            LlmProviderKind::Gemini => vec!["GOOGLE_API_KEY".into(), "GEMINI_API_KEY".into()],
        }
    }
}

fn default_model() -> String {
    "gemini-2.5-flash".into()
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    #[default]
    Llm,
    StackTrace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    #[serde(default)]
    pub strategy: LocatorStrategy,
    /// Characters of serialized stack trace included in the prompt.
    #[serde(default = "default_stack_budget")]
    pub stack_trace_chars: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            strategy: LocatorStrategy::default(),
            stack_trace_chars: default_stack_budget(),
        }
    }
}

fn default_stack_budget() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_command")]
    pub command: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,
    #[serde(default = "default_clone_base")]
    pub clone_base_url: String,
    /// Branch or tag to clone; the default branch when unset.
    #[serde(default)]
    pub git_ref: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_sandbox_command(),
            timeout_secs: default_sandbox_timeout(),
            max_output_bytes: default_max_output(),
            clone_base_url: default_clone_base(),
            git_ref: None,
        }
    }
}

fn default_sandbox_command() -> String {
    "pip install -r requirements.txt && python app.py".into()
}
fn default_sandbox_timeout() -> u64 {
    120
}
fn default_max_output() -> usize {
    64 * 1024
}
fn default_clone_base() -> String {
    "https://github.com".into()
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Reads secrets from the environment at runtime.
pub struct CredentialProvider;

impl CredentialProvider {
    /// First non-empty value among the given env vars.
    pub fn first_of(names: &[String]) -> Option<String> {
        Self::first_of_with(names, |k| std::env::var(k).ok())
    }

    fn first_of_with(names: &[String], lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        names
            .iter()
            .filter_map(|name| lookup(name))
            .find(|v| !v.trim().is_empty())
    }
}

/// Resolved secrets for every credentialed collaborator.
#[derive(Clone)]
pub struct Credentials {
    pub sentry_token: String,
    pub llm_api_key: String,
    pub github_token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("sentry_token", &"[REDACTED]")
            .field("llm_api_key", &"[REDACTED]")
            .field("github_token", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Resolve all credentials, failing on the first one missing.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        Self::resolve_with(config, |k| std::env::var(k).ok())
    }

    fn resolve_with(
        config: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let require = |name: &str, envs: Vec<String>| {
            CredentialProvider::first_of_with(&envs, &lookup).ok_or_else(|| {
                ConfigError::MissingCredential {
                    name: name.to_string(),
                    env_var: envs.join(" or "),
                }
            })
        };
        Ok(Self {
            sentry_token: require("sentry token", vec![config.sentry.token_env.clone()])?,
            llm_api_key: require("LLM API key", config.llm.key_env_candidates())?,
            github_token: require("GitHub token", vec![config.github.token_env.clone()])?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.sandbox.timeout_secs, 120);
        assert_eq!(cfg.sentry.stats_period, "14d");
        assert_eq!(cfg.github.branch_prefix, "bugfix");
        assert_eq!(cfg.llm.provider, LlmProviderKind::Gemini);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [github]
            repository = "https://github.com/acme/shop"

            [llm]
            provider = "anthropic"
            model = "claude-sonnet-4-5"

            [locator]
            strategy = "stack_trace"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.require_repository().unwrap(), RepoRef::new("acme", "shop"));
        assert_eq!(cfg.llm.provider, LlmProviderKind::Anthropic);
        assert_eq!(cfg.locator.strategy, LocatorStrategy::StackTrace);
        assert_eq!(cfg.sandbox.command, default_sandbox_command());
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut cfg = Config::default();
        cfg.github.repository = Some("acme/shop".into());
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.github.repository.as_deref(), Some("acme/shop"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sandbox]\ntimeout_secs = 30\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.sandbox.timeout_secs, 30);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let err = Config::load_from("/nonexistent/bughunt.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn rejects_bad_repository() {
        let mut cfg = Config::default();
        cfg.github.repository = Some("not a repo".into());
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.sandbox.timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_repository_is_validation_error() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.require_repository(),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_overrides_from(env(&[
            ("SENTRY_ORG_SLUG", "acme"),
            ("SENTRY_PROJECT_SLUG", "shop-api"),
            ("GITHUB_REPO", "acme/shop"),
            ("BUGHUNT_MODEL", "gemini-2.5-pro"),
        ]));
        assert_eq!(cfg.sentry.organization.as_deref(), Some("acme"));
        assert_eq!(cfg.sentry.project.as_deref(), Some("shop-api"));
        assert_eq!(cfg.github.repository.as_deref(), Some("acme/shop"));
        assert_eq!(cfg.llm.model, "gemini-2.5-pro");
    }

    #[test]
    fn blank_env_override_is_ignored() {
        let mut cfg = Config::default();
        cfg.github.repository = Some("acme/shop".into());
        cfg.apply_overrides_from(env(&[("GITHUB_REPO", "  ")]));
        assert_eq!(cfg.github.repository.as_deref(), Some("acme/shop"));
    }

    #[test]
    fn gemini_key_falls_back() {
        let cfg = Config::default();
        let creds = Credentials::resolve_with(
            &cfg,
            env(&[
                ("SENTRY_TOKEN", "s"),
                ("GEMINI_API_KEY", "g"),
                ("GITHUB_TOKEN", "gh"),
            ]),
        )
        .unwrap();
        assert_eq!(creds.llm_api_key, "g");
    }

    #[test]
    fn missing_credential_names_env_var() {
        let cfg = Config::default();
        let err = Credentials::resolve_with(&cfg, env(&[("SENTRY_TOKEN", "s")])).unwrap_err();
        match err {
            ConfigError::MissingCredential { env_var, .. } => {
                assert_eq!(env_var, "GOOGLE_API_KEY or GEMINI_API_KEY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            sentry_token: "secret-1".into(),
            llm_api_key: "secret-2".into(),
            github_token: "secret-3".into(),
        };
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn state_dir_expands_home() {
        let mut cfg = Config::default();
        cfg.general.state_dir = Some("/tmp/bughunt-tasks".into());
        assert_eq!(cfg.state_dir(), PathBuf::from("/tmp/bughunt-tasks"));
        cfg.general.state_dir = None;
        assert!(cfg.state_dir().ends_with(".bughunt/tasks"));
    }
}
