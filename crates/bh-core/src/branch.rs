//! Branch and commit naming for published fixes.

/// Characters of the task id that make it into the branch name.
pub const MAX_BRANCH_SLUG_CHARS: usize = 20;

/// Used when nothing usable survives sanitisation.
pub const DEFAULT_BRANCH_NAME: &str = "bugfix/patch";

/// Default prefix in front of the task slug.
pub const DEFAULT_BRANCH_PREFIX: &str = "bugfix";

/// Characters of the PR description embedded in a commit message.
pub const COMMIT_BODY_LIMIT: usize = 500;

/// Derive a git branch name from a task id.
///
/// Result is `<prefix>/<slug>` where the slug is the first
/// [`MAX_BRANCH_SLUG_CHARS`] characters of `task_id`. Anything outside
/// `[A-Za-z0-9_/-]` becomes `-`, and leading/trailing `/` or `-` are stripped
/// from both parts. Falls back to [`DEFAULT_BRANCH_NAME`] when the slug is empty.
pub fn derive_branch_name(task_id: &str, prefix: &str) -> String {
    let truncated: String = task_id.chars().take(MAX_BRANCH_SLUG_CHARS).collect();
    let slug = sanitize_ref_component(&truncated);
    if slug.is_empty() {
        return DEFAULT_BRANCH_NAME.to_string();
    }
    let prefix = sanitize_ref_component(prefix);
    if prefix.is_empty() {
        slug
    } else {
        format!("{prefix}/{slug}")
    }
}

fn sanitize_ref_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    replaced.trim_matches(|c| c == '/' || c == '-').to_string()
}

/// `Fix: <title>` followed by a bounded prefix of the description.
pub fn commit_message(title: &str, description: &str) -> String {
    let body: String = description.chars().take(COMMIT_BODY_LIMIT).collect();
    let body = body.trim_end();
    if body.is_empty() {
        format!("Fix: {title}")
    } else {
        format!("Fix: {title}\n\n{body}")
    }
}
