use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bh_core::collaborators::{CodeLocator, LocateOutcome};
use bh_core::proposal::sanitize_path;
use bh_core::types::{CandidateLocation, ErrorReport, RepoRef};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::llm::{CompletionConfig, LlmMessage, LlmProvider};
use crate::prompts;

// ---------------------------------------------------------------------------
// LlmCodeLocator
// ---------------------------------------------------------------------------

/// Asks a model which files the error most likely comes from.
pub struct LlmCodeLocator {
    provider: Arc<dyn LlmProvider>,
    config: CompletionConfig,
    stack_budget: usize,
}

impl LlmCodeLocator {
    pub fn new(provider: Arc<dyn LlmProvider>, config: CompletionConfig) -> Self {
        Self {
            provider,
            config,
            stack_budget: 1000,
        }
    }

    /// Characters of serialized stack trace included in the prompt.
    pub fn with_stack_budget(mut self, chars: usize) -> Self {
        self.stack_budget = chars;
        self
    }
}

#[async_trait]
impl CodeLocator for LlmCodeLocator {
    async fn locate(&self, repository: &RepoRef, report: &ErrorReport) -> LocateOutcome {
        let messages = [
            LlmMessage::system(prompts::LOCATOR_SYSTEM),
            LlmMessage::user(prompts::locator_prompt(report, repository, self.stack_budget)),
        ];
        let response = match self.provider.complete(&messages, &self.config).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "locator model call failed");
                return LocateOutcome::failed(format!("Code location failed: {e}"));
            }
        };
        match parse_locator_response(&response.content) {
            Ok(outcome) => {
                debug!(candidates = outcome.candidates.len(), "locator response parsed");
                outcome
            }
            Err(e) => {
                warn!(error = %e, "locator response unparseable");
                let preview: String = response.content.chars().take(200).collect();
                LocateOutcome::failed(format!(
                    "Could not parse locator output ({e}). Raw output: {preview}"
                ))
            }
        }
    }
}

#[derive(Deserialize)]
struct LocatorJson {
    #[serde(default)]
    files: Vec<FileJson>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct FileJson {
    #[serde(default)]
    path: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    line_number: Option<serde_json::Value>,
}

/// Strip markdown code fences from a response.
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between matching delimiters.
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start <= end).then(|| &text[start..=end])
}

/// Line numbers arrive as numbers, numeric strings or null.
fn lenient_line(value: Option<&serde_json::Value>) -> Option<u32> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse `{files:[{path,reason,line_number}],summary}`, tolerating fences and
/// prose around the object. Entries without a path are dropped.
pub fn parse_locator_response(text: &str) -> Result<LocateOutcome, String> {
    let clean = strip_markdown_fences(text);
    let json = extract_json_fragment(clean, '{', '}').ok_or("no JSON object in response")?;
    let parsed: LocatorJson = serde_json::from_str(json).map_err(|e| e.to_string())?;

    let candidates: Vec<CandidateLocation> = parsed
        .files
        .into_iter()
        .filter_map(|f| {
            let path = sanitize_path(f.path);
            if path.is_empty() {
                return None;
            }
            Some(CandidateLocation {
                path,
                justification: f.reason,
                line_number: lenient_line(f.line_number.as_ref()),
            })
        })
        .collect();

    let summary = if parsed.summary.trim().is_empty() {
        format!("Found {} relevant file(s)", candidates.len())
    } else {
        parsed.summary
    };
    Ok(LocateOutcome {
        candidates,
        summary,
    })
}

// ---------------------------------------------------------------------------
// StackTraceLocator
// ---------------------------------------------------------------------------

/// Deterministic locator: in-app stack frames, innermost first.
#[derive(Debug, Default, Clone)]
pub struct StackTraceLocator;

#[async_trait]
impl CodeLocator for StackTraceLocator {
    async fn locate(&self, _repository: &RepoRef, report: &ErrorReport) -> LocateOutcome {
        let mut seen = HashSet::new();
        let candidates: Vec<CandidateLocation> = report
            .stack_frames
            .iter()
            .rev()
            .filter(|f| f.in_app && !f.filename.trim().is_empty())
            .filter(|f| seen.insert((f.filename.clone(), f.line_number)))
            .map(|f| {
                let justification = match (&f.function, f.line_number) {
                    (Some(func), Some(line)) => {
                        format!("{} raised in {func} at line {line}", report.error_type)
                    }
                    (Some(func), None) => format!("{} raised in {func}", report.error_type),
                    (None, Some(line)) => format!("{} raised at line {line}", report.error_type),
                    (None, None) => format!("{} raised in this file", report.error_type),
                };
                CandidateLocation {
                    path: f.filename.clone(),
                    justification,
                    line_number: f.line_number,
                }
            })
            .collect();

        if candidates.is_empty() {
            return LocateOutcome::failed("No in-app frames in the stack trace");
        }
        let summary = format!("{} in-app frame(s) from the stack trace", candidates.len());
        LocateOutcome {
            candidates,
            summary,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bh_core::types::StackFrame;

    #[test]
    fn parses_plain_json() {
        let outcome = parse_locator_response(
            r#"{"files":[{"path":"app.py","reason":"raises KeyError","line_number":10}],"summary":"handler bug"}"#,
        )
        .unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].line_number, Some(10));
        assert_eq!(outcome.summary, "handler bug");
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let text = "Here you go:\n```json\n{\"files\": [{\"path\": \"`src/a.py`\", \"reason\": \"r\", \"line_number\": \"7\"}, {\"path\": \"\", \"reason\": \"x\"}]}\n```\nHope that helps.";
        let outcome = parse_locator_response(text).unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].path, "src/a.py");
        assert_eq!(outcome.candidates[0].line_number, Some(7));
        assert_eq!(outcome.summary, "Found 1 relevant file(s)");
    }

    #[test]
    fn keeps_duplicate_paths() {
        let outcome = parse_locator_response(
            r#"{"files":[{"path":"a.py","reason":"one"},{"path":"a.py","reason":"two"}],"summary":"s"}"#,
        )
        .unwrap();
        assert_eq!(outcome.candidates.len(), 2);
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_locator_response("I could not find anything").is_err());
    }

    fn frame(file: &str, func: &str, line: u32, in_app: bool) -> StackFrame {
        StackFrame {
            filename: file.into(),
            function: Some(func.into()),
            line_number: Some(line),
            in_app,
        }
    }

    #[tokio::test]
    async fn stack_trace_locator_orders_innermost_first() {
        let mut report = ErrorReport::new("1", "KeyError", "'foo'");
        report.stack_frames = vec![
            frame("site-packages/flask/app.py", "dispatch", 100, false),
            frame("views.py", "index", 20, true),
            frame("app.py", "handler", 10, true),
            frame("app.py", "handler", 10, true),
        ];
        let outcome = StackTraceLocator
            .locate(&RepoRef::new("acme", "shop"), &report)
            .await;
        let paths: Vec<&str> = outcome.candidates.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["app.py", "views.py"]);
        assert_eq!(
            outcome.candidates[0].justification,
            "KeyError raised in handler at line 10"
        );
    }

    #[tokio::test]
    async fn stack_trace_locator_without_frames() {
        let report = ErrorReport::new("1", "KeyError", "'foo'");
        let outcome = StackTraceLocator
            .locate(&RepoRef::new("acme", "shop"), &report)
            .await;
        assert!(outcome.candidates.is_empty());
        assert!(!outcome.summary.is_empty());
    }
}
