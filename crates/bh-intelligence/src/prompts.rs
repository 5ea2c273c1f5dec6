//! Prompt templates for locating faulty code and drafting fixes.
//!
//! Templates use `{variable}` placeholders expanded by [`render`].

use std::collections::HashMap;

use bh_core::types::{CandidateLocation, ErrorReport, RepoRef};

pub const LOCATOR_SYSTEM: &str =
    "You are a code detective. You read production error reports and point at the files most likely to contain the fault.";

pub const FIX_SYSTEM: &str =
    "You are a senior software engineer tasked with fixing a production bug.";

const LOCATOR_TEMPLATE: &str = r#"Analyze this error report for the GitHub repository {repository} and identify the source files likely causing it.

Error Information:
- Error Type: {error_type}
- Error Message: {error_message}
- Culprit: {culprit}
- Stack Trace: {stack_trace}

Look for files mentioned in the stack trace (file paths, function names) and files whose responsibilities match the error. For each file give the full path, a brief reason it is relevant, and the line number if the stack trace mentions one.

Output ONLY valid JSON in this exact format, no extra text:
{
  "files": [
    {"path": "src/app.py", "reason": "Stack trace shows error at line 42 in app.py", "line_number": 42},
    {"path": "utils/helper.py", "reason": "Function called from app.py is defined here", "line_number": null}
  ],
  "summary": "Brief summary of what files are involved and why"
}

If you cannot identify specific files, return an empty files array but still provide a summary based on the error type."#;

const FIX_TEMPLATE: &str = r#"Analyze the error and propose a fix.

ERROR INFORMATION:
- Error Type: {error_type}
- Error Message: {error_message}

{files_context}
FILES ANALYSIS SUMMARY:
{summary}

TASK:
1. Work out what went wrong from the error.
2. Consider the relevant files and why they relate to the error.
3. Propose a fix that addresses the root cause.
4. Show the complete fixed code for the affected file.
5. Provide a clear PR title and description.

OUTPUT FORMAT:
Answer using exactly these section markers:

**File to Fix:** [file path]

**Problem:**
[what is wrong]

**Solution:**
[how the change fixes it]

**Fixed Code:**
```
[the complete new content of the file]
```

**PR Title:** [short title]

**PR Description:**
[description for reviewers]"#;

/// Expand `{key}` placeholders.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut output = template.to_string();
    for (key, value) in vars {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}

/// Pretty JSON of the stack frames, cut to `budget` characters.
pub fn stack_trace_excerpt(report: &ErrorReport, budget: usize) -> String {
    if report.stack_frames.is_empty() {
        return "(none)".to_string();
    }
    let json = serde_json::to_string_pretty(&report.stack_frames).unwrap_or_default();
    json.chars().take(budget).collect()
}

pub fn locator_prompt(report: &ErrorReport, repository: &RepoRef, stack_budget: usize) -> String {
    let mut vars = HashMap::new();
    vars.insert("repository", repository.to_string());
    vars.insert("error_type", report.error_type.clone());
    vars.insert("error_message", report.message.clone());
    vars.insert(
        "culprit",
        report.culprit.clone().unwrap_or_else(|| "unknown".into()),
    );
    vars.insert("stack_trace", stack_trace_excerpt(report, stack_budget));
    render(LOCATOR_TEMPLATE, &vars)
}

fn files_context(candidates: &[CandidateLocation]) -> String {
    if candidates.is_empty() {
        return String::new();
    }
    let mut out = String::from("Relevant files identified:\n");
    for c in candidates {
        out.push_str("- ");
        out.push_str(&c.path);
        if let Some(line) = c.line_number {
            out.push_str(&format!(" (line {line})"));
        }
        out.push_str(": ");
        out.push_str(&c.justification);
        out.push('\n');
    }
    out
}

pub fn fix_prompt(
    report: &ErrorReport,
    candidates: &[CandidateLocation],
    summary: Option<&str>,
) -> String {
    let mut vars = HashMap::new();
    vars.insert("error_type", report.error_type.clone());
    vars.insert("error_message", report.message.clone());
    vars.insert("files_context", files_context(candidates));
    vars.insert(
        "summary",
        summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("No additional summary available")
            .to_string(),
    );
    render(FIX_TEMPLATE, &vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bh_core::types::StackFrame;

    fn report() -> ErrorReport {
        let mut r = ErrorReport::new("1", "KeyError", "'foo'");
        r.stack_frames = (0..50)
            .map(|i| StackFrame {
                filename: format!("module_{i}.py"),
                function: Some("handler".into()),
                line_number: Some(i),
                in_app: true,
            })
            .collect();
        r
    }

    #[test]
    fn stack_trace_is_truncated() {
        let excerpt = stack_trace_excerpt(&report(), 1000);
        assert_eq!(excerpt.chars().count(), 1000);
        assert_eq!(
            stack_trace_excerpt(&ErrorReport::new("1", "E", "m"), 1000),
            "(none)"
        );
    }

    #[test]
    fn locator_prompt_fills_placeholders() {
        let prompt = locator_prompt(&report(), &RepoRef::new("acme", "shop"), 200);
        assert!(prompt.contains("acme/shop"));
        assert!(prompt.contains("Error Type: KeyError"));
        assert!(!prompt.contains("{error_type}"));
        assert!(prompt.contains("\"files\""));
    }

    #[test]
    fn fix_prompt_lists_candidates_and_markers() {
        let candidates = vec![CandidateLocation::new("app.py", "raises here").at_line(10)];
        let prompt = fix_prompt(&report(), &candidates, None);
        assert!(prompt.contains("- app.py (line 10): raises here"));
        assert!(prompt.contains("No additional summary available"));
        for marker in [
            "**File to Fix:**",
            "**Problem:**",
            "**Solution:**",
            "**Fixed Code:**",
            "**PR Title:**",
            "**PR Description:**",
        ] {
            assert!(prompt.contains(marker), "missing {marker}");
        }
    }
}
