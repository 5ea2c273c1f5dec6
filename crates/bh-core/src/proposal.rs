//! Best-effort extraction of a [`FixProposal`] from model output.
//!
//! The model is asked to answer with labelled sections:
//!
//! ~~~text
//! **File to Fix:** app.py
//! **Problem:**
//! ...
//! **Solution:**
//! ...
//! **Fixed Code:**
//! ```python
//! ...
//! ```
//! **PR Title:**
//! ...
//! **PR Description:**
//! ...
//! ~~~
//!
//! Each recognised marker opens a section that runs until the next recognised
//! marker or the end of input. Markers inside a closed code fence are treated
//! as code. Parsing never fails; missing sections fall back to defaults.

use crate::types::FixProposal;

/// Title used when the model gave none.
pub const DEFAULT_PR_TITLE: &str = "Fix: Bug resolution";

const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    TargetFile,
    Problem,
    Solution,
    FixedCode,
    PrTitle,
    PrDescription,
}

const MARKERS: [(&str, Section); 6] = [
    ("**File to Fix:**", Section::TargetFile),
    ("**Problem:**", Section::Problem),
    ("**Solution:**", Section::Solution),
    ("**Fixed Code:**", Section::FixedCode),
    ("**PR Title:**", Section::PrTitle),
    ("**PR Description:**", Section::PrDescription),
];

impl Section {
    fn is_single_line(self) -> bool {
        matches!(self, Section::TargetFile | Section::PrTitle)
    }
}

struct RawSection<'a> {
    section: Section,
    /// Remainder of the marker line.
    head: &'a str,
    body: Vec<&'a str>,
}

/// Parse free-form model output. Never fails.
pub fn parse(raw: &str) -> FixProposal {
    let lines: Vec<&str> = raw.lines().collect();
    let fenced = closed_fence_mask(&lines);
    let sections = split_sections(&lines, &fenced);

    let first = |wanted: Section| sections.iter().find(|s| s.section == wanted);

    let target_file = first(Section::TargetFile)
        .and_then(single_line_value)
        .map(sanitize_path)
        .filter(|p| !p.is_empty());

    let patched_content = match first(Section::FixedCode) {
        Some(section) => {
            let mut code_lines = vec![section.head];
            code_lines.extend(section.body.iter().copied());
            first_fenced_block(&code_lines)
        }
        None => first_fenced_block(&lines),
    }
    .filter(|code| !code.trim().is_empty());

    let pr_title = first(Section::PrTitle)
        .and_then(single_line_value)
        .unwrap_or_else(|| DEFAULT_PR_TITLE.to_string());

    let pr_description = first(Section::PrDescription)
        .and_then(multi_line_value)
        .unwrap_or_else(|| raw.to_string());

    FixProposal {
        target_file,
        problem_statement: first(Section::Problem).and_then(multi_line_value),
        solution_rationale: first(Section::Solution).and_then(multi_line_value),
        patched_content,
        pr_title,
        pr_description,
    }
}

/// Strip surrounding quotes, backticks and whitespace from a path.
pub fn sanitize_path(value: String) -> String {
    value
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '`' | '"' | '\''))
        .to_string()
}

fn is_fence(line: &str) -> bool {
    line.trim_start().starts_with(FENCE)
}

/// Marks every line that belongs to a closed fence pair (fences included).
/// An opening fence without a partner marks nothing.
fn closed_fence_mask(lines: &[&str]) -> Vec<bool> {
    let mut mask = vec![false; lines.len()];
    let mut i = 0;
    while i < lines.len() {
        if is_fence(lines[i]) {
            match (i + 1..lines.len()).find(|&j| is_fence(lines[j])) {
                Some(close) => {
                    mask[i..=close].iter_mut().for_each(|m| *m = true);
                    i = close + 1;
                    continue;
                }
                None => break,
            }
        }
        i += 1;
    }
    mask
}

fn match_marker(line: &str) -> Option<(Section, &str)> {
    MARKERS
        .iter()
        .filter_map(|(marker, section)| {
            line.find(marker)
                .map(|idx| (idx, *section, &line[idx + marker.len()..]))
        })
        .min_by_key(|(idx, _, _)| *idx)
        .map(|(_, section, rest)| (section, rest))
}

fn split_sections<'a>(lines: &[&'a str], fenced: &[bool]) -> Vec<RawSection<'a>> {
    let mut sections: Vec<RawSection<'a>> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if !fenced[idx] {
            if let Some((section, rest)) = match_marker(line) {
                sections.push(RawSection {
                    section,
                    head: rest,
                    body: Vec::new(),
                });
                continue;
            }
        }
        if let Some(current) = sections.last_mut() {
            current.body.push(line);
        }
    }
    sections
}

fn single_line_value(section: &RawSection<'_>) -> Option<String> {
    debug_assert!(section.section.is_single_line());
    let head = section.head.trim();
    if !head.is_empty() {
        return Some(head.to_string());
    }
    section
        .body
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn multi_line_value(section: &RawSection<'_>) -> Option<String> {
    let mut parts = Vec::with_capacity(section.body.len() + 1);
    if !section.head.trim().is_empty() {
        parts.push(section.head.trim());
    }
    parts.extend(section.body.iter().copied());
    let joined = parts.join("\n");
    let trimmed = joined.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Content strictly between the first opening fence and its closing fence.
fn first_fenced_block(lines: &[&str]) -> Option<String> {
    let open = lines.iter().position(|l| is_fence(l))?;
    let close = lines[open + 1..].iter().position(|l| is_fence(l))? + open + 1;
    Some(lines[open + 1..close].join("\n"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = "\
**File to Fix:** `app.py`

**Problem:**
The handler reads a missing key.

**Solution:**
Use dict.get with a default.

**Fixed Code:**
```python
def handler(data):
    return data.get('foo', None)
```

**PR Title:**
Guard against missing 'foo' key

**PR Description:**
Replaces direct indexing with `dict.get`.

Fixes the KeyError seen in production.";

    #[test]
    fn extracts_all_six_sections() {
        let proposal = parse(WELL_FORMED);
        assert_eq!(proposal.target_file.as_deref(), Some("app.py"));
        assert_eq!(
            proposal.problem_statement.as_deref(),
            Some("The handler reads a missing key.")
        );
        assert_eq!(
            proposal.solution_rationale.as_deref(),
            Some("Use dict.get with a default.")
        );
        assert_eq!(
            proposal.patched_content.as_deref(),
            Some("def handler(data):\n    return data.get('foo', None)")
        );
        assert_eq!(proposal.pr_title, "Guard against missing 'foo' key");
        assert_eq!(
            proposal.pr_description,
            "Replaces direct indexing with `dict.get`.\n\nFixes the KeyError seen in production."
        );
    }

    #[test]
    fn no_sections_yields_defaults() {
        let raw = "I could not work out what is wrong here.\nSorry.";
        let proposal = parse(raw);
        assert_eq!(proposal.target_file, None);
        assert_eq!(proposal.problem_statement, None);
        assert_eq!(proposal.solution_rationale, None);
        assert_eq!(proposal.patched_content, None);
        assert_eq!(proposal.pr_title, DEFAULT_PR_TITLE);
        assert_eq!(proposal.pr_description, raw);
    }

    #[test]
    fn empty_input_yields_defaults() {
        let proposal = parse("");
        assert_eq!(proposal.pr_title, DEFAULT_PR_TITLE);
        assert_eq!(proposal.pr_description, "");
        assert!(proposal.target_file.is_none());
    }

    #[test]
    fn unclosed_fence_extracts_no_code() {
        let raw = "**Fixed Code:**\n```python\nprint('half')\n**PR Title:** Still parsed";
        let proposal = parse(raw);
        assert_eq!(proposal.patched_content, None);
        assert_eq!(proposal.pr_title, "Still parsed");
    }

    #[test]
    fn markers_inside_code_are_code() {
        let raw = "**Fixed Code:**\n```\nlabel = '**PR Title:** not a title'\n```\n**PR Title:** Real title";
        let proposal = parse(raw);
        assert_eq!(
            proposal.patched_content.as_deref(),
            Some("label = '**PR Title:** not a title'")
        );
        assert_eq!(proposal.pr_title, "Real title");
    }

    #[test]
    fn only_first_code_block_is_taken() {
        let raw = "**Fixed Code:**\n```\nfirst\n```\n```\nsecond\n```";
        assert_eq!(parse(raw).patched_content.as_deref(), Some("first"));
    }

    #[test]
    fn code_found_without_fixed_code_marker() {
        let raw = "Here is the fix:\n```rust\nfn main() {}\n```";
        assert_eq!(parse(raw).patched_content.as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn marker_is_case_sensitive() {
        let proposal = parse("**pr title:** lower case");
        assert_eq!(proposal.pr_title, DEFAULT_PR_TITLE);
    }

    #[test]
    fn target_file_is_sanitized() {
        let proposal = parse("**File to Fix:**  \"`src/app.py`\"  ");
        assert_eq!(proposal.target_file.as_deref(), Some("src/app.py"));

        let blank = parse("**File to Fix:** ``");
        assert_eq!(blank.target_file, None);
    }

    #[test]
    fn title_on_marker_line_wins() {
        let proposal = parse("**PR Title:** Inline title\nNext line");
        assert_eq!(proposal.pr_title, "Inline title");
    }

    #[test]
    fn empty_description_falls_back_to_raw_text() {
        let raw = "**PR Title:** T\n**PR Description:**\n   \n";
        assert_eq!(parse(raw).pr_description, raw);
    }
}
