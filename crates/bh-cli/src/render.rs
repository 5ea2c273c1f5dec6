//! Plain-text rendering for terminal output.

use std::fmt::Write;

use bh_agents::bus::StageUpdate;
use bh_core::collaborators::IssueSummary;
use bh_core::types::{ApprovalState, LogLevel, Task, TaskLogEntry};

fn level_tag(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Success => " ok ",
        LogLevel::Warning => "warn",
        LogLevel::Error => "FAIL",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

pub fn log_line(entry: &TaskLogEntry) -> String {
    let stage = entry
        .stage
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} [{}] {:<14} {}",
        entry.timestamp.format("%H:%M:%S"),
        level_tag(entry.level),
        stage,
        entry.message
    )
}

/// Lines printed for one live update: its log entries.
pub fn update_lines(update: &StageUpdate) -> Vec<String> {
    update.update.log.iter().map(log_line).collect()
}

pub fn issue_table(issues: &[IssueSummary]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<12} {:<14} {:>7}  {:<17} TITLE", "ID", "SHORT ID", "EVENTS", "LAST SEEN");
    for issue in issues {
        let last_seen = issue
            .last_seen
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<12} {:<14} {:>7}  {:<17} {}",
            issue.id,
            issue.short_id,
            issue.event_count,
            last_seen,
            truncate(&issue.title, 60)
        );
    }
    out
}

pub fn task_table(tasks: &[Task]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<20} {:<18} {:<9} {:<16} ERROR", "TASK", "STATUS", "APPROVAL", "UPDATED");
    for task in tasks {
        let _ = writeln!(
            out,
            "{:<20} {:<18} {:<9} {:<16} {}",
            truncate(&task.id, 20),
            task.status.to_string(),
            task.approval.to_string(),
            task.updated_at.format("%Y-%m-%d %H:%M"),
            truncate(&task.error_report.headline(), 50)
        );
    }
    out
}

pub fn task_summary(task: &Task) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Task {} ({})", task.id, task.repository);
    let _ = writeln!(out, "  error:    {}", task.error_report.headline());
    let _ = writeln!(out, "  status:   {}", task.status);
    let _ = writeln!(out, "  approval: {}", task.approval);

    if !task.candidate_locations.is_empty() {
        let _ = writeln!(out, "  candidates:");
        for c in &task.candidate_locations {
            match c.line_number {
                Some(line) => {
                    let _ = writeln!(out, "    {}:{}  {}", c.path, line, c.justification);
                }
                None => {
                    let _ = writeln!(out, "    {}  {}", c.path, c.justification);
                }
            }
        }
    }
    if let Some(fix) = &task.fix_proposal {
        let _ = writeln!(out, "  proposal: {}", fix.pr_title);
        if let Some(file) = &fix.target_file {
            let _ = writeln!(out, "  file:     {file}");
        }
    }
    if let Some(result) = &task.sandbox_result {
        let verdict = if result.succeeded {
            "passed"
        } else if result.timed_out {
            "timed out"
        } else {
            "failed"
        };
        let _ = writeln!(out, "  sandbox:  {verdict} ({} ms)", result.duration_ms);
    }
    if let Some(pr) = &task.pull_request {
        let _ = writeln!(out, "  pull request #{}: {}", pr.number, pr.url);
    }
    if let Some(failure) = &task.failure {
        let _ = writeln!(out, "  failed in {}: {}", failure.stage, failure.message);
    }
    if task.approval == ApprovalState::Rejected {
        let _ = writeln!(out, "  the fix was rejected; nothing was published");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bh_core::types::{
        CandidateLocation, ErrorReport, PullRequestRef, RepoRef, StageName, WorkflowStatus,
    };

    fn task() -> Task {
        let mut task = Task::new(
            "4711",
            ErrorReport::new("4711", "KeyError", "'foo'"),
            RepoRef::new("acme", "shop"),
        );
        task.candidate_locations = vec![CandidateLocation::new("app.py", "raises").at_line(10)];
        task
    }

    #[test]
    fn summary_mentions_the_essentials() {
        let mut t = task();
        t.status = WorkflowStatus::Completed;
        t.approval = ApprovalState::Approved;
        t.pull_request = Some(PullRequestRef {
            url: "https://github.com/acme/shop/pull/7".into(),
            number: 7,
        });
        let text = task_summary(&t);
        assert!(text.contains("Task 4711 (acme/shop)"));
        assert!(text.contains("KeyError: 'foo'"));
        assert!(text.contains("app.py:10"));
        assert!(text.contains("pull request #7"));
    }

    #[test]
    fn log_line_shows_stage_and_level() {
        let entry = TaskLogEntry::new(Some(StageName::Verify), LogLevel::Error, "boom");
        let line = log_line(&entry);
        assert!(line.contains("[FAIL]"));
        assert!(line.contains("verify"));
        assert!(line.ends_with("boom"));
    }

    #[test]
    fn long_titles_are_truncated() {
        assert_eq!(truncate("abcdef", 5), "ab...");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[test]
    fn tables_have_one_row_per_item() {
        let table = task_table(&[task(), task()]);
        assert_eq!(table.lines().count(), 3);
    }
}
