//! Sentry issue tracker over the REST API.

use async_trait::async_trait;
use bh_core::collaborators::{CollaboratorError, IssueSummary, IssueTracker};
use bh_core::config::SentryConfig;
use bh_core::types::{ErrorReport, StackFrame};
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SentryError {
    #[error("missing Sentry token")]
    MissingToken,

    #[error("missing Sentry organization slug")]
    MissingOrganization,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Sentry API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected Sentry payload: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SentryError>;

impl From<SentryError> for CollaboratorError {
    fn from(err: SentryError) -> Self {
        match err {
            SentryError::NotFound(what) => CollaboratorError::NotFound(what),
            SentryError::Api { status, message } => CollaboratorError::Api { status, message },
            SentryError::InvalidResponse(msg) => CollaboratorError::InvalidResponse(msg),
            SentryError::Http(e) => CollaboratorError::Transport(e.to_string()),
            other @ (SentryError::MissingToken | SentryError::MissingOrganization) => {
                CollaboratorError::InvalidResponse(other.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentryClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    organization: Option<String>,
    project: Option<String>,
    query: String,
    stats_period: String,
}

impl SentryClient {
    pub fn new(config: &SentryConfig, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(SentryError::MissingToken);
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            organization: config.organization.clone(),
            project: config.project.clone(),
            query: config.query.clone(),
            stats_period: config.stats_period.clone(),
        })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "sentry request");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(SentryError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SentryError::Api {
                status: status.as_u16(),
                message,
            });
        }
        resp.json()
            .await
            .map_err(|e| SentryError::InvalidResponse(e.to_string()))
    }

    /// Latest event of an issue, mapped into an [`ErrorReport`].
    pub async fn latest_event(&self, issue_id: &str) -> Result<ErrorReport> {
        let path = format!("/api/0/issues/{issue_id}/events/");
        let body = self.get_json(&path, &[]).await?;
        let event = body
            .as_array()
            .and_then(|events| events.first())
            .ok_or_else(|| SentryError::NotFound(format!("issue {issue_id} has no events")))?;
        let report = event_to_report(issue_id, event);
        info!(
            issue_id,
            error_type = %report.error_type,
            frames = report.stack_frames.len(),
            "fetched sentry event"
        );
        Ok(report)
    }

    /// Unresolved issues in the configured project, or the whole organization
    /// when no project is set.
    pub async fn unresolved_issues(&self, limit: usize) -> Result<Vec<IssueSummary>> {
        let org = self
            .organization
            .as_deref()
            .ok_or(SentryError::MissingOrganization)?;
        let path = match &self.project {
            Some(project) => format!("/api/0/projects/{org}/{project}/issues/"),
            None => format!("/api/0/organizations/{org}/issues/"),
        };
        let query = [
            ("statsPeriod", self.stats_period.clone()),
            ("query", self.query.clone()),
            ("limit", limit.to_string()),
        ];
        let body = self.get_json(&path, &query).await?;
        let issues = body
            .as_array()
            .ok_or_else(|| SentryError::InvalidResponse("issue list is not an array".into()))?;
        Ok(issues.iter().take(limit).map(issue_summary).collect())
    }
}

#[async_trait]
impl IssueTracker for SentryClient {
    async fn fetch_error_detail(
        &self,
        error_id: &str,
    ) -> std::result::Result<ErrorReport, CollaboratorError> {
        Ok(self.latest_event(error_id).await?)
    }

    async fn list_issues(
        &self,
        limit: usize,
    ) -> std::result::Result<Vec<IssueSummary>, CollaboratorError> {
        Ok(self.unresolved_issues(limit).await?)
    }
}

// ---- payload mapping --------------------------------------------------------

fn non_empty(value: &Value) -> Option<&str> {
    value.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// The first exception value, from either the flattened `exception` key or
/// the `entries` list the events endpoint returns.
fn first_exception(event: &Value) -> Option<&Value> {
    if let Some(first) = event["exception"]["values"].get(0) {
        return Some(first);
    }
    event["entries"]
        .as_array()?
        .iter()
        .find(|e| e["type"] == "exception")
        .and_then(|e| e["data"]["values"].get(0))
}

fn parse_frame(frame: &Value) -> Option<StackFrame> {
    let filename = non_empty(&frame["filename"])
        .or_else(|| non_empty(&frame["absPath"]))
        .or_else(|| non_empty(&frame["module"]))?;
    let line_number = frame["lineNo"]
        .as_u64()
        .or_else(|| frame["lineno"].as_u64())
        .and_then(|n| u32::try_from(n).ok());
    let in_app = frame["inApp"]
        .as_bool()
        .or_else(|| frame["in_app"].as_bool())
        .unwrap_or(false);
    Some(StackFrame {
        filename: filename.to_string(),
        function: non_empty(&frame["function"]).map(str::to_string),
        line_number,
        in_app,
    })
}

/// Map a Sentry event payload. Missing fields degrade to `"Unknown"` or
/// empty values; mapping never fails.
pub fn event_to_report(issue_id: &str, event: &Value) -> ErrorReport {
    let exception = first_exception(event);

    let error_type = exception
        .and_then(|e| non_empty(&e["type"]))
        .or_else(|| non_empty(&event["metadata"]["type"]))
        .or_else(|| non_empty(&event["type"]).filter(|t| *t != "error" && *t != "default"))
        .or_else(|| non_empty(&event["title"]))
        .unwrap_or("Unknown")
        .to_string();

    let message = non_empty(&event["metadata"]["value"])
        .or_else(|| non_empty(&event["message"]))
        .or_else(|| exception.and_then(|e| non_empty(&e["value"])))
        .unwrap_or_default()
        .to_string();

    let frames = exception
        .and_then(|e| e["stacktrace"]["frames"].as_array())
        .or_else(|| event["stacktrace"]["frames"].as_array());
    let stack_frames = frames
        .map(|frames| frames.iter().filter_map(parse_frame).collect())
        .unwrap_or_default();

    let mut report = ErrorReport::new(issue_id, error_type, message);
    report.culprit = non_empty(&event["culprit"]).map(str::to_string);
    report.stack_frames = stack_frames;
    report.raw = event.clone();
    report
}

pub fn issue_summary(issue: &Value) -> IssueSummary {
    let event_count = issue["count"]
        .as_u64()
        .or_else(|| issue["count"].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0);
    let last_seen = issue["lastSeen"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    IssueSummary {
        id: issue["id"].as_str().unwrap_or_default().to_string(),
        short_id: issue["shortId"].as_str().unwrap_or_default().to_string(),
        title: issue["title"].as_str().unwrap_or_default().to_string(),
        event_count,
        last_seen,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_flattened_exception() {
        let event = json!({
            "title": "KeyError: 'foo'",
            "culprit": "app in handler",
            "metadata": {"type": "KeyError", "value": "'foo'"},
            "exception": {"values": [{
                "type": "KeyError",
                "value": "'foo'",
                "stacktrace": {"frames": [
                    {"filename": "flask/app.py", "function": "dispatch", "lineno": 900, "in_app": false},
                    {"filename": "app.py", "function": "handler", "lineno": 10, "in_app": true}
                ]}
            }]}
        });
        let report = event_to_report("42", &event);
        assert_eq!(report.id, "42");
        assert_eq!(report.error_type, "KeyError");
        assert_eq!(report.message, "'foo'");
        assert_eq!(report.culprit.as_deref(), Some("app in handler"));
        assert_eq!(report.stack_frames.len(), 2);
        assert!(report.stack_frames[1].in_app);
        assert_eq!(report.stack_frames[1].line_number, Some(10));
    }

    #[test]
    fn maps_entries_layout() {
        let event = json!({
            "title": "ZeroDivisionError",
            "entries": [
                {"type": "breadcrumbs", "data": {}},
                {"type": "exception", "data": {"values": [{
                    "type": "ZeroDivisionError",
                    "value": "division by zero",
                    "stacktrace": {"frames": [
                        {"absPath": "/srv/app/calc.py", "function": "ratio", "lineNo": 7, "inApp": true}
                    ]}
                }]}}
            ]
        });
        let report = event_to_report("7", &event);
        assert_eq!(report.error_type, "ZeroDivisionError");
        assert_eq!(report.message, "division by zero");
        assert_eq!(report.stack_frames[0].filename, "/srv/app/calc.py");
        assert_eq!(report.stack_frames[0].line_number, Some(7));
    }

    #[test]
    fn falls_back_to_title_and_message() {
        let event = json!({"type": "default", "title": "Something broke", "message": "boom"});
        let report = event_to_report("1", &event);
        assert_eq!(report.error_type, "Something broke");
        assert_eq!(report.message, "boom");
        assert!(report.stack_frames.is_empty());
    }

    #[test]
    fn maps_issue_summary() {
        let issue = json!({
            "id": "123",
            "shortId": "SHOP-1A",
            "title": "KeyError: 'foo'",
            "count": "57",
            "lastSeen": "2026-03-01T12:00:00Z"
        });
        let summary = issue_summary(&issue);
        assert_eq!(summary.short_id, "SHOP-1A");
        assert_eq!(summary.event_count, 57);
        assert!(summary.last_seen.is_some());
    }

    #[test]
    fn empty_token_is_rejected() {
        let err = SentryClient::new(&SentryConfig::default(), "  ").unwrap_err();
        assert!(matches!(err, SentryError::MissingToken));
    }
}
