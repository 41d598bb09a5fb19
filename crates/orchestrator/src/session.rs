//! Remote agent-session service.
//!
//! Sessions are long-running remote units of work identified by an opaque
//! resource name (`sessions/{id}`), queried through a status endpoint and a
//! paginated activity feed. Response shapes are not a stable contract, so
//! everything here works on raw JSON trees: field lookup is an explicit
//! ordered list of extraction attempts, and transcript accumulation just
//! concatenates every string leaf it can find.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::OrchestratorError;

/// Remote session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unset,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Lenient parse: anything unrecognized is treated as `Unset`
    /// (non-terminal), so an unknown state keeps the poll loop alive.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUNNING" | "IN_PROGRESS" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" => Self::Cancelled,
            _ => Self::Unset,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "UNSET"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct SessionSpec<'a> {
    pub prompt: &'a str,
    /// Source repository the session works against.
    pub source: &'a str,
    pub title: Option<String>,
    pub starting_branch: Option<&'a str>,
    /// Remote automation mode, e.g. `AUTO_CREATE_PR` for development runs.
    pub automation_mode: Option<&'a str>,
    pub require_plan_approval: bool,
}

/// The agent-session collaborator contract.
///
/// All methods return raw JSON trees; callers resolve fields through the
/// duck-typed helpers below.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn create_session(&self, spec: SessionSpec<'_>) -> Result<Value>;
    async fn get_session(&self, session: &str) -> Result<Value>;
    async fn list_activities(&self, session: &str, page_token: Option<&str>) -> Result<Value>;
    async fn send_message(&self, session: &str, prompt: &str) -> Result<Value>;
    async fn approve_plan(&self, session: &str) -> Result<Value>;
}

/// Resolve the session resource name from a create/get response.
///
/// Ordered attempts: `name`, `session.name`, `id`.
pub fn session_name_from(resp: &Value) -> Result<String> {
    let attempts = [
        resp.get("name"),
        resp.get("session").and_then(|s| s.get("name")),
        resp.get("id"),
    ];
    for candidate in attempts.into_iter().flatten() {
        if let Some(name) = candidate.as_str() {
            if !name.is_empty() {
                return Ok(name.to_string());
            }
        }
    }
    anyhow::bail!("could not determine session id from response")
}

/// Resolve the session state from a get-session response.
///
/// Ordered attempts: `state`, `status`.
pub fn session_state_from(resp: &Value) -> SessionState {
    for key in ["state", "status"] {
        if let Some(raw) = resp.get(key).and_then(Value::as_str) {
            return SessionState::parse(raw);
        }
    }
    SessionState::Unset
}

/// Collect every string leaf of a JSON tree, in document order.
pub fn flatten_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => {
            for item in items {
                flatten_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                flatten_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Accumulate the session transcript by paginating through the activity
/// feed, up to `max_pages` pages per call.
pub async fn collect_activity_text(
    svc: &dyn SessionService,
    session: &str,
    max_pages: usize,
) -> Result<String> {
    let mut text = String::new();
    let mut page_token: Option<String> = None;
    for _ in 0..max_pages {
        let page = svc.list_activities(session, page_token.as_deref()).await?;
        let mut parts = Vec::new();
        flatten_strings(&page, &mut parts);
        for part in parts {
            text.push_str(part);
            text.push('\n');
        }
        page_token = page
            .get("nextPageToken")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_owned);
        if page_token.is_none() {
            break;
        }
    }
    Ok(text)
}

const DEFAULT_ATTEMPTS: u32 = 3;
// Freshly created sessions can 404 for a while before becoming queryable.
const NOT_FOUND_ATTEMPTS: u32 = 6;
const ACTIVITY_PAGE_SIZE: u32 = 50;

/// REST client for the agent-session API, one instance per role key.
pub struct SessionClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl SessionClient {
    pub fn new(api_key: impl Into<String>, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Normalize a possibly-qualified resource name down to `sessions/{id}`.
    fn normalize_name(session: &str) -> String {
        const MARKER: &str = "sessions/";
        match session.rsplit_once(MARKER) {
            Some((_, id)) => format!("{MARKER}{id}"),
            None => format!("{MARKER}{session}"),
        }
    }

    fn session_path(session: &str) -> String {
        format!("/{}", Self::normalize_name(session))
    }

    /// Issue one request with bounded exponential backoff on transient
    /// failures (429/5xx, plus 404 when `retry_on_not_found`).
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        retry_on_not_found: bool,
        max_attempts: u32,
    ) -> Result<Value> {
        let url = format!("{}{}", self.api_base, path);
        for attempt in 1..=max_attempts {
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("x-goog-api-key", &self.api_key)
                .timeout(Duration::from_secs(30));
            if let Some(ref body) = body {
                req = req.json(body);
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status.is_success() {
                return Ok(resp.json().await?);
            }
            let retryable = (status.as_u16() == 404 && retry_on_not_found)
                || status.as_u16() == 429
                || status.is_server_error();
            if retryable && attempt < max_attempts {
                let delay = Duration::from_secs(1 << attempt);
                debug!(%url, %status, attempt, "transient agent API failure, backing off");
                tokio::time::sleep(delay).await;
                continue;
            }
            let text = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::AgentApi {
                status: status.as_u16(),
                method: method.to_string(),
                url,
                body: text,
            }
            .into());
        }
        unreachable!("request loop always returns")
    }
}

#[async_trait]
impl SessionService for SessionClient {
    async fn create_session(&self, spec: SessionSpec<'_>) -> Result<Value> {
        let mut repo_context = json!({});
        if let Some(branch) = spec.starting_branch {
            repo_context["startingBranch"] = json!(branch);
        }
        let mut body = json!({
            "prompt": spec.prompt,
            "sourceContext": {
                "source": spec.source,
                "githubRepoContext": repo_context,
            },
        });
        if let Some(title) = spec.title {
            body["title"] = json!(title);
        }
        if let Some(mode) = spec.automation_mode {
            body["automationMode"] = json!(mode);
        }
        if spec.require_plan_approval {
            body["requirePlanApproval"] = json!(true);
        }
        self.request(Method::POST, "/sessions", Some(body), false, DEFAULT_ATTEMPTS)
            .await
    }

    async fn get_session(&self, session: &str) -> Result<Value> {
        self.request(
            Method::GET,
            &Self::session_path(session),
            None,
            true,
            NOT_FOUND_ATTEMPTS,
        )
        .await
    }

    async fn list_activities(&self, session: &str, page_token: Option<&str>) -> Result<Value> {
        let mut path = format!(
            "{}/activities?pageSize={ACTIVITY_PAGE_SIZE}",
            Self::session_path(session)
        );
        if let Some(token) = page_token {
            path.push_str("&pageToken=");
            path.push_str(token);
        }
        self.request(Method::GET, &path, None, true, NOT_FOUND_ATTEMPTS)
            .await
    }

    async fn send_message(&self, session: &str, prompt: &str) -> Result<Value> {
        let path = format!("{}:sendMessage", Self::session_path(session));
        self.request(
            Method::POST,
            &path,
            Some(json!({ "prompt": prompt })),
            false,
            DEFAULT_ATTEMPTS,
        )
        .await
    }

    async fn approve_plan(&self, session: &str) -> Result<Value> {
        let path = format!("{}:approvePlan", Self::session_path(session));
        self.request(Method::POST, &path, None, false, DEFAULT_ATTEMPTS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_ordered_attempts() {
        let resp = json!({"name": "sessions/a"});
        assert_eq!(session_name_from(&resp).unwrap(), "sessions/a");

        let resp = json!({"session": {"name": "sessions/b"}});
        assert_eq!(session_name_from(&resp).unwrap(), "sessions/b");

        let resp = json!({"id": "c"});
        assert_eq!(session_name_from(&resp).unwrap(), "c");

        // `name` wins over the nested and `id` forms
        let resp = json!({"name": "sessions/a", "session": {"name": "sessions/b"}, "id": "c"});
        assert_eq!(session_name_from(&resp).unwrap(), "sessions/a");

        assert!(session_name_from(&json!({"state": "RUNNING"})).is_err());
        assert!(session_name_from(&json!({"name": ""})).is_err());
    }

    #[test]
    fn test_session_state_ordered_attempts() {
        assert_eq!(
            session_state_from(&json!({"state": "RUNNING"})),
            SessionState::Running
        );
        assert_eq!(
            session_state_from(&json!({"status": "completed"})),
            SessionState::Completed
        );
        assert_eq!(
            session_state_from(&json!({"state": "weird"})),
            SessionState::Unset
        );
        assert_eq!(session_state_from(&json!({})), SessionState::Unset);
    }

    #[test]
    fn test_state_parse_and_terminality() {
        assert_eq!(SessionState::parse("failed"), SessionState::Failed);
        assert!(SessionState::Failed.is_failure());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(!SessionState::Completed.is_failure());
        assert!(!SessionState::parse("???").is_terminal());
    }

    #[test]
    fn test_flatten_strings_walks_nested_structures() {
        let page = json!({
            "activities": [
                {"agentMessaged": {"message": "hello"}},
                {"progressUpdated": {"title": "step", "details": ["a", "b"]}},
            ],
            "nextPageToken": "tok",
        });
        let mut parts = Vec::new();
        flatten_strings(&page, &mut parts);
        assert!(parts.contains(&"hello"));
        assert!(parts.contains(&"a"));
        assert!(parts.contains(&"tok"));
    }

    #[test]
    fn test_normalize_session_name() {
        assert_eq!(SessionClient::normalize_name("abc"), "sessions/abc");
        assert_eq!(SessionClient::normalize_name("sessions/abc"), "sessions/abc");
        assert_eq!(
            SessionClient::normalize_name("projects/p/sessions/abc"),
            "sessions/abc"
        );
    }
}
