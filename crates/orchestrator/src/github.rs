//! Code-host collaborator.
//!
//! The engine only needs a handful of PR operations: find-or-create a PR for
//! a branch, read PR metadata, check and perform merges, and look up the
//! branch a session pushed when the transcript never mentioned one.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Method;
use serde_json::{json, Value};

use crate::error::OrchestratorError;

static PR_URL_PARTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([^/]+)/([^/]+)/pull/(\d+)").expect("valid regex")
});

/// Merge strategy for auto-merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

impl fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeMethod {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            _ => Err(()),
        }
    }
}

/// The PR metadata the engine cares about.
#[derive(Debug, Clone)]
pub struct PrInfo {
    pub number: u64,
    pub html_url: String,
    pub title: Option<String>,
    pub head_ref: Option<String>,
    pub state: Option<String>,
}

impl PrInfo {
    fn from_value(value: &Value, fallback_url: Option<&str>) -> Self {
        Self {
            number: value.get("number").and_then(Value::as_u64).unwrap_or(0),
            html_url: value
                .get("html_url")
                .and_then(Value::as_str)
                .or(fallback_url)
                .unwrap_or_default()
                .to_string(),
            title: value
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_owned),
            head_ref: value
                .get("head")
                .and_then(|h| h.get("ref"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            state: value
                .get("state")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
    }
}

/// Outcome of a merge attempt. A non-merged outcome carries the host's
/// message so it can be recorded on the feature.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub merged: bool,
    pub message: String,
}

/// Code-host collaborator contract.
#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn find_pr_by_head(&self, repo: &str, branch: &str) -> Result<Option<PrInfo>>;
    async fn create_pr(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo>;
    async fn pr_info(&self, pr_url: &str) -> Result<PrInfo>;
    async fn is_merged(&self, pr_url: &str) -> Result<bool>;
    async fn merge_pr(&self, pr_url: &str, method: MergeMethod) -> Result<MergeOutcome>;
    /// Find a branch whose name embeds the given session id.
    async fn find_branch_by_session(&self, repo: &str, session_id: &str)
        -> Result<Option<String>>;
}

/// Split a PR URL into `(owner, repo, number)`.
pub fn parse_pr_url(pr_url: &str) -> Result<(String, String, u64)> {
    let caps = PR_URL_PARTS
        .captures(pr_url)
        .ok_or_else(|| anyhow::anyhow!("unsupported PR url: {pr_url}"))?;
    let number = caps[3].parse()?;
    Ok((caps[1].to_string(), caps[2].to_string(), number))
}

/// GitHub REST implementation of [`CodeHost`].
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let resp = self.send(method, path, body).await?;
        let url = format!("{}{}", self.api_base, path);
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::CodeHostApi {
                status: status.as_u16(),
                url,
                body: text,
            }
            .into());
        }
        Ok(resp.json().await?)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base, path);
        let mut req = self
            .http
            .request(method, &url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "triad-orchestrator")
            .timeout(Duration::from_secs(30));
        if let Some(body) = body {
            req = req.json(&body);
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl CodeHost for GithubClient {
    async fn find_pr_by_head(&self, repo: &str, branch: &str) -> Result<Option<PrInfo>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let path = format!("/repos/{repo}/pulls?head={owner}:{branch}&state=open");
        let list = self.request(Method::GET, &path, None).await?;
        Ok(list
            .as_array()
            .and_then(|items| items.first())
            .map(|pr| PrInfo::from_value(pr, None)))
    }

    async fn create_pr(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PrInfo> {
        let path = format!("/repos/{repo}/pulls");
        let payload = json!({
            "title": title,
            "body": body,
            "head": head,
            "base": base,
        });
        let created = self.request(Method::POST, &path, Some(payload)).await?;
        Ok(PrInfo::from_value(&created, None))
    }

    async fn pr_info(&self, pr_url: &str) -> Result<PrInfo> {
        let (owner, repo, number) = parse_pr_url(pr_url)?;
        let path = format!("/repos/{owner}/{repo}/pulls/{number}");
        let value = self.request(Method::GET, &path, None).await?;
        Ok(PrInfo::from_value(&value, Some(pr_url)))
    }

    async fn is_merged(&self, pr_url: &str) -> Result<bool> {
        let (owner, repo, number) = parse_pr_url(pr_url)?;
        let path = format!("/repos/{owner}/{repo}/pulls/{number}/merge");
        let resp = self.send(Method::GET, &path, None).await?;
        match resp.status().as_u16() {
            204 => Ok(true),
            404 => Ok(false),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(OrchestratorError::CodeHostApi {
                    status,
                    url: format!("{}{}", self.api_base, path),
                    body: text,
                }
                .into())
            }
        }
    }

    async fn merge_pr(&self, pr_url: &str, method: MergeMethod) -> Result<MergeOutcome> {
        let (owner, repo, number) = parse_pr_url(pr_url)?;
        let path = format!("/repos/{owner}/{repo}/pulls/{number}/merge");
        let payload = json!({ "merge_method": method.as_str() });
        let resp = self.send(Method::PUT, &path, Some(payload)).await?;
        let status = resp.status();
        let value: Value = resp.json().await.unwrap_or_default();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if status.is_success() {
            let merged = value
                .get("merged")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            return Ok(MergeOutcome { merged, message });
        }
        // 405/409/422 are merge refusals, not transport failures; surface
        // the host's message so the engine can record it.
        match status.as_u16() {
            405 | 409 | 422 => Ok(MergeOutcome {
                merged: false,
                message,
            }),
            code => Err(OrchestratorError::CodeHostApi {
                status: code,
                url: format!("{}{}", self.api_base, path),
                body: message,
            }
            .into()),
        }
    }

    async fn find_branch_by_session(
        &self,
        repo: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let path = format!("/repos/{repo}/branches?per_page=100");
        let list = self.request(Method::GET, &path, None).await?;
        let branches = match list.as_array() {
            Some(items) => items,
            None => return Ok(None),
        };
        Ok(branches
            .iter()
            .filter_map(|b| b.get("name").and_then(Value::as_str))
            .find(|name| name.contains(session_id))
            .map(str::to_owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pr_url() {
        let (owner, repo, number) =
            parse_pr_url("https://github.com/acme/shop/pull/17").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "shop");
        assert_eq!(number, 17);

        assert!(parse_pr_url("https://github.com/acme/shop/issues/17").is_err());
        assert!(parse_pr_url("not a url").is_err());
    }

    #[test]
    fn test_merge_method_parsing() {
        assert_eq!("squash".parse(), Ok(MergeMethod::Squash));
        assert_eq!("Rebase".parse(), Ok(MergeMethod::Rebase));
        assert_eq!("merge".parse(), Ok(MergeMethod::Merge));
        assert!("octopus".parse::<MergeMethod>().is_err());
    }

    #[test]
    fn test_pr_info_from_value() {
        let value = serde_json::json!({
            "number": 3,
            "html_url": "https://github.com/o/r/pull/3",
            "title": "Add login",
            "head": {"ref": "feature/login"},
            "state": "open",
        });
        let info = PrInfo::from_value(&value, None);
        assert_eq!(info.number, 3);
        assert_eq!(info.head_ref.as_deref(), Some("feature/login"));

        // sparse responses fall back to the requested url
        let info = PrInfo::from_value(&serde_json::json!({}), Some("https://github.com/o/r/pull/9"));
        assert_eq!(info.html_url, "https://github.com/o/r/pull/9");
        assert!(info.head_ref.is_none());
    }
}
