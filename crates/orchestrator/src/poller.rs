//! Bounded-time session polling.
//!
//! One generic primitive drives every remote stage: poll a session's
//! transcript at a fixed interval until a completion predicate yields a
//! payload, the session fails terminally, or a time bound is hit. Time
//! bounds nest three deep (the sleep interval, the per-stage poll window,
//! and the overall run deadline, checked with a safety buffer every
//! iteration) and reaching an outer bound is never an error: the caller
//! gets a `Pending` result, persists its resumption anchor, and exits so a
//! later invocation can continue.

use std::sync::LazyLock;
use std::time::Instant;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::OrchestratorError;
use crate::extract;
use crate::github::CodeHost;
use crate::model::{BacklogPayload, ReviewPayload};
use crate::session::{
    collect_activity_text, session_state_from, SessionService, SessionState,
};

static PR_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/[^/\s]+/[^/\s]+/pull/\d+").expect("valid regex")
});
static BRANCH_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"refs/heads/([A-Za-z0-9._/-]+)").expect("valid regex"));
static FEATURE_BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(feature/[A-Za-z0-9._/-]+)").expect("valid regex"));

/// Why a poll stopped without finding its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingReason {
    /// The run deadline (minus safety buffer) is imminent.
    RunDeadline,
    /// The per-stage poll window elapsed.
    StageWindow,
    /// The session completed but the predicate never matched.
    SessionCompleted,
}

/// A poll that stopped early; carries the last observed remote state for the
/// resumption anchor.
#[derive(Debug, Clone)]
pub struct Pending {
    pub last_state: Option<SessionState>,
    pub reason: PendingReason,
}

/// Outcome of a bounded poll.
#[derive(Debug)]
pub enum Poll<T> {
    Found(T),
    Pending(Pending),
}

/// Poll `session` until `predicate` extracts a payload from the accumulated
/// transcript, or a bound is reached.
///
/// Errors only when the session reports FAILED/CANCELLED; every time bound
/// degrades to `Pending`. When the session completes without a match, one
/// extra transcript fetch is attempted before giving up, since activities can
/// land between the last poll and the state change.
pub async fn poll_session<T, F>(
    svc: &dyn SessionService,
    cfg: &Config,
    session: &str,
    what: &str,
    mut predicate: F,
) -> Result<Poll<T>>
where
    F: FnMut(&str) -> Option<T>,
{
    let window_end = Instant::now() + cfg.stage_poll_window;
    let mut last_state: Option<SessionState> = None;
    loop {
        if let Some(pending) = bounds_reached(cfg, window_end, last_state) {
            debug!(session, what, reason = ?pending.reason, "poll stopped early");
            return Ok(Poll::Pending(pending));
        }

        let text = collect_activity_text(svc, session, cfg.max_activity_pages).await?;
        if let Some(found) = predicate(&text) {
            info!(session, what, "payload found in transcript");
            return Ok(Poll::Found(found));
        }

        let state = session_state_from(&svc.get_session(session).await?);
        last_state = Some(state);
        if state.is_failure() {
            return Err(OrchestratorError::SessionFailed {
                session: session.to_string(),
                state,
            }
            .into());
        }
        if state == SessionState::Completed {
            let text = collect_activity_text(svc, session, cfg.max_activity_pages).await?;
            return match predicate(&text) {
                Some(found) => Ok(Poll::Found(found)),
                None => Ok(Poll::Pending(Pending {
                    last_state,
                    reason: PendingReason::SessionCompleted,
                })),
            };
        }

        tokio::time::sleep(cfg.poll_interval).await;
    }
}

/// Poll a session with no text predicate at all: done when it completes.
pub async fn poll_session_completion(
    svc: &dyn SessionService,
    cfg: &Config,
    session: &str,
) -> Result<Poll<SessionState>> {
    let window_end = Instant::now() + cfg.stage_poll_window;
    let mut last_state: Option<SessionState> = None;
    loop {
        if let Some(pending) = bounds_reached(cfg, window_end, last_state) {
            debug!(session, reason = ?pending.reason, "completion poll stopped early");
            return Ok(Poll::Pending(pending));
        }

        let state = session_state_from(&svc.get_session(session).await?);
        last_state = Some(state);
        if state.is_failure() {
            return Err(OrchestratorError::SessionFailed {
                session: session.to_string(),
                state,
            }
            .into());
        }
        if state == SessionState::Completed {
            return Ok(Poll::Found(state));
        }

        tokio::time::sleep(cfg.poll_interval).await;
    }
}

fn bounds_reached(
    cfg: &Config,
    window_end: Instant,
    last_state: Option<SessionState>,
) -> Option<Pending> {
    if cfg.deadline_imminent() {
        Some(Pending {
            last_state,
            reason: PendingReason::RunDeadline,
        })
    } else if Instant::now() >= window_end {
        Some(Pending {
            last_state,
            reason: PendingReason::StageWindow,
        })
    } else {
        None
    }
}

/// Poll an architecture session for a backlog payload.
pub async fn poll_for_backlog(
    svc: &dyn SessionService,
    cfg: &Config,
    session: &str,
) -> Result<Poll<BacklogPayload>> {
    poll_session(svc, cfg, session, "backlog payload", extract::extract_backlog).await
}

/// Poll a review session for a verdict payload.
pub async fn poll_for_review(
    svc: &dyn SessionService,
    cfg: &Config,
    session: &str,
) -> Result<Poll<ReviewPayload>> {
    poll_session(svc, cfg, session, "review payload", extract::extract_review).await
}

/// Poll a development session for a pull-request URL.
///
/// Primary signal is a PR URL anywhere in the transcript. When the session
/// finishes (or the stage window closes) without one, the fallback derives
/// the pushed branch (from the transcript, else by asking the code host for
/// a branch embedding the session id) and finds or creates the PR for it.
/// An imminent run deadline skips the fallback: the next invocation resumes.
pub async fn poll_for_pr(
    svc: &dyn SessionService,
    host: Option<&dyn CodeHost>,
    cfg: &Config,
    session: &str,
    feature_id: &str,
) -> Result<Poll<String>> {
    let mut branch: Option<String> = None;
    let outcome = poll_session(svc, cfg, session, "pull request url", |text| {
        if branch.is_none() {
            branch = extract_branch(text);
        }
        PR_URL_RE.find(text).map(|m| m.as_str().to_string())
    })
    .await?;

    let pending = match outcome {
        Poll::Found(url) => return Ok(Poll::Found(url)),
        Poll::Pending(pending) if pending.reason == PendingReason::RunDeadline => {
            return Ok(Poll::Pending(pending))
        }
        Poll::Pending(pending) => pending,
    };

    if let (Some(host), Some(repo)) = (host, cfg.github_repository.as_deref()) {
        let session_id = session.rsplit('/').next().unwrap_or(session);
        let candidate = match branch {
            Some(branch) => Some(branch),
            None => host.find_branch_by_session(repo, session_id).await?,
        };
        if let Some(branch) = candidate {
            info!(session, branch, "no PR in transcript, using branch fallback");
            if let Some(url) = find_or_create_pr(host, cfg, repo, &branch, feature_id).await? {
                return Ok(Poll::Found(url));
            }
        }
    }
    Ok(Poll::Pending(pending))
}

/// Branch name hidden in transcript text: a `refs/heads/...` ref or a
/// `feature/...` branch, preferring the last match.
fn extract_branch(text: &str) -> Option<String> {
    let mut candidates: Vec<String> = BRANCH_REF_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();
    candidates.extend(FEATURE_BRANCH_RE.captures_iter(text).map(|c| c[1].to_string()));
    candidates.pop()
}

async fn find_or_create_pr(
    host: &dyn CodeHost,
    cfg: &Config,
    repo: &str,
    branch: &str,
    feature_id: &str,
) -> Result<Option<String>> {
    if let Some(existing) = host.find_pr_by_head(repo, branch).await? {
        if !existing.html_url.is_empty() {
            return Ok(Some(existing.html_url));
        }
    }
    let title = format!("Feature {feature_id}");
    let body =
        "Auto-created by the orchestrator: the development session completed without publishing a PR.";
    let created = host
        .create_pr(repo, branch, &cfg.starting_branch, &title, body)
        .await?;
    Ok(Some(created.html_url).filter(|url| !url.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::ReconcileMode;
    use crate::config::StatusMode;
    use crate::github::MergeMethod;
    use crate::session::SessionSpec;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            api_base: "https://agents.invalid/v1".into(),
            key_arch: None,
            key_dev: None,
            key_review: None,
            source: Some("sources/demo".into()),
            product_prompt: None,
            event_path: None,
            poll_interval: Duration::from_millis(1),
            stage_poll_window: Duration::from_secs(3600),
            max_activity_pages: 3,
            require_plan_approval: false,
            github_token: None,
            github_repository: None,
            github_api_url: "https://api.github.com".into(),
            starting_branch: "main".into(),
            reconcile_mode: ReconcileMode::Replace,
            status_mode: StatusMode::Artifact,
            auto_merge: false,
            merge_method: MergeMethod::Squash,
            run_deadline: Instant::now() + Duration::from_secs(3600),
            dry_run: false,
        }
    }

    /// Stub service: fixed transcript, fixed state, counts calls.
    struct StubSessions {
        transcript: &'static str,
        state: &'static str,
        calls: AtomicUsize,
    }

    impl StubSessions {
        fn new(transcript: &'static str, state: &'static str) -> Self {
            Self {
                transcript,
                state,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionService for StubSessions {
        async fn create_session(&self, _spec: SessionSpec<'_>) -> anyhow::Result<Value> {
            Ok(json!({"name": "sessions/stub"}))
        }

        async fn get_session(&self, _session: &str) -> anyhow::Result<Value> {
            Ok(json!({"state": self.state}))
        }

        async fn list_activities(
            &self,
            _session: &str,
            _page_token: Option<&str>,
        ) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"activities": [{"text": self.transcript}]}))
        }

        async fn send_message(&self, _session: &str, _prompt: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }

        async fn approve_plan(&self, _session: &str) -> anyhow::Result<Value> {
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_run_deadline_dominates_stage_window() {
        let mut cfg = test_config();
        // stage window is huge, run deadline already imminent
        cfg.run_deadline = Instant::now();
        let svc = StubSessions::new("nothing yet", "RUNNING");

        let outcome = poll_for_review(&svc, &cfg, "sessions/r1").await.unwrap();
        match outcome {
            Poll::Pending(pending) => assert_eq!(pending.reason, PendingReason::RunDeadline),
            Poll::Found(_) => panic!("expected pending"),
        }
        // deadline is checked before any remote call
        assert_eq!(svc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_window_elapses_without_error() {
        let mut cfg = test_config();
        cfg.stage_poll_window = Duration::from_millis(0);
        let svc = StubSessions::new("still working", "RUNNING");

        let outcome = poll_for_review(&svc, &cfg, "sessions/r1").await.unwrap();
        match outcome {
            Poll::Pending(pending) => assert_eq!(pending.reason, PendingReason::StageWindow),
            Poll::Found(_) => panic!("expected pending"),
        }
    }

    #[tokio::test]
    async fn test_found_payload_short_circuits() {
        let cfg = test_config();
        let svc = StubSessions::new(r#"done: {"verdict": "PASS"}"#, "RUNNING");

        let outcome = poll_for_review(&svc, &cfg, "sessions/r1").await.unwrap();
        match outcome {
            Poll::Found(payload) => {
                assert_eq!(payload.verdict, crate::model::Verdict::Pass)
            }
            Poll::Pending(_) => panic!("expected payload"),
        }
    }

    #[tokio::test]
    async fn test_completed_session_without_payload_is_pending() {
        let cfg = test_config();
        let svc = StubSessions::new("finished, no verdict emitted", "COMPLETED");

        let outcome = poll_for_review(&svc, &cfg, "sessions/r1").await.unwrap();
        match outcome {
            Poll::Pending(pending) => {
                assert_eq!(pending.reason, PendingReason::SessionCompleted);
                assert_eq!(pending.last_state, Some(SessionState::Completed));
            }
            Poll::Found(_) => panic!("expected pending"),
        }
    }

    #[tokio::test]
    async fn test_failed_session_is_fatal() {
        let cfg = test_config();
        let svc = StubSessions::new("boom", "FAILED");

        let err = poll_for_review(&svc, &cfg, "sessions/r1").await.unwrap_err();
        assert_eq!(crate::error::categorize(&err), "session");
    }

    #[tokio::test]
    async fn test_pr_poll_finds_url_in_transcript() {
        let cfg = test_config();
        let svc = StubSessions::new(
            "opened https://github.com/acme/shop/pull/7 for you",
            "RUNNING",
        );

        let outcome = poll_for_pr(&svc, None, &cfg, "sessions/d1", "F1").await.unwrap();
        match outcome {
            Poll::Found(url) => assert_eq!(url, "https://github.com/acme/shop/pull/7"),
            Poll::Pending(_) => panic!("expected url"),
        }
    }

    #[test]
    fn test_extract_branch_prefers_last_match() {
        let text = "pushed refs/heads/feature/a then refs/heads/feature/b";
        // feature-branch matches come after ref matches, last one wins
        assert_eq!(extract_branch(text), Some("feature/b".into()));

        let text = "checked out refs/heads/triad/session-42";
        assert_eq!(extract_branch(text), Some("triad/session-42".into()));

        assert_eq!(extract_branch("no branches here"), None);
    }
}
