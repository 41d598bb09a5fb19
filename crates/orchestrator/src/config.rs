//! Run configuration.
//!
//! Built once at startup from the environment and threaded as a value
//! through every component. The run deadline is an ordinary field computed
//! at construction, so there is no ambient process-wide timing state.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::warn;

use crate::backlog::ReconcileMode;
use crate::github::MergeMethod;

/// Margin kept between the last poll iteration and the run deadline so the
/// invocation always has time to persist and exit cleanly.
pub const DEADLINE_SAFETY_BUFFER: Duration = Duration::from_secs(90);

/// Where status snapshots go: left for the CI job to collect, or committed
/// alongside the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    Artifact,
    Commit,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Agent-session API base URL.
    pub api_base: String,
    /// Per-role API keys; a stage that needs a missing key fails fast.
    pub key_arch: Option<String>,
    pub key_dev: Option<String>,
    pub key_review: Option<String>,
    /// Source repository identifier passed to created sessions.
    pub source: Option<String>,
    /// Explicit architecture-stage trigger; webhook intake applies when unset.
    pub product_prompt: Option<String>,
    /// Inbound webhook event file, when invoked from one.
    pub event_path: Option<PathBuf>,
    /// Sleep between poll iterations.
    pub poll_interval: Duration,
    /// Maximum poll window per stage.
    pub stage_poll_window: Duration,
    /// Activity-feed pages fetched per poll iteration.
    pub max_activity_pages: usize,
    pub require_plan_approval: bool,
    pub github_token: Option<String>,
    /// `owner/repo` the PRs live in.
    pub github_repository: Option<String>,
    pub github_api_url: String,
    pub starting_branch: String,
    pub reconcile_mode: ReconcileMode,
    pub status_mode: StatusMode,
    pub auto_merge: bool,
    pub merge_method: MergeMethod,
    /// Wall-clock cutoff for this invocation.
    pub run_deadline: Instant,
    pub dry_run: bool,
}

impl Config {
    pub fn from_env(dry_run: bool) -> Result<Self> {
        let poll_seconds = env_u64("ORCH_POLL_SECONDS", 10)?;
        let max_poll_minutes = env_u64("ORCH_MAX_POLL_MINUTES", 20)?;
        let run_max_minutes = env_u64("ORCH_RUN_MAX_MINUTES", 27)?;

        let reconcile_mode = match env_opt("ORCH_RECONCILE_MODE") {
            None => ReconcileMode::Replace,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(mode = %raw, "unknown reconcile mode, defaulting to replace");
                ReconcileMode::Replace
            }),
        };
        let status_mode = match env_opt("ORCH_STATUS_MODE").as_deref() {
            Some("commit") => StatusMode::Commit,
            _ => StatusMode::Artifact,
        };
        let merge_method = match env_opt("ORCH_MERGE_METHOD") {
            None => MergeMethod::Squash,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(method = %raw, "unknown merge method, defaulting to squash");
                MergeMethod::Squash
            }),
        };

        Ok(Self {
            api_base: env_or("AGENT_API_BASE", "https://jules.googleapis.com/v1alpha"),
            key_arch: env_opt("AGENT_KEY_ARCH"),
            key_dev: env_opt("AGENT_KEY_DEV"),
            key_review: env_opt("AGENT_KEY_REVIEW"),
            source: env_opt("AGENT_SOURCE"),
            product_prompt: env_opt("PRODUCT_PROMPT"),
            event_path: env_opt("GITHUB_EVENT_PATH").map(PathBuf::from),
            poll_interval: Duration::from_secs(poll_seconds),
            stage_poll_window: Duration::from_secs(max_poll_minutes * 60),
            max_activity_pages: env_u64("ORCH_MAX_ACTIVITY_PAGES", 10)? as usize,
            require_plan_approval: env_flag("AGENT_REQUIRE_PLAN_APPROVAL"),
            github_token: env_opt("GITHUB_TOKEN"),
            github_repository: env_opt("GITHUB_REPOSITORY"),
            github_api_url: env_or("GITHUB_API_URL", "https://api.github.com"),
            starting_branch: env_or("ORCH_STARTING_BRANCH", "main"),
            reconcile_mode,
            status_mode,
            auto_merge: env_flag("ORCH_AUTO_MERGE"),
            merge_method,
            run_deadline: Instant::now() + Duration::from_secs(run_max_minutes * 60),
            dry_run,
        })
    }

    /// Whether the run deadline (minus the safety buffer) has been reached.
    /// Poll loops check this every iteration; it dominates any stage window.
    pub fn deadline_imminent(&self) -> bool {
        Instant::now() + DEADLINE_SAFETY_BUFFER >= self.run_deadline
    }
}

/// Resolve an optional config value or fail with the env var to set.
pub fn require<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| crate::error::OrchestratorError::MissingConfig(name).into())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_flag(name: &str) -> bool {
    matches!(
        env_opt(name).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env_opt(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid integer for {name}: {raw}")),
    }
}
