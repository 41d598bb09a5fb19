//! Inbound webhook intake.
//!
//! Derives the architecture-stage trigger from a code-host event payload:
//! an issue comment or issue body carrying a command prefix, or an issue
//! labeled for intake. Comments on pull requests are ignored. A leading
//! `append`/`replace` token after the prefix (or an `append` label) selects
//! the reconcile mode; otherwise the configured default applies.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::backlog::ReconcileMode;

const COMMAND_PREFIXES: &[&str] = &["/agent1", "/product", "/idea"];
const INTAKE_LABELS: &[&str] = &["agent1", "product", "intake"];

/// Trigger derived from an inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct Intake {
    pub prompt: String,
    pub mode: Option<ReconcileMode>,
}

/// Parse the event file at `path`. Returns `None` when the event carries no
/// trigger (wrong event type, PR comment, no prefix/label).
pub fn prompt_from_event(path: &Path) -> Result<Option<Intake>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read event file {}", path.display()))?;
    let event: Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse event file {}", path.display()))?;
    Ok(parse_event(&event))
}

fn parse_event(event: &Value) -> Option<Intake> {
    let issue = event.get("issue")?;
    // comments on pull requests are not intake
    if issue.get("pull_request").is_some() {
        return None;
    }

    if let Some(comment) = event.get("comment") {
        let body = comment.get("body").and_then(Value::as_str).unwrap_or("");
        return strip_command(body);
    }

    let labels: Vec<String> = issue
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default();

    let body = issue.get("body").and_then(Value::as_str).unwrap_or("");
    if labels.iter().any(|l| INTAKE_LABELS.contains(&l.as_str())) {
        let title = issue.get("title").and_then(Value::as_str).unwrap_or("");
        let prompt = format!("{title}\n\n{body}").trim().to_string();
        if prompt.is_empty() {
            return None;
        }
        let mode = labels
            .iter()
            .any(|l| l == "append")
            .then_some(ReconcileMode::Append);
        return Some(Intake { prompt, mode });
    }
    strip_command(body)
}

/// Strip a command prefix and an optional leading mode token.
fn strip_command(body: &str) -> Option<Intake> {
    let trimmed = body.trim_start();
    let lowered = trimmed.to_ascii_lowercase();
    let prefix = COMMAND_PREFIXES
        .iter()
        .find(|prefix| lowered.starts_with(*prefix))?;

    let rest = trimmed[prefix.len()..].trim_start_matches([' ', '\t', ':', '-', '\n']);
    let (mode, rest) = take_mode_token(rest);
    let prompt = rest.trim();
    if prompt.is_empty() {
        return None;
    }
    Some(Intake {
        prompt: prompt.to_string(),
        mode,
    })
}

fn take_mode_token(rest: &str) -> (Option<ReconcileMode>, &str) {
    let token_end = rest
        .find(|c: char| c.is_whitespace() || c == ':')
        .unwrap_or(rest.len());
    let token = rest[..token_end].to_ascii_lowercase();
    match token.parse::<ReconcileMode>() {
        Ok(mode) => (
            Some(mode),
            rest[token_end..].trim_start_matches([' ', '\t', ':', '\n']),
        ),
        Err(()) => (None, rest),
    }
}
