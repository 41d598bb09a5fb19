//! Prompt construction for the three agent roles.
//!
//! The architect prompt carries the marker-wrapped JSON template the payload
//! extractor understands; in append mode it also embeds the current backlog
//! snapshot so new items get fresh ids. Developer and reviewer prompts embed
//! the feature, its stories, and the acceptance criteria verbatim as JSON.

use serde::Serialize;
use serde_json::Value;

use crate::backlog::ReconcileMode;
use crate::model::{AcceptanceRecord, Feature, ReviewPayload, Story};

const BACKLOG_TEMPLATE: &str = r#"BEGIN_BACKLOG_JSON
{
  "product": {
    "id": "prod-001",
    "name": "<short product name>",
    "owner": "product-owner",
    "vision": "<1-3 sentences>",
    "constraints": ["<constraint 1>", "<constraint 2>"],
    "rules": ["<rule 1>", "<rule 2>"],
    "requirements": ["<req 1>", "<req 2>"],
    "status": "active"
  },
  "epics": [
    {"id": "E1", "title": "<epic>", "status": "planned", "description": "<short>"}
  ],
  "features": [
    {"id": "F1", "epic": "E1", "title": "<feature>", "status": "ready", "description": "<short>"}
  ],
  "stories": [
    {"id": "S1", "feature": "F1", "title": "<story>", "status": "ready", "description": "<short>"}
  ],
  "acceptance": [
    {"story": "S1", "criteria": ["<criterion 1>", "<criterion 2>"]}
  ]
}
END_BACKLOG_JSON"#;

const BACKLOG_APPEND_TEMPLATE: &str = r#"BEGIN_BACKLOG_JSON
{
  "product": {
    "constraints": [],
    "rules": [],
    "requirements": []
  },
  "epics": [],
  "features": [],
  "stories": [],
  "acceptance": []
}
END_BACKLOG_JSON"#;

const REVIEW_TEMPLATE: &str = r#"BEGIN_REVIEW_JSON
{
  "verdict": "PASS",
  "blocking": ["<blocking issue 1>", "<blocking issue 2>"],
  "non_blocking": ["<suggestion 1>", "<suggestion 2>"],
  "notes": "<short notes>"
}
END_REVIEW_JSON"#;

/// Prompt for the architecture session that (re)generates the backlog.
pub fn architect_prompt(product_prompt: &str, mode: ReconcileMode, existing: &Value) -> String {
    match mode {
        ReconcileMode::Append => format!(
            "You are the architect and business analyst for this product.\n\
             \n\
             Mode: APPEND. Do NOT modify or delete existing backlog items. Only add new items.\n\
             \n\
             Input from the product owner:\n\
             {product_prompt}\n\
             \n\
             Existing backlog (for reference):\n\
             {existing}\n\
             \n\
             Rules:\n\
             - Only add NEW epics, features, stories, and acceptance criteria.\n\
             - Use NEW unique ids that do not exist yet.\n\
             - A new feature must reference an epic id; a new story must reference a feature id.\n\
             - If you have no new items for a section, return an empty array for that section.\n\
             - You may add new entries to the product constraints/rules/requirements lists only.\n\
             \n\
             Return ONLY the JSON payload between the markers below. Do not include any extra text.\n\
             \n\
             {template}",
            product_prompt = product_prompt,
            existing = pretty(existing),
            template = BACKLOG_APPEND_TEMPLATE,
        ),
        ReconcileMode::Replace => format!(
            "You are the architect and business analyst for this product.\n\
             \n\
             Input from the product owner:\n\
             {product_prompt}\n\
             \n\
             Return ONLY the JSON payload between the markers below. Do not include any extra text.\n\
             \n\
             {template}",
            product_prompt = product_prompt,
            template = BACKLOG_TEMPLATE,
        ),
    }
}

/// Prompt for the development session implementing one feature.
pub fn developer_prompt(
    feature: &Feature,
    stories: &[Story],
    acceptance: &[AcceptanceRecord],
) -> String {
    format!(
        "You are the developer for this product.\n\
         \n\
         Implement the feature described below in a single PR. Implement all related stories\n\
         and satisfy all acceptance criteria.\n\
         - Do not change unrelated files.\n\
         - Do not update backlog or status files.\n\
         - Keep the diff minimal and focused.\n\
         \n\
         FEATURE:\n{feature}\n\
         \n\
         STORIES:\n{stories}\n\
         \n\
         ACCEPTANCE:\n{acceptance}",
        feature = pretty(feature),
        stories = pretty(&stories),
        acceptance = pretty(&acceptance),
    )
}

/// Prompt for a fix session addressing reviewer findings on an open PR.
pub fn fix_prompt(pr_url: &str, review: &ReviewPayload) -> String {
    format!(
        "You are the developer for this product.\n\
         \n\
         Fix the issues reported by the reviewer for this PR:\n\
         {pr_url}\n\
         \n\
         Push the fixes to the same PR branch. Focus on the blocking issues first.\n\
         \n\
         REVIEW:\n{review}",
        review = pretty(review),
    )
}

/// Prompt for the review session judging an open PR.
pub fn reviewer_prompt(
    pr_url: &str,
    feature: &Feature,
    stories: &[Story],
    acceptance: &[AcceptanceRecord],
) -> String {
    format!(
        "You are the senior reviewer for this product.\n\
         \n\
         Review the PR for correctness, security, performance, and adherence to the\n\
         acceptance criteria. Return ONLY the JSON payload between the markers below.\n\
         Do not include any extra text.\n\
         \n\
         PR:\n{pr_url}\n\
         \n\
         FEATURE:\n{feature}\n\
         \n\
         STORIES:\n{stories}\n\
         \n\
         ACCEPTANCE:\n{acceptance}\n\
         \n\
         {template}",
        feature = pretty(feature),
        stories = pretty(&stories),
        acceptance = pretty(&acceptance),
        template = REVIEW_TEMPLATE,
    )
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureStatus, StageAnchor, StoryStatus};
    use serde_json::json;

    fn feature() -> Feature {
        Feature {
            id: "F1".into(),
            epic: "E1".into(),
            title: "Login".into(),
            description: Some("Email login".into()),
            status: FeatureStatus::Ready,
            pr_url: None,
            review_verdict: None,
            merge_status: None,
            build: StageAnchor::None,
            fix: StageAnchor::None,
        }
    }

    #[test]
    fn test_architect_prompt_carries_markers() {
        let prompt = architect_prompt("build a shop", ReconcileMode::Replace, &json!({}));
        assert!(prompt.contains("build a shop"));
        assert!(prompt.contains("BEGIN_BACKLOG_JSON"));
        assert!(prompt.contains("END_BACKLOG_JSON"));
        assert!(!prompt.contains("Mode: APPEND"));
    }

    #[test]
    fn test_architect_append_prompt_embeds_snapshot() {
        let existing = json!({"features": [{"id": "F1"}]});
        let prompt = architect_prompt("add reporting", ReconcileMode::Append, &existing);
        assert!(prompt.contains("Mode: APPEND"));
        assert!(prompt.contains("\"F1\""));
        assert!(prompt.contains("BEGIN_BACKLOG_JSON"));
    }

    #[test]
    fn test_developer_prompt_embeds_backlog_items() {
        let stories = vec![Story {
            id: "S1".into(),
            feature: "F1".into(),
            title: "Login form".into(),
            description: None,
            status: StoryStatus::Ready,
        }];
        let acceptance = vec![AcceptanceRecord {
            story: "S1".into(),
            criteria: vec!["shows errors".into()],
        }];
        let prompt = developer_prompt(&feature(), &stories, &acceptance);
        assert!(prompt.contains("\"S1\""));
        assert!(prompt.contains("shows errors"));
        assert!(prompt.contains("single PR"));
    }

    #[test]
    fn test_reviewer_prompt_carries_verdict_template() {
        let prompt = reviewer_prompt("https://github.com/o/r/pull/1", &feature(), &[], &[]);
        assert!(prompt.contains("BEGIN_REVIEW_JSON"));
        assert!(prompt.contains("\"verdict\""));
        assert!(prompt.contains("https://github.com/o/r/pull/1"));
    }
}
