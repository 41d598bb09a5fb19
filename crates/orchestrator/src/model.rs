//! Backlog data model.
//!
//! Five collections make up the backlog: a singleton product record plus
//! ordered sequences of epics, features, stories, and acceptance records.
//! Insertion order is significant (feature selection is FIFO by backlog
//! order) and ids are never reused or deleted; lifecycle changes are status
//! transitions, never removal.
//!
//! The feature record also carries the cross-invocation resumption state:
//! a [`StageAnchor`] per remote stage (development, fix) so a later run can
//! continue polling an in-flight session instead of creating a second one.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::session::SessionState;

/// Schema version written into every persisted collection.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Status enums: one closed set per entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Draft,
    Active,
    Shipped,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Planned,
    InProgress,
    Done,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Ready,
    InProgress,
    Review,
    Done,
    Blocked,
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Review => write!(f, "review"),
            Self::Done => write!(f, "done"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Ready,
    InProgress,
    Done,
    Verified,
    Blocked,
}

// ---------------------------------------------------------------------------
// Review verdict
// ---------------------------------------------------------------------------

/// Normalized review outcome.
///
/// Reviewer output is free text; whatever verdict string it contains is
/// collapsed onto this closed set before any branching. Unrecognized strings
/// are preserved verbatim in `Other` so the snapshot stays introspectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    NeedsChanges,
    Pending,
    Other(String),
}

impl Verdict {
    /// Collapse a raw verdict string onto the closed set.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        match upper.as_str() {
            "PASS" | "PASSED" | "APPROVE" | "APPROVED" | "LGTM" | "ACCEPT" | "ACCEPTED" => {
                Self::Pass
            }
            "NEEDS_CHANGES" | "NEEDS CHANGES" | "CHANGES_REQUESTED" | "REQUEST_CHANGES"
            | "NEEDS_WORK" | "REJECTED" => Self::NeedsChanges,
            "" | "PENDING" => Self::Pending,
            _ => Self::Other(upper),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pass => "PASS",
            Self::NeedsChanges => "NEEDS_CHANGES",
            Self::Pending => "PENDING",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::normalize(&raw))
    }
}

// ---------------------------------------------------------------------------
// Stage anchors: resumption state persisted on the feature
// ---------------------------------------------------------------------------

/// Resumption state for one remote stage of a feature.
///
/// `Pending` is the anchor proper: a later invocation polls the recorded
/// session instead of creating a new one. `Done` marks a stage whose session
/// finished, so resumption logic is a single match instead of a cluster of
/// optional-field checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageAnchor {
    #[default]
    None,
    Pending {
        session: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_state: Option<SessionState>,
    },
    Done {
        session: String,
    },
}

impl StageAnchor {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Session handle when the stage is in flight.
    pub fn pending_session(&self) -> Option<&str> {
        match self {
            Self::Pending { session, .. } => Some(session),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Singleton product record. Scalars are optional so an append payload that
/// only contributes list items stays representable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProductStatus>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: EpicStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    /// Id of the epic this feature belongs to.
    pub epic: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: FeatureStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_verdict: Option<Verdict>,
    /// Free-text merge outcome, e.g. "merged" or a manual-merge note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_status: Option<String>,
    /// Development-session resumption anchor.
    #[serde(default, skip_serializing_if = "StageAnchor::is_none")]
    pub build: StageAnchor,
    /// Fix-session resumption anchor (review requested changes).
    #[serde(default, skip_serializing_if = "StageAnchor::is_none")]
    pub fix: StageAnchor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    /// Id of the feature this story belongs to.
    pub feature: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StoryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptanceRecord {
    /// Id of the story these criteria verify.
    pub story: String,
    #[serde(default)]
    pub criteria: Vec<String>,
}

// ---------------------------------------------------------------------------
// Persisted documents
// ---------------------------------------------------------------------------

fn default_version() -> u32 {
    SCHEMA_VERSION
}

/// On-disk wrapper for the product singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductDoc {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

impl Default for ProductDoc {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            product: None,
        }
    }
}

/// On-disk wrapper for an ordered item collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection<T> {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            items: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent payloads
// ---------------------------------------------------------------------------

/// Backlog payload produced by the architecture agent. Sections are optional:
/// only sections present in the payload are reconciled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BacklogPayload {
    #[serde(default)]
    pub product: Option<Product>,
    #[serde(default)]
    pub epics: Option<Vec<Epic>>,
    #[serde(default)]
    pub features: Option<Vec<Feature>>,
    #[serde(default)]
    pub stories: Option<Vec<Story>>,
    #[serde(default)]
    pub acceptance: Option<Vec<AcceptanceRecord>>,
}

/// Review payload produced by the reviewer agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub verdict: Verdict,
    #[serde(default)]
    pub blocking: Vec<String>,
    #[serde(default)]
    pub non_blocking: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Partial feature updates
// ---------------------------------------------------------------------------

/// Field-level patch for a feature. Only populated fields are applied, so
/// writes from different stages never clobber each other's fields.
#[derive(Debug, Clone, Default)]
pub struct FeaturePatch {
    pub status: Option<FeatureStatus>,
    pub pr_url: Option<String>,
    pub review_verdict: Option<Verdict>,
    pub merge_status: Option<String>,
    pub build: Option<StageAnchor>,
    pub fix: Option<StageAnchor>,
}

impl FeaturePatch {
    /// Apply the populated fields onto a feature, leaving the rest untouched.
    pub fn apply(self, feature: &mut Feature) {
        if let Some(status) = self.status {
            feature.status = status;
        }
        if let Some(pr_url) = self.pr_url {
            feature.pr_url = Some(pr_url);
        }
        if let Some(verdict) = self.review_verdict {
            feature.review_verdict = Some(verdict);
        }
        if let Some(merge_status) = self.merge_status {
            feature.merge_status = Some(merge_status);
        }
        if let Some(build) = self.build {
            feature.build = build;
        }
        if let Some(fix) = self.fix {
            feature.fix = fix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_normalization() {
        assert_eq!(Verdict::normalize("PASS"), Verdict::Pass);
        assert_eq!(Verdict::normalize("approved"), Verdict::Pass);
        assert_eq!(Verdict::normalize(" lgtm "), Verdict::Pass);
        assert_eq!(Verdict::normalize("changes_requested"), Verdict::NeedsChanges);
        assert_eq!(Verdict::normalize("NEEDS_CHANGES"), Verdict::NeedsChanges);
        assert_eq!(Verdict::normalize(""), Verdict::Pending);
        assert_eq!(Verdict::normalize("pending"), Verdict::Pending);
        assert_eq!(
            Verdict::normalize("inconclusive"),
            Verdict::Other("INCONCLUSIVE".into())
        );
    }

    #[test]
    fn test_verdict_serde_normalizes_on_ingest() {
        let payload: ReviewPayload =
            serde_json::from_str(r#"{"verdict": "approved", "blocking": []}"#).unwrap();
        assert_eq!(payload.verdict, Verdict::Pass);

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"PASS\""));
    }

    #[test]
    fn test_stage_anchor_yaml_roundtrip() {
        let anchor = StageAnchor::Pending {
            session: "sessions/abc123".into(),
            last_state: Some(SessionState::Running),
        };
        let yaml = serde_yaml::to_string(&anchor).unwrap();
        let restored: StageAnchor = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(restored, anchor);
        assert_eq!(restored.pending_session(), Some("sessions/abc123"));
    }

    #[test]
    fn test_feature_patch_leaves_unset_fields() {
        let mut feature = Feature {
            id: "F1".into(),
            epic: "E1".into(),
            title: "Login".into(),
            description: None,
            status: FeatureStatus::InProgress,
            pr_url: Some("https://github.com/o/r/pull/1".into()),
            review_verdict: None,
            merge_status: None,
            build: StageAnchor::Done {
                session: "sessions/dev".into(),
            },
            fix: StageAnchor::None,
        };

        FeaturePatch {
            status: Some(FeatureStatus::Review),
            ..Default::default()
        }
        .apply(&mut feature);

        assert_eq!(feature.status, FeatureStatus::Review);
        assert_eq!(feature.pr_url.as_deref(), Some("https://github.com/o/r/pull/1"));
        assert!(matches!(feature.build, StageAnchor::Done { .. }));
    }

    #[test]
    fn test_feature_without_anchors_serializes_compactly() {
        let feature = Feature {
            id: "F1".into(),
            epic: "E1".into(),
            title: "Login".into(),
            description: None,
            status: FeatureStatus::Ready,
            pr_url: None,
            review_verdict: None,
            merge_status: None,
            build: StageAnchor::None,
            fix: StageAnchor::None,
        };
        let yaml = serde_yaml::to_string(&feature).unwrap();
        assert!(!yaml.contains("build"));
        assert!(!yaml.contains("pr_url"));

        let restored: Feature = serde_yaml::from_str(&yaml).unwrap();
        assert!(restored.build.is_none());
    }
}
