//! External-facing status snapshots.
//!
//! Pure side-effecting sink: aggregate counts plus the current feature and a
//! free-text note, written as JSON under `status/`. Fatal paths additionally
//! record a structured error snapshot so the last failure is always
//! introspectable.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::backlog::BacklogStore;
use crate::error::categorize;
use crate::model::{EpicStatus, FeatureStatus, ProductStatus};

const PRODUCT_STATUS_FILE: &str = "status/product_status.json";
const FEATURE_STATUS_FILE: &str = "status/feature_status.json";
const LAST_ERROR_FILE: &str = "status/last_error.json";

/// Repo-relative paths of the status snapshots, for the commit step.
pub fn status_paths() -> [&'static str; 2] {
    [PRODUCT_STATUS_FILE, FEATURE_STATUS_FILE]
}

pub fn error_path() -> &'static str {
    LAST_ERROR_FILE
}

#[derive(Serialize)]
struct ProductSnapshot<'a> {
    product_id: &'a str,
    status: ProductStatus,
    last_run: String,
    current_epic: Option<&'a str>,
    current_feature: Option<&'a str>,
    current_story: Option<&'a str>,
    epics_total: usize,
    epics_done: usize,
    features_total: usize,
    features_done: usize,
    notes: &'a str,
}

#[derive(Serialize)]
struct FeatureLine<'a> {
    id: &'a str,
    status: FeatureStatus,
}

#[derive(Serialize)]
struct FeatureSnapshot<'a> {
    items: Vec<FeatureLine<'a>>,
}

#[derive(Serialize)]
struct ErrorSnapshot<'a> {
    error: String,
    context: &'a str,
    timestamp: String,
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write the progress snapshot for the current backlog state.
pub fn write_status(
    root: &Path,
    store: &BacklogStore,
    current_feature: Option<&str>,
    notes: &str,
) -> Result<()> {
    let product = store.product.product.as_ref();
    let epics = &store.epics.items;
    let features = &store.features.items;

    let snapshot = ProductSnapshot {
        product_id: product
            .and_then(|p| p.id.as_deref())
            .unwrap_or("prod-001"),
        status: product
            .and_then(|p| p.status)
            .unwrap_or(ProductStatus::Draft),
        last_run: now_iso(),
        current_epic: None,
        current_feature,
        current_story: None,
        epics_total: epics.len(),
        epics_done: epics.iter().filter(|e| e.status == EpicStatus::Done).count(),
        features_total: features.len(),
        features_done: features
            .iter()
            .filter(|f| f.status == FeatureStatus::Done)
            .count(),
        notes,
    };

    let feature_lines = FeatureSnapshot {
        items: features
            .iter()
            .map(|f| FeatureLine {
                id: &f.id,
                status: f.status,
            })
            .collect(),
    };

    write_json(root, PRODUCT_STATUS_FILE, &snapshot)?;
    write_json(root, FEATURE_STATUS_FILE, &feature_lines)
}

/// Record the failure that is about to abort the invocation.
pub fn write_error(root: &Path, err: &anyhow::Error) -> Result<()> {
    let snapshot = ErrorSnapshot {
        error: format!("{err:#}"),
        context: categorize(err),
        timestamp: now_iso(),
    };
    write_json(root, LAST_ERROR_FILE, &snapshot)
}

fn write_json<T: Serialize>(root: &Path, rel: &str, value: &T) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(&path, raw).with_context(|| format!("failed to write {}", path.display()))
}
