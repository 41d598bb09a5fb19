//! Payload extraction from free-text agent transcripts.
//!
//! Agents are asked to wrap their JSON payload in begin/end markers, but the
//! transcript is not a contract: the payload may be buried in commentary,
//! the markers may be missing or mangled, or the marker body may fail to
//! parse. Extraction therefore runs two strategies:
//!
//! 1. Delimited: first `begin` marker, first `end` marker after it, parse
//!    the interposed text.
//! 2. Scanning fallback: attempt a JSON parse at every `{` in the text and
//!    accept the first object whose top-level keys intersect the required
//!    key set and that converts into the expected shape.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::model::{BacklogPayload, ReviewPayload};

pub const BACKLOG_BEGIN: &str = "BEGIN_BACKLOG_JSON";
pub const BACKLOG_END: &str = "END_BACKLOG_JSON";
pub const REVIEW_BEGIN: &str = "BEGIN_REVIEW_JSON";
pub const REVIEW_END: &str = "END_REVIEW_JSON";

const BACKLOG_KEYS: &[&str] = &["product", "epics", "features", "stories", "acceptance"];
const REVIEW_KEYS: &[&str] = &["verdict"];

/// Extract a backlog payload from an architecture-session transcript.
pub fn extract_backlog(text: &str) -> Option<BacklogPayload> {
    extract_delimited(text, BACKLOG_BEGIN, BACKLOG_END, BACKLOG_KEYS)
}

/// Extract a review payload from a review-session transcript.
pub fn extract_review(text: &str) -> Option<ReviewPayload> {
    extract_delimited(text, REVIEW_BEGIN, REVIEW_END, REVIEW_KEYS)
}

/// Delimited extraction with scanning fallback.
///
/// The marker strategy wins whenever both markers are present in order and
/// the interposed text parses; anything else falls through to the scanner.
pub fn extract_delimited<T: DeserializeOwned>(
    text: &str,
    begin: &str,
    end: &str,
    required_keys: &[&str],
) -> Option<T> {
    if let Some(start) = text.find(begin) {
        let after = &text[start + begin.len()..];
        if let Some(stop) = after.find(end) {
            let body = after[..stop].trim();
            if let Ok(payload) = serde_json::from_str::<T>(body) {
                return Some(payload);
            }
        }
    }
    scan_for_object(text, required_keys)
}

/// Left-to-right scan for an embedded JSON object.
///
/// At every `{` the scanner attempts a raw decode. A decoded object is
/// accepted when its top-level key set intersects `required_keys` and it
/// converts into `T`; otherwise the scan skips past the decoded value.
/// A failed decode advances a single character.
fn scan_for_object<T: DeserializeOwned>(text: &str, required_keys: &[&str]) -> Option<T> {
    let bytes = text.as_bytes();
    let mut idx = 0;
    while idx < text.len() {
        // '{' is ASCII, so a byte match is always a char boundary.
        if bytes[idx] != b'{' {
            idx += 1;
            continue;
        }
        let mut stream = serde_json::Deserializer::from_str(&text[idx..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset().max(1);
                if let Some(map) = value.as_object() {
                    if required_keys.iter().any(|key| map.contains_key(*key)) {
                        if let Ok(payload) = serde_json::from_value::<T>(value) {
                            return Some(payload);
                        }
                    }
                }
                idx += consumed;
            }
            _ => idx += 1,
        }
    }
    None
}
