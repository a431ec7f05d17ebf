//! Recovering a readable error message from a raw upstream error body.
//!
//! Upstream error bodies come in several shapes: OpenAI-style
//! `{"error": {"message": ...}}`, flat `{"message": ...}` / `{"detail": ...}`,
//! and a known quirk where the message is itself a stringified Python dict,
//! e.g. `{"message": "{'msg': 'model not found'}"}`.
//!
//! Extraction runs in two ordered passes, each short-circuiting:
//!
//! 1. [`TOP_LEVEL`] pulls the best string out of the JSON body;
//! 2. [`REFINERS`] try to dig a more specific message out of that string
//!    (or out of the raw body when it is not JSON).
//!
//! The most specific hit wins.

use std::sync::OnceLock;

use axum::http::StatusCode;
use regex::Regex;
use serde_json::Value;

use crate::error::ApiError;

/// Reported when nothing usable can be recovered.
pub const UNKNOWN_ERROR: &str = "An unknown error occurred";

type Extractor = fn(&Value) -> Option<String>;
type Refiner = fn(&str) -> Option<String>;

/// Fields of a parsed error body, most conventional first.
const TOP_LEVEL: [Extractor; 4] = [error_message, error_string, message, detail];

/// Ways to dig into a message string, most specific first.
const REFINERS: [Refiner; 2] = [nested_json_message, python_dict_msg];

/// Build the caller-facing error from a diagnostic response.
///
/// Uses the diagnostic status when it is an error status, otherwise 500.
/// Falls back to [`UNKNOWN_ERROR`] with 500 when no message is found.
pub fn normalize(status: StatusCode, body: &str) -> ApiError {
    match extract_message(body) {
        Some(message) if status.is_client_error() || status.is_server_error() => {
            ApiError::new(status, message)
        }
        Some(message) => ApiError::internal(message),
        None => ApiError::internal(UNKNOWN_ERROR),
    }
}

/// The most specific error message in `body`, if any.
pub fn extract_message(body: &str) -> Option<String> {
    let top = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|parsed| TOP_LEVEL.iter().find_map(|extract| extract(&parsed)));

    let text = top.as_deref().unwrap_or(body);
    REFINERS
        .iter()
        .find_map(|refine| refine(text))
        .or(top)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

fn error_message(body: &Value) -> Option<String> {
    body.pointer("/error/message")?.as_str().and_then(non_empty)
}

fn error_string(body: &Value) -> Option<String> {
    body.get("error")?.as_str().and_then(non_empty)
}

fn message(body: &Value) -> Option<String> {
    body.get("message")?.as_str().and_then(non_empty)
}

fn detail(body: &Value) -> Option<String> {
    body.get("detail")?.as_str().and_then(non_empty)
}

/// `text` is itself JSON carrying a message, e.g. `{"msg": "..."}`.
fn nested_json_message(text: &str) -> Option<String> {
    let nested: Value = serde_json::from_str(text).ok()?;
    ["msg", "message", "detail"]
        .iter()
        .find_map(|key| nested.get(*key)?.as_str().and_then(non_empty))
}

/// Compatibility shim for an upstream that stringifies Python dicts into its
/// error messages: matches `'msg': '...'` anywhere in `text`.
fn python_dict_msg(text: &str) -> Option<String> {
    static MSG: OnceLock<Regex> = OnceLock::new();
    let re = MSG.get_or_init(|| Regex::new(r"'msg'\s*:\s*'([^']*)'").expect("static pattern"));
    re.captures(text).and_then(|caps| non_empty(&caps[1]))
}
