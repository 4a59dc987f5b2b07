//! Variable extraction from HTTP responses.
//!
//! Values are pulled out with JSONPath, regex, header or cookie extractors.
//! A failed extraction yields nothing, so the caller's prior state is left
//! untouched.

use crate::checks::json_to_string;
use crate::client::HttpResponse;
use crate::scenario::{Extractor, VariableExtraction};
use regex::Regex;
use serde_json::Value;
use serde_json_path::JsonPath;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("JSONPath query failed: {0}")]
    JsonPathError(String),

    #[error("Invalid JSON response: {0}")]
    InvalidJson(String),

    #[error("Value at '{0}' is null or empty")]
    Empty(String),

    #[error("Regex compilation failed: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Regex pattern did not match")]
    RegexNoMatch,

    #[error("Named capture group '{0}' not found in regex")]
    RegexGroupNotFound(String),

    #[error("Header '{0}' not found in response")]
    HeaderNotFound(String),

    #[error("Cookie '{0}' not found in response")]
    CookieNotFound(String),

    #[error("Extraction failed: {0}")]
    Other(String),
}

/// Runs every extraction and returns the ones that produced a value.
pub fn extract_variables<'a>(
    extractions: &'a [VariableExtraction],
    response: &HttpResponse,
) -> Vec<(&'a VariableExtraction, String)> {
    let mut extracted = Vec::with_capacity(extractions.len());

    for extraction in extractions {
        match extract_value(&extraction.extractor, response) {
            Ok(value) => {
                debug!(
                    variable_name = %extraction.name,
                    value = %value,
                    "Extracted variable"
                );
                extracted.push((extraction, value));
            }
            Err(e) => {
                warn!(
                    variable_name = %extraction.name,
                    status = response.status,
                    error = %e,
                    "Failed to extract variable"
                );
            }
        }
    }

    extracted
}

fn extract_value(extractor: &Extractor, response: &HttpResponse) -> Result<String, ExtractionError> {
    match extractor {
        Extractor::JsonPath(path) => extract_json_path(&response.body, path),
        Extractor::Regex { pattern, group } => extract_regex(&response.body, pattern, group),
        Extractor::Header(name) => extract_header(&response.headers, name),
        Extractor::Cookie(name) => extract_cookie(&response.headers, name),
    }
}

/// Extract a scalar with a JSONPath query. Null and empty-string values count
/// as missing.
///
/// # Example
/// ```
/// use rampload::extractor::extract_json_path;
///
/// let json = r#"{"user": {"id": 123, "name": "Alice"}}"#;
/// assert_eq!(extract_json_path(json, "$.user.id").unwrap(), "123");
/// ```
pub fn extract_json_path(json_body: &str, path: &str) -> Result<String, ExtractionError> {
    let json: Value =
        serde_json::from_str(json_body).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

    let json_path = JsonPath::parse(path)
        .map_err(|e| ExtractionError::JsonPathError(format!("Invalid JSONPath: {}", e)))?;

    let node_list = json_path.query(&json);
    let value = node_list.exactly_one().map_err(|_| {
        ExtractionError::JsonPathError(format!(
            "JSONPath '{}' did not match exactly one value",
            path
        ))
    })?;

    match value {
        Value::Null => Err(ExtractionError::Empty(path.to_string())),
        Value::String(s) if s.is_empty() => Err(ExtractionError::Empty(path.to_string())),
        other => Ok(json_to_string(other)),
    }
}

/// Extract value using regex with named capture group.
pub fn extract_regex(text: &str, pattern: &str, group: &str) -> Result<String, ExtractionError> {
    let re = Regex::new(pattern)?;

    let captures = re.captures(text).ok_or(ExtractionError::RegexNoMatch)?;
    captures
        .name(group)
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ExtractionError::RegexGroupNotFound(group.to_string()))
}

pub fn extract_header(
    headers: &reqwest::header::HeaderMap,
    header_name: &str,
) -> Result<String, ExtractionError> {
    headers
        .get(header_name)
        .ok_or_else(|| ExtractionError::HeaderNotFound(header_name.to_string()))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|e| ExtractionError::Other(format!("Invalid header value: {}", e)))
}

/// Extract a cookie value from the `Set-Cookie` headers.
pub fn extract_cookie(
    headers: &reqwest::header::HeaderMap,
    cookie_name: &str,
) -> Result<String, ExtractionError> {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next()?.split_once('='))
        .find(|(name, _)| name.trim() == cookie_name)
        .map(|(_, value)| value.trim().to_string())
        .ok_or_else(|| ExtractionError::CookieNotFound(cookie_name.to_string()))
}
