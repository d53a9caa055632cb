//! Multipart encoding of batch requests and decoding of batch responses.
//!
//! A batch bundles up to [`MAX_BATCH_SIZE`] nested HTTP requests. Each part is
//! tagged `Content-ID: <itemN>`; the server answers with
//! `Content-ID: <response-itemN>`, which is how results find their way back to
//! request positions regardless of the order the parts arrive in.

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use crate::calendar::RemoteEvent;
use crate::sync::google_api::ApiError;

pub const MAX_BATCH_SIZE: usize = 100;

static BOUNDARY_RE: OnceLock<Regex> = OnceLock::new();
static CONTENT_ID_RE: OnceLock<Regex> = OnceLock::new();

fn boundary_pattern() -> &'static Regex {
    BOUNDARY_RE.get_or_init(|| {
        Regex::new(r#"(?i)boundary="?([^";]+)"?"#).expect("invalid boundary regex")
    })
}

fn content_id_pattern() -> &'static Regex {
    CONTENT_ID_RE.get_or_init(|| {
        Regex::new(r"response-item(\d+)").expect("invalid content id regex")
    })
}

/// One nested request inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPart {
    pub method: &'static str,
    pub path: String,
    pub json_body: Option<String>,
}

impl BatchPart {
    pub fn post(path: String, json_body: String) -> Self {
        Self {
            method: "POST",
            path,
            json_body: Some(json_body),
        }
    }

    pub fn delete(path: String) -> Self {
        Self {
            method: "DELETE",
            path,
            json_body: None,
        }
    }
}

pub fn new_boundary() -> String {
    format!("batch_{}", uuid::Uuid::new_v4().simple())
}

pub fn encode_batch(boundary: &str, parts: &[BatchPart]) -> String {
    let mut body = String::new();

    for (index, part) in parts.iter().enumerate() {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str(&format!("Content-ID: <item{}>\r\n", index));
        body.push_str("\r\n");
        body.push_str(&format!("{} {} HTTP/1.1\r\n", part.method, part.path));
        match &part.json_body {
            Some(json) => {
                body.push_str("Content-Type: application/json\r\n");
                body.push_str("\r\n");
                body.push_str(json);
                body.push_str("\r\n");
            }
            None => body.push_str("\r\n"),
        }
    }

    body.push_str(&format!("--{}--\r\n", boundary));
    body
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    boundary_pattern()
        .captures(content_type)
        .map(|captures| captures[1].trim().to_string())
}

/// A decoded response part with the nested HTTP envelope removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponsePart {
    headers: HashMap<String, String>,
    pub status: Option<u16>,
    pub body: String,
}

impl ResponsePart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Request index this part answers, from `Content-ID: <response-itemN>`.
    pub fn request_index(&self) -> Option<usize> {
        let content_id = self.header("content-id")?;
        content_id_pattern()
            .captures(content_id)
            .and_then(|captures| captures[1].parse().ok())
    }

    fn is_success_status(&self) -> bool {
        self.status.is_none_or(|status| (200..300).contains(&status))
    }
}

/// Splits `text` at the first blank line, accepting `\n\n` and `\r\n\r\n`.
fn split_header_block(text: &str) -> (&str, &str) {
    if let Some(rest) = text.strip_prefix("\r\n") {
        return ("", rest);
    }
    if let Some(rest) = text.strip_prefix('\n') {
        return ("", rest);
    }

    let crlf = text.find("\r\n\r\n").map(|at| (at, 4));
    let lf = text.find("\n\n").map(|at| (at, 2));
    let separator = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match separator {
        Some((at, width)) => (&text[..at], &text[at + width..]),
        None => (text, ""),
    }
}

fn parse_headers(block: &str) -> HashMap<String, String> {
    block
        .lines()
        .filter_map(|line| line.trim_end_matches('\r').split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

fn parse_part(chunk: &str) -> Option<ResponsePart> {
    let chunk = chunk.trim_start_matches(['\r', '\n']);
    if chunk.trim().is_empty() {
        return None;
    }

    let (header_block, mut payload) = split_header_block(chunk);
    let headers = parse_headers(header_block);
    let mut status = None;

    if payload.starts_with("HTTP/1.1") || payload.starts_with("HTTP/2") {
        let (status_line, after_status) = payload.split_once('\n').unwrap_or((payload, ""));
        status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok());
        payload = split_header_block(after_status).1;
    }

    Some(ResponsePart {
        headers,
        status,
        body: payload.trim().to_string(),
    })
}

/// Splits a multipart body on `--{boundary}`, dropping the preamble and the
/// closing `--{boundary}--` marker.
pub fn parse_multipart(body: &str, boundary: &str) -> Vec<ResponsePart> {
    let delimiter = format!("--{}", boundary);

    body.split(delimiter.as_str())
        .skip(1)
        .take_while(|chunk| !chunk.starts_with("--"))
        .filter_map(parse_part)
        .collect()
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: u16,
    #[serde(default)]
    message: String,
}

fn error_payload(body: &str) -> Option<ErrorBody> {
    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .map(|payload| payload.error)
}

/// Create answers carry the created resource; anything else is a failure.
pub fn interpret_create(part: &ResponsePart) -> Result<String, ApiError> {
    if let Some(status) = part.status
        && !part.is_success_status()
    {
        return Err(ApiError::from_status(status, &part.body));
    }
    if let Some(error) = error_payload(&part.body) {
        return Err(ApiError::from_status(error.code, &error.message));
    }

    let created: RemoteEvent = serde_json::from_str(&part.body)
        .map_err(|e| ApiError::ParseError(format!("create response: {}", e)))?;
    created
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::ParseError("create response without id".to_string()))
}

/// Delete answers are empty on success; not-found and gone count as done.
pub fn interpret_delete(part: &ResponsePart) -> Result<(), ApiError> {
    let failure = match (part.status, error_payload(&part.body)) {
        (Some(status), _) if !part.is_success_status() => ApiError::from_status(status, &part.body),
        (_, Some(error)) => ApiError::from_status(error.code, &error.message),
        _ => return Ok(()),
    };

    if failure.is_not_found() {
        Ok(())
    } else {
        Err(failure)
    }
}

/// Per-index outcome of one batch call.
#[derive(Debug)]
pub struct BatchResults<T> {
    pub successes: BTreeMap<usize, T>,
    pub failures: BTreeMap<usize, ApiError>,
}

impl<T> Default for BatchResults<T> {
    fn default() -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: BTreeMap::new(),
        }
    }
}

impl<T> BatchResults<T> {
    /// Every item failed with the same error, e.g. the batch request itself
    /// could not be delivered.
    pub fn all_failed(count: usize, error: &ApiError) -> Self {
        Self {
            successes: BTreeMap::new(),
            failures: (0..count).map(|index| (index, error.replicate())).collect(),
        }
    }

    /// Nothing succeeded and every failure was a rate-limit signal.
    pub fn only_rate_limited(&self) -> bool {
        self.successes.is_empty()
            && !self.failures.is_empty()
            && self.failures.values().all(ApiError::is_rate_limited)
    }
}

/// Maps response parts back to request indices `0..count`.
///
/// Parts without a recognizable index are dropped. Requests that got no
/// part at all are recorded as decode failures so they are never lost.
pub fn correlate<T>(
    parts: &[ResponsePart],
    count: usize,
    interpret: impl Fn(&ResponsePart) -> Result<T, ApiError>,
) -> BatchResults<T> {
    let mut results = BatchResults::default();

    for part in parts {
        let Some(index) = part.request_index().filter(|index| *index < count) else {
            tracing::debug!("Dropping batch response part with unknown Content-ID");
            continue;
        };
        if results.successes.contains_key(&index) || results.failures.contains_key(&index) {
            continue;
        }
        match interpret(part) {
            Ok(value) => {
                results.successes.insert(index, value);
            }
            Err(e) => {
                results.failures.insert(index, e);
            }
        }
    }

    for index in 0..count {
        if !results.successes.contains_key(&index) && !results.failures.contains_key(&index) {
            results.failures.insert(
                index,
                ApiError::ParseError(format!("no response part for item {}", index)),
            );
        }
    }

    results
}
