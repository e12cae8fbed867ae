//! Request matching logic.
//!
//! Matches incoming requests against stub entries in stored order. The first
//! entry whose pattern accepts the request wins; there is no scoring.

use crate::stub::{StubEntry, StubRequest, UrlPattern};
use std::collections::HashMap;
use std::sync::Arc;

/// An inbound request, reduced to what matching and recording need.
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query_string: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl IncomingRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Build from a request target such as `/search?q=rust`.
    pub fn from_target(method: impl Into<String>, target: &str) -> Self {
        let mut request = Self::new(method, target);
        if let Some((path, query)) = target.split_once('?') {
            request.path = path.to_string();
            if !query.is_empty() {
                request.query_string = Some(query.to_string());
            }
        }
        request
    }

    pub fn with_query(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = Some(query_string.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Raw `Authorization` header value.
    pub fn authorization(&self) -> Option<&str> {
        self.header("authorization")
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query_string(self.query_string.as_deref().unwrap_or(""))
    }

    /// Path plus `?query` when a query string is present.
    pub fn url(&self) -> String {
        match self.query_string.as_deref() {
            Some(query) if !query.is_empty() => format!("{}?{}", self.path, query),
            _ => self.path.clone(),
        }
    }
}

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// URL regex capture groups, by number and by name
    pub captures: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
}

/// Result of matching a request against the stub table.
#[derive(Debug)]
pub enum MatchOutcome {
    Matched {
        index: usize,
        entry: Arc<StubEntry>,
        context: MatchContext,
    },
    /// Nothing matched, but the entry at `index` would have without its
    /// authorization requirement.
    Unauthorized { index: usize },
    NotFound,
}

/// Find the first entry accepting `incoming`.
pub fn find_match(incoming: &IncomingRequest, entries: &[Arc<StubEntry>]) -> MatchOutcome {
    let query_params = incoming.query_params();
    let mut unauthorized = None;

    for (index, entry) in entries.iter().enumerate() {
        let Some(captures) = matches_request(entry.request(), incoming, &query_params) else {
            continue;
        };

        if let Some(authorization) = entry.request().authorization() {
            if !authorization.accepts(incoming.authorization()) {
                unauthorized.get_or_insert(index);
                continue;
            }
        }

        return MatchOutcome::Matched {
            index,
            entry: Arc::clone(entry),
            context: MatchContext {
                captures,
                query_params,
            },
        };
    }

    match unauthorized {
        Some(index) => MatchOutcome::Unauthorized { index },
        None => MatchOutcome::NotFound,
    }
}

/// Every check except authorization. Returns URL captures on success.
fn matches_request(
    pattern: &StubRequest,
    incoming: &IncomingRequest,
    query_params: &HashMap<String, String>,
) -> Option<HashMap<String, String>> {
    if !pattern.accepts_method(&incoming.method) {
        return None;
    }

    let captures = matches_url(pattern.url(), &incoming.path)?;

    // Undeclared parameters and headers are ignored
    for (name, value_pattern) in pattern.query() {
        match query_params.get(name) {
            Some(value) if value_pattern.is_match(value) => {}
            _ => return None,
        }
    }

    for (name, value_pattern) in pattern.headers() {
        match incoming.header(name) {
            Some(value) if value_pattern.is_match(value) => {}
            _ => return None,
        }
    }

    if let Some(body_pattern) = pattern.body() {
        if !body_pattern.is_match(incoming.body.as_deref().unwrap_or("")) {
            return None;
        }
    }

    Some(captures)
}

fn matches_url(pattern: &UrlPattern, path: &str) -> Option<HashMap<String, String>> {
    match pattern {
        UrlPattern::Literal(url) => (url == path).then(HashMap::new),
        UrlPattern::Regex(value_pattern) => {
            if value_pattern.as_str() == path {
                return Some(HashMap::new());
            }

            let regex = value_pattern.regex();
            let captures = regex.captures(path)?;
            let mut found = HashMap::new();
            for (i, cap) in captures.iter().enumerate().skip(1) {
                if let Some(m) = cap {
                    found.insert(i.to_string(), m.as_str().to_string());
                }
            }
            for name in regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    found.insert(name.to_string(), m.as_str().to_string());
                }
            }
            Some(found)
        }
    }
}

/// Parse a query string into key-value pairs. Later duplicates win.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        decoded.push(byte);
                        i += 3;
                    }
                    None => {
                        decoded.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            other => {
                decoded.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}
