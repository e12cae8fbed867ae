//! Stub data model.
//!
//! A [`StubEntry`] pairs one [`StubRequest`] pattern with an ordered, non-empty
//! list of [`StubResponse`]s and owns the cursor that cycles through them.
//!
//! Responses are value-like except for two fields: status and body can be
//! replaced exactly once by recording, and the resource-id header is written
//! when a table is published. Both sit behind their own lock.

use crate::error::StubError;
use base64::Engine;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Response header carrying the stored position of the owning entry.
pub const RESOURCE_ID_HEADER: &str = "x-stub-resource-id";

/// A pattern that must match the whole input value.
#[derive(Clone)]
pub struct ValuePattern {
    source: String,
    regex: Regex,
}

impl ValuePattern {
    /// Compile `source` as a full-string regex. `field` names the pattern in errors.
    pub fn new(field: &str, source: &str) -> Result<Self, StubError> {
        let regex = Regex::new(&format!("^(?:{source})$"))
            .map_err(|e| StubError::invalid_pattern(field, source, e))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }
}

impl PartialEq for ValuePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for ValuePattern {}

impl fmt::Debug for ValuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ValuePattern").field(&self.source).finish()
    }
}

/// URL pattern: a literal path, or a regex when the text has metacharacters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Literal(String),
    Regex(ValuePattern),
}

impl UrlPattern {
    pub fn new(url: &str) -> Result<Self, StubError> {
        if regex::escape(url) == url {
            Ok(UrlPattern::Literal(url.to_string()))
        } else {
            ValuePattern::new("url", url).map(UrlPattern::Regex)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            UrlPattern::Literal(url) => url,
            UrlPattern::Regex(pattern) => pattern.as_str(),
        }
    }
}

/// How the expected `Authorization` header value is derived from credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationKind {
    /// `Basic <base64(credentials)>`
    Basic,
    /// `Bearer <credentials>`
    Bearer,
    /// Credentials used verbatim.
    Custom,
}

/// Required authorization for a stubbed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    kind: AuthorizationKind,
    credentials: String,
}

impl Authorization {
    pub fn new(kind: AuthorizationKind, credentials: impl Into<String>) -> Self {
        Self {
            kind,
            credentials: credentials.into(),
        }
    }

    pub fn basic(credentials: impl Into<String>) -> Self {
        Self::new(AuthorizationKind::Basic, credentials)
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::new(AuthorizationKind::Bearer, token)
    }

    pub fn kind(&self) -> AuthorizationKind {
        self.kind
    }

    pub fn credentials(&self) -> &str {
        &self.credentials
    }

    /// The exact header value an incoming request must carry.
    pub fn expected_header_value(&self) -> String {
        match self.kind {
            AuthorizationKind::Basic => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(&self.credentials)
            ),
            AuthorizationKind::Bearer => format!("Bearer {}", self.credentials),
            AuthorizationKind::Custom => self.credentials.clone(),
        }
    }

    /// Exact comparison against the raw incoming header; no pattern matching.
    pub fn accepts(&self, raw_header: Option<&str>) -> bool {
        raw_header == Some(self.expected_header_value().as_str())
    }
}

/// Immutable description of the requests an entry answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubRequest {
    methods: Vec<String>,
    url: UrlPattern,
    query: BTreeMap<String, ValuePattern>,
    headers: BTreeMap<String, ValuePattern>,
    body: Option<ValuePattern>,
    authorization: Option<Authorization>,
}

impl StubRequest {
    pub fn builder(url: impl Into<String>) -> StubRequestBuilder {
        StubRequestBuilder {
            url: url.into(),
            methods: Vec::new(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            authorization: None,
        }
    }

    /// Accepted methods, upper-cased. Empty means any method.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn url(&self) -> &UrlPattern {
        &self.url
    }

    pub fn query(&self) -> &BTreeMap<String, ValuePattern> {
        &self.query
    }

    /// Header patterns keyed by lower-cased header name.
    pub fn headers(&self) -> &BTreeMap<String, ValuePattern> {
        &self.headers
    }

    pub fn body(&self) -> Option<&ValuePattern> {
        self.body.as_ref()
    }

    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    pub fn accepts_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Typed construction of a [`StubRequest`]; every pattern is validated in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct StubRequestBuilder {
    url: String,
    methods: Vec<String>,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<String>,
    authorization: Option<Authorization>,
}

impl StubRequestBuilder {
    /// Add an accepted method. `*` accepts any method.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.methods.push(method.into());
        self
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods.extend(methods.into_iter().map(Into::into));
        self
    }

    pub fn query(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.query.push((name.into(), pattern.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.headers.push((name.into(), pattern.into()));
        self
    }

    pub fn body(mut self, pattern: impl Into<String>) -> Self {
        self.body = Some(pattern.into());
        self
    }

    pub fn authorization(mut self, authorization: Authorization) -> Self {
        self.authorization = Some(authorization);
        self
    }

    pub fn build(self) -> Result<StubRequest, StubError> {
        let mut methods = Vec::with_capacity(self.methods.len());
        for method in &self.methods {
            let method = method.trim().to_uppercase();
            if method == "*" {
                methods.clear();
                break;
            }
            hyper::Method::from_bytes(method.as_bytes())
                .map_err(|_| StubError::InvalidMethod(method.clone()))?;
            if !methods.contains(&method) {
                methods.push(method);
            }
        }

        let url = UrlPattern::new(&self.url)?;

        let mut query = BTreeMap::new();
        for (name, pattern) in &self.query {
            query.insert(
                name.clone(),
                ValuePattern::new(&format!("query parameter '{name}'"), pattern)?,
            );
        }

        let mut headers = BTreeMap::new();
        for (name, pattern) in &self.headers {
            headers.insert(
                name.to_lowercase(),
                ValuePattern::new(&format!("header '{name}'"), pattern)?,
            );
        }

        let body = self
            .body
            .as_deref()
            .map(|pattern| ValuePattern::new("body", pattern))
            .transpose()?;

        Ok(StubRequest {
            methods,
            url,
            query,
            headers,
            body,
            authorization: self.authorization,
        })
    }
}

#[derive(Debug, Clone)]
struct ResponseContent {
    status: u16,
    body: String,
}

/// A canned response.
///
/// Status and body are replaced together, at most once, when a recordable
/// response is fetched from upstream.
#[derive(Debug)]
pub struct StubResponse {
    content: RwLock<ResponseContent>,
    file: Option<PathBuf>,
    file_bytes: Vec<u8>,
    headers: RwLock<BTreeMap<String, String>>,
    latency: Option<Duration>,
    template: bool,
}

impl StubResponse {
    pub fn builder() -> StubResponseBuilder {
        StubResponseBuilder::default()
    }

    /// A `200` response with an empty body.
    pub fn ok() -> Self {
        Self::with_body(200, "")
    }

    pub fn with_body(status: u16, body: impl Into<String>) -> Self {
        Self {
            content: RwLock::new(ResponseContent {
                status,
                body: body.into(),
            }),
            file: None,
            file_bytes: Vec::new(),
            headers: RwLock::new(BTreeMap::new()),
            latency: None,
            template: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.content.read().status
    }

    pub fn body(&self) -> String {
        self.content.read().body.clone()
    }

    /// Status and body read under one lock.
    pub fn content(&self) -> (u16, String) {
        let content = self.content.read();
        (content.status, content.body.clone())
    }

    /// Whether the body is a placeholder upstream URL.
    pub fn is_recordable(&self) -> bool {
        is_upstream_url(&self.content.read().body)
    }

    /// The placeholder upstream URL, if this response still awaits recording.
    pub fn recording_source(&self) -> Option<String> {
        let content = self.content.read();
        is_upstream_url(&content.body).then(|| content.body.clone())
    }

    /// Output bytes: the file content when non-empty, the body text otherwise.
    pub fn body_bytes(&self) -> Vec<u8> {
        if self.file_bytes.is_empty() {
            self.body().into_bytes()
        } else {
            self.file_bytes.clone()
        }
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        self.headers.read().clone()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .read()
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn is_template(&self) -> bool {
        self.template
    }

    pub(crate) fn record(&self, status: u16, body: String) {
        let mut content = self.content.write();
        content.status = status;
        content.body = body;
    }

    /// Replaces any declared header spelled like the resource-id header.
    pub(crate) fn set_resource_id(&self, id: usize) {
        let mut headers = self.headers.write();
        headers.retain(|name, _| !name.eq_ignore_ascii_case(RESOURCE_ID_HEADER));
        headers.insert(RESOURCE_ID_HEADER.to_string(), id.to_string());
    }
}

fn is_upstream_url(body: &str) -> bool {
    body.get(..4)
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case("http"))
}

/// Typed construction of a [`StubResponse`].
#[derive(Debug, Default, Clone)]
pub struct StubResponseBuilder {
    status: Option<u16>,
    body: Option<String>,
    file: Option<PathBuf>,
    headers: BTreeMap<String, String>,
    latency_ms: Option<u64>,
    template: bool,
}

impl StubResponseBuilder {
    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn template(mut self, template: bool) -> Self {
        self.template = template;
        self
    }

    pub fn build(self) -> Result<StubResponse, StubError> {
        let status = self.status.unwrap_or(200);
        if !(100..=599).contains(&status) {
            return Err(StubError::InvalidStatus(status));
        }

        let file_bytes = match &self.file {
            Some(path) => std::fs::read(path).map_err(|source| StubError::File {
                path: path.clone(),
                source,
            })?,
            None => Vec::new(),
        };

        Ok(StubResponse {
            content: RwLock::new(ResponseContent {
                status,
                body: self.body.unwrap_or_default(),
            }),
            file: self.file,
            file_bytes,
            headers: RwLock::new(self.headers),
            latency: self.latency_ms.map(Duration::from_millis),
            template: self.template,
        })
    }
}

/// One stubbed request pattern with its responses.
///
/// Two entries are equal when their request patterns are equal; responses
/// are not compared.
pub struct StubEntry {
    request: StubRequest,
    responses: Vec<Arc<StubResponse>>,
    cursor: AtomicUsize,
    description: Option<String>,
}

impl StubEntry {
    /// Fails with [`StubError::MalformedResponseSet`] when `responses` is empty.
    pub fn new(request: StubRequest, responses: Vec<StubResponse>) -> Result<Self, StubError> {
        if responses.is_empty() {
            return Err(StubError::MalformedResponseSet(format!(
                "stub for {} declares no responses",
                request.url().as_str()
            )));
        }
        Ok(Self {
            request,
            responses: responses.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
            description: None,
        })
    }

    pub fn with_response(request: StubRequest, response: StubResponse) -> Self {
        Self {
            request,
            responses: vec![Arc::new(response)],
            cursor: AtomicUsize::new(0),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn request(&self) -> &StubRequest {
        &self.request
    }

    pub fn responses(&self) -> &[Arc<StubResponse>] {
        &self.responses
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Select the response under the cursor.
    ///
    /// With `advance`, the cursor moves to the next response in the same atomic
    /// step, wrapping at the end. A single-response entry never touches it.
    pub fn next_response(&self, advance: bool) -> Arc<StubResponse> {
        let len = self.responses.len();
        if len == 1 {
            return Arc::clone(&self.responses[0]);
        }

        let index = if advance {
            self.cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
                .unwrap_or_else(|current| current)
        } else {
            self.cursor.load(Ordering::Acquire)
        };
        Arc::clone(&self.responses[index % len])
    }

    /// The response the next resolution would serve, without advancing.
    pub fn current_response(&self) -> Arc<StubResponse> {
        self.next_response(false)
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Read from the first response; every response carries the same value.
    pub fn resource_id(&self) -> Option<String> {
        self.responses[0].header(RESOURCE_ID_HEADER)
    }

    pub(crate) fn set_resource_id(&self, id: usize) {
        for response in &self.responses {
            response.set_resource_id(id);
        }
    }
}

impl PartialEq for StubEntry {
    fn eq(&self, other: &Self) -> bool {
        self.request == other.request
    }
}

impl fmt::Debug for StubEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubEntry")
            .field("request", &self.request)
            .field("responses", &self.responses.len())
            .field("cursor", &self.cursor())
            .field("description", &self.description)
            .finish()
    }
}
