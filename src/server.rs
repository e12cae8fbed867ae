//! HTTP listener serving the stub table, plus the `/_admin` JSON surface.

use crate::config::{GlobalSettings, YamlStubParser};
use crate::error::StubError;
use crate::matcher::IncomingRequest;
use crate::repository::{Resolution, ResolvedStub, StubRepository};
use crate::stub::{AuthorizationKind, StubEntry, StubResponse, ValuePattern};
use crate::template::TemplateEngine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Path prefix of the admin surface.
pub const ADMIN_PREFIX: &str = "/_admin";

type HttpResponse = Response<Full<Bytes>>;

/// Serves stubbed responses over HTTP/1.
pub struct StubServer {
    repository: Arc<StubRepository>,
    settings: GlobalSettings,
    templates: TemplateEngine,
    /// File the table was loaded from, used by refresh
    config_path: Option<PathBuf>,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
    requests_unauthorized: AtomicU64,
}

/// Request counters reported by `GET /_admin/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub stubs: usize,
    pub requests_total: u64,
    pub requests_matched: u64,
    pub requests_unmatched: u64,
    pub requests_unauthorized: u64,
}

/// Admin view of one stub.
#[derive(Debug, Clone, Serialize)]
pub struct StubSummary {
    pub index: usize,
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub methods: Vec<String>,
    pub url: String,
    pub responses: usize,
    pub cursor: usize,
}

impl StubSummary {
    fn new(index: usize, entry: &StubEntry) -> Self {
        Self {
            index,
            resource_id: entry.resource_id(),
            description: entry.description().map(String::from),
            methods: entry.request().methods().to_vec(),
            url: entry.request().url().as_str().to_string(),
            responses: entry.responses().len(),
            cursor: entry.cursor(),
        }
    }
}

/// Full admin view of one stub, returned by `GET /_admin/stubs/{i}`.
#[derive(Debug, Clone, Serialize)]
pub struct StubDetail {
    pub index: usize,
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub request: RequestView,
    pub responses: Vec<ResponseView>,
    /// Position of the response the next match serves
    pub cursor: usize,
    pub current_response: ResponseView,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub methods: Vec<String>,
    pub url: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationView {
    #[serde(rename = "type")]
    pub kind: AuthorizationKind,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseView {
    pub status: u16,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub template: bool,
    pub recordable: bool,
}

impl StubDetail {
    fn new(index: usize, entry: &StubEntry) -> Self {
        let request = entry.request();
        let patterns = |map: &BTreeMap<String, ValuePattern>| -> BTreeMap<String, String> {
            map.iter()
                .map(|(name, pattern)| (name.clone(), pattern.as_str().to_string()))
                .collect()
        };

        Self {
            index,
            resource_id: entry.resource_id(),
            description: entry.description().map(String::from),
            request: RequestView {
                methods: request.methods().to_vec(),
                url: request.url().as_str().to_string(),
                query: patterns(request.query()),
                headers: patterns(request.headers()),
                body: request.body().map(|b| b.as_str().to_string()),
                authorization: request.authorization().map(|auth| AuthorizationView {
                    kind: auth.kind(),
                    value: auth.credentials().to_string(),
                }),
            },
            responses: entry
                .responses()
                .iter()
                .map(|r| ResponseView::new(r))
                .collect(),
            cursor: entry.cursor(),
            current_response: ResponseView::new(&entry.current_response()),
        }
    }
}

impl ResponseView {
    fn new(response: &StubResponse) -> Self {
        let (status, body) = response.content();
        Self {
            recordable: response.is_recordable(),
            status,
            body,
            file: response.file().map(PathBuf::from),
            headers: response.headers(),
            latency_ms: response.latency().map(|l| l.as_millis() as u64),
            template: response.is_template(),
        }
    }
}

impl StubServer {
    pub fn new(repository: Arc<StubRepository>, settings: GlobalSettings) -> Self {
        info!(
            stubs = repository.len(),
            log_matches = settings.log_matches,
            "Stub server initialized"
        );

        Self {
            repository,
            settings,
            templates: TemplateEngine::new(),
            config_path: None,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
            requests_unauthorized: AtomicU64::new(0),
        }
    }

    /// Enable `POST /_admin/refresh` from `path`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn repository(&self) -> &Arc<StubRepository> {
        &self.repository
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            stubs: self.repository.len(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_matched: self.requests_matched.load(Ordering::Relaxed),
            requests_unmatched: self.requests_unmatched.load(Ordering::Relaxed),
            requests_unauthorized: self.requests_unauthorized.load(Ordering::Relaxed),
        }
    }

    /// Bind `addr` and serve until the task is dropped.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("Stub server listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, "Connection error: {}", e);
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<HttpResponse, Infallible> {
        let (parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return Ok(json_response(
                    StatusCode::BAD_REQUEST,
                    &serde_json::json!({ "error": "unreadable request body" }),
                ));
            }
        };

        let mut headers = HashMap::new();
        for (name, value) in &parts.headers {
            // First value wins for repeated headers
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| value.to_string());
            }
        }

        let incoming = IncomingRequest {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query_string: parts.uri.query().map(String::from),
            headers,
            body: (!body.is_empty()).then(|| String::from_utf8_lossy(&body).into_owned()),
        };

        Ok(self.respond(incoming).await)
    }

    /// Produce the response for one request.
    pub async fn respond(&self, incoming: IncomingRequest) -> HttpResponse {
        if let Some(route) = admin_route(&incoming.path) {
            return self.admin(&incoming, route);
        }

        self.requests_total.fetch_add(1, Ordering::Relaxed);

        match self.repository.resolve(&incoming).await {
            Resolution::Found(resolved) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        index = resolved.index,
                        method = %incoming.method,
                        url = %incoming.url(),
                        status = resolved.response.status(),
                        "Request matched stub"
                    );
                }
                self.stub_response(&resolved, &incoming).await
            }
            Resolution::Unauthorized => {
                self.requests_unauthorized.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    info!(method = %incoming.method, url = %incoming.url(), "Request not authorized");
                }
                json_response(
                    StatusCode::UNAUTHORIZED,
                    &serde_json::json!({
                        "error": "Unauthorized",
                        "method": incoming.method,
                        "url": incoming.url(),
                    }),
                )
            }
            Resolution::NotFound => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    info!(method = %incoming.method, url = %incoming.url(), "No stub matched request");
                }
                json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({
                        "error": "No stub matched",
                        "method": incoming.method,
                        "url": incoming.url(),
                    }),
                )
            }
        }
    }

    async fn stub_response(&self, resolved: &ResolvedStub, incoming: &IncomingRequest) -> HttpResponse {
        let response = &resolved.response;

        if let Some(latency) = response.latency() {
            debug!(index = resolved.index, latency_ms = latency.as_millis() as u64, "Applying latency");
            tokio::time::sleep(latency).await;
        }

        let body = if response.is_template() {
            let template = String::from_utf8_lossy(&response.body_bytes()).into_owned();
            match self.templates.render(&template, &resolved.context, incoming) {
                Ok(rendered) => rendered.into_bytes(),
                Err(e) => {
                    warn!(index = resolved.index, error = %e, "Template rendering failed");
                    return json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &serde_json::json!({ "error": format!("template error: {e}") }),
                    );
                }
            }
        } else {
            response.body_bytes()
        };

        let mut http = Response::new(Full::new(Bytes::from(body)));
        *http.status_mut() =
            StatusCode::from_u16(response.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = http.headers_mut();
        for (name, value) in response.headers() {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(index = resolved.index, header = %name, "Skipping invalid response header"),
            }
        }
        if !headers.contains_key(CONTENT_TYPE) {
            if let Ok(value) = HeaderValue::from_str(&self.settings.default_content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }

        http
    }

    fn admin(&self, incoming: &IncomingRequest, route: &str) -> HttpResponse {
        let segments: Vec<&str> = route.split('/').filter(|s| !s.is_empty()).collect();
        let method = incoming.method.as_str();

        match (method, segments.as_slice()) {
            ("GET", ["stubs"]) => {
                let summaries: Vec<StubSummary> = self
                    .repository
                    .stubs()
                    .iter()
                    .enumerate()
                    .map(|(index, entry)| StubSummary::new(index, entry))
                    .collect();
                json_response(StatusCode::OK, &summaries)
            }
            ("POST", ["stubs"]) => match self.parse_definition(incoming) {
                Ok(entry) => {
                    let index = self.repository.append(entry);
                    json_response(StatusCode::CREATED, &serde_json::json!({ "index": index }))
                }
                Err(e) => error_response(StatusCode::BAD_REQUEST, &e),
            },
            (_, ["stubs", index]) => {
                let Ok(index) = index.parse::<usize>() else {
                    return json_response(
                        StatusCode::BAD_REQUEST,
                        &serde_json::json!({ "error": format!("invalid stub index {index:?}") }),
                    );
                };
                self.admin_stub(method, index, incoming)
            }
            ("POST", ["refresh"]) => self.refresh(),
            ("GET", ["stats"]) => json_response(StatusCode::OK, &self.stats()),
            (_, ["stubs"] | ["refresh"] | ["stats"]) => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({ "error": format!("{method} not allowed on {ADMIN_PREFIX}{route}") }),
            ),
            _ => json_response(
                StatusCode::NOT_FOUND,
                &serde_json::json!({ "error": format!("unknown admin route {route:?}") }),
            ),
        }
    }

    fn admin_stub(&self, method: &str, index: usize, incoming: &IncomingRequest) -> HttpResponse {
        match method {
            "GET" => match self.repository.match_by_index(index) {
                Some(entry) => json_response(StatusCode::OK, &StubDetail::new(index, &entry)),
                None => json_response(
                    StatusCode::NOT_FOUND,
                    &serde_json::json!({ "error": format!("no stub at index {index}") }),
                ),
            },
            "PUT" => {
                let entry = match self.parse_definition(incoming) {
                    Ok(entry) => entry,
                    Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
                };
                match self.repository.update_by_index(index, entry) {
                    Ok(_) => json_response(StatusCode::OK, &serde_json::json!({ "index": index })),
                    Err(e) => error_response(StatusCode::NOT_FOUND, &e),
                }
            }
            "DELETE" => match self.repository.delete_by_index(index) {
                Ok(removed) => json_response(StatusCode::OK, &StubSummary::new(index, &removed)),
                Err(e) => error_response(StatusCode::NOT_FOUND, &e),
            },
            _ => json_response(
                StatusCode::METHOD_NOT_ALLOWED,
                &serde_json::json!({ "error": format!("{method} not allowed on a stub") }),
            ),
        }
    }

    fn parse_definition(&self, incoming: &IncomingRequest) -> Result<StubEntry, StubError> {
        let raw = incoming.body.as_deref().unwrap_or_default();
        YamlStubParser.parse_definition(raw, self.origin())
    }

    fn origin(&self) -> &Path {
        self.config_path
            .as_deref()
            .unwrap_or_else(|| Path::new("stubs.yaml"))
    }

    fn refresh(&self) -> HttpResponse {
        let Some(path) = &self.config_path else {
            return json_response(
                StatusCode::CONFLICT,
                &serde_json::json!({ "error": "server was started without a configuration file" }),
            );
        };

        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(source) => {
                let e = StubError::File {
                    path: path.clone(),
                    source,
                };
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e);
            }
        };

        match self.repository.reload(&YamlStubParser, &raw, path) {
            Ok(changed) => {
                info!(path = %path.display(), changed, "Stub table refreshed");
                json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "changed": changed, "stubs": self.repository.len() }),
                )
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Refresh failed, keeping current stubs");
                error_response(StatusCode::BAD_REQUEST, &e)
            }
        }
    }
}

/// The part of `path` after [`ADMIN_PREFIX`], if `path` is an admin path.
fn admin_route(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(ADMIN_PREFIX)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> HttpResponse {
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, error: &StubError) -> HttpResponse {
    json_response(status, &serde_json::json!({ "error": error.to_string() }))
}
