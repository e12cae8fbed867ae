//! Upstream recording.
//!
//! A response whose body is an upstream URL is a placeholder. The first
//! successful fetch from that upstream replaces the placeholder's status and
//! body in place, so every later match of the entry serves the recorded
//! content. Failed fetches leave the placeholder untouched and the next
//! matching request tries again.

use crate::matcher::IncomingRequest;
use crate::stub::{StubEntry, StubResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status and body returned by an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unsupported HTTP method {0:?}")]
    InvalidMethod(String),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The transport declined to produce a response without a lower-level error.
    #[error("upstream {url} unavailable: {reason}")]
    Unavailable { url: String, reason: String },
}

/// Outbound HTTP used to record upstream content.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<FetchedResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&str>,
    ) -> Result<FetchedResponse, TransportError> {
        let http_method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| TransportError::InvalidMethod(method.to_string()))?;

        let mut request = self.client.request(http_method, url);

        // Copy headers (excluding host)
        for (key, value) in headers {
            let key_lower = key.to_lowercase();
            if key_lower != "host" && key_lower != "content-length" {
                request = request.header(key, value);
            }
        }

        if let Some(body) = body {
            request = request.body(body.to_string());
        }

        let response = request
            .send()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|source| TransportError::Request {
                url: url.to_string(),
                source,
            })?;

        Ok(FetchedResponse { status, body })
    }
}

/// Replaces recordable responses with upstream content.
#[derive(Clone)]
pub struct Recorder {
    transport: Arc<dyn Transport>,
}

impl Recorder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Return `response`, recording it first when it is still a placeholder.
    ///
    /// Never fails: a transport error or a panicking transport is logged and
    /// the response comes back unchanged. The fetch and the write-back run on
    /// their own task, so a finished fetch is kept even if the caller is
    /// dropped while waiting.
    pub async fn resolve(
        &self,
        entry: &StubEntry,
        response: Arc<StubResponse>,
        incoming: &IncomingRequest,
    ) -> Arc<StubResponse> {
        let Some(source) = response.recording_source() else {
            return response;
        };

        let target_url = format!("{}{}", source, incoming.url());
        debug!(
            resource_id = ?entry.resource_id(),
            url = %target_url,
            "Recording upstream response"
        );

        let transport = Arc::clone(&self.transport);
        let target = Arc::clone(&response);
        let resource_id = entry.resource_id();
        let method = incoming.method.clone();
        let headers = incoming.headers.clone();
        let body = incoming.body.clone();
        let url = target_url.clone();

        let recording = tokio::spawn(async move {
            match transport.fetch(&method, &url, &headers, body.as_deref()).await {
                Ok(fetched) => {
                    info!(
                        resource_id = ?resource_id,
                        url = %url,
                        status = fetched.status,
                        "Recorded upstream response"
                    );
                    target.record(fetched.status, fetched.body);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Recording failed, serving placeholder");
                }
            }
        });

        if let Err(e) = recording.await {
            warn!(url = %target_url, error = %e, "Recording transport aborted, serving placeholder");
        }

        response
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) enum Outcome {
        Reply(u16, &'static str),
        /// Reply after the given delay
        Slow(Duration, u16, &'static str),
        Fail,
        Panic,
    }

    /// Plays back queued outcomes, then keeps answering with the default reply.
    pub(crate) struct ScriptedTransport {
        calls: AtomicUsize,
        targets: Mutex<Vec<String>>,
        script: Mutex<VecDeque<Outcome>>,
        default_reply: FetchedResponse,
    }

    impl ScriptedTransport {
        pub(crate) fn replying(status: u16, body: &str) -> Arc<Self> {
            Self::scripted(Vec::new(), status, body)
        }

        pub(crate) fn scripted(script: Vec<Outcome>, status: u16, body: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                targets: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
                default_reply: FetchedResponse {
                    status,
                    body: body.to_string(),
                },
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn targets(&self) -> Vec<String> {
            self.targets.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn fetch(
            &self,
            _method: &str,
            url: &str,
            _headers: &HashMap<String, String>,
            _body: Option<&str>,
        ) -> Result<FetchedResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().push(url.to_string());

            let next = self.script.lock().pop_front();
            match next {
                Some(Outcome::Reply(status, body)) => Ok(FetchedResponse {
                    status,
                    body: body.to_string(),
                }),
                Some(Outcome::Slow(delay, status, body)) => {
                    tokio::time::sleep(delay).await;
                    Ok(FetchedResponse {
                        status,
                        body: body.to_string(),
                    })
                }
                Some(Outcome::Fail) => Err(TransportError::Unavailable {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
                Some(Outcome::Panic) => panic!("transport exploded"),
                None => Ok(self.default_reply.clone()),
            }
        }
    }
}
