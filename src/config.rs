//! Configuration for the stub server.
//!
//! Defines the YAML stub definition format, the settings block, and the
//! [`StubParser`] seam that turns definition text into stub entries.

use crate::error::StubError;
use crate::stub::{Authorization, AuthorizationKind, StubEntry, StubRequest, StubResponse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Turns stub definition text into entries.
///
/// `origin` is the file the text came from; relative file references
/// resolve against its directory.
pub trait StubParser {
    fn parse(&self, raw: &str, origin: &Path) -> Result<Vec<StubEntry>, StubError>;
}

/// Parser for the YAML definition format.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlStubParser;

impl YamlStubParser {
    /// Parse a single stub definition, as accepted by the admin surface.
    pub fn parse_definition(&self, raw: &str, origin: &Path) -> Result<StubEntry, StubError> {
        let definition: StubDefinition = serde_yaml::from_str(raw)?;
        definition.to_entry(base_dir(origin))
    }
}

impl StubParser for YamlStubParser {
    fn parse(&self, raw: &str, origin: &Path) -> Result<Vec<StubEntry>, StubError> {
        StubsConfig::from_yaml_str(raw)?.to_entries(base_dir(origin))
    }
}

fn base_dir(origin: &Path) -> &Path {
    origin.parent().unwrap_or_else(|| Path::new("."))
}

/// Main configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StubsConfig {
    /// Stub definitions, matched in this order
    #[serde(default)]
    pub stubs: Vec<StubDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl StubsConfig {
    /// Load configuration from a YAML file and validate it.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        config.validate(base_dir(path))?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, StubError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Build every stub once, reporting the first failure with its position.
    pub fn validate(&self, base_dir: &Path) -> anyhow::Result<()> {
        for (i, stub) in self.stubs.iter().enumerate() {
            stub.to_entry(base_dir)
                .map_err(|e| anyhow::anyhow!("Stub {}: {}", i, e))?;
        }
        Ok(())
    }

    pub fn to_entries(&self, base_dir: &Path) -> Result<Vec<StubEntry>, StubError> {
        self.stubs.iter().map(|stub| stub.to_entry(base_dir)).collect()
    }
}

/// A single stub definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StubDefinition {
    /// Optional free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Request pattern
    pub request: RequestDefinition,

    /// One response, or a sequence served in rotation
    pub response: ResponseSet,
}

impl StubDefinition {
    pub fn to_entry(&self, base_dir: &Path) -> Result<StubEntry, StubError> {
        let request = self.request.to_request()?;
        let responses = match &self.response {
            ResponseSet::Single(response) => vec![response.to_response(base_dir)?],
            ResponseSet::Sequence(responses) => responses
                .iter()
                .map(|r| r.to_response(base_dir))
                .collect::<Result<Vec<_>, _>>()?,
        };

        let entry = StubEntry::new(request, responses)?;
        Ok(match &self.description {
            Some(description) => entry.with_description(description.clone()),
            None => entry,
        })
    }
}

/// Request pattern. Every value is a full-string regex; literals match themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    /// HTTP method(s) to match (empty = any)
    #[serde(default)]
    pub method: Vec<String>,

    /// Literal path, or a regex when it contains metacharacters
    pub url: String,

    /// Query parameter patterns
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Header patterns (names are case-insensitive)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Body pattern
    #[serde(default)]
    pub body: Option<String>,

    /// Required authorization
    #[serde(default)]
    pub authorization: Option<AuthorizationDefinition>,
}

impl RequestDefinition {
    pub fn to_request(&self) -> Result<StubRequest, StubError> {
        let mut builder = StubRequest::builder(&self.url).methods(&self.method);
        for (name, pattern) in &self.query {
            builder = builder.query(name, pattern);
        }
        for (name, pattern) in &self.headers {
            builder = builder.header(name, pattern);
        }
        if let Some(body) = &self.body {
            builder = builder.body(body);
        }
        if let Some(auth) = &self.authorization {
            builder = builder.authorization(Authorization::new(auth.kind, &auth.value));
        }
        builder.build()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorizationDefinition {
    #[serde(rename = "type")]
    pub kind: AuthorizationKind,
    /// `user:password` for basic, the token for bearer, the full header value for custom
    pub value: String,
}

/// One response or a list of them.
///
/// `Sequence` is tried first: every response field has a default, so an
/// empty YAML list would otherwise deserialize as a single default response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseSet {
    Sequence(Vec<ResponseDefinition>),
    Single(ResponseDefinition),
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Body text, or an upstream URL to record from
    #[serde(default)]
    pub body: Option<String>,

    /// File whose content replaces the body when non-empty
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Artificial latency before responding
    #[serde(default)]
    pub latency_ms: Option<u64>,

    /// Render the body as a Handlebars template
    #[serde(default)]
    pub template: bool,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    pub fn to_response(&self, base_dir: &Path) -> Result<StubResponse, StubError> {
        let mut builder = StubResponse::builder()
            .status(self.status)
            .template(self.template);
        if let Some(body) = &self.body {
            builder = builder.body(body);
        }
        if let Some(file) = &self.file {
            builder = builder.file(base_dir.join(file));
        }
        if let Some(latency_ms) = self.latency_ms {
            builder = builder.latency_ms(latency_ms);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder.build()
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all matched stubs
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Content type used when a response declares none
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Timeout for upstream fetches while recording
    #[serde(default = "default_recording_timeout_ms")]
    pub recording_timeout_ms: u64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
            recording_timeout_ms: default_recording_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

fn default_recording_timeout_ms() -> u64 {
    30_000
}
