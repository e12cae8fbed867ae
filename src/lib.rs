//! HTTP stub server
//!
//! Serves canned HTTP responses from an ordered table of stubs. Each stub
//! pairs a request pattern with one or more responses.
//!
//! # Features
//!
//! - **Request Matching**: Method, URL (literal or regex), query, headers, body, authorization
//! - **Response Sequences**: A stub with several responses serves them in rotation
//! - **Recording**: A response whose body is an upstream URL is fetched once and kept
//! - **Dynamic Templates**: Handlebars templates over the matched request
//! - **Latency Simulation**: Fixed delay per response
//! - **Admin API**: Inspect, add, replace, delete and reload stubs at runtime
//!
//! # Example Configuration
//!
//! ```yaml
//! stubs:
//!   - request:
//!       method: [GET]
//!       url: /hello
//!     response:
//!       status: 200
//!       body: "Hello, World!"
//! ```

pub mod config;
pub mod error;
pub mod matcher;
pub mod recording;
pub mod repository;
pub mod server;
pub mod stub;
pub mod template;

pub use config::{StubParser, StubsConfig, YamlStubParser};
pub use error::StubError;
pub use matcher::IncomingRequest;
pub use recording::{HttpTransport, Transport};
pub use repository::{Resolution, StubRepository};
pub use server::StubServer;
pub use stub::{StubEntry, StubRequest, StubResponse};
