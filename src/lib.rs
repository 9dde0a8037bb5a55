//! Provision Mock Server
//!
//! A stateful HTTP mock server. Responses are provisioned at runtime through
//! an admin API and looked up per request by method, URI and the current
//! state of that URI, then shaped by a transform pipeline before being sent.
//!
//! # Features
//!
//! - **Matching Algorithms**: Full, regex, priority regex and regex-replace URI classification
//! - **State Flows**: Per-key `inState`/`outState` transitions, including virtual deletion
//! - **Transform Pipelines**: Copy values between request, response, variables and events
//! - **Event History**: Every request/response pair is recorded and queryable
//! - **External Commands**: Bounded, timeout-enforced shell execution as a value source
//!
//! # Example Provision
//!
//! ```json
//! {
//!   "requestMethod": "GET",
//!   "requestUri": "/app/v1/foo",
//!   "responseCode": 200,
//!   "responseBody": { "foo": "bar" },
//!   "outState": "second",
//!   "transform": [
//!     { "source": "recvseq", "target": "response.body.integer.sequence" }
//!   ]
//! }
//! ```

pub mod admin;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod matching;
pub mod math;
pub mod provision;
pub mod rule;
pub mod server;
pub mod state;
pub mod transform;
pub mod value;
pub mod variables;

pub use admin::AdminApi;
pub use config::ProcessConfig;
pub use engine::MockServerEngine;
pub use server::{AdminServer, TrafficServer};
