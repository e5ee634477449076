//! Transport session to the remote build agent.
//!
//! One TLS connection carries an HTTP/2 session; every phase of a job
//! (upload, status, each artifact download) is an independent stream on it.
//!
//! ```text
//! +---------+   TLS (ALPN h2)   +-------------+
//! | Session | ================> | build agent |
//! +---------+                   +-------------+
//!   | stream 1: POST /v1/upload
//!   | stream 3: GET  /v1/status/{id}
//!   | stream 5..: GET /v1/download/{id}/{file}
//! ```

pub mod body;
pub mod idle;
pub mod session;
pub mod tls;

pub use body::{copy_body, pump_body, read_body, release_capacity};
pub use idle::{ActivityClock, ActivityIo};
pub use session::Session;
pub use tls::tls_client_config;
