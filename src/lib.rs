//! Client driver for remote build agents.
//!
//! Uploads a compressed workspace over one HTTP/2 session, follows the job's
//! status stream, and downloads the produced artifacts concurrently.
//!
//! ```text
//! +--------------+    +-----------+    +--------------+    +-----------+
//! | tar | zstd   | -> |  upload   | -> | status events| -> | downloads |
//! +--------------+    +-----------+    +--------------+    +-----------+
//!                      \_____________ one h2 Session _______________/
//! ```

pub mod archive;
pub mod config;
pub mod error;
pub mod job;
pub mod protocol;
pub mod transport;

pub use config::{ClientConfig, CompressionLevel, Endpoint, TrustPolicy};
pub use error::{BuildError, Result, TransportCause};
pub use job::{
    ArtifactRecord, ArtifactSink, BuildRequest, JobEvent, JobHeaders, JobOutcome, JobState,
    ProjectInfo, RemoteBuild,
};
pub use protocol::ArtifactDescriptor;
pub use transport::Session;
