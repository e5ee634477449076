//! Remote build job phases.
//!
//! Upload -> (grace delay) -> status events -> concurrent artifact downloads,
//! all over one [`crate::transport::Session`].

pub mod artifacts;
pub mod events;
pub mod lifecycle;
pub mod upload;

pub use artifacts::{ArtifactRecord, ArtifactRetrieval, Completion, DownloadProgress};
pub use events::{classify, EventDecoder, EventStream, JobEvent, JsonStreamDecoder};
pub use lifecycle::{
    race_completion, ArtifactSink, BuildRequest, JobOutcome, JobState, ProjectInfo, RemoteBuild,
};
pub use upload::{upload, JobHeaders};
