//! Remote build session lifecycle.
//!
//! ```text
//! Connecting -> Uploading -> AwaitingJobGrace -> WatchingEvents
//!                  |                                  |      \
//!                  v                                  v       v
//!                Failed <------------------------- Failed  DownloadingArtifacts
//!                                                              |        |
//!                                                              v        v
//!                                                          Completed  Failed
//! ```
//!
//! The session is destroyed exactly once on entering `Completed` or
//! `Failed`, whichever path got there.

use crate::archive::{CompressionPipeline, Workspace};
use crate::config::ClientConfig;
use crate::error::{BuildError, Result};
use crate::job::artifacts::{ArtifactRecord, ArtifactRetrieval};
use crate::job::events::{EventDecoder, EventStream, JsonStreamDecoder};
use crate::job::upload::{upload, JobHeaders};
use crate::transport::Session;
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;

/// Supplies the generated project-info file shipped with the workspace.
#[async_trait]
pub trait ProjectInfo: Send + Sync {
    /// Path of the info file; may be generated on first call.
    async fn info_file(&self) -> Result<PathBuf>;
}

/// Receives each artifact as soon as it is on disk.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn artifact_created(&self, record: ArtifactRecord) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Connecting,
    Uploading,
    AwaitingJobGrace,
    WatchingEvents,
    DownloadingArtifacts,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Connecting, Uploading) => true,
            (Uploading, AwaitingJobGrace) => true,
            (AwaitingJobGrace, WatchingEvents) => true,
            (WatchingEvents, DownloadingArtifacts) => true,
            (DownloadingArtifacts, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Records the current state and logs transitions.
#[derive(Debug)]
struct StateTracker {
    state: JobState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: JobState::Connecting,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!("Job state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// What to build and where the artifacts go.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub project_dir: PathBuf,
    pub build_resources_dir: PathBuf,
    pub output_dir: PathBuf,
    pub headers: JobHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub artifacts: usize,
}

type DecoderFactory = Box<dyn Fn() -> Box<dyn EventDecoder> + Send + Sync>;

/// Runs one remote build job end to end.
pub struct RemoteBuild {
    config: ClientConfig,
    decoder: DecoderFactory,
}

impl RemoteBuild {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            decoder: Box::new(|| Box::new(JsonStreamDecoder::new())),
        }
    }

    /// Replace the status-stream framing decoder.
    pub fn with_decoder<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn EventDecoder> + Send + Sync + 'static,
    {
        self.decoder = Box::new(factory);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate the workspace, connect, and run the job.
    pub async fn run(
        &self,
        request: &BuildRequest,
        project: &dyn ProjectInfo,
        sink: &dyn ArtifactSink,
    ) -> Result<JobOutcome> {
        let workspace = self.prepare(request, project).await?;
        let session = Session::connect(&self.config).await?;
        self.execute(session, workspace, request, sink).await
    }

    /// Same as [`RemoteBuild::run`] on an already established session.
    /// The session is destroyed on return.
    pub async fn run_on_session(
        &self,
        session: Session,
        request: &BuildRequest,
        project: &dyn ProjectInfo,
        sink: &dyn ArtifactSink,
    ) -> Result<JobOutcome> {
        let workspace = match self.prepare(request, project).await {
            Ok(workspace) => workspace,
            Err(e) => {
                session.destroy();
                return Err(e);
            }
        };
        self.execute(session, workspace, request, sink).await
    }

    /// Everything that must hold before any network activity.
    async fn prepare(&self, request: &BuildRequest, project: &dyn ProjectInfo) -> Result<Workspace> {
        let info_file = project.info_file().await?;
        Workspace::new(
            &request.project_dir,
            info_file,
            &request.build_resources_dir,
        )
    }

    async fn execute(
        &self,
        session: Session,
        workspace: Workspace,
        request: &BuildRequest,
        sink: &dyn ArtifactSink,
    ) -> Result<JobOutcome> {
        let mut tracker = StateTracker::new();
        let outcome = race_completion(
            self.drive(&session, &workspace, request, sink, &mut tracker),
            session.closed(),
        )
        .await;

        match &outcome {
            Ok(_) => tracker.advance(JobState::Completed),
            Err(e) => {
                tracing::debug!("Job failed in {:?}: {}", tracker.state, e);
                tracker.advance(JobState::Failed);
            }
        }
        session.destroy();
        outcome
    }

    async fn drive(
        &self,
        session: &Session,
        workspace: &Workspace,
        request: &BuildRequest,
        sink: &dyn ArtifactSink,
        tracker: &mut StateTracker,
    ) -> Result<JobOutcome> {
        tracker.advance(JobState::Uploading);
        let pipeline =
            CompressionPipeline::new(self.config.archiver.clone(), self.config.compressor_stage());
        let archive = pipeline.spawn(workspace)?;
        let job_id = upload(session, &request.headers, archive).await?;
        tracing::info!("Remote build job {} accepted", job_id);

        // The agent needs a moment to materialize job state before the
        // status endpoint knows the id.
        tracker.advance(JobState::AwaitingJobGrace);
        tokio::time::sleep(self.config.grace_delay).await;

        tracker.advance(JobState::WatchingEvents);
        let mut events = EventStream::open(session, &job_id, (self.decoder)()).await?;
        let artifacts = events.wait_for_manifest().await?;
        drop(events);

        tracker.advance(JobState::DownloadingArtifacts);
        tracing::info!("Downloading {} artifact(s)", artifacts.len());
        let retrieval = ArtifactRetrieval::new(session, &job_id, &request.output_dir);
        let count = retrieval.retrieve_all(artifacts, sink).await?;

        Ok(JobOutcome {
            job_id,
            artifacts: count,
        })
    }
}

/// Run `work` until it finishes or the transport reports closure. When both
/// are ready at once the finished work wins.
pub async fn race_completion<T, W, C>(work: W, closed: C) -> Result<T>
where
    W: Future<Output = Result<T>>,
    C: Future<Output = BuildError>,
{
    tokio::select! {
        biased;
        outcome = work => outcome,
        err = closed => Err(err),
    }
}
