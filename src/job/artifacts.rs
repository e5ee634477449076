//! Artifact retrieval: one concurrent download stream per manifest entry.

use crate::error::{BuildError, Result};
use crate::job::lifecycle::ArtifactSink;
use crate::protocol::{download_path, ArtifactDescriptor};
use crate::transport::session::is_ok;
use crate::transport::{copy_body, read_body, Session};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Write buffer for streamed downloads; keeps slow disks from throttling
/// the stream
pub const DOWNLOAD_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4MB

/// Result of [`DownloadProgress::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending { completed: usize, total: usize },
    Finished,
}

/// Completed-download counter against the manifest length.
///
/// Increment and completion check are one atomic step, so exactly one
/// caller ever sees [`Completion::Finished`] and the count never passes the
/// total.
#[derive(Debug)]
pub struct DownloadProgress {
    completed: AtomicUsize,
    total: usize,
}

impl DownloadProgress {
    pub fn new(total: usize) -> Self {
        Self {
            completed: AtomicUsize::new(0),
            total,
        }
    }

    pub fn record(&self) -> Result<Completion> {
        let total = self.total;
        let previous = self
            .completed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < total).then_some(n + 1)
            })
            .map_err(|n| {
                BuildError::Protocol(format!(
                    "download completion {} exceeds manifest length {}",
                    n + 1,
                    total
                ))
            })?;

        let completed = previous + 1;
        if completed == total {
            Ok(Completion::Finished)
        } else {
            Ok(Completion::Pending { completed, total })
        }
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.completed() == self.total
    }
}

/// A downloaded artifact, handed to the [`ArtifactSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    pub file: PathBuf,
    pub target: Option<String>,
    pub arch: Option<String>,
    pub safe_artifact_name: Option<String>,
    pub is_write_update_info: bool,
    pub update_info: Option<serde_json::Value>,
    /// Raw content, only for metadata files
    pub data: Option<Bytes>,
}

impl ArtifactRecord {
    pub fn new(descriptor: ArtifactDescriptor, file: PathBuf, data: Option<Bytes>) -> Self {
        Self {
            file,
            target: descriptor.target,
            arch: descriptor.arch,
            safe_artifact_name: descriptor.safe_artifact_name,
            is_write_update_info: descriptor.is_write_update_info,
            update_info: descriptor.update_info,
            data,
        }
    }
}

/// Downloads every artifact of one job into `output_dir`.
pub struct ArtifactRetrieval<'a> {
    session: &'a Session,
    job_id: &'a str,
    output_dir: &'a Path,
}

impl<'a> ArtifactRetrieval<'a> {
    pub fn new(session: &'a Session, job_id: &'a str, output_dir: &'a Path) -> Self {
        Self {
            session,
            job_id,
            output_dir,
        }
    }

    /// Download all artifacts concurrently. Each completion bumps the shared
    /// counter and is reported to `sink`; returns once the counter reaches
    /// the manifest length. The first failure abandons the rest.
    pub async fn retrieve_all(
        &self,
        artifacts: Vec<ArtifactDescriptor>,
        sink: &dyn ArtifactSink,
    ) -> Result<usize> {
        let progress = DownloadProgress::new(artifacts.len());
        if artifacts.is_empty() {
            tracing::debug!("Manifest is empty, nothing to download");
            return Ok(0);
        }

        let progress = &progress;
        let mut downloads: FuturesUnordered<_> = artifacts
            .into_iter()
            .map(|descriptor| async move {
                let record = self.download(descriptor).await?;
                let completion = progress.record()?;
                sink.artifact_created(record).await?;
                Ok::<Completion, BuildError>(completion)
            })
            .collect();

        while let Some(result) = downloads.next().await {
            match result? {
                Completion::Finished => return Ok(progress.total()),
                Completion::Pending { completed, total } => {
                    tracing::debug!("Downloaded {}/{} artifacts", completed, total);
                }
            }
        }

        Err(BuildError::Protocol(format!(
            "downloads ended at {}/{} artifacts",
            progress.completed(),
            progress.total()
        )))
    }

    /// Fetch one artifact. Metadata files are buffered and kept in the
    /// record; everything else is streamed to disk.
    pub async fn download(&self, descriptor: ArtifactDescriptor) -> Result<ArtifactRecord> {
        let local = descriptor.local_path(self.output_dir)?;
        let path = download_path(self.job_id, &descriptor.file);

        let response = self.session.get(&path).await?;
        if !is_ok(response.status()) {
            return Err(BuildError::HttpStatus {
                status: response.status().as_u16(),
                path,
            });
        }
        let mut body = response.into_body();

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| BuildError::file_io(parent, e))?;
        }

        let data = if descriptor.is_metadata() {
            let content = read_body(&mut body).await?;
            fs::write(&local, &content)
                .await
                .map_err(|e| BuildError::file_io(&local, e))?;
            Some(content)
        } else {
            let file = File::create(&local)
                .await
                .map_err(|e| BuildError::file_io(&local, e))?;
            let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFFER_SIZE, file);
            let written = copy_body(&mut body, &mut writer, &local).await?;
            writer
                .flush()
                .await
                .map_err(|e| BuildError::file_io(&local, e))?;
            tracing::debug!("Wrote {} bytes to {}", written, local.display());
            None
        };

        Ok(ArtifactRecord::new(descriptor, local, data))
    }
}
